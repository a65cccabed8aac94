//! Recording sinks for events and evidence.

use std::sync::Mutex;

use tenderbft_consensus::{Event, EventBus};
use tenderbft_core_types::{EvidencePool, SignedVote};

/// An [`EventBus`] that records every published event.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Whether any published event satisfies the predicate.
    pub fn saw(&self, predicate: impl Fn(&Event) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(predicate)
    }
}

impl EventBus for RecordingEventBus {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// An [`EvidencePool`] that records reported conflicting vote pairs.
#[derive(Default)]
pub struct RecordingEvidencePool {
    reports: Mutex<Vec<(SignedVote, SignedVote)>>,
}

impl RecordingEvidencePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// All reported pairs so far.
    pub fn reports(&self) -> Vec<(SignedVote, SignedVote)> {
        self.reports.lock().unwrap().clone()
    }
}

impl EvidencePool for RecordingEvidencePool {
    fn report_conflicting_votes(&self, vote_a: SignedVote, vote_b: SignedVote) {
        self.reports.lock().unwrap().push((vote_a, vote_b));
    }
}
