//! The timeout ticker: a single-slot timer for the driver.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use tenderbft_core_types::{Height, Round};

use crate::round_state::Step;

/// A scheduled (or fired) timeout: the duration it was armed with and the
/// (height, round, step) it belongs to, so stale tocks can be discarded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    /// How long the timer was armed for.
    pub duration: Duration,

    /// Height the timeout belongs to.
    pub height: Height,

    /// Round the timeout belongs to.
    pub round: Round,

    /// Step the timeout belongs to.
    pub step: Step,
}

impl TimeoutInfo {
    /// Create a new timeout descriptor.
    pub fn new(duration: Duration, height: Height, round: Round, step: Step) -> Self {
        Self {
            duration,
            height,
            round,
            step,
        }
    }
}

/// Single-slot timeout scheduler.
///
/// Only the most recently scheduled timeout is ever delivered: arming a new
/// one supersedes the pending one. Delivered tocks still carry their
/// (height, round, step), and the driver drops any that are stale by the
/// time they arrive.
pub struct TimeoutTicker {
    schedule_tx: mpsc::UnboundedSender<TimeoutInfo>,
}

impl TimeoutTicker {
    /// Spawn the ticker task. Returns the handle used to arm timeouts and
    /// the channel tocks are delivered on.
    pub fn spawn() -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (tock_tx, tock_rx) = mpsc::channel(1);

        tokio::spawn(run(schedule_rx, tock_tx));

        (Self { schedule_tx }, tock_rx)
    }

    /// Arm the timer, superseding any pending timeout.
    pub fn schedule(&self, info: TimeoutInfo) {
        trace!(
            height = %info.height,
            round = %info.round,
            step = ?info.step,
            duration = ?info.duration,
            "Scheduling timeout"
        );

        // The ticker task only dies when the driver drops the tock
        // receiver, at which point nobody cares about timeouts anymore.
        let _ = self.schedule_tx.send(info);
    }
}

async fn run(
    mut schedule_rx: mpsc::UnboundedReceiver<TimeoutInfo>,
    tock_tx: mpsc::Sender<TimeoutInfo>,
) {
    let mut pending: Option<(Instant, TimeoutInfo)> = None;

    loop {
        if let Some((deadline, info)) = pending {
            tokio::select! {
                scheduled = schedule_rx.recv() => match scheduled {
                    Some(new_info) => {
                        debug!(superseded = ?info, by = ?new_info, "Timeout superseded");
                        pending = Some((Instant::now() + new_info.duration, new_info));
                    }
                    None => break,
                },

                () = tokio::time::sleep_until(deadline) => {
                    pending = None;
                    if tock_tx.send(info).await.is_err() {
                        break;
                    }
                }
            }
        } else {
            match schedule_rx.recv().await {
                Some(new_info) => {
                    pending = Some((Instant::now() + new_info.duration, new_info));
                }
                None => break,
            }
        }
    }
}
