//! The driver: sole owner of the round state, fed by four input streams.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use tenderbft_config::ConsensusConfig;
use tenderbft_core_types::{
    BlockExecutor, BlockStore, ChainState, EvidencePool, PrivValidator, Round, StateStore,
    Timestamp, TxNotifier,
};
use tenderbft_core_votekeeper::HeightVoteSet;

use crate::error::ConsensusError;
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;
use crate::msgs::{ConsensusMessage, MessageInfo};
use crate::round_state::{RoundState, Step};
use crate::signer::SignerGateway;
use crate::ticker::{TimeoutInfo, TimeoutTicker};
use crate::wal::{ConsensusWal, WalMessage};

/// Handle for feeding the driver from the outside: peer messages in,
/// shutdown signal.
#[derive(Clone)]
pub struct DriverHandle {
    peer_tx: mpsc::Sender<MessageInfo>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl DriverHandle {
    /// Deliver a message received from a peer. Blocks when the peer queue
    /// is full, back-pressuring the reactor.
    pub async fn send(&self, info: MessageInfo) -> Result<(), ConsensusError> {
        self.peer_tx
            .send(info)
            .await
            .map_err(|_| ConsensusError::DriverStopped)
    }

    /// Ask the driver to shut down after the input it is processing.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

enum Input {
    Tock(TimeoutInfo),
    Peer(MessageInfo),
    PeerClosed,
    TxsAvailable,
    Shutdown,
}

/// The consensus driver. One instance per node; it serializes every state
/// mutation for the height it owns.
pub struct Driver {
    pub(crate) config: ConsensusConfig,
    pub(crate) state: ChainState,
    pub(crate) rs: RoundState,
    pub(crate) votes: HeightVoteSet,
    pub(crate) wal: ConsensusWal,
    pub(crate) ticker: TimeoutTicker,
    pub(crate) signer: SignerGateway,
    pub(crate) executor: Arc<dyn BlockExecutor>,
    pub(crate) block_store: Arc<dyn BlockStore>,
    pub(crate) evidence_pool: Arc<dyn EvidencePool>,
    pub(crate) tx_notifier: Arc<dyn TxNotifier>,
    pub(crate) event_bus: Arc<dyn EventBus>,
    pub(crate) metrics: Metrics,

    tock_rx: mpsc::Receiver<TimeoutInfo>,
    peer_rx: mpsc::Receiver<MessageInfo>,
    shutdown_rx: watch::Receiver<bool>,

    // Self-generated messages; drained to completion after every input so
    // WAL order always equals dispatch order.
    pub(crate) internal_queue: VecDeque<MessageInfo>,

    pub(crate) replaying: bool,
    pub(crate) txs_available: bool,
}

/// Everything the driver consumes from the outside world.
pub struct Collaborators {
    /// Source of the chain state.
    pub state_store: Arc<dyn StateStore>,

    /// The block store.
    pub block_store: Arc<dyn BlockStore>,

    /// Block execution and proposal processing.
    pub executor: Arc<dyn BlockExecutor>,

    /// The private validator.
    pub signer: Arc<dyn PrivValidator>,

    /// Mempool txs-available signal.
    pub tx_notifier: Arc<dyn TxNotifier>,

    /// Sink for equivocation evidence.
    pub evidence_pool: Arc<dyn EvidencePool>,

    /// Sink for consensus events.
    pub event_bus: Arc<dyn EventBus>,
}

impl Driver {
    /// Build the driver: load the chain state, run the double-sign check,
    /// open (and if needed repair) the write-ahead log.
    ///
    /// Call [`Driver::start`] next to replay the log and arm the first
    /// round, then [`Driver::run`] to process live inputs.
    pub async fn new(
        config: ConsensusConfig,
        collaborators: Collaborators,
        metrics: Metrics,
    ) -> Result<(Self, DriverHandle), ConsensusError> {
        let state = collaborators
            .state_store
            .load()
            .map_err(ConsensusError::StateStore)?;

        let signer =
            SignerGateway::new(collaborators.signer, state.chain_id.clone()).await?;

        signer.double_sign_check(
            collaborators.block_store.as_ref(),
            config.double_sign_check_height,
        )?;

        let (wal, repaired) = ConsensusWal::open(&config.wal_path)?;
        if repaired.is_some() {
            warn!("WAL was repaired on startup");
        }

        let height = state.next_height();

        let rs = RoundState {
            height,
            round: Round::ZERO,
            step: Step::NewHeight,
            start_time: Timestamp::now(),
            commit_time: Timestamp::UNIX_EPOCH,
            validators: state.validators.clone(),
            last_validators: state.last_validators.clone(),
            proposal: None,
            proposal_receive_time: Timestamp::UNIX_EPOCH,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: Round::Nil,
            locked_block: None,
            locked_block_parts: None,
            valid_round: Round::Nil,
            valid_block: None,
            valid_block_parts: None,
            commit_round: Round::Nil,
            triggered_timeout_precommit: false,
            last_commit: None,
        };

        let votes = HeightVoteSet::new(state.chain_id.clone(), height, state.validators.clone());

        let (ticker, tock_rx) = TimeoutTicker::spawn();
        let (peer_tx, peer_rx) = mpsc::channel(config.peer_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Self {
            config,
            state,
            rs,
            votes,
            wal,
            ticker,
            signer,
            executor: collaborators.executor,
            block_store: collaborators.block_store,
            evidence_pool: collaborators.evidence_pool,
            tx_notifier: collaborators.tx_notifier,
            event_bus: collaborators.event_bus,
            metrics,
            tock_rx,
            peer_rx,
            shutdown_rx,
            internal_queue: VecDeque::new(),
            replaying: false,
            txs_available: false,
        };

        let handle = DriverHandle {
            peer_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        };

        Ok((driver, handle))
    }

    /// Replay the write-ahead log from the last end-height marker and arm
    /// the timer for round 0 of the current height.
    pub async fn start(&mut self) -> Result<(), ConsensusError> {
        let replay = self.wal.replay_messages(self.rs.height)?;

        if !replay.is_empty() {
            info!(
                height = %self.rs.height,
                entries = replay.len(),
                "Replaying write-ahead log"
            );

            self.replaying = true;

            for msg in replay {
                match msg {
                    WalMessage::Msg(info) => {
                        self.dispatch_message(info).await?;
                        self.drain_internal().await?;
                    }
                    WalMessage::Timeout(info) => {
                        self.dispatch_timeout(info).await?;
                        self.drain_internal().await?;
                    }
                    WalMessage::EndHeight(_) | WalMessage::RoundState(_) => {}
                }
            }

            self.replaying = false;
        }

        self.metrics.height.set(self.rs.height.as_u64() as i64);
        self.schedule_new_height_timeout();

        Ok(())
    }

    /// Run the driver until shutdown. Closes the write-ahead log on the
    /// way out; during a requested shutdown a "log already closed" error is
    /// expected and swallowed.
    pub async fn run(mut self) {
        let result = self.run_loop().await;

        let shutting_down = *self.shutdown_rx.borrow();

        match result {
            Ok(()) => info!("Consensus driver stopped"),
            Err(err) => error!(%err, "Consensus driver failed"),
        }

        if let Err(err) = self.wal.close() {
            if !shutting_down {
                error!(%err, "Failed to close write-ahead log");
            }
        }
    }

    async fn run_loop(&mut self) -> Result<(), ConsensusError> {
        loop {
            self.drain_internal().await?;

            let input = {
                let notifier = self.tx_notifier.clone();

                tokio::select! {
                    biased;

                    _ = self.shutdown_rx.changed() => Input::Shutdown,

                    Some(info) = self.tock_rx.recv() => Input::Tock(info),

                    maybe = self.peer_rx.recv() => match maybe {
                        Some(info) => Input::Peer(info),
                        None => Input::PeerClosed,
                    },

                    () = notifier.txs_available() => Input::TxsAvailable,
                }
            };

            match input {
                Input::Shutdown => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown requested");
                        return Ok(());
                    }
                }
                Input::Tock(info) => self.handle_timeout(info).await?,
                Input::Peer(info) => self.handle_message(info).await?,
                Input::PeerClosed => {
                    info!("Peer channel closed");
                    return Ok(());
                }
                Input::TxsAvailable => self.on_txs_available().await?,
            }
        }
    }

    /// Handle one input message: append it to the write-ahead log, then
    /// dispatch. Self-generated messages require a durable append.
    pub async fn handle_message(&mut self, info: MessageInfo) -> Result<(), ConsensusError> {
        if info.is_internal() {
            self.wal
                .append_sync(&WalMessage::Msg(info.clone()))
                .map_err(ConsensusError::InternalWalAppend)?;
            self.metrics.wal_syncs.inc();
        } else if let Err(err) = self.wal.append(&WalMessage::Msg(info.clone())) {
            // Replay may repeat this message; losing the entry is survivable.
            error!(%err, "Failed to append peer message to WAL");
        }

        self.dispatch_message(info).await?;
        self.drain_internal().await
    }

    /// Handle a delivered timeout: drop it if stale, log it, dispatch it.
    pub async fn handle_timeout(&mut self, info: TimeoutInfo) -> Result<(), ConsensusError> {
        if info.height != self.rs.height
            || info.round < self.rs.round
            || (info.round == self.rs.round && info.step < self.rs.step)
        {
            debug!(?info, "Ignoring stale timeout");
            return Ok(());
        }

        if let Err(err) = self.wal.append(&WalMessage::Timeout(info)) {
            error!(%err, "Failed to append timeout to WAL");
        }

        self.dispatch_timeout(info).await?;
        self.drain_internal().await
    }

    pub(crate) async fn dispatch_message(
        &mut self,
        info: MessageInfo,
    ) -> Result<(), ConsensusError> {
        match info.msg {
            ConsensusMessage::Proposal(proposal) => {
                self.set_proposal(proposal, info.receive_time).await
            }
            ConsensusMessage::BlockPart {
                height,
                round,
                part,
            } => self.add_proposal_block_part(height, round, part).await,
            ConsensusMessage::Vote(vote) => self.try_add_vote(vote, info.peer_id).await,
        }
    }

    pub(crate) async fn dispatch_timeout(
        &mut self,
        info: TimeoutInfo,
    ) -> Result<(), ConsensusError> {
        match info.step {
            Step::NewHeight => self.enter_new_round(info.height, Round::ZERO).await,

            Step::NewRound => {
                // The empty-blocks interval elapsed without transactions.
                self.enter_propose(info.height, Round::ZERO).await
            }

            Step::Propose => {
                self.event_bus
                    .publish(Event::TimeoutPropose(self.rs.event()));
                self.enter_prevote(info.height, info.round).await
            }

            Step::PrevoteWait => {
                self.event_bus.publish(Event::TimeoutWait(self.rs.event()));
                self.enter_precommit(info.height, info.round).await
            }

            Step::PrecommitWait => {
                self.event_bus.publish(Event::TimeoutWait(self.rs.event()));
                self.enter_precommit(info.height, info.round).await?;
                self.enter_new_round(info.height, info.round.increment())
                    .await
            }

            step => {
                debug!(?step, "No timeout handling for step");
                Ok(())
            }
        }
    }

    /// Handle the mempool's txs-available signal. Only meaningful while
    /// waiting to start round 0 without transactions.
    pub async fn on_txs_available(&mut self) -> Result<(), ConsensusError> {
        self.txs_available = true;

        if self.rs.round != Round::ZERO {
            return Ok(());
        }

        match self.rs.step {
            // Round 0 starts when the commit timer fires; the flag is
            // picked up on entry.
            Step::NewHeight => {}
            Step::NewRound => self.enter_propose(self.rs.height, Round::ZERO).await?,
            _ => {}
        }

        self.drain_internal().await
    }

    /// Process queued self-generated messages to completion. Each one is
    /// made durable before it takes effect; failure to do so is fatal
    /// because replaying without the entry could produce a conflicting
    /// signature.
    pub async fn drain_internal(&mut self) -> Result<(), ConsensusError> {
        while let Some(info) = self.internal_queue.pop_front() {
            if !self.replaying {
                self.wal
                    .append_sync(&WalMessage::Msg(info.clone()))
                    .map_err(ConsensusError::InternalWalAppend)?;
                self.metrics.wal_syncs.inc();
            }

            self.dispatch_message(info).await?;
        }

        Ok(())
    }

    pub(crate) fn send_internal(&mut self, msg: ConsensusMessage) {
        if self.internal_queue.len() >= self.config.internal_queue_capacity {
            warn!(
                len = self.internal_queue.len(),
                "Internal message queue over capacity"
            );
        }

        self.internal_queue
            .push_back(MessageInfo::internal(msg, Timestamp::now()));
    }

    pub(crate) fn update_step(&mut self, step: Step) {
        self.rs.step = step;

        let event = self.rs.event();

        if !self.replaying {
            if let Err(err) = self.wal.append(&WalMessage::RoundState(event.clone())) {
                error!(%err, "Failed to append round state snapshot to WAL");
            }
        }

        self.event_bus.publish(Event::NewRoundStep(event));
    }

    pub(crate) fn schedule_timeout(&self, duration: Duration, round: Round, step: Step) {
        self.ticker
            .schedule(TimeoutInfo::new(duration, self.rs.height, round, step));
    }

    pub(crate) fn schedule_new_height_timeout(&self) {
        let duration = self
            .rs
            .start_time
            .saturating_duration_since(Timestamp::now())
            + Duration::from_millis(1);

        self.ticker.schedule(TimeoutInfo::new(
            duration,
            self.rs.height,
            Round::ZERO,
            Step::NewHeight,
        ));
    }

    /// The current round state. Observers should prefer the published
    /// [`Event::NewRoundStep`] snapshots; this accessor exists for tests
    /// and local tooling.
    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    /// The vote sets of the current height.
    pub fn votes(&self) -> &HeightVoteSet {
        &self.votes
    }

    /// The chain state the driver is working from.
    pub fn chain_state(&self) -> &ChainState {
        &self.state
    }

    /// Our validator address.
    pub fn address(&self) -> tenderbft_core_types::Address {
        self.signer.address()
    }

    /// Whether we are the proposer of the current round.
    pub fn is_proposer(&self) -> bool {
        self.rs.validators.proposer().address == self.signer.address()
    }
}
