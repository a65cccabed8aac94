//! Step transitions of the round state machine.
//!
//! Every entry point is guarded by "same height, round not earlier, step
//! not later than the target"; violating calls are rejected as no-ops.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use tenderbft_core_types::{
    Block, BlockId, ChainState, Commit, ExtendedCommit, ExtendedCommitSig, Height, Part, PartSet,
    Proposal, Round, SignedProposal, SignedVote, Timestamp, Vote, VoteType,
};
use tenderbft_core_votekeeper::{AddVoteError, HeightVoteSet};

use crate::driver::Driver;
use crate::error::ConsensusError;
use crate::events::Event;
use crate::msgs::{ConsensusMessage, PeerId};
use crate::round_state::Step;

impl Driver {
    //---------------------------------------------------------------------
    // New round
    //---------------------------------------------------------------------

    /// Enter a new round of the current height. Resets the per-round state
    /// and either proceeds to `Propose` or waits for transactions.
    pub(crate) async fn enter_new_round(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            debug!(%height, %round, step = ?self.rs.step, "Ignoring enter_new_round");
            return Ok(());
        }

        // Rotate the proposer by however many rounds we are advancing.
        if self.rs.round < round {
            let skipped = (round.as_i64() - self.rs.round.as_i64()) as u32;
            self.rs.validators.advance_proposer_priority(skipped);
        }

        self.rs.reset_for_round(round);
        self.votes.set_round(round);
        self.update_step(Step::NewRound);
        self.metrics.round.set(round.as_i64());

        let proposer = self.rs.validators.proposer().address;
        info!(%height, %round, %proposer, "Entering new round");

        self.event_bus.publish(Event::NewRound {
            height,
            round,
            proposer,
        });

        // Round 0 may wait for transactions before proposing an empty
        // block; later rounds never wait.
        let wait_for_txs = round == Round::ZERO
            && self.config.wait_for_txs()
            && !self.txs_available
            && !self.need_proof_block();

        if wait_for_txs {
            let interval = self.config.create_empty_blocks_interval;
            if interval > std::time::Duration::ZERO {
                self.schedule_timeout(interval, round, Step::NewRound);
            }
            Ok(())
        } else {
            self.enter_propose(height, round).await
        }
    }

    // A proof block carries the effects of the previous block to the
    // application and cannot wait for transactions.
    fn need_proof_block(&self) -> bool {
        if self.rs.height == self.state.initial_height {
            return true;
        }

        match self
            .rs
            .height
            .decrement()
            .and_then(|h| self.block_store.load_block_meta(h))
        {
            Some(meta) => meta.header.app_hash != self.state.app_hash,
            None => true,
        }
    }

    //---------------------------------------------------------------------
    // Propose
    //---------------------------------------------------------------------

    /// Enter the `Propose` step: arm the propose timeout and, if we are
    /// the proposer, build and broadcast a proposal.
    pub(crate) async fn enter_propose(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Propose)
        {
            debug!(%height, %round, step = ?self.rs.step, "Ignoring enter_propose");
            return Ok(());
        }

        self.update_step(Step::Propose);

        let timeout = self.state.consensus_params.timeout.propose_for_round(round);
        self.schedule_timeout(timeout, round, Step::Propose);

        if self.is_proposer() {
            info!(%height, %round, "Our turn to propose");
            self.decide_proposal(height, round).await;
        }

        // The proposal may already be complete, eg. on round 0 re-entry or
        // when parts raced ahead of the proposal message.
        if self.is_proposal_complete() {
            self.enter_prevote(height, round).await?;
        }

        Ok(())
    }

    async fn decide_proposal(&mut self, height: Height, round: Round) {
        // Prefer the valid block: it carries a proof of lock others may be
        // bound to.
        let reproposal = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            (Some(block), Some(parts)) => Some((block.clone(), parts.clone())),
            _ => None,
        };

        let (block, parts) = match reproposal {
            Some(pair) => pair,
            None => {
                let Some(last_ext_commit) = self.last_extended_commit() else {
                    error!(%height, "No commit for the previous height; cannot propose");
                    return;
                };

                let executor = self.executor.clone();
                let block = match executor
                    .create_proposal_block(height, &self.state, &last_ext_commit, &self.signer.address())
                    .await
                {
                    Ok(block) => block,
                    Err(err) => {
                        error!(%err, "Failed to create proposal block");
                        return;
                    }
                };

                let parts = PartSet::from_data(block.encode());
                (block, parts)
            }
        };

        let block_id = BlockId::new(block.hash(), parts.header());

        let proposal = Proposal::new(
            height,
            round,
            self.rs.valid_round,
            block_id,
            block.header.time,
            self.signer.address(),
        );

        let deadline = self.state.consensus_params.timeout.propose_for_round(round);

        match self.signer.sign_proposal(&proposal, deadline).await {
            Ok(signature) => {
                debug!(%height, %round, %block_id, "Signed proposal");

                let signed = SignedProposal::new(proposal, signature);
                self.send_internal(ConsensusMessage::Proposal(signed));

                for part in parts.parts() {
                    self.send_internal(ConsensusMessage::BlockPart {
                        height,
                        round,
                        part: part.clone(),
                    });
                }
            }
            Err(err) => {
                // The machine will time out and retry on the next round.
                warn!(%err, "Failed to sign proposal; abandoning this round");
            }
        }
    }

    fn last_extended_commit(&self) -> Option<ExtendedCommit> {
        if self.rs.height == self.state.initial_height {
            return Some(ExtendedCommit::empty());
        }

        let prev = self.rs.height.decrement()?;

        if self.state.consensus_params.vote_extensions_enabled(prev) {
            if let Some(ec) = self
                .rs
                .last_commit
                .as_ref()
                .and_then(|lc| lc.make_extended_commit())
            {
                return Some(ec);
            }

            self.block_store.load_block_extended_commit(prev)
        } else {
            let commit = self
                .rs
                .last_commit
                .as_ref()
                .and_then(|lc| lc.make_commit())
                .or_else(|| {
                    self.block_store
                        .load_seen_commit()
                        .filter(|c| c.height == prev)
                })
                .or_else(|| self.block_store.load_block_commit(prev))?;

            Some(lift_commit(commit))
        }
    }

    /// A proposal is complete once we hold the proposal itself, the full
    /// block, and, for a re-proposal, the two-thirds prevotes of its proof
    /// of lock.
    pub(crate) fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };

        if self.rs.proposal_block.is_none() {
            return false;
        }

        let pol_round = proposal.proposal.pol_round;
        if pol_round.is_nil() {
            return true;
        }

        self.votes
            .prevotes(pol_round)
            .is_some_and(|pv| pv.two_thirds_majority().is_some())
    }

    //---------------------------------------------------------------------
    // Prevote
    //---------------------------------------------------------------------

    /// Enter the `Prevote` step and cast our prevote.
    pub(crate) async fn enter_prevote(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Prevote)
        {
            debug!(%height, %round, step = ?self.rs.step, "Ignoring enter_prevote");
            return Ok(());
        }

        self.update_step(Step::Prevote);
        self.do_prevote(height, round).await;

        Ok(())
    }

    async fn do_prevote(&mut self, height: Height, round: Round) {
        let decision = self.prevote_decision().await;

        let block_id = match decision {
            Some(block_id) => {
                info!(%height, %round, %block_id, "Prevoting block");
                block_id
            }
            None => {
                info!(%height, %round, "Prevoting nil");
                BlockId::nil()
            }
        };

        self.sign_vote_and_queue(VoteType::Prevote, block_id).await;
    }

    // The full prevote rule: any failed condition means nil.
    async fn prevote_decision(&mut self) -> Option<BlockId> {
        let Some(signed_proposal) = self.rs.proposal.clone() else {
            debug!("No proposal; prevoting nil");
            return None;
        };
        let proposal = signed_proposal.proposal;

        let Some(block) = self.rs.proposal_block.clone() else {
            debug!("Proposal block not complete; prevoting nil");
            return None;
        };

        if proposal.timestamp != block.header.time {
            debug!("Proposal timestamp differs from block time; prevoting nil");
            return None;
        }

        // Fresh proposals from an unlocked state must be timely.
        if proposal.pol_round.is_nil()
            && self.rs.locked_round.is_nil()
            && !self.is_timely(&proposal)
        {
            self.metrics.untimely_proposals.inc();
            info!(
                proposal_timestamp = %proposal.timestamp,
                receive_time = %self.rs.proposal_receive_time,
                "Proposal is not timely; prevoting nil"
            );
            return None;
        }

        let executor = self.executor.clone();

        if let Err(err) = executor.validate_block(&self.state, &block).await {
            debug!(%err, "Invalid proposal block; prevoting nil");
            return None;
        }

        match executor.process_proposal(&block, &self.state).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Application rejected the proposal; prevoting nil");
                return None;
            }
            Err(err) => {
                debug!(%err, "process_proposal failed; prevoting nil");
                return None;
            }
        }

        let locked_hash = self.rs.locked_block.as_ref().map(Block::hash);

        let acceptable = if proposal.pol_round.is_nil() {
            // Fresh proposal: free, or a re-proposal of our locked block.
            self.rs.locked_round.is_nil() || locked_hash == Some(block.hash())
        } else {
            // Re-proposal: its proof of lock must be real and not behind
            // our own lock, unless it is our locked block anyway.
            let polka = self
                .votes
                .prevotes(proposal.pol_round)
                .is_some_and(|pv| pv.two_thirds_majority() == Some(proposal.block_id));

            polka
                && (self.rs.locked_round <= proposal.pol_round
                    || locked_hash == Some(block.hash()))
        };

        acceptable.then_some(proposal.block_id)
    }

    /// Proposer-based timestamps: a fresh proposal is timely iff it was
    /// received within the synchrony window around its own timestamp.
    fn is_timely(&self, proposal: &Proposal) -> bool {
        let synchrony = self.state.consensus_params.synchrony;
        let receive_time = self.rs.proposal_receive_time;

        let lower = proposal.timestamp - synchrony.precision;
        let upper = proposal.timestamp
            + synchrony.message_delay_for_round(proposal.round)
            + synchrony.precision;

        receive_time >= lower && receive_time <= upper
    }

    /// Enter `PrevoteWait`: two-thirds-any prevotes are in, wait a bounded
    /// time for a majority to form.
    pub(crate) async fn enter_prevote_wait(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::PrevoteWait)
        {
            debug!(%height, %round, step = ?self.rs.step, "Ignoring enter_prevote_wait");
            return Ok(());
        }

        let any = self
            .votes
            .prevotes(round)
            .is_some_and(|pv| pv.two_thirds_any());
        if !any {
            debug!(%round, "enter_prevote_wait without two-thirds-any prevotes");
            return Ok(());
        }

        self.update_step(Step::PrevoteWait);

        let timeout = self.state.consensus_params.timeout.vote_for_round(round);
        self.schedule_timeout(timeout, round, Step::PrevoteWait);

        Ok(())
    }

    //---------------------------------------------------------------------
    // Precommit
    //---------------------------------------------------------------------

    /// Enter the `Precommit` step and cast our precommit, applying the
    /// lock rules.
    pub(crate) async fn enter_precommit(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Precommit)
        {
            debug!(%height, %round, step = ?self.rs.step, "Ignoring enter_precommit");
            return Ok(());
        }

        info!(%height, %round, "Entering precommit");
        self.update_step(Step::Precommit);

        let majority = self
            .votes
            .prevotes(round)
            .and_then(|pv| pv.two_thirds_majority());

        let Some(block_id) = majority else {
            debug!("No prevote majority; precommitting nil");
            self.sign_vote_and_queue(VoteType::Precommit, BlockId::nil())
                .await;
            return Ok(());
        };

        if block_id.is_nil() {
            debug!("Prevote majority for nil; precommitting nil");
            self.sign_vote_and_queue(VoteType::Precommit, BlockId::nil())
                .await;
            return Ok(());
        }

        self.event_bus.publish(Event::Polka {
            height,
            round,
            block_id,
        });

        let locked_hash = self.rs.locked_block.as_ref().map(Block::hash);

        // Already locked on this block: bump the lock to this round.
        if locked_hash == Some(block_id.hash) {
            info!(%round, %block_id, "Relocking");
            self.rs.locked_round = round;
            self.event_bus.publish(Event::Relock(self.rs.event()));
            self.sign_vote_and_queue(VoteType::Precommit, block_id).await;
            return Ok(());
        }

        let proposal_hash = self.rs.proposal_block.as_ref().map(Block::hash);

        if proposal_hash == Some(block_id.hash) {
            let block = self.rs.proposal_block.clone().expect("checked above");

            let executor = self.executor.clone();
            if let Err(err) = executor.validate_block(&self.state, &block).await {
                // A polka formed on a block we consider invalid. Nil is
                // always safe.
                error!(%err, "Two-thirds prevoted a block that fails validation; precommitting nil");
                self.sign_vote_and_queue(VoteType::Precommit, BlockId::nil())
                    .await;
                return Ok(());
            }

            info!(%round, %block_id, "Locking");
            self.rs.locked_round = round;
            self.rs.locked_block = Some(block);
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.event_bus.publish(Event::Lock(self.rs.event()));
            self.sign_vote_and_queue(VoteType::Precommit, block_id).await;
            return Ok(());
        }

        // A polka for a block we don't have. Start fetching it by its part
        // set header and precommit nil.
        debug!(%block_id, "Polka for a missing block; fetching parts");

        let have_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|parts| parts.has_header(block_id.part_set_header));

        if !have_header {
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(block_id.part_set_header));
        }

        self.sign_vote_and_queue(VoteType::Precommit, BlockId::nil())
            .await;

        Ok(())
    }

    /// Arm the precommit-wait timeout once per round.
    pub(crate) async fn enter_precommit_wait(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            debug!(%height, %round, "Ignoring enter_precommit_wait");
            return Ok(());
        }

        let any = self
            .votes
            .precommits(round)
            .is_some_and(|pc| pc.two_thirds_any());
        if !any {
            debug!(%round, "enter_precommit_wait without two-thirds-any precommits");
            return Ok(());
        }

        self.rs.triggered_timeout_precommit = true;

        if self.rs.round == round && self.rs.step == Step::Precommit {
            self.update_step(Step::PrecommitWait);
        }

        let timeout = self.state.consensus_params.timeout.vote_for_round(round);
        self.schedule_timeout(timeout, round, Step::PrecommitWait);

        Ok(())
    }

    //---------------------------------------------------------------------
    // Commit
    //---------------------------------------------------------------------

    /// Enter `Commit`: a non-nil block has a precommit majority at
    /// `commit_round`. Finalizes immediately when the block is in hand.
    pub(crate) async fn enter_commit(
        &mut self,
        height: Height,
        commit_round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step >= Step::Commit {
            debug!(%height, %commit_round, step = ?self.rs.step, "Ignoring enter_commit");
            return Ok(());
        }

        let majority = self
            .votes
            .precommits(commit_round)
            .and_then(|pc| pc.two_thirds_majority())
            .filter(|id| !id.is_nil());

        let Some(block_id) = majority else {
            error!(%commit_round, "enter_commit without a block majority");
            return Ok(());
        };

        info!(%height, %commit_round, %block_id, "Entering commit");

        self.rs.commit_round = commit_round;
        self.rs.commit_time = Timestamp::now();
        self.update_step(Step::Commit);

        // The locked block is usually the committed block.
        let locked_hash = self.rs.locked_block.as_ref().map(Block::hash);
        if locked_hash == Some(block_id.hash) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        // Otherwise start fetching it.
        let proposal_hash = self.rs.proposal_block.as_ref().map(Block::hash);
        if proposal_hash != Some(block_id.hash) {
            let have_header = self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|parts| parts.has_header(block_id.part_set_header));

            if !have_header {
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts =
                    Some(PartSet::from_header(block_id.part_set_header));
                self.event_bus.publish(Event::ValidBlock(self.rs.event()));
            }
        }

        self.try_finalize_commit(height).await
    }

    /// Finalize if the committed block is fully in hand; otherwise keep
    /// waiting for its parts.
    pub(crate) async fn try_finalize_commit(
        &mut self,
        height: Height,
    ) -> Result<(), ConsensusError> {
        debug_assert_eq!(self.rs.height, height);

        let majority = self
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|pc| pc.two_thirds_majority())
            .filter(|id| !id.is_nil());

        let Some(block_id) = majority else {
            return Ok(());
        };

        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|block| block.hash() == block_id.hash);

        if have_block {
            self.finalize_commit(block_id).await
        } else {
            debug!(%block_id, "Cannot finalize commit yet; block not in hand");
            Ok(())
        }
    }

    async fn finalize_commit(&mut self, block_id: BlockId) -> Result<(), ConsensusError> {
        let height = self.rs.height;
        let block = self.rs.proposal_block.clone().expect("checked by caller");
        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .expect("parts exist when block does");

        let executor = self.executor.clone();

        // Final validation. Failure here means more than two thirds of the
        // voting power committed an invalid block: a safety violation.
        if let Err(err) = executor.validate_block(&self.state, &block).await {
            panic!("+2/3 committed an invalid block at height {height}: {err}");
        }

        info!(%height, hash = %block_id.hash, "Finalizing commit");

        let precommits = self
            .votes
            .precommits(self.rs.commit_round)
            .expect("commit round has precommits");

        // Persist the block before the end-height marker. Skipped when the
        // block was already saved, eg. during WAL replay.
        if self.block_store.height() < height {
            if self.state.consensus_params.vote_extensions_enabled(height) {
                let seen = precommits
                    .make_extended_commit()
                    .expect("majority implies a commit");
                self.block_store
                    .save_block_with_extended_commit(block.clone(), &parts, seen);
            } else {
                let seen = precommits.make_commit().expect("majority implies a commit");
                self.block_store.save_block(block.clone(), &parts, seen);
            }
        } else {
            debug!(%height, "Block already persisted");
        }

        self.wal.write_end_height(height)?;
        self.metrics.wal_syncs.inc();

        let new_state = match executor
            .apply_block(self.state.clone(), &block_id, &block)
            .await
        {
            Ok(state) => state,
            Err(err) => {
                // Do not advance the height; the commit can be retried
                // when the trigger fires again.
                error!(%err, %height, "Failed to apply block");
                return Ok(());
            }
        };

        self.metrics.commits.inc();

        if let Err(err) = self.signer.refresh_pub_key().await {
            warn!(%err, "Failed to refresh validator public key");
        }

        self.update_to_state(new_state);
        self.schedule_new_height_timeout();

        Ok(())
    }

    fn update_to_state(&mut self, new_state: ChainState) {
        let height = new_state.next_height();
        debug_assert_eq!(height, self.rs.height.increment());

        let last_commit = self.votes.precommits(self.rs.commit_round).cloned();

        let has_all_precommits = last_commit.as_ref().is_some_and(|pc| pc.has_all());
        let bypass = new_state.consensus_params.timeout.bypass_commit_timeout;

        let start_time = if bypass && has_all_precommits {
            Timestamp::now()
        } else {
            self.rs.commit_time + new_state.consensus_params.timeout.commit
        };

        self.rs.last_validators =
            std::mem::replace(&mut self.rs.validators, new_state.validators.clone());

        self.rs.height = height;
        self.rs.round = Round::ZERO;
        self.rs.start_time = start_time;
        self.rs.proposal = None;
        self.rs.proposal_receive_time = Timestamp::UNIX_EPOCH;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.rs.locked_round = Round::Nil;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.rs.valid_round = Round::Nil;
        self.rs.valid_block = None;
        self.rs.valid_block_parts = None;
        self.rs.commit_round = Round::Nil;
        self.rs.triggered_timeout_precommit = false;
        self.rs.last_commit = last_commit;

        self.votes = HeightVoteSet::new(
            new_state.chain_id.clone(),
            height,
            new_state.validators.clone(),
        );

        self.state = new_state;
        self.txs_available = false;

        self.update_step(Step::NewHeight);

        self.metrics.height.set(height.as_u64() as i64);
        self.metrics.round.set(0);

        info!(%height, "Advanced to next height");
    }

    //---------------------------------------------------------------------
    // Proposals and block parts
    //---------------------------------------------------------------------

    /// Accept a proposal for the current round. The first valid proposal
    /// wins; identical or conflicting repeats are no-ops.
    pub(crate) async fn set_proposal(
        &mut self,
        signed: SignedProposal,
        receive_time: Timestamp,
    ) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }

        let proposal = &signed.proposal;

        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(
                proposal.height = %proposal.height,
                proposal.round = %proposal.round,
                "Proposal for a different height/round, ignoring"
            );
            return Ok(());
        }

        if !(proposal.pol_round.is_nil()
            || (proposal.pol_round >= Round::ZERO && proposal.pol_round < proposal.round))
        {
            debug!(pol_round = %proposal.pol_round, "Proposal with invalid POL round, ignoring");
            return Ok(());
        }

        let proposer = self.rs.validators.proposer().clone();

        if proposal.proposer_address != proposer.address {
            debug!(
                got = %proposal.proposer_address,
                expected = %proposer.address,
                "Proposal not from the round's proposer, ignoring"
            );
            return Ok(());
        }

        if proposer
            .pub_key
            .verify(&proposal.sign_bytes(&self.state.chain_id), &signed.signature)
            .is_err()
        {
            debug!(proposer = %proposer.address, "Invalid proposal signature, ignoring");
            return Ok(());
        }

        info!(
            height = %proposal.height,
            round = %proposal.round,
            block_id = %proposal.block_id,
            "Received proposal"
        );

        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(proposal.block_id.part_set_header));
        }

        self.rs.proposal = Some(signed);
        self.rs.proposal_receive_time = receive_time;

        Ok(())
    }

    /// Accept one block part. Completes the proposal block when the last
    /// part arrives, possibly advancing the state machine.
    pub(crate) async fn add_proposal_block_part(
        &mut self,
        height: Height,
        round: Round,
        part: Part,
    ) -> Result<(), ConsensusError> {
        if height != self.rs.height {
            debug!(%height, "Block part for a different height, ignoring");
            return Ok(());
        }

        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            debug!(%height, %round, "No part set accumulator, ignoring block part");
            return Ok(());
        };

        let added = match parts.add_part(part) {
            Ok(added) => added,
            Err(err) => {
                debug!(%err, "Rejected block part");
                return Ok(());
            }
        };

        if !added || !parts.is_complete() {
            return Ok(());
        }

        let data = parts.assemble().expect("part set is complete");
        let header = parts.header();

        let max_bytes = self.state.consensus_params.block.max_bytes;
        let block = match Block::decode(&data, max_bytes) {
            Ok(block) => block,
            Err(err) => {
                error!(%err, "Completed part set does not decode to a block");
                return Ok(());
            }
        };

        // The reconstructed block must be the one we committed to fetch.
        let expected_hash = self
            .rs
            .proposal
            .as_ref()
            .map(|p| p.proposal.block_id.hash)
            .or_else(|| {
                self.votes
                    .precommits(self.rs.commit_round)
                    .and_then(|pc| pc.two_thirds_majority())
                    .map(|id| id.hash)
            });

        if let Some(expected) = expected_hash {
            if block.hash() != expected {
                error!(
                    got = %block.hash(),
                    %expected,
                    "Completed block hash mismatch, dropping"
                );
                return Ok(());
            }
        }

        info!(height = %self.rs.height, hash = %block.hash(), "Received complete proposal block");
        self.rs.proposal_block = Some(block.clone());

        // A polka may already be waiting on this block.
        let polka = self
            .votes
            .prevotes(self.rs.round)
            .and_then(|pv| pv.two_thirds_majority());

        if let Some(maj) = polka {
            if !maj.is_nil() && maj.hash == block.hash() && self.rs.valid_round < self.rs.round {
                self.rs.valid_round = self.rs.round;
                self.rs.valid_block = Some(block.clone());
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                self.event_bus.publish(Event::ValidBlock(self.rs.event()));
            }
        }

        self.event_bus.publish(Event::CompleteProposal {
            height: self.rs.height,
            round: self.rs.round,
            block_id: BlockId::new(block.hash(), header),
        });

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            let current_round = self.rs.round;
            self.enter_prevote(height, current_round).await?;

            if polka.is_some() {
                self.enter_precommit(height, current_round).await?;
            }
        } else if self.rs.step == Step::Commit {
            self.try_finalize_commit(height).await?;
        }

        Ok(())
    }

    //---------------------------------------------------------------------
    // Votes
    //---------------------------------------------------------------------

    /// Tally a vote and run the threshold-driven transitions.
    pub(crate) async fn try_add_vote(
        &mut self,
        vote: SignedVote,
        _peer_id: Option<PeerId>,
    ) -> Result<(), ConsensusError> {
        let our_address = self.signer.address();

        // Precommits for the previous height top up the last commit.
        if vote.vote.height.increment() == self.rs.height
            && vote.vote.vote_type == VoteType::Precommit
        {
            return self.add_last_commit_precommit(vote).await;
        }

        if vote.vote.height != self.rs.height {
            debug!(
                vote.height = %vote.vote.height,
                height = %self.rs.height,
                "Vote for a different height, ignoring"
            );
            return Ok(());
        }

        let Some(vote) = self.check_vote_extension(vote).await else {
            return Ok(());
        };

        let added = match self.votes.add_vote(vote.clone()) {
            Ok(added) => added,
            Err(AddVoteError::ConflictingVotes {
                address,
                existing,
                conflicting,
            }) => {
                self.metrics.equivocations.inc();

                if address == our_address {
                    // Our own key produced both votes: either the signer's
                    // double-sign guard is broken or this key runs on two
                    // nodes. Equivocating further is worse than halting.
                    error!(
                        height = %vote.vote.height,
                        round = %vote.vote.round,
                        "Conflicting vote signed by our own key"
                    );
                    return Err(ConsensusError::SelfConflictingVote {
                        height: vote.vote.height,
                        round: vote.vote.round,
                    });
                }

                warn!(%address, "Conflicting votes, reporting to evidence pool");
                self.evidence_pool
                    .report_conflicting_votes(*existing, *conflicting);
                return Ok(());
            }
            Err(err) => {
                debug!(%err, "Rejected vote");
                return Ok(());
            }
        };

        if !added {
            return Ok(());
        }

        self.event_bus.publish(Event::Vote(vote.clone()));

        match vote.vote.vote_type {
            VoteType::Prevote => self.on_prevote_added(vote).await,
            VoteType::Precommit => self.on_precommit_added(vote).await,
        }
    }

    async fn add_last_commit_precommit(
        &mut self,
        vote: SignedVote,
    ) -> Result<(), ConsensusError> {
        let Some(last_commit) = self.rs.last_commit.as_mut() else {
            debug!("No last commit tracked, ignoring previous-height precommit");
            return Ok(());
        };

        match last_commit.add_vote(vote.clone()) {
            Ok(true) => {
                self.event_bus.publish(Event::Vote(vote));

                let bypass = self.state.consensus_params.timeout.bypass_commit_timeout;
                if bypass && last_commit.has_all() && self.rs.step == Step::NewHeight {
                    let height = self.rs.height;
                    self.enter_new_round(height, Round::ZERO).await?;
                }
            }
            Ok(false) => {}
            Err(err) => debug!(%err, "Rejected previous-height precommit"),
        }

        Ok(())
    }

    // Enforce the vote extension discipline on peer precommits: when
    // enabled, a non-nil precommit must carry a verifiable extension; when
    // disabled, stray extension data is stripped before storing.
    async fn check_vote_extension(&self, vote: SignedVote) -> Option<SignedVote> {
        let enabled = self
            .state
            .consensus_params
            .vote_extensions_enabled(self.rs.height);

        if !enabled {
            return Some(vote.strip_extension());
        }

        let needs_extension = vote.vote.vote_type == VoteType::Precommit
            && !vote.vote.block_id.is_nil()
            && vote.vote.validator_address != self.signer.address();

        if !needs_extension {
            return Some(vote);
        }

        let Some(ext_signature) = &vote.extension_signature else {
            debug!(
                validator = %vote.vote.validator_address,
                "Precommit without required vote extension, rejecting"
            );
            return None;
        };

        let (_, validator) = self
            .rs
            .validators
            .get_by_address(&vote.vote.validator_address)?;

        if validator
            .pub_key
            .verify(
                &vote.vote.extension_sign_bytes(&self.state.chain_id),
                ext_signature,
            )
            .is_err()
        {
            debug!(
                validator = %vote.vote.validator_address,
                "Invalid vote extension signature, rejecting"
            );
            return None;
        }

        let executor = self.executor.clone();
        if let Err(err) = executor.verify_vote_extension(&vote).await {
            debug!(%err, "Application rejected vote extension");
            return None;
        }

        Some(vote)
    }

    async fn on_prevote_added(&mut self, vote: SignedVote) -> Result<(), ConsensusError> {
        let height = self.rs.height;
        let vote_round = vote.vote.round;

        let (majority, any) = match self.votes.prevotes(vote_round) {
            Some(pv) => (pv.two_thirds_majority(), pv.two_thirds_any()),
            None => (None, false),
        };

        if let Some(block_id) = majority {
            // Track the most recent proof-of-lock block. The lock itself is
            // never released: a later proof of lock overrides it through
            // the prevote rule instead.
            if !block_id.is_nil()
                && self.rs.valid_round < vote_round
                && vote_round == self.rs.round
            {
                let proposal_hash = self.rs.proposal_block.as_ref().map(Block::hash);

                if proposal_hash == Some(block_id.hash) {
                    self.rs.valid_round = vote_round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                    self.event_bus.publish(Event::ValidBlock(self.rs.event()));
                } else {
                    let have_header = self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .is_some_and(|parts| parts.has_header(block_id.part_set_header));

                    if !have_header {
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_parts =
                            Some(PartSet::from_header(block_id.part_set_header));
                    }
                }
            }
        }

        if self.rs.round < vote_round && any {
            // Round skip on two-thirds-any at a later round.
            self.metrics.round_skips.inc();
            self.enter_new_round(height, vote_round).await?;
        } else if self.rs.round == vote_round && self.rs.step >= Step::Prevote {
            let decided = majority.is_some_and(|id| self.is_proposal_complete() || id.is_nil());

            if decided {
                self.enter_precommit(height, vote_round).await?;
            } else if any {
                self.enter_prevote_wait(height, vote_round).await?;
            }
        } else if let Some(proposal) = &self.rs.proposal {
            // Late prevotes may complete a re-proposal's proof of lock.
            if proposal.proposal.pol_round == vote_round && self.is_proposal_complete() {
                let current_round = self.rs.round;
                self.enter_prevote(height, current_round).await?;
            }
        }

        Ok(())
    }

    async fn on_precommit_added(&mut self, vote: SignedVote) -> Result<(), ConsensusError> {
        let height = self.rs.height;
        let vote_round = vote.vote.round;

        let (majority, any, has_all) = match self.votes.precommits(vote_round) {
            Some(pc) => (pc.two_thirds_majority(), pc.two_thirds_any(), pc.has_all()),
            None => (None, false, false),
        };

        if let Some(block_id) = majority {
            self.enter_new_round(height, vote_round).await?;
            self.enter_precommit(height, vote_round).await?;

            if !block_id.is_nil() {
                self.enter_commit(height, vote_round).await?;

                let bypass = self.state.consensus_params.timeout.bypass_commit_timeout;
                if bypass && has_all {
                    // The commit advanced the height; start its round 0
                    // without waiting out the commit timer.
                    let next_height = self.rs.height;
                    self.enter_new_round(next_height, Round::ZERO).await?;
                }
            } else {
                self.enter_precommit_wait(height, vote_round).await?;
            }
        } else if self.rs.round <= vote_round && any {
            self.enter_new_round(height, vote_round).await?;
            self.enter_precommit_wait(height, vote_round).await?;
        }

        Ok(())
    }

    //---------------------------------------------------------------------
    // Signing
    //---------------------------------------------------------------------

    // Sign a vote and queue it as an internal message. The signature is
    // not released to the network until the queued message has been
    // fsynced to the WAL and applied.
    async fn sign_vote_and_queue(&mut self, vote_type: VoteType, block_id: BlockId) {
        let address = self.signer.address();

        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            debug!("Not in the validator set; not voting");
            return;
        };

        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: Timestamp::now(),
            validator_address: address,
            validator_index: index,
            extension: Bytes::new(),
        };

        let extensions_enabled = self
            .state
            .consensus_params
            .vote_extensions_enabled(self.rs.height);

        if extensions_enabled && vote_type == VoteType::Precommit && !block_id.is_nil() {
            let executor = self.executor.clone();
            match executor.extend_vote(&vote).await {
                Ok(extension) => vote.extension = extension,
                Err(err) => {
                    warn!(%err, "extend_vote failed; abandoning vote for this round");
                    return;
                }
            }
        }

        let deadline = self
            .state
            .consensus_params
            .timeout
            .vote_for_round(self.rs.round);

        match self.signer.sign_vote(&vote, deadline).await {
            Ok((signature, extension_signature)) => {
                let mut signed = SignedVote::new(vote, signature);
                if let Some(ext_sig) = extension_signature {
                    signed = signed.with_extension_signature(ext_sig);
                }

                self.send_internal(ConsensusMessage::Vote(signed));
            }
            Err(err) => {
                // The round will time out and move on without our vote.
                warn!(%err, ?vote_type, "Failed to sign vote; abandoning for this round");
            }
        }
    }
}

fn lift_commit(commit: Commit) -> ExtendedCommit {
    ExtendedCommit {
        height: commit.height,
        round: commit.round,
        block_id: commit.block_id,
        signatures: commit
            .signatures
            .into_iter()
            .map(|commit_sig| ExtendedCommitSig {
                commit_sig,
                extension: Bytes::new(),
                extension_signature: None,
            })
            .collect(),
    }
}
