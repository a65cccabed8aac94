//! End-to-end scenarios driving a single consensus node by hand.

use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use tenderbft_consensus::{decode_message, Event, Step, WalMessage};
use tenderbft_core_types::{
    BlockId, BlockStore, Hash, Height, PartSetHeader, Round, SynchronyParams, Timestamp, VoteType,
};
use tenderbft_test::{parts_for, Fixture, TestExecutor, TestNode};

const H1: Height = Height::new(1);
const R0: Round = Round::ZERO;

/// An index that does not propose in any of the given rounds.
fn bystander(fixture: &Fixture, rounds: impl IntoIterator<Item = u32>) -> u32 {
    let proposers: Vec<u32> = rounds.into_iter().map(|r| fixture.proposer_at(r)).collect();
    (0..fixture.validators.len() as u32)
        .find(|index| !proposers.contains(index))
        .expect("a bystander exists")
}

/// Indices of everyone but `ours`.
fn peers(fixture: &Fixture, ours: u32) -> Vec<u32> {
    (0..fixture.validators.len() as u32)
        .filter(|index| *index != ours)
        .collect()
}

fn wal_end_heights(path: &std::path::Path) -> Vec<u64> {
    let log = tenderbft_wal::Log::open(path).unwrap();
    log.iter()
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter_map(|bytes| decode_message(std::io::Cursor::new(&bytes[..])).ok())
        .filter_map(|msg| match msg {
            WalMessage::EndHeight(height) => Some(height.as_u64()),
            _ => None,
        })
        .collect()
}

// S1: we are the proposer at height 1, round 0. Our proposal gathers
// prevotes and precommits from everyone, and the block commits.
#[tokio::test]
async fn happy_path_commits_in_round_zero() {
    let fixture = Fixture::new(4);
    let ours = fixture.proposer_at(0);

    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("cs.wal");

    let mut node = TestNode::new(&fixture, ours, wal_path.clone()).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    // We proposed, completed our own proposal, and prevoted it.
    let rs = node.driver.round_state();
    assert_eq!(rs.step, Step::Prevote);
    let block_id = rs.proposal.as_ref().unwrap().proposal.block_id;
    assert_eq!(node.our_vote(R0, VoteType::Prevote), Some(block_id));

    for index in peers(&fixture, ours) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, H1, R0, block_id);
        node.deliver_vote(vote).await.unwrap();
    }

    // The polka locked us on the block and we precommitted it.
    assert_eq!(node.driver.round_state().locked_round, R0);
    assert_eq!(node.our_vote(R0, VoteType::Precommit), Some(block_id));

    for index in peers(&fixture, ours) {
        let vote = fixture.signed_vote(index, VoteType::Precommit, H1, R0, block_id);
        node.deliver_vote(vote).await.unwrap();
    }

    // Committed: block persisted, height advanced.
    assert_eq!(node.block_store.height(), H1);
    let rs = node.driver.round_state();
    assert_eq!(rs.height, Height::new(2));
    assert_eq!(rs.step, Step::NewHeight);

    // The last commit carries all four precommits.
    let last_commit = rs.last_commit.as_ref().unwrap();
    assert!(last_commit.has_all());
    assert_eq!(last_commit.make_commit().unwrap().signatures.len(), 4);

    // The end-height marker made it into the WAL.
    drop(node);
    assert_eq!(wal_end_heights(&wal_path), vec![1]);
}

// S2: no proposal arrives. We prevote nil on the propose timeout, the
// round dies with nil precommits, and the machine moves to round 1.
#[tokio::test]
async fn missing_proposer_advances_to_the_next_round() {
    let fixture = Fixture::new(4);
    let ours = bystander(&fixture, [0, 1]);

    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::new(&fixture, ours, dir.path().join("cs.wal")).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    assert_eq!(node.driver.round_state().step, Step::Propose);

    node.fire_timeout(R0, Step::Propose).await.unwrap();
    assert_eq!(node.our_vote(R0, VoteType::Prevote), Some(BlockId::nil()));

    // Two peer nils complete a nil polka; we precommit nil.
    for index in peers(&fixture, ours).into_iter().take(2) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, H1, R0, BlockId::nil());
        node.deliver_vote(vote).await.unwrap();
    }
    assert_eq!(node.our_vote(R0, VoteType::Precommit), Some(BlockId::nil()));

    for index in peers(&fixture, ours) {
        let vote = fixture.signed_vote(index, VoteType::Precommit, H1, R0, BlockId::nil());
        node.deliver_vote(vote).await.unwrap();
    }

    assert!(node.driver.round_state().triggered_timeout_precommit);
    node.fire_timeout(R0, Step::PrecommitWait).await.unwrap();

    let rs = node.driver.round_state();
    assert_eq!(rs.round, Round::new(1));
    assert_eq!(rs.step, Step::Propose);
    assert_eq!(rs.locked_round, Round::Nil);
}

// S3: lock on a block in round 0, refuse a fresh competing proposal in
// round 1, then relock when the original block returns with its proof of
// lock in round 2.
#[tokio::test]
async fn lock_then_relock_on_reproposal() {
    let fixture = Fixture::new(4);
    let ours = bystander(&fixture, [0, 1, 2]);
    let genesis = fixture.genesis();

    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::new(&fixture, ours, dir.path().join("cs.wal")).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    // Round 0: proposer sends block B; everyone prevotes it.
    let proposer0 = fixture.proposer_at(0);
    let block_b = TestExecutor::build_block(
        &genesis,
        vec![Bytes::from_static(b"tx-b")],
        Timestamp::now(),
        fixture.validators.get_by_index(proposer0).unwrap().address,
    );
    let parts_b = parts_for(&block_b);
    let b_id = BlockId::new(block_b.hash(), parts_b.header());

    let proposal = fixture.signed_proposal(proposer0, R0, Round::Nil, &block_b, &parts_b);
    node.deliver_proposal(proposal, &parts_b).await.unwrap();

    assert_eq!(node.our_vote(R0, VoteType::Prevote), Some(b_id));

    for index in peers(&fixture, ours).into_iter().take(2) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, H1, R0, b_id);
        node.deliver_vote(vote).await.unwrap();
    }

    // Locked on B and precommitted it.
    let rs = node.driver.round_state();
    assert_eq!(rs.locked_round, R0);
    assert_eq!(node.our_vote(R0, VoteType::Precommit), Some(b_id));

    // But the rest of the network precommits nil; the round dies.
    for index in peers(&fixture, ours) {
        let vote = fixture.signed_vote(index, VoteType::Precommit, H1, R0, BlockId::nil());
        node.deliver_vote(vote).await.unwrap();
    }
    node.fire_timeout(R0, Step::PrecommitWait).await.unwrap();

    let round1 = Round::new(1);
    assert_eq!(node.driver.round_state().round, round1);

    // Round 1: a fresh competing proposal. We are locked on B, so nil.
    let proposer1 = fixture.proposer_at(1);
    let block_c = TestExecutor::build_block(
        &genesis,
        vec![Bytes::from_static(b"tx-c")],
        Timestamp::now(),
        fixture.validators.get_by_index(proposer1).unwrap().address,
    );
    let parts_c = parts_for(&block_c);

    let proposal = fixture.signed_proposal(proposer1, round1, Round::Nil, &block_c, &parts_c);
    node.deliver_proposal(proposal, &parts_c).await.unwrap();

    assert_eq!(node.our_vote(round1, VoteType::Prevote), Some(BlockId::nil()));
    assert_eq!(node.driver.round_state().locked_round, R0);

    // Round 1 dies too.
    for index in peers(&fixture, ours).into_iter().take(2) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, H1, round1, BlockId::nil());
        node.deliver_vote(vote).await.unwrap();
    }
    for index in peers(&fixture, ours) {
        let vote = fixture.signed_vote(index, VoteType::Precommit, H1, round1, BlockId::nil());
        node.deliver_vote(vote).await.unwrap();
    }
    node.fire_timeout(round1, Step::PrecommitWait).await.unwrap();

    let round2 = Round::new(2);
    assert_eq!(node.driver.round_state().round, round2);

    // Round 2: B comes back with its proof of lock from round 0.
    let proposer2 = fixture.proposer_at(2);
    let proposal = fixture.signed_proposal(proposer2, round2, R0, &block_b, &parts_b);
    node.deliver_proposal(proposal, &parts_b).await.unwrap();

    assert_eq!(node.our_vote(round2, VoteType::Prevote), Some(b_id));

    for index in peers(&fixture, ours).into_iter().take(2) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, H1, round2, b_id);
        node.deliver_vote(vote).await.unwrap();
    }

    // Relocked at round 2 and precommitted B.
    let rs = node.driver.round_state();
    assert_eq!(rs.locked_round, round2);
    assert_eq!(node.our_vote(round2, VoteType::Precommit), Some(b_id));
    assert!(node.event_bus.saw(|e| matches!(e, Event::Relock(_))));
}

// S4: two-thirds precommits observed at a much higher round jump the
// machine straight there.
#[tokio::test]
async fn round_skip_on_higher_round_votes() {
    let fixture = Fixture::new(4);
    let ours = bystander(&fixture, [5]);

    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::new(&fixture, ours, dir.path().join("cs.wal")).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();
    node.fire_timeout(R0, Step::Propose).await.unwrap();

    assert_eq!(node.driver.round_state().step, Step::Prevote);

    let round5 = Round::new(5);
    for index in peers(&fixture, ours).into_iter().take(3) {
        let vote = fixture.signed_vote(index, VoteType::Precommit, H1, round5, BlockId::nil());
        node.deliver_vote(vote).await.unwrap();
    }

    let rs = node.driver.round_state();
    assert_eq!(rs.round, round5);
    assert_eq!(node.our_vote(round5, VoteType::Precommit), Some(BlockId::nil()));
}

// S5: a peer equivocates. The conflict is reported to the evidence pool,
// both votes are retained, and the node keeps running.
#[tokio::test]
async fn conflicting_peer_votes_become_evidence() {
    let fixture = Fixture::new(4);
    let ours = bystander(&fixture, [0]);

    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::new(&fixture, ours, dir.path().join("cs.wal")).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    let equivocator = peers(&fixture, ours)[0];

    let id1 = BlockId::new(Hash::digest([1]), PartSetHeader::new(1, Hash::digest([1])));
    let id2 = BlockId::new(Hash::digest([2]), PartSetHeader::new(1, Hash::digest([2])));

    let first = fixture.signed_vote(equivocator, VoteType::Prevote, H1, R0, id1);
    let second = fixture.signed_vote(equivocator, VoteType::Prevote, H1, R0, id2);

    node.deliver_vote(first.clone()).await.unwrap();
    node.deliver_vote(second.clone()).await.unwrap();

    let reports = node.evidence.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, first);
    assert_eq!(reports[0].1, second);

    // The first vote stands; the conflict is also kept as evidence.
    let address = first.vote.validator_address;
    let stored = node
        .driver
        .votes()
        .prevotes(R0)
        .unwrap()
        .get_by_address(&address)
        .unwrap();
    assert_eq!(stored, &first);
    assert!(node.driver.votes().evidence().get(&address).is_some());

    // State is untouched; the machine is still live.
    assert_eq!(node.driver.round_state().height, H1);
    node.fire_timeout(R0, Step::Propose).await.unwrap();
    assert_eq!(node.driver.round_state().step, Step::Prevote);
}

// S6: the WAL loses its tail to corruption. Startup repairs it once,
// preserves the original, replays what survived, and consensus resumes at
// the height after the last end-height marker.
#[tokio::test]
async fn wal_corruption_is_repaired_on_startup() {
    let fixture = Fixture::new(4);
    let ours = fixture.proposer_at(0);

    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("cs.wal");

    let mut node = TestNode::new(&fixture, ours, wal_path.clone()).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    let block_id = node
        .driver
        .round_state()
        .proposal
        .as_ref()
        .unwrap()
        .proposal
        .block_id;

    for index in peers(&fixture, ours) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, H1, R0, block_id);
        node.deliver_vote(vote).await.unwrap();
    }
    for index in peers(&fixture, ours) {
        let vote = fixture.signed_vote(index, VoteType::Precommit, H1, R0, block_id);
        node.deliver_vote(vote).await.unwrap();
    }

    assert_eq!(node.driver.round_state().height, Height::new(2));

    // Two height-2 prevotes land after the end-height marker; the second
    // will fall to the corruption.
    let h2 = Height::new(2);
    for index in peers(&fixture, ours).into_iter().take(2) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, h2, R0, BlockId::nil());
        node.deliver_vote(vote).await.unwrap();
    }

    let block_store = node.block_store.clone();
    let state_store = node.state_store.clone();
    drop(node);

    // Chop 17 bytes off the end of the log.
    let len = std::fs::metadata(&wal_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&wal_path)
        .unwrap();
    file.set_len(len - 17).unwrap();
    drop(file);

    let config = tenderbft_config::ConsensusConfig {
        wal_path: wal_path.clone(),
        ..tenderbft_config::ConsensusConfig::default()
    };
    let mut node =
        TestNode::with_stores(&fixture, ours, config, block_store, state_store).await;
    node.start().await.unwrap();

    // The original was preserved and consensus resumed at height 2.
    let corrupted = {
        let mut name = wal_path.as_os_str().to_os_string();
        name.push(".CORRUPTED");
        std::path::PathBuf::from(name)
    };
    assert!(corrupted.exists());

    let rs = node.driver.round_state();
    assert_eq!(rs.height, h2);

    // The surviving height-2 prevote was replayed into the vote set.
    let replayed = node.driver.votes().prevotes(R0).unwrap().weight_sum();
    assert_eq!(replayed, 1);
}

// S7: a proposal whose timestamp is outside the synchrony window is
// rejected as untimely and prevoted nil.
#[tokio::test]
async fn untimely_proposal_gets_a_nil_prevote() {
    let params = {
        let mut params = tenderbft_core_types::ConsensusParams::default();
        params.synchrony = SynchronyParams {
            message_delay: Duration::from_millis(500),
            precision: Duration::from_millis(10),
        };
        params
    };

    let fixture = Fixture::with_params(4, params);
    let ours = bystander(&fixture, [0]);
    let genesis = fixture.genesis();

    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::new(&fixture, ours, dir.path().join("cs.wal")).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    // Timestamp beyond receive_time + message_delay(0) + precision.
    let skewed = Timestamp::now()
        + Duration::from_millis(500)
        + Duration::from_millis(10)
        + Duration::from_millis(250);

    let proposer0 = fixture.proposer_at(0);
    let block = TestExecutor::build_block(
        &genesis,
        vec![Bytes::from_static(b"tx")],
        skewed,
        fixture.validators.get_by_index(proposer0).unwrap().address,
    );
    let parts = parts_for(&block);

    let proposal = fixture.signed_proposal(proposer0, R0, Round::Nil, &block, &parts);
    node.deliver_proposal(proposal, &parts).await.unwrap();

    assert_eq!(node.our_vote(R0, VoteType::Prevote), Some(BlockId::nil()));
    assert_eq!(node.metrics.untimely_proposals.get(), 1);
}

// The first proposal for a round wins; later ones are ignored.
#[tokio::test]
async fn set_proposal_is_first_come_first_served() {
    let fixture = Fixture::new(4);
    let ours = bystander(&fixture, [0]);
    let genesis = fixture.genesis();

    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::new(&fixture, ours, dir.path().join("cs.wal")).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    let proposer0 = fixture.proposer_at(0);
    let proposer_address = fixture.validators.get_by_index(proposer0).unwrap().address;

    let block_a = TestExecutor::build_block(
        &genesis,
        vec![Bytes::from_static(b"a")],
        Timestamp::now(),
        proposer_address,
    );
    let parts_a = parts_for(&block_a);

    let block_b = TestExecutor::build_block(
        &genesis,
        vec![Bytes::from_static(b"b")],
        Timestamp::now(),
        proposer_address,
    );
    let parts_b = parts_for(&block_b);

    let first = fixture.signed_proposal(proposer0, R0, Round::Nil, &block_a, &parts_a);
    let second = fixture.signed_proposal(proposer0, R0, Round::Nil, &block_b, &parts_b);

    node.deliver(tenderbft_consensus::ConsensusMessage::Proposal(first.clone()))
        .await
        .unwrap();
    node.deliver(tenderbft_consensus::ConsensusMessage::Proposal(second))
        .await
        .unwrap();

    let stored = node.driver.round_state().proposal.as_ref().unwrap();
    assert_eq!(stored, &first);
}

// With vote extensions enabled, bare non-nil precommits from peers are
// rejected, extended ones are accepted, and the commit is stored in its
// extended form.
#[tokio::test]
async fn vote_extensions_are_required_when_enabled() {
    let params = {
        let mut params = tenderbft_core_types::ConsensusParams::default();
        params.abci.vote_extensions_enable_height = Height::new(1);
        params
    };

    let fixture = Fixture::with_params(4, params);
    let ours = bystander(&fixture, [0]);
    let genesis = fixture.genesis();

    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::new(&fixture, ours, dir.path().join("cs.wal")).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    let proposer0 = fixture.proposer_at(0);
    let block = TestExecutor::build_block(
        &genesis,
        vec![Bytes::from_static(b"tx")],
        Timestamp::now(),
        fixture.validators.get_by_index(proposer0).unwrap().address,
    );
    let parts = parts_for(&block);
    let b_id = BlockId::new(block.hash(), parts.header());

    let proposal = fixture.signed_proposal(proposer0, R0, Round::Nil, &block, &parts);
    node.deliver_proposal(proposal, &parts).await.unwrap();

    for index in peers(&fixture, ours).into_iter().take(2) {
        let vote = fixture.signed_vote(index, VoteType::Prevote, H1, R0, b_id);
        node.deliver_vote(vote).await.unwrap();
    }

    // Polka: our own precommit (with extension) is in.
    assert_eq!(node.our_vote(R0, VoteType::Precommit), Some(b_id));
    let our_weight = node.driver.votes().precommits(R0).unwrap().weight_sum();
    assert_eq!(our_weight, 1);

    // A bare precommit is rejected outright.
    let bare_index = peers(&fixture, ours)[0];
    let bare = fixture.signed_vote(bare_index, VoteType::Precommit, H1, R0, b_id);
    node.deliver_vote(bare).await.unwrap();
    assert_eq!(node.driver.votes().precommits(R0).unwrap().weight_sum(), 1);

    // Extended precommits are accepted and drive the commit.
    for index in peers(&fixture, ours) {
        let vote = fixture.signed_precommit_with_extension(
            index,
            H1,
            R0,
            b_id,
            Bytes::from_static(b"extension"),
        );
        node.deliver_vote(vote).await.unwrap();
    }

    assert_eq!(node.driver.round_state().height, Height::new(2));
    let extended = node.block_store.load_block_extended_commit(H1).unwrap();
    assert_eq!(extended.block_id, b_id);
    assert!(extended
        .signatures
        .iter()
        .filter(|sig| sig.commit_sig.is_present())
        .all(|sig| !sig.extension.is_empty()));
}

// With empty blocks disabled, round 0 lingers in NewRound until the
// mempool signals transactions; the signal moves it into Propose.
#[tokio::test]
async fn txs_available_triggers_propose() {
    use std::sync::Arc;
    use tenderbft_core_types::{BlockStore, ChainState, Commit};
    use tenderbft_test::{MemBlockStore, MemStateStore};

    let fixture = Fixture::new(4);
    let genesis = fixture.genesis();

    // Waiting only applies beyond the initial height (the first block is a
    // proof block), so pretend height 1 already committed.
    let proposer0 = fixture.proposer_at(0);
    let block1 = TestExecutor::build_block(
        &genesis,
        Vec::new(),
        Timestamp::now(),
        fixture.validators.get_by_index(proposer0).unwrap().address,
    );
    let parts1 = parts_for(&block1);

    let block_store = Arc::new(MemBlockStore::new());
    block_store.save_block(block1.clone(), &parts1, Commit::empty());

    let mut validators = genesis.validators.clone();
    validators.advance_proposer_priority(1);

    let state = ChainState {
        last_block_height: Height::new(1),
        last_block_id: BlockId::new(block1.hash(), parts1.header()),
        last_block_time: block1.header.time,
        validators: validators.clone(),
        last_validators: genesis.validators.clone(),
        ..genesis
    };

    // Pick a non-proposer for height 2, round 0.
    let proposer_address = validators.proposer().address;
    let ours = (0..4u32)
        .find(|i| fixture.keys[*i as usize].public_key().address() != proposer_address)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = tenderbft_config::ConsensusConfig {
        wal_path: dir.path().join("cs.wal"),
        create_empty_blocks: false,
        ..tenderbft_config::ConsensusConfig::default()
    };

    let state_store = Arc::new(MemStateStore::new(state));
    let mut node = TestNode::with_stores(&fixture, ours, config, block_store, state_store).await;
    node.start().await.unwrap();
    node.enter_round0().await.unwrap();

    // Lingering: no transactions, no propose step yet.
    let rs = node.driver.round_state();
    assert_eq!(rs.height, Height::new(2));
    assert_eq!(rs.step, Step::NewRound);

    node.driver.on_txs_available().await.unwrap();
    assert_eq!(node.driver.round_state().step, Step::Propose);
}
