//! Unit tests of the round engine phases, driven through the real message
//! store.
use ibft_messages::{testonly as msgs, CommittedSeal, MsgType};
use zksync_concurrency::ctx;

use super::{id, payload, view};
use crate::{
    state::Phase,
    testonly::{test_hash, Harness, TestBackend},
};

#[tokio::test]
async fn proposer_builds_fresh_block_at_round_zero() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let me = id("me");
    let mut backend = TestBackend::new(me.clone(), vec![me]);
    backend.proposal = payload("new block");
    let mut util = Harness::new(backend);
    util.engine.state.reset(0);

    util.engine.run_new_round(ctx, view(0, 0)).await.unwrap();

    let sent = util.recv_sent(ctx, MsgType::PrePrepare).await.unwrap();
    let pre_prepare = sent.pre_prepare().unwrap();
    assert_eq!(pre_prepare.proposal, payload("new block"));
    assert!(pre_prepare.certificate.is_none());
    assert_eq!(util.engine.state.phase(), Phase::Prepare);
    assert_eq!(util.engine.state.proposal_message(), Some(sent));
}

#[tokio::test]
async fn proposer_at_later_round_builds_fresh_block() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let me = id("me");
    let mut backend = TestBackend::new(me.clone(), vec![me]);
    backend.quorum = 4;
    backend.proposal = payload("proposal");
    let mut util = Harness::new(backend);
    util.engine.state.reset(0);
    util.engine.state.set_view(view(0, 1));

    // A quorum of round changes, none of which prepared anything.
    for i in 0..4 {
        util.engine
            .add_message(msgs::empty_round_change(view(0, 1), msgs::node(i)));
    }

    util.engine.run_new_round(ctx, view(0, 1)).await.unwrap();

    let sent = util.recv_sent(ctx, MsgType::PrePrepare).await.unwrap();
    let pre_prepare = sent.pre_prepare().unwrap();
    assert_eq!(pre_prepare.proposal, payload("proposal"));
    assert_eq!(pre_prepare.certificate.as_ref().unwrap().len(), 4);
    assert_eq!(util.engine.state.phase(), Phase::Prepare);
    // The proposal phase multicasts nothing but the proposal itself.
    assert!(util.try_recv_sent().is_none());
}

#[tokio::test]
async fn proposer_at_later_round_reproposes_prepared_block() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let me = id("me");
    let prepared_proposer = id("unique node");
    let mut backend = TestBackend::new(me.clone(), vec![me, prepared_proposer.clone()]);
    backend.quorum = 4;
    backend.proposal = payload("proposal");
    let mut util = Harness::new(backend);
    util.engine.state.reset(0);
    util.engine.state.set_view(view(0, 1));

    // One round change proves "last prepared block" reached the prepare
    // quorum at round 0; the rest are empty.
    let block = payload("last prepared block");
    let certificate = msgs::prepared_certificate(
        view(0, 0),
        prepared_proposer,
        block.clone(),
        test_hash(&block),
        3,
    );
    util.engine.add_message(msgs::round_change(
        view(0, 1),
        msgs::node(0),
        block.clone(),
        certificate,
    ));
    for i in 1..4 {
        util.engine
            .add_message(msgs::empty_round_change(view(0, 1), msgs::node(i)));
    }

    util.engine.run_new_round(ctx, view(0, 1)).await.unwrap();

    let sent = util.recv_sent(ctx, MsgType::PrePrepare).await.unwrap();
    assert_eq!(sent.pre_prepare().unwrap().proposal, block);
    assert_eq!(util.engine.state.phase(), Phase::Prepare);
    assert!(util.try_recv_sent().is_none());
}

#[tokio::test]
async fn validator_accepts_proposal_at_round_zero() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let proposer = id("proposer");
    let backend = TestBackend::new(id("non proposer"), vec![proposer.clone()]);
    let mut util = Harness::new(backend);
    util.engine.state.reset(0);

    let block = payload("new block");
    let proposal = msgs::pre_prepare(view(0, 0), proposer, block.clone(), test_hash(&block), None);
    util.engine.add_message(proposal.clone());

    util.engine.run_new_round(ctx, view(0, 0)).await.unwrap();

    assert_eq!(util.engine.state.phase(), Phase::Prepare);
    assert_eq!(util.engine.state.proposal(), Some(block.clone()));
    assert_eq!(util.engine.state.proposal_message(), Some(proposal));
    let prepare = util.recv_sent(ctx, MsgType::Prepare).await.unwrap();
    assert_eq!(prepare.proposal_hash(), Some(&test_hash(&block)));
}

#[tokio::test]
async fn validator_skips_proposals_failing_validation() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let proposer = id("proposer");
    let backend = TestBackend::new(id("non proposer"), vec![proposer.clone()]);
    let util = Harness::new(backend);
    util.engine.state.reset(0);

    // An intruder's proposal lands first but fails validation.
    let block = payload("new block");
    util.engine.add_message(msgs::pre_prepare(
        view(0, 0),
        id("intruder"),
        payload("bogus"),
        test_hash(&payload("bogus")),
        None,
    ));
    let proposal = msgs::pre_prepare(view(0, 0), proposer, block.clone(), test_hash(&block), None);
    util.engine.add_message(proposal.clone());

    util.engine.run_new_round(ctx, view(0, 0)).await.unwrap();

    assert_eq!(util.engine.state.proposal_message(), Some(proposal));
    assert_eq!(util.engine.state.proposal(), Some(block));
}

#[tokio::test]
async fn prepare_quorum_moves_to_commit() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let proposer = id("proposer");
    let mut backend = TestBackend::new(id("me"), vec![proposer.clone()]);
    backend.quorum = 2;
    let mut util = Harness::new(backend);
    util.engine.state.reset(0);

    let block = payload("block proposal");
    let hash = test_hash(&block);
    util.engine.state.accept_proposal(msgs::pre_prepare(
        view(0, 0),
        proposer,
        block.clone(),
        hash.clone(),
        None,
    ));

    util.engine
        .add_message(msgs::prepare(view(0, 0), msgs::node(1), hash.clone()));
    // A vote for some other hash never counts towards the quorum.
    util.engine.add_message(msgs::prepare(
        view(0, 0),
        msgs::node(2),
        test_hash(&payload("other")),
    ));
    util.engine
        .add_message(msgs::prepare(view(0, 0), msgs::node(3), hash.clone()));

    util.engine.run_prepare(ctx, view(0, 0)).await.unwrap();

    assert_eq!(util.engine.state.phase(), Phase::Commit);
    assert_eq!(util.engine.state.proposal(), Some(block.clone()));
    let commit = util.recv_sent(ctx, MsgType::Commit).await.unwrap();
    assert_eq!(commit.proposal_hash(), Some(&hash));
    assert_eq!(commit.committed_seal(), Some(&b"committed seal"[..]));

    let (last_block, last_certificate) = util.engine.state.last_prepared();
    assert_eq!(last_block, Some(block));
    assert_eq!(last_certificate.unwrap().prepare_messages.len(), 2);
}

#[tokio::test]
async fn commit_quorum_collects_seals() {
    zksync_concurrency::testonly::abort_on_panic();
    let ctx = &ctx::test_root(&ctx::RealClock);
    let proposer = id("proposer");
    let backend = TestBackend::new(id("me"), vec![proposer.clone()]);
    let util = Harness::new(backend);
    util.engine.state.reset(0);

    let block = payload("block proposal");
    let hash = test_hash(&block);
    util.engine.state.accept_proposal(msgs::pre_prepare(
        view(0, 0),
        proposer.clone(),
        block.clone(),
        hash.clone(),
        None,
    ));
    util.engine.state.finalize_prepare(
        msgs::prepared_certificate(view(0, 0), proposer, block.clone(), hash.clone(), 1),
        block,
    );

    util.engine.add_message(msgs::commit(
        view(0, 0),
        id("signer"),
        hash,
        "committed seal",
    ));

    util.engine.run_commit(ctx, view(0, 0)).await.unwrap();

    assert_eq!(
        util.engine.state.committed_seals(),
        vec![CommittedSeal {
            signer: id("signer"),
            signature: b"committed seal".to_vec(),
        }]
    );
    // Insertion, and with it the FIN transition, is the sequence engine's
    // job.
    assert_eq!(util.engine.state.phase(), Phase::Commit);
}
