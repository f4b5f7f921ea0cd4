//! Tests of the per-height state transitions and the round timer
//! arithmetic.
use ibft_messages::testonly as msgs;
use zksync_concurrency::time;

use super::{id, payload, view};
use crate::{
    state::Phase,
    testonly::{test_hash, Harness, TestBackend},
};

#[test]
fn phase_display_strings() {
    assert_eq!(Phase::NewRound.to_string(), "new round");
    assert_eq!(Phase::Prepare.to_string(), "prepare");
    assert_eq!(Phase::Commit.to_string(), "commit");
    assert_eq!(Phase::Fin.to_string(), "fin");
}

#[test]
fn set_view_clears_the_round_but_keeps_the_prepared_cache() {
    let util = Harness::new(TestBackend::new(id("me"), vec![id("proposer")]));
    let state = &util.engine.state;
    state.reset(0);

    let block = payload("block");
    let hash = test_hash(&block);
    state.accept_proposal(msgs::pre_prepare(
        view(0, 0),
        id("proposer"),
        block.clone(),
        hash.clone(),
        None,
    ));
    state.finalize_prepare(
        msgs::prepared_certificate(view(0, 0), id("proposer"), block.clone(), hash, 2),
        block.clone(),
    );
    assert_eq!(state.phase(), Phase::Commit);

    state.set_view(view(0, 1));

    assert_eq!(state.view(), view(0, 1));
    assert_eq!(state.phase(), Phase::NewRound);
    assert!(state.proposal_message().is_none());
    assert!(!state.round_started());
    // The prepared cache survives round changes within the height.
    let (last_block, last_certificate) = state.last_prepared();
    assert_eq!(last_block, Some(block));
    assert!(last_certificate.is_some());
}

#[test]
fn reset_clears_the_prepared_cache() {
    let util = Harness::new(TestBackend::new(id("me"), vec![id("proposer")]));
    let state = &util.engine.state;
    state.reset(0);

    let block = payload("block");
    let hash = test_hash(&block);
    state.finalize_prepare(
        msgs::prepared_certificate(view(0, 0), id("proposer"), block.clone(), hash, 2),
        block,
    );

    state.reset(1);

    assert_eq!(state.view(), view(1, 0));
    assert_eq!(state.phase(), Phase::NewRound);
    let (last_block, last_certificate) = state.last_prepared();
    assert!(last_block.is_none());
    assert!(last_certificate.is_none());
}

#[test]
fn round_timeout_doubles_every_round() {
    let util = Harness::with_base_timeout(
        TestBackend::new(id("me"), vec![]),
        time::Duration::seconds(10),
    );
    assert_eq!(util.engine.round_timeout(0), time::Duration::seconds(10));
    assert_eq!(util.engine.round_timeout(1), time::Duration::seconds(20));
    assert_eq!(util.engine.round_timeout(3), time::Duration::seconds(80));
}

#[test]
fn round_timeout_is_capped() {
    let mut util = Harness::with_base_timeout(
        TestBackend::new(id("me"), vec![]),
        time::Duration::seconds(10),
    );
    util.engine.config.max_round_timeout = time::Duration::seconds(40);
    assert_eq!(util.engine.round_timeout(10), time::Duration::seconds(40));
    // Large rounds must not overflow.
    assert_eq!(util.engine.round_timeout(u64::MAX), time::Duration::seconds(40));
}

#[test]
fn extend_round_timeout_adds_to_every_round() {
    let util = Harness::with_base_timeout(
        TestBackend::new(id("me"), vec![]),
        time::Duration::seconds(10),
    );
    util.engine.extend_round_timeout(time::Duration::seconds(5));
    assert_eq!(util.engine.additional_timeout(), time::Duration::seconds(5));
    assert_eq!(util.engine.round_timeout(0), time::Duration::seconds(15));
    assert_eq!(util.engine.round_timeout(1), time::Duration::seconds(25));
}
