//! Test-only builders for protocol messages and certificates.
use crate::{
    Commit, ConsensusMsg, Message, NodeId, Payload, PayloadHash, PrePrepare, Prepare,
    PreparedCertificate, RoundChange, RoundChangeCertificate, View,
};

/// A node id of the form "node <i>".
pub fn node(i: usize) -> NodeId {
    NodeId::new(format!("node {i}"))
}

/// A PRE-PREPARE message.
pub fn pre_prepare(
    view: View,
    from: NodeId,
    proposal: Payload,
    proposal_hash: PayloadHash,
    certificate: Option<RoundChangeCertificate>,
) -> Message {
    Message {
        view,
        from,
        msg: ConsensusMsg::PrePrepare(PrePrepare {
            proposal,
            proposal_hash,
            certificate,
        }),
    }
}

/// A PREPARE message.
pub fn prepare(view: View, from: NodeId, proposal_hash: PayloadHash) -> Message {
    Message {
        view,
        from,
        msg: ConsensusMsg::Prepare(Prepare { proposal_hash }),
    }
}

/// A COMMIT message.
pub fn commit(
    view: View,
    from: NodeId,
    proposal_hash: PayloadHash,
    committed_seal: impl Into<Vec<u8>>,
) -> Message {
    Message {
        view,
        from,
        msg: ConsensusMsg::Commit(Commit {
            proposal_hash,
            committed_seal: committed_seal.into(),
        }),
    }
}

/// A ROUND-CHANGE message with no prepared block.
pub fn empty_round_change(view: View, from: NodeId) -> Message {
    Message {
        view,
        from,
        msg: ConsensusMsg::RoundChange(RoundChange::default()),
    }
}

/// A ROUND-CHANGE message carrying a prepared block and its certificate.
pub fn round_change(
    view: View,
    from: NodeId,
    last_prepared_block: Payload,
    last_prepared_certificate: PreparedCertificate,
) -> Message {
    Message {
        view,
        from,
        msg: ConsensusMsg::RoundChange(RoundChange {
            last_prepared_block: Some(last_prepared_block),
            last_prepared_certificate: Some(last_prepared_certificate),
        }),
    }
}

/// A prepared certificate for `proposal` at `view`: a PRE-PREPARE from
/// `proposer` plus `votes` PREPARE messages from senders "node 1".."node
/// <votes>".
pub fn prepared_certificate(
    view: View,
    proposer: NodeId,
    proposal: Payload,
    proposal_hash: PayloadHash,
    votes: usize,
) -> PreparedCertificate {
    PreparedCertificate {
        proposal_message: Box::new(pre_prepare(
            view,
            proposer,
            proposal,
            proposal_hash.clone(),
            None,
        )),
        prepare_messages: (1..=votes)
            .map(|i| prepare(view, node(i), proposal_hash.clone()))
            .collect(),
    }
}

/// `count` ROUND-CHANGE messages at `view` from unique senders, each carrying
/// the same prepared block and a certificate for it at `prepared_view`.
pub fn filled_round_changes(
    view: View,
    prepared_view: View,
    proposer: NodeId,
    proposal: Payload,
    proposal_hash: PayloadHash,
    count: usize,
) -> Vec<Message> {
    let certificate = prepared_certificate(
        prepared_view,
        proposer,
        proposal.clone(),
        proposal_hash,
        count - 1,
    );
    (0..count)
        .map(|i| round_change(view, node(i), proposal.clone(), certificate.clone()))
        .collect()
}
