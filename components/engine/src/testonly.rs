//! Test-only collaborators: a scriptable backend, a recording transport and
//! a harness bundling them with an engine instance.
use std::sync::{Arc, Mutex};

use ibft_messages::{
    Commit, CommittedSeal, ConsensusMsg, Message, MsgType, NodeId, Payload, PayloadHash,
    PrePrepare, Prepare, PreparedCertificate, RoundChange, RoundChangeCertificate, View,
};
use zksync_concurrency::ctx;

use crate::{Backend, Config, Transport, IBFT};

/// The hash rule every [`TestBackend`] agrees on: deterministic, collision
/// free for test payloads, and obviously not a real hash.
pub fn test_hash(proposal: &Payload) -> PayloadHash {
    PayloadHash([b"hash:".as_slice(), &proposal.0].concat())
}

/// A backend scriptable through plain fields. Proposer policy is membership
/// in `proposers`; the hash rule is [`test_hash`]; inserted blocks are
/// recorded for assertions.
#[derive(Debug)]
pub struct TestBackend {
    /// This node's id.
    pub id: NodeId,
    /// Ids considered proposers, for every view.
    pub proposers: Vec<NodeId>,
    /// Quorum size, for every height.
    pub quorum: usize,
    /// Tolerated faulty validators, for every height.
    pub max_faulty: usize,
    /// The block `build_proposal` produces.
    pub proposal: Payload,
    /// Whether `is_valid_block` accepts anything.
    pub valid_blocks: bool,
    /// Senders `is_valid_sender` rejects.
    pub invalid_senders: Vec<NodeId>,
    /// Blocks handed to `insert_block`, with their seals.
    pub inserted: Mutex<Vec<(Payload, Vec<CommittedSeal>)>>,
}

impl TestBackend {
    /// A backend for node `id`; `proposers` decides the proposer role.
    pub fn new(id: NodeId, proposers: Vec<NodeId>) -> Self {
        Self {
            id,
            proposers,
            quorum: 1,
            max_faulty: 0,
            proposal: Payload(b"block proposal".to_vec()),
            valid_blocks: true,
            invalid_senders: Vec::new(),
            inserted: Mutex::new(Vec::new()),
        }
    }

    /// Number of blocks inserted so far.
    pub fn inserted_count(&self) -> usize {
        self.inserted.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Backend for TestBackend {
    fn id(&self) -> NodeId {
        self.id.clone()
    }

    fn quorum(&self, _height: u64) -> usize {
        self.quorum
    }

    fn max_faulty(&self, _height: u64) -> usize {
        self.max_faulty
    }

    fn is_proposer(&self, id: &NodeId, _height: u64, _round: u64) -> bool {
        self.proposers.contains(id)
    }

    async fn build_proposal(&self, _ctx: &ctx::Ctx, _height: u64) -> ctx::Result<Payload> {
        Ok(self.proposal.clone())
    }

    fn build_pre_prepare(
        &self,
        proposal: Payload,
        certificate: Option<RoundChangeCertificate>,
        view: View,
    ) -> Message {
        Message {
            view,
            from: self.id.clone(),
            msg: ConsensusMsg::PrePrepare(PrePrepare {
                proposal_hash: test_hash(&proposal),
                proposal,
                certificate,
            }),
        }
    }

    fn build_prepare(&self, proposal_hash: PayloadHash, view: View) -> Message {
        Message {
            view,
            from: self.id.clone(),
            msg: ConsensusMsg::Prepare(Prepare { proposal_hash }),
        }
    }

    fn build_commit(&self, proposal_hash: PayloadHash, view: View) -> Message {
        Message {
            view,
            from: self.id.clone(),
            msg: ConsensusMsg::Commit(Commit {
                proposal_hash,
                committed_seal: b"committed seal".to_vec(),
            }),
        }
    }

    fn build_round_change(
        &self,
        last_prepared_block: Option<Payload>,
        last_prepared_certificate: Option<PreparedCertificate>,
        view: View,
    ) -> Message {
        Message {
            view,
            from: self.id.clone(),
            msg: ConsensusMsg::RoundChange(RoundChange {
                last_prepared_block,
                last_prepared_certificate,
            }),
        }
    }

    fn is_valid_block(&self, _proposal: &Payload) -> bool {
        self.valid_blocks
    }

    fn is_valid_proposal_hash(&self, proposal: &Payload, hash: &PayloadHash) -> bool {
        hash == &test_hash(proposal)
    }

    fn is_valid_sender(&self, message: &Message) -> bool {
        !self.invalid_senders.contains(&message.from)
    }

    async fn insert_block(
        &self,
        _ctx: &ctx::Ctx,
        proposal: &Payload,
        seals: Vec<CommittedSeal>,
    ) -> ctx::Result<()> {
        self.inserted.lock().unwrap().push((proposal.clone(), seals));
        Ok(())
    }
}

/// A transport forwarding every multicast into an unbounded channel owned by
/// the test.
#[derive(Debug)]
pub struct TestTransport(pub ctx::channel::UnboundedSender<Message>);

impl Transport for TestTransport {
    fn multicast(&self, message: Message) {
        self.0.send(message);
    }
}

/// An engine wired to a [`TestBackend`] and a recording transport.
pub struct Harness {
    /// The engine under test.
    pub engine: IBFT,
    /// The backend behind the engine.
    pub backend: Arc<TestBackend>,
    /// Everything the engine multicast, in order.
    pub sent: ctx::channel::UnboundedReceiver<Message>,
}

impl Harness {
    /// Harness with the default round timer durations.
    pub fn new(backend: TestBackend) -> Self {
        let backend = Arc::new(backend);
        let (send, recv) = ctx::channel::unbounded();
        let engine = IBFT::new(Config::new(backend.clone(), Arc::new(TestTransport(send))));
        Self {
            engine,
            backend,
            sent: recv,
        }
    }

    /// Harness with a custom base round timeout.
    pub fn with_base_timeout(backend: TestBackend, base: zksync_concurrency::time::Duration) -> Self {
        let mut this = Self::new(backend);
        this.engine.config.base_round_timeout = base;
        this
    }

    /// Awaits the next multicast message of the given kind, discarding
    /// others.
    pub async fn recv_sent(
        &mut self,
        ctx: &ctx::Ctx,
        kind: MsgType,
    ) -> ctx::OrCanceled<Message> {
        loop {
            let message = self.sent.recv(ctx).await?;
            if message.kind() == kind {
                return Ok(message);
            }
        }
    }

    /// The next multicast message, if one is already pending.
    pub fn try_recv_sent(&mut self) -> Option<Message> {
        self.sent.try_recv()
    }
}
