//! A thread-safe inbox for protocol messages, partitioned by
//! (height, round, kind), with threshold subscriptions: consumers register
//! interest in "at least N messages of kind K at view V" and get woken on a
//! channel once the count crosses the threshold.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use zksync_concurrency::ctx;

use crate::{Message, MsgType, NodeId, View};

/// What a subscriber wants to be woken for.
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionDetails {
    /// Height and (minimum) round of interest.
    pub view: View,
    /// Message kind of interest.
    pub kind: MsgType,
    /// How many messages must be buffered before the subscriber is woken.
    pub min_count: usize,
    /// If set, any round >= `view.round` at `view.height` counts, and the
    /// highest satisfied round is reported. Otherwise only the exact
    /// (height, round) bucket is considered.
    pub any_round_geq: bool,
}

/// Identifier of an active subscription, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription. The channel yields the round number at
/// which the threshold was met. Notifications are edge-triggered with a
/// buffer of one: at most a single notification is pending at any time, and
/// the subscription re-arms once the consumer drains it.
#[derive(Debug)]
pub struct Subscription {
    /// Identifier to pass to [`MessageStore::unsubscribe`].
    pub id: SubscriptionId,
    /// Wake-up channel carrying the satisfied round number.
    pub notify: ctx::channel::Receiver<u64>,
}

/// Messages of one kind at one height, bucketed by round and deduplicated
/// by sender within a bucket (a later message from the same sender replaces
/// the earlier one).
type RoundBuckets = BTreeMap<u64, BTreeMap<NodeId, Message>>;

/// All buckets of a single height.
#[derive(Debug, Default)]
struct KindBuckets {
    pre_prepare: RoundBuckets,
    prepare: RoundBuckets,
    commit: RoundBuckets,
    round_change: RoundBuckets,
}

impl KindBuckets {
    fn get(&self, kind: MsgType) -> &RoundBuckets {
        match kind {
            MsgType::PrePrepare => &self.pre_prepare,
            MsgType::Prepare => &self.prepare,
            MsgType::Commit => &self.commit,
            MsgType::RoundChange => &self.round_change,
        }
    }

    fn get_mut(&mut self, kind: MsgType) -> &mut RoundBuckets {
        match kind {
            MsgType::PrePrepare => &mut self.pre_prepare,
            MsgType::Prepare => &mut self.prepare,
            MsgType::Commit => &mut self.commit,
            MsgType::RoundChange => &mut self.round_change,
        }
    }
}

/// An active subscription as tracked by the store.
#[derive(Debug)]
struct SubEntry {
    details: SubscriptionDetails,
    notify: ctx::channel::Sender<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    heights: BTreeMap<u64, KindBuckets>,
    subscriptions: HashMap<SubscriptionId, SubEntry>,
}

impl Inner {
    /// The round satisfying `details`, if any. In min-round mode the highest
    /// satisfied round wins.
    fn satisfied_round(&self, details: &SubscriptionDetails) -> Option<u64> {
        let rounds = self.heights.get(&details.view.height)?.get(details.kind);
        if details.any_round_geq {
            rounds
                .range(details.view.round..)
                .filter(|(_, bucket)| bucket.len() >= details.min_count)
                .map(|(round, _)| *round)
                .next_back()
        } else {
            rounds
                .get(&details.view.round)
                .filter(|bucket| bucket.len() >= details.min_count)
                .map(|_| details.view.round)
        }
    }
}

/// The message store. All operations may be called concurrently; mutations
/// are serialized behind a single mutex, and subscription wake-ups are sent
/// after the lock is released, so a woken consumer may immediately call back
/// into the store.
#[derive(Debug, Default)]
pub struct MessageStore {
    inner: Mutex<Inner>,
    next_subscription_id: AtomicU64,
}

impl MessageStore {
    /// Constructs an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a message in the bucket keyed by its view and kind.
    /// A message from a sender already present in the bucket replaces the
    /// earlier one, so buckets count distinct senders. Matching
    /// subscriptions are notified.
    pub fn add(&self, message: Message) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let view = message.view;
            let kind = message.kind();
            inner
                .heights
                .entry(view.height)
                .or_default()
                .get_mut(kind)
                .entry(view.round)
                .or_default()
                .insert(message.from.clone(), message);

            for sub in inner.subscriptions.values() {
                if sub.details.kind != kind || sub.details.view.height != view.height {
                    continue;
                }
                if let Some(round) = inner.satisfied_round(&sub.details) {
                    pending.push((sub.notify.clone(), round));
                }
            }
        }
        for (notify, round) in pending {
            // The channel holds one pending notification; if the consumer
            // hasn't drained the previous one yet, this send is a no-op.
            let _ = notify.try_send(round);
        }
    }

    /// Snapshot of the messages in the exact (height, round, kind) bucket
    /// passing `is_valid`. The order is unspecified but stable within a call.
    pub fn get_valid(
        &self,
        view: View,
        kind: MsgType,
        is_valid: impl Fn(&Message) -> bool,
    ) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        let Some(bucket) = inner
            .heights
            .get(&view.height)
            .and_then(|kinds| kinds.get(kind).get(&view.round))
        else {
            return Vec::new();
        };
        bucket
            .values()
            .filter(|message| is_valid(message))
            .cloned()
            .collect()
    }

    /// Registers a subscription. If already-buffered messages satisfy the
    /// threshold, a notification is pending on the returned channel right
    /// away.
    pub fn subscribe(&self, details: SubscriptionDetails) -> Subscription {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let (send, recv) = ctx::channel::bounded(1);
        let satisfied = {
            let mut inner = self.inner.lock().unwrap();
            let satisfied = inner.satisfied_round(&details);
            inner.subscriptions.insert(
                id,
                SubEntry {
                    details,
                    notify: send.clone(),
                },
            );
            satisfied
        };
        if let Some(round) = satisfied {
            let _ = send.try_send(round);
        }
        Subscription { id, notify: recv }
    }

    /// Removes a subscription. Pending notifications stay readable.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().unwrap().subscriptions.remove(&id);
    }

    /// Drops all buckets below the given height.
    pub fn prune_by_height(&self, height: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.heights = inner.heights.split_off(&height);
    }

    /// Drops all buckets of `view.height` below `view.round`.
    /// Other heights are untouched.
    pub fn prune_by_round(&self, view: View) {
        let mut inner = self.inner.lock().unwrap();
        let Some(kinds) = inner.heights.get_mut(&view.height) else {
            return;
        };
        for kind in [
            MsgType::PrePrepare,
            MsgType::Prepare,
            MsgType::Commit,
            MsgType::RoundChange,
        ] {
            let rounds = kinds.get_mut(kind);
            *rounds = rounds.split_off(&view.round);
        }
    }
}
