//! Inbox - envelope bus for inbound objects
//!
//! Every object read off any connection becomes an `Envelope` and is
//! published here. Subscribers register filters (object-type glob, sender
//! identity) and consume matching envelopes from their own bounded queue:
//! a slow subscriber drops its overflow, it never blocks `publish` or
//! other subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::identity::PublicKey;
use crate::object::Object;

/// Per-subscriber envelope buffer.
const SUBSCRIPTION_BUFFER: usize = 64;

/// An inbound object paired with its verified sender identity.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Verified remote identity of the connection the object arrived on
    pub sender: PublicKey,
    /// The object itself
    pub payload: Object,
}

/// Match an object type against a dot-segment glob pattern.
///
/// `*` matches exactly one segment, `**` matches one or more. An exact
/// pattern (no wildcards) matches only itself.
pub fn type_matches(pattern: &str, object_type: &str) -> bool {
    if pattern == object_type {
        return true;
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let value: Vec<&str> = object_type.split('.').collect();
    segments_match(&pattern, &value)
}

fn segments_match(pattern: &[&str], value: &[&str]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some((&"**", rest)) => {
            (1..=value.len()).any(|consumed| segments_match(rest, &value[consumed..]))
        }
        Some((&"*", rest)) => !value.is_empty() && segments_match(rest, &value[1..]),
        Some((&literal, rest)) => {
            value.first() == Some(&literal) && segments_match(rest, &value[1..])
        }
    }
}

/// Filter selecting which envelopes a subscription receives.
///
/// Empty dimensions match everything; multiple patterns or senders are
/// OR-ed within their dimension.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFilter {
    object_types: Vec<String>,
    senders: Vec<PublicKey>,
}

impl EnvelopeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match envelopes whose object type matches this glob pattern.
    pub fn object_type(mut self, pattern: impl Into<String>) -> Self {
        self.object_types.push(pattern.into());
        self
    }

    /// Match envelopes from this sender.
    pub fn sender(mut self, key: PublicKey) -> Self {
        self.senders.push(key);
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        let type_ok = self.object_types.is_empty()
            || self
                .object_types
                .iter()
                .any(|p| type_matches(p, envelope.payload.object_type()));
        let sender_ok = self.senders.is_empty() || self.senders.contains(&envelope.sender);
        type_ok && sender_ok
    }
}

struct SubEntry {
    filter: EnvelopeFilter,
    tx: mpsc::Sender<Envelope>,
}

#[derive(Default)]
struct InboxInner {
    subscriptions: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
}

/// The subsystem-wide envelope bus.
#[derive(Clone, Default)]
pub struct Inbox {
    inner: Arc<InboxInner>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription with the given filter.
    pub async fn subscribe(&self, filter: EnvelopeFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.inner
            .subscriptions
            .write()
            .await
            .insert(id, SubEntry { filter, tx });
        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fan an envelope out to every matching subscription.
    ///
    /// Never blocks: a full subscriber queue drops the envelope for that
    /// subscriber only. Subscriptions whose receiver is gone are pruned.
    pub async fn publish(&self, envelope: Envelope) {
        let mut dead = Vec::new();
        {
            let subscriptions = self.inner.subscriptions.read().await;
            for (id, entry) in subscriptions.iter() {
                if !entry.filter.matches(&envelope) {
                    continue;
                }
                match entry.tx.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(
                            subscription = id,
                            object_type = envelope.payload.object_type(),
                            "subscriber queue full, dropping envelope"
                        );
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut subscriptions = self.inner.subscriptions.write().await;
            for id in dead {
                subscriptions.remove(&id);
                trace!(subscription = id, "pruned closed subscription");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().await.len()
    }
}

/// A live subscription to the inbox.
///
/// Dropping the subscription without `cancel` is fine: the entry is pruned
/// on the next publish that would have matched it.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Envelope>,
    inner: Arc<InboxInner>,
}

impl Subscription {
    /// Next matching envelope. `None` once cancelled and drained.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Deregister from the inbox.
    pub async fn cancel(mut self) {
        self.inner.subscriptions.write().await.remove(&self.id);
        self.rx.close();
    }
}
