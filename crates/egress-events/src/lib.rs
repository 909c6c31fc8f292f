use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    /// Routing key; keyed subscribers only see envelopes with a matching key.
    #[serde(default)]
    pub key: Option<String>,
    pub payload: Value,
}

/// Which envelopes a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Key(String),
}

impl Filter {
    fn matches(&self, env: &Envelope) -> bool {
        match self {
            Filter::All => true,
            Filter::Key(key) => env.key.as_deref() == Some(key.as_str()),
        }
    }
}

struct Registration {
    filter: Filter,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct BusInner {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, Registration>>,
}

/// Fan-out bus for JSON-serializable events.
///
/// Every subscriber owns an unbounded queue, so a subscriber connected at
/// publish time never loses an envelope and sees envelopes in publish order.
/// Subscribers registered after a publish do not receive it.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to every envelope.
    pub fn subscribe(&self) -> Subscription {
        self.register(Filter::All)
    }

    /// Subscribe to envelopes published with `key`.
    pub fn subscribe_key(&self, key: impl Into<String>) -> Subscription {
        self.register(Filter::Key(key.into()))
    }

    fn register(&self, filter: Filter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .write()
            .insert(id, Registration { filter, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publish to all matching subscribers; returns how many received it.
    pub fn publish<T: Serialize>(&self, kind: &str, key: Option<&str>, payload: &T) -> usize {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let env = Envelope {
            time: now,
            kind: kind.to_string(),
            key: key.map(str::to_string),
            payload: val,
        };
        let mut delivered = 0usize;
        let mut closed: Vec<u64> = Vec::new();
        {
            let subs = self.inner.subscribers.read();
            for (id, reg) in subs.iter() {
                if !reg.filter.matches(&env) {
                    continue;
                }
                if reg.tx.send(env.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }
        if !closed.is_empty() {
            let mut subs = self.inner.subscribers.write();
            for id in closed {
                subs.remove(&id);
            }
        }
        tracing::trace!(kind, ?key, delivered, "bus publish");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// Registered subscriber handle. Dropping it deregisters from the bus.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Envelope>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.subscribers.write().remove(&self.id);
        }
    }
}
