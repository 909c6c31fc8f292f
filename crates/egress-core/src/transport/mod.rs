//! Message-bus transport abstraction.
//!
//! Subjects are routed exactly (no wildcards); a request carries an optional
//! reply subject the responder publishes to.

mod local;
#[cfg(feature = "nats")]
mod nats;

use std::sync::Arc;

use anyhow::Result;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::config::{BusBackend, BusConfig};

pub use local::LocalTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// Stream of messages delivered to one subscription. Dropping it unsubscribes.
pub struct Inbox {
    stream: BoxStream<'static, Message>,
}

impl Inbox {
    pub fn new(stream: BoxStream<'static, Message>) -> Self {
        Self { stream }
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.stream.next().await
    }

    pub fn close(self) {
        drop(self);
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, subject: &str) -> Result<Inbox>;
}

/// Build the transport selected by `[bus]`.
pub async fn connect(cfg: &BusConfig) -> Result<Arc<dyn Transport>> {
    match cfg.backend {
        BusBackend::Local => Ok(Arc::new(LocalTransport::new())),
        #[cfg(feature = "nats")]
        BusBackend::Nats => {
            let url = cfg
                .nats_url
                .clone()
                .unwrap_or_else(|| "nats://127.0.0.1:4222".to_string());
            Ok(Arc::new(NatsTransport::connect(&url).await?))
        }
        #[cfg(not(feature = "nats"))]
        BusBackend::Nats => Err(anyhow::anyhow!(
            "bus backend \"nats\" requires the `nats` feature"
        )),
    }
}
