use anyhow::Result;
use async_nats::Client;
use futures_util::StreamExt;

use super::{Inbox, Message, Transport};
use crate::util::{env_bool, env_parse, env_string};

/// Core NATS transport (at-most-once, best-effort).
#[derive(Clone)]
pub struct NatsTransport {
    client: Client,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = connect_with_env(url).await?;
        tracing::info!(url, "connected to nats");
        Ok(Self { client })
    }
}

/// Build a NATS connection honoring env-based auth/TLS knobs and a simple initial retry.
async fn connect_with_env(url: &str) -> Result<Client> {
    let mut u = url.to_string();
    if env_bool("EGRESS_NATS_TLS").unwrap_or(false) {
        u = u.replacen("nats://", "tls://", 1);
        u = u.replacen("ws://", "wss://", 1);
    }
    // inject credentials only when the URL carries no userinfo
    if !u.contains('@') {
        if let (Some(user), Some(pass)) = (
            env_string("EGRESS_NATS_USER"),
            env_string("EGRESS_NATS_PASS"),
        ) {
            if let Some((scheme, rest)) = u.split_once("://") {
                u = format!("{scheme}://{user}:{pass}@{rest}");
            }
        }
    }
    let retries: u32 = env_parse("EGRESS_NATS_CONNECT_RETRIES")
        .ok()
        .flatten()
        .unwrap_or(3);
    let backoff_ms: u64 = env_parse("EGRESS_NATS_CONNECT_BACKOFF_MS")
        .ok()
        .flatten()
        .unwrap_or(500);
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 0..=retries {
        match async_nats::connect(&u).await {
            Ok(c) => return Ok(c),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "nats connect failed");
                last_err = Some(anyhow::anyhow!(e));
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("nats connect failed")))
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Vec<u8>) -> Result<()> {
        match reply {
            Some(reply) => {
                self.client
                    .publish_with_reply(subject.to_string(), reply.to_string(), payload.into())
                    .await?
            }
            None => self.client.publish(subject.to_string(), payload.into()).await?,
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Inbox> {
        let sub = self.client.subscribe(subject.to_string()).await?;
        let stream = sub
            .map(|msg| Message {
                subject: msg.subject.to_string(),
                reply: msg.reply.map(|r| r.to_string()),
                payload: msg.payload.to_vec(),
            })
            .boxed();
        Ok(Inbox::new(stream))
    }
}
