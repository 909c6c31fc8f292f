use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Inbox, Message, Transport};

/// In-process transport for single-node deployments and tests.
#[derive(Clone, Default)]
pub struct LocalTransport {
    subjects: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects
            .lock()
            .get(subject)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Vec<u8>) -> Result<()> {
        let mut map = self.subjects.lock();
        let Some(subs) = map.get_mut(subject) else {
            tracing::trace!(subject, "no subscribers");
            return Ok(());
        };
        let msg = Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };
        subs.retain(|tx| tx.send(msg.clone()).is_ok());
        if subs.is_empty() {
            map.remove(subject);
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut map = self.subjects.lock();
            // one-shot reply subjects are never published again; sweep them here
            map.retain(|_, subs| {
                subs.retain(|tx| !tx.is_closed());
                !subs.is_empty()
            });
            map.entry(subject.to_string()).or_default().push(tx);
        }
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })
        .boxed();
        Ok(Inbox::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_exact_subject_with_reply() {
        let t = LocalTransport::new();
        let mut a = t.subscribe("egress.updates").await.unwrap();
        let mut b = t.subscribe("egress.updates.EG_1").await.unwrap();

        t.publish("egress.updates", Some("_INBOX.1"), b"one".to_vec())
            .await
            .unwrap();
        let msg = a.next().await.unwrap();
        assert_eq!(msg.reply.as_deref(), Some("_INBOX.1"));
        assert_eq!(msg.payload, b"one".to_vec());

        t.publish("egress.updates.EG_1", None, b"two".to_vec())
            .await
            .unwrap();
        assert_eq!(b.next().await.unwrap().payload, b"two".to_vec());
    }

    #[tokio::test]
    async fn closed_inboxes_are_swept() {
        let t = LocalTransport::new();
        let inbox = t.subscribe("_INBOX.x").await.unwrap();
        assert_eq!(t.subscriber_count("_INBOX.x"), 1);
        inbox.close();
        assert_eq!(t.subscriber_count("_INBOX.x"), 0);
        let _other = t.subscribe("egress.request").await.unwrap();
        assert!(!t.subjects.lock().contains_key("_INBOX.x"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let t = LocalTransport::new();
        t.publish("nobody", None, Vec::new()).await.unwrap();
    }
}
