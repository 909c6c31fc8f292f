use std::sync::Arc;

use egress_events::{Bus, Subscription};
use egress_protocol::{EgressInfo, Wire};
use egress_topics::{job_updates_subject, SUBJECT_EGRESS_UPDATES, TOPIC_EGRESS_UPDATED};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::transport::Transport;

/// Fans out job transitions to in-process subscribers and, optionally, to
/// the message bus (`egress.updates` and `egress.updates.<id>`).
///
/// Callers publish while holding the job table lock, so each subscriber sees
/// one job's transitions in the order they were applied.
#[derive(Clone)]
pub struct UpdatePublisher {
    bus: Bus,
    forward: Option<mpsc::UnboundedSender<EgressInfo>>,
}

impl UpdatePublisher {
    pub fn new(bus: Bus) -> Self {
        Self { bus, forward: None }
    }

    /// Also forward every update to `transport`. A single task performs the
    /// forwarding so bus order matches publish order.
    pub fn with_transport(bus: Bus, transport: Arc<dyn Transport>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EgressInfo>();
        let handle = tokio::spawn(async move {
            while let Some(info) = rx.recv().await {
                let bytes = match info.to_wire() {
                    Ok(b) => b,
                    Err(err) => {
                        warn!(egress_id = %info.egress_id, %err, "failed to encode update");
                        continue;
                    }
                };
                if let Err(err) = transport
                    .publish(SUBJECT_EGRESS_UPDATES, None, bytes.clone())
                    .await
                {
                    warn!(egress_id = %info.egress_id, %err, "global update publish failed");
                }
                let subject = job_updates_subject(&info.egress_id);
                if let Err(err) = transport.publish(&subject, None, bytes).await {
                    warn!(egress_id = %info.egress_id, %err, "job update publish failed");
                }
            }
        });
        (
            Self {
                bus,
                forward: Some(tx),
            },
            handle,
        )
    }

    pub fn publish(&self, info: &EgressInfo) {
        let delivered = self
            .bus
            .publish(TOPIC_EGRESS_UPDATED, Some(info.egress_id.as_str()), info);
        tracing::debug!(
            egress_id = %info.egress_id,
            status = %info.status,
            delivered,
            "egress update"
        );
        if let Some(tx) = &self.forward {
            let _ = tx.send(info.clone());
        }
    }

    /// Every job's transitions.
    pub fn subscribe(&self) -> UpdateSubscription {
        UpdateSubscription {
            inner: self.bus.subscribe(),
        }
    }

    /// Transitions of a single job.
    pub fn subscribe_job(&self, egress_id: &str) -> UpdateSubscription {
        UpdateSubscription {
            inner: self.bus.subscribe_key(egress_id),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }
}

/// Typed view over a bus subscription. Dropping or closing it deregisters.
pub struct UpdateSubscription {
    inner: Subscription,
}

impl UpdateSubscription {
    pub async fn next(&mut self) -> Option<EgressInfo> {
        loop {
            let env = self.inner.recv().await?;
            if env.kind != TOPIC_EGRESS_UPDATED {
                continue;
            }
            match serde_json::from_value(env.payload) {
                Ok(info) => return Some(info),
                Err(err) => warn!(%err, "dropping undecodable update"),
            }
        }
    }

    pub fn try_next(&mut self) -> Option<EgressInfo> {
        while let Some(env) = self.inner.try_recv() {
            if env.kind != TOPIC_EGRESS_UPDATED {
                continue;
            }
            if let Ok(info) = serde_json::from_value(env.payload) {
                return Some(info);
            }
        }
        None
    }

    pub fn close(self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use egress_protocol::EgressStatus;
    use std::time::Duration;

    fn info(id: &str, status: EgressStatus) -> EgressInfo {
        EgressInfo {
            egress_id: id.into(),
            room_id: "RM_1".into(),
            status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn job_subscription_sees_only_its_job_in_order() {
        let p = UpdatePublisher::new(Bus::new());
        let mut all = p.subscribe();
        let mut one = p.subscribe_job("EG_1");

        p.publish(&info("EG_1", EgressStatus::Starting));
        p.publish(&info("EG_2", EgressStatus::Starting));
        p.publish(&info("EG_1", EgressStatus::Active));

        assert_eq!(one.next().await.unwrap().status, EgressStatus::Starting);
        assert_eq!(one.next().await.unwrap().status, EgressStatus::Active);
        assert!(one.try_next().is_none());

        let ids: Vec<String> = (0..3)
            .map(|_| all.try_next().unwrap().egress_id)
            .collect();
        assert_eq!(ids, vec!["EG_1", "EG_2", "EG_1"]);
    }

    #[tokio::test]
    async fn closed_subscription_deregisters() {
        let p = UpdatePublisher::new(Bus::new());
        let sub = p.subscribe_job("EG_1");
        assert_eq!(p.bus().subscriber_count(), 1);
        sub.close();
        assert_eq!(p.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn forwards_to_global_and_job_subjects() {
        let transport = Arc::new(LocalTransport::new());
        let mut global = transport.subscribe(SUBJECT_EGRESS_UPDATES).await.unwrap();
        let mut scoped = transport
            .subscribe(&job_updates_subject("EG_9"))
            .await
            .unwrap();
        let (p, _forwarder) = UpdatePublisher::with_transport(Bus::new(), transport.clone());

        p.publish(&info("EG_9", EgressStatus::Starting));
        p.publish(&info("EG_9", EgressStatus::Aborted));

        for inbox in [&mut global, &mut scoped] {
            for expected in [EgressStatus::Starting, EgressStatus::Aborted] {
                let msg = tokio::time::timeout(Duration::from_secs(1), inbox.next())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(EgressInfo::from_wire(&msg.payload).unwrap().status, expected);
            }
        }
    }
}
