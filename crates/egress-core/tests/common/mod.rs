#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use egress_core::{
    AdmissionController, CpuCostConfig, EgressService, PipelineContext, PipelineExecutor,
    PipelineFailure, ServiceOptions, Transport, UpdatePublisher, UpdateSubscription,
};
use egress_events::Bus;
use egress_protocol::{
    EgressInfo, RoomCompositeEgressRequest, StartEgressPayload, StartEgressRequest,
    TrackEgressRequest,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

/// Scripted pipeline step for [`ManualExecutor`].
#[derive(Debug, Clone)]
pub enum Step {
    Active,
    Ending,
    Finish,
    Fail(String),
}

type Channel = (
    mpsc::UnboundedSender<Step>,
    Option<mpsc::UnboundedReceiver<Step>>,
);

/// Executor driven step by step from the test body. Forced termination makes
/// the run return immediately.
#[derive(Clone, Default)]
pub struct ManualExecutor {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, egress_id: &str, step: Step) {
        let mut map = self.channels.lock();
        let (tx, _) = map
            .entry(egress_id.to_string())
            .or_insert_with(new_channel);
        let _ = tx.send(step);
    }

    fn take_receiver(&self, egress_id: &str) -> Option<mpsc::UnboundedReceiver<Step>> {
        let mut map = self.channels.lock();
        map.entry(egress_id.to_string())
            .or_insert_with(new_channel)
            .1
            .take()
    }
}

fn new_channel() -> Channel {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Some(rx))
}

#[async_trait::async_trait]
impl PipelineExecutor for ManualExecutor {
    async fn run(&self, ctx: PipelineContext) -> Result<(), PipelineFailure> {
        let Some(mut rx) = self.take_receiver(ctx.egress_id()) else {
            return Err(PipelineFailure::new("pipeline already running"));
        };
        loop {
            tokio::select! {
                step = rx.recv() => match step {
                    Some(Step::Active) => ctx.report_active(),
                    Some(Step::Ending) => ctx.report_ending(),
                    Some(Step::Finish) | None => return Ok(()),
                    Some(Step::Fail(msg)) => return Err(PipelineFailure::new(msg)),
                },
                _ = ctx.killed() => return Ok(()),
            }
        }
    }
}

pub struct Harness {
    pub service: EgressService,
    pub executor: ManualExecutor,
}

pub fn harness(
    num_cpus: f64,
    costs: CpuCostConfig,
    release: Duration,
    options: ServiceOptions,
) -> Harness {
    build(num_cpus, costs, release, options, UpdatePublisher::new(Bus::new()))
}

/// Harness whose updates are also forwarded to `transport`.
pub fn bus_harness(num_cpus: f64, transport: Arc<dyn Transport>) -> Harness {
    let (publisher, _forwarder) = UpdatePublisher::with_transport(Bus::new(), transport);
    build(
        num_cpus,
        CpuCostConfig::default(),
        Duration::from_secs(5),
        ServiceOptions::default(),
        publisher,
    )
}

fn build(
    num_cpus: f64,
    costs: CpuCostConfig,
    release: Duration,
    options: ServiceOptions,
    publisher: UpdatePublisher,
) -> Harness {
    let executor = ManualExecutor::new();
    let admission = AdmissionController::new("test-node", costs, num_cpus, release)
        .expect("valid cpu config");
    let service = EgressService::new(
        Arc::new(admission),
        Arc::new(executor.clone()),
        publisher,
        options,
    );
    Harness { service, executor }
}

pub fn default_harness() -> Harness {
    harness(
        8.0,
        CpuCostConfig::default(),
        Duration::from_millis(100),
        ServiceOptions {
            drain_timeout: Duration::from_secs(2),
            terminal_retention: Duration::from_millis(150),
        },
    )
}

pub fn room_composite_request(room_id: &str) -> StartEgressRequest {
    StartEgressRequest {
        room_id: room_id.to_string(),
        ws_url: "ws://localhost:7880".into(),
        request: StartEgressPayload::RoomComposite(RoomCompositeEgressRequest {
            room_name: "standup".into(),
            layout: Some("speaker-dark".into()),
            output: json!({"file": {"filepath": "standup.mp4"}}),
        }),
    }
}

pub fn track_request(room_id: &str) -> StartEgressRequest {
    StartEgressRequest {
        room_id: room_id.to_string(),
        ws_url: "ws://localhost:7880".into(),
        request: StartEgressPayload::Track(TrackEgressRequest {
            room_name: "standup".into(),
            track_id: "TR_audio".into(),
            output: json!({"file": {"filepath": "track.ogg"}}),
        }),
    }
}

pub async fn next_update(sub: &mut UpdateSubscription) -> EgressInfo {
    tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("update within deadline")
        .expect("subscription open")
}
