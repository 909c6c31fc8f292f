use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use egress_core::{
    sampler::run_sampler, transport, AdmissionController, CommandExecutor, Config, EgressService,
    PipelineContext, PipelineExecutor, PipelineFailure, RpcServer, ServiceOptions, SysinfoSampler,
    Transport, UpdatePublisher,
};
use egress_events::Bus;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tasks::{spawn_supervised, TaskHandle, TaskManager};

/// A running node: the service plus the tasks that feed and expose it.
pub struct Node {
    pub service: EgressService,
    pub transport: Arc<dyn Transport>,
    pub health_addr: Option<SocketAddr>,
    pub background_tasks: TaskManager,
    /// Stops the sampler and request loop.
    pub shutdown: CancellationToken,
}

pub async fn build(cfg: Config) -> anyhow::Result<Node> {
    build_with_cpus(cfg, egress_core::host_cpus()).await
}

pub(crate) async fn build_with_cpus(cfg: Config, num_cpus: f64) -> anyhow::Result<Node> {
    let admission = Arc::new(AdmissionController::from_config(&cfg, num_cpus)?);
    info!(
        node_id = cfg.node_id(),
        num_cpus,
        advisories = admission.advisories().len(),
        backend = ?cfg.bus.backend,
        "egress node starting"
    );

    let shutdown = CancellationToken::new();
    let mut background_tasks = TaskManager::new();

    let sampler_ctl = admission.clone();
    let sampler_token = shutdown.clone();
    let interval = cfg.admission.sample_interval();
    background_tasks.push(spawn_supervised("cpu.sampler", move || {
        run_sampler(
            sampler_ctl.clone(),
            SysinfoSampler::new(),
            interval,
            sampler_token.clone(),
        )
    }));

    let transport = transport::connect(&cfg.bus).await?;
    let (updates, forwarder) = UpdatePublisher::with_transport(Bus::new(), transport.clone());
    background_tasks.push(TaskHandle::new("updates.forwarder", forwarder));

    let service = EgressService::new(
        admission,
        pipeline_executor(&cfg),
        updates,
        ServiceOptions::from_config(&cfg.service),
    );
    let rpc = RpcServer::new(
        service.clone(),
        transport.clone(),
        cfg.service.request_concurrency,
    )
    .spawn(shutdown.clone())
    .await?;
    background_tasks.push(TaskHandle::new("rpc.server", rpc));

    let health_addr = cfg
        .health_port
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)));

    Ok(Node {
        service,
        transport,
        health_addr,
        background_tasks,
        shutdown,
    })
}

fn pipeline_executor(cfg: &Config) -> Arc<dyn PipelineExecutor> {
    match CommandExecutor::from_command(&cfg.pipeline.command) {
        Some(exec) => Arc::new(exec),
        None => {
            warn!("pipeline.command is not set; every egress will abort");
            Arc::new(NoPipeline)
        }
    }
}

struct NoPipeline;

#[async_trait]
impl PipelineExecutor for NoPipeline {
    async fn run(&self, _ctx: PipelineContext) -> Result<(), PipelineFailure> {
        Err(PipelineFailure::new("no pipeline configured"))
    }
}
