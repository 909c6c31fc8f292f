//! Seam to the media pipeline.
//!
//! Executors only *report* progress through their [`PipelineContext`]; the
//! orchestrator owns every status write and maps the run outcome to a
//! terminal state.

mod command;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use egress_protocol::{EgressStatus, StartEgressRequest};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineFailure;

pub use command::CommandExecutor;

#[async_trait::async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Build and run the pipeline for one job. Returns when the pipeline has
    /// finished; `Err` marks the job aborted with the failure detail.
    async fn run(&self, ctx: PipelineContext) -> Result<(), PipelineFailure>;
}

#[derive(Debug)]
pub(crate) enum LifecycleEventKind {
    Reported(EgressStatus),
    Finished(Result<(), PipelineFailure>),
}

/// Progress flowing back from a running pipeline.
#[derive(Debug)]
pub(crate) struct LifecycleEvent {
    pub egress_id: String,
    pub kind: LifecycleEventKind,
}

/// Handle given to an executor for a single job.
pub struct PipelineContext {
    egress_id: String,
    request: StartEgressRequest,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    stop: CancellationToken,
    kill: CancellationToken,
}

impl PipelineContext {
    pub(crate) fn new(
        egress_id: String,
        request: StartEgressRequest,
        events: mpsc::UnboundedSender<LifecycleEvent>,
        stop: CancellationToken,
        kill: CancellationToken,
    ) -> Self {
        Self {
            egress_id,
            request,
            events,
            stop,
            kill,
        }
    }

    pub fn egress_id(&self) -> &str {
        &self.egress_id
    }

    pub fn request(&self) -> &StartEgressRequest {
        &self.request
    }

    /// The pipeline is producing output.
    pub fn report_active(&self) {
        self.report(EgressStatus::Active);
    }

    /// The pipeline began ending on its own (e.g. the source went away).
    pub fn report_ending(&self) {
        self.report(EgressStatus::Ending);
    }

    fn report(&self, status: EgressStatus) {
        let _ = self.events.send(LifecycleEvent {
            egress_id: self.egress_id.clone(),
            kind: LifecycleEventKind::Reported(status),
        });
    }

    /// Resolves once a cooperative stop was requested (also on forced termination).
    pub fn stop_requested(&self) -> impl Future<Output = ()> + Send + '_ {
        self.stop.cancelled()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves on forced termination; the executor should return promptly.
    pub fn killed(&self) -> impl Future<Output = ()> + Send + '_ {
        self.kill.cancelled()
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }
}

/// Run `ctx` on `executor` in its own task and report the outcome.
/// A panicking executor is reported as a failure.
pub(crate) fn spawn_pipeline(
    executor: Arc<dyn PipelineExecutor>,
    ctx: PipelineContext,
) -> JoinHandle<()> {
    let events = ctx.events.clone();
    let egress_id = ctx.egress_id.clone();
    tokio::spawn(async move {
        let result = match AssertUnwindSafe(executor.run(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(egress_id = %egress_id, "pipeline executor panicked");
                Err(PipelineFailure::new("pipeline panicked"))
            }
        };
        let _ = events.send(LifecycleEvent {
            egress_id,
            kind: LifecycleEventKind::Finished(result),
        });
    })
}
