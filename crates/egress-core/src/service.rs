//! Service orchestrator: the façade over admission, the job table, pipeline
//! dispatch and update publishing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use egress_protocol::{
    BusRequest, EgressControl, EgressInfo, EgressStatus, RpcResponse, StartEgressRequest,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::ServiceConfig;
use crate::error::{PipelineFailure, ServiceError};
use crate::executor::{
    spawn_pipeline, LifecycleEvent, LifecycleEventKind, PipelineContext, PipelineExecutor,
};
use crate::job::{new_egress_id, JobEntry, JobTable};
use crate::updates::{UpdatePublisher, UpdateSubscription};
use crate::util::now_millis;

const COUNTER_TRANSITIONS_REJECTED: &str = "egress.transitions.rejected";

const MSG_STOPPED_BEFORE_ACTIVE: &str = "egress stopped before becoming active";
const MSG_EXITED_BEFORE_ACTIVE: &str = "pipeline exited before becoming active";
const MSG_TERMINATED: &str = "egress terminated by shutdown";

/// How long killed pipelines get to report back before their jobs are aborted in place.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub drain_timeout: Duration,
    pub terminal_retention: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl ServiceOptions {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            drain_timeout: cfg.drain_timeout(),
            terminal_retention: cfg.terminal_retention(),
        }
    }

    fn sweep_interval(&self) -> Duration {
        (self.terminal_retention / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}

#[derive(Clone)]
pub struct EgressService {
    inner: Arc<Inner>,
}

struct Inner {
    admission: Arc<AdmissionController>,
    executor: Arc<dyn PipelineExecutor>,
    updates: UpdatePublisher,
    jobs: Mutex<JobTable>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    shutting_down: AtomicBool,
    terminal: Notify,
    stopped: CancellationToken,
    options: ServiceOptions,
}

impl EgressService {
    /// Must be called inside a tokio runtime: spawns the lifecycle event loop
    /// and the terminal-job sweeper.
    pub fn new(
        admission: Arc<AdmissionController>,
        executor: Arc<dyn PipelineExecutor>,
        updates: UpdatePublisher,
        options: ServiceOptions,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            admission,
            executor,
            updates,
            jobs: Mutex::new(JobTable::default()),
            events,
            shutting_down: AtomicBool::new(false),
            terminal: Notify::new(),
            stopped: CancellationToken::new(),
            options,
        });
        tokio::spawn(run_event_loop(Arc::downgrade(&inner), rx));
        tokio::spawn(run_sweeper(Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.inner.admission
    }

    pub fn updates(&self) -> &UpdatePublisher {
        &self.inner.updates
    }

    pub fn subscribe_updates(&self) -> UpdateSubscription {
        self.inner.updates.subscribe()
    }

    pub fn subscribe_job(&self, egress_id: &str) -> UpdateSubscription {
        self.inner.updates.subscribe_job(egress_id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Admit and dispatch a new job. Returns as soon as the job is STARTING.
    pub fn start(&self, request: StartEgressRequest) -> Result<EgressInfo, ServiceError> {
        let inner = &self.inner;
        let kind = request.kind();
        let (info, ctx) = {
            let mut jobs = inner.jobs.lock();
            if inner.shutting_down.load(Ordering::SeqCst) {
                return Err(ServiceError::ShuttingDown);
            }
            if !inner.admission.can_accept(kind) {
                info!(
                    kind = kind.as_str(),
                    room_id = %request.room_id,
                    available = inner.admission.available_cpu(),
                    "egress rejected: not enough cpu"
                );
                inner.admission.record_rejection(kind);
                return Err(ServiceError::ResourceExhausted { kind });
            }
            let egress_id = new_egress_id();
            let info = EgressInfo {
                egress_id: egress_id.clone(),
                room_id: request.room_id.clone(),
                status: EgressStatus::Starting,
                ..Default::default()
            };
            let entry = JobEntry::new(info.clone(), kind);
            let ctx = PipelineContext::new(
                egress_id,
                request,
                inner.events.clone(),
                entry.stop.clone(),
                entry.kill.clone(),
            );
            jobs.insert(entry);
            inner.admission.reserve(kind);
            inner.admission.job_started(kind);
            inner.updates.publish(&info);
            (info, ctx)
        };
        spawn_pipeline(inner.executor.clone(), ctx);
        info!(
            egress_id = %info.egress_id,
            kind = kind.as_str(),
            room_id = %info.room_id,
            "egress started"
        );
        Ok(info)
    }

    /// Request a cooperative stop. The terminal state arrives later as an update.
    pub fn stop(&self, egress_id: &str) -> Result<EgressInfo, ServiceError> {
        let inner = &self.inner;
        let mut jobs = inner.jobs.lock();
        let entry = jobs.get(egress_id).ok_or_else(|| ServiceError::NotFound {
            egress_id: egress_id.to_string(),
        })?;
        let from = entry.status();
        if from.is_terminal() {
            return Err(ServiceError::NotFound {
                egress_id: egress_id.to_string(),
            });
        }
        if from == EgressStatus::Ending {
            return Err(ServiceError::InvalidState {
                egress_id: egress_id.to_string(),
                from,
                to: EgressStatus::Ending,
            });
        }
        entry.stop.cancel();
        let info = jobs.transition(egress_id, EgressStatus::Ending, None, now_millis())?;
        inner.updates.publish(&info);
        info!(egress_id, from = %from, "egress stop requested");
        Ok(info)
    }

    /// Every retained job, terminal ones included until evicted.
    pub fn list(&self) -> Vec<EgressInfo> {
        self.inner.jobs.lock().list()
    }

    pub fn get(&self, egress_id: &str) -> Option<EgressInfo> {
        self.inner.jobs.lock().get(egress_id).map(|e| e.info.clone())
    }

    /// Health payload: one entry per live job plus `CpuLoad`.
    pub fn status(&self) -> Value {
        let mut map = Map::new();
        {
            let jobs = self.inner.jobs.lock();
            for entry in jobs.live() {
                map.insert(
                    entry.info.egress_id.clone(),
                    serde_json::to_value(&entry.info).unwrap_or(Value::Null),
                );
            }
        }
        map.insert(
            "CpuLoad".to_string(),
            Value::from(self.inner.admission.load_percent()),
        );
        Value::Object(map)
    }

    pub fn live_count(&self) -> usize {
        self.inner.jobs.lock().live_count()
    }

    /// Dispatch one inbound bus request.
    pub fn handle(&self, correlation_id: &str, request: BusRequest) -> RpcResponse {
        match request {
            BusRequest::Start(req) => {
                let room_id = req.room_id.clone();
                match self.start(req) {
                    Ok(info) => RpcResponse::info(correlation_id, info),
                    Err(err) => {
                        let mut resp = RpcResponse::problem(correlation_id, err.to_problem());
                        resp.info = Some(EgressInfo {
                            room_id,
                            status: EgressStatus::Aborted,
                            error: err.to_string(),
                            ..Default::default()
                        });
                        resp
                    }
                }
            }
            BusRequest::Egress(req) => match req.request {
                EgressControl::Stop(_) => match self.stop(&req.egress_id) {
                    Ok(info) => RpcResponse::info(correlation_id, info),
                    Err(err) => RpcResponse::problem(correlation_id, err.to_problem()),
                },
            },
            BusRequest::List => RpcResponse::items(correlation_id, self.list()),
        }
    }

    /// Stop accepting work. A graceful shutdown waits up to the drain timeout
    /// for live jobs to finish; anything left is force-terminated.
    pub async fn shutdown(&self, graceful: bool) {
        let inner = &self.inner;
        let live = {
            let jobs = inner.jobs.lock();
            inner.shutting_down.store(true, Ordering::SeqCst);
            jobs.live_count()
        };
        info!(graceful, live, "egress service shutting down");

        if graceful && !self.drain(inner.options.drain_timeout).await {
            warn!(
                timeout_secs = inner.options.drain_timeout.as_secs(),
                live = self.live_count(),
                "drain timed out; terminating remaining egresses"
            );
        }
        self.kill_all();
        if !self.drain(KILL_GRACE).await {
            self.abort_remaining();
        }
        inner.stopped.cancel();
        info!("egress service stopped");
    }

    /// Wait until no job is live; `false` if `limit` elapsed first.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.inner.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.live_count() == 0;
            }
        }
    }

    fn kill_all(&self) {
        let jobs = self.inner.jobs.lock();
        for entry in jobs.live() {
            debug!(egress_id = %entry.info.egress_id, "killing pipeline");
            entry.kill.cancel();
        }
    }

    fn abort_remaining(&self) {
        let mut jobs = self.inner.jobs.lock();
        let ids: Vec<String> = jobs.live().map(|e| e.info.egress_id.clone()).collect();
        for id in ids {
            warn!(egress_id = %id, "pipeline did not exit after kill");
            self.inner
                .apply(&mut jobs, &id, EgressStatus::Aborted, Some(MSG_TERMINATED));
        }
    }
}

impl Inner {
    fn on_event(&self, event: LifecycleEvent) {
        let LifecycleEvent { egress_id, kind } = event;
        match kind {
            LifecycleEventKind::Reported(status) => {
                let mut jobs = self.jobs.lock();
                // a stop already moved the job to ENDING
                if status == EgressStatus::Ending
                    && jobs.get(&egress_id).map(JobEntry::status) == Some(EgressStatus::Ending)
                {
                    return;
                }
                self.apply(&mut jobs, &egress_id, status, None);
            }
            LifecycleEventKind::Finished(result) => self.finish(&egress_id, result),
        }
    }

    /// Map a pipeline's outcome onto the terminal state.
    fn finish(&self, egress_id: &str, result: Result<(), PipelineFailure>) {
        let mut jobs = self.jobs.lock();
        let Some(entry) = jobs.get(egress_id) else {
            return;
        };
        let status = entry.status();
        if status.is_terminal() {
            return;
        }
        let killed = entry.kill.is_cancelled();
        let stop_requested = entry.stop.is_cancelled();
        let reached_active = entry.reached_active;

        match result {
            _ if killed => {
                self.apply(&mut jobs, egress_id, EgressStatus::Aborted, Some(MSG_TERMINATED));
            }
            Err(failure) => {
                warn!(egress_id, error = %failure, "egress failed");
                self.apply(
                    &mut jobs,
                    egress_id,
                    EgressStatus::Aborted,
                    Some(&failure.message),
                );
            }
            Ok(()) if !reached_active => {
                let msg = if stop_requested {
                    MSG_STOPPED_BEFORE_ACTIVE
                } else {
                    MSG_EXITED_BEFORE_ACTIVE
                };
                self.apply(&mut jobs, egress_id, EgressStatus::Aborted, Some(msg));
            }
            Ok(()) => {
                if status == EgressStatus::Active {
                    self.apply(&mut jobs, egress_id, EgressStatus::Ending, None);
                }
                self.apply(&mut jobs, egress_id, EgressStatus::Complete, None);
            }
        }
    }

    /// Validate, record and publish a transition. Rejected moves are logged only.
    fn apply(&self, jobs: &mut JobTable, egress_id: &str, to: EgressStatus, error: Option<&str>) {
        match jobs.transition(egress_id, to, error, now_millis()) {
            Ok(info) => {
                if to.is_terminal() {
                    if let Some(entry) = jobs.get(egress_id) {
                        self.admission.job_ended(entry.kind);
                    }
                    info!(egress_id, status = %to, error = %info.error, "egress finished");
                    self.terminal.notify_waiters();
                } else {
                    debug!(egress_id, status = %to, "egress transition");
                }
                self.updates.publish(&info);
            }
            Err(err) => {
                warn!(egress_id, %err, "dropping lifecycle transition");
                metrics::counter!(COUNTER_TRANSITIONS_REJECTED).increment(1);
            }
        }
    }
}

async fn run_event_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<LifecycleEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_event(event);
    }
    debug!("lifecycle event loop stopped");
}

async fn run_sweeper(inner: Weak<Inner>) {
    let (interval, stopped) = match inner.upgrade() {
        Some(inner) => (inner.options.sweep_interval(), inner.stopped.clone()),
        None => return,
    };
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stopped.cancelled() => break,
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let evicted = inner
            .jobs
            .lock()
            .evict_expired(Instant::now(), inner.options.terminal_retention);
        for id in evicted {
            debug!(egress_id = %id, "evicted terminal egress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuCostConfig;
    use egress_events::Bus;
    use egress_protocol::{StartEgressPayload, TrackEgressRequest};
    use serde_json::json;

    /// Reports ACTIVE, then waits for a stop (or kill) and exits cleanly.
    struct UntilStopped;

    #[async_trait::async_trait]
    impl PipelineExecutor for UntilStopped {
        async fn run(&self, ctx: PipelineContext) -> Result<(), PipelineFailure> {
            ctx.report_active();
            ctx.stop_requested().await;
            Ok(())
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl PipelineExecutor for Panics {
        async fn run(&self, _ctx: PipelineContext) -> Result<(), PipelineFailure> {
            panic!("boom");
        }
    }

    fn service(executor: Arc<dyn PipelineExecutor>) -> EgressService {
        let admission = AdmissionController::new(
            "test",
            CpuCostConfig::default(),
            8.0,
            Duration::from_millis(50),
        )
        .unwrap();
        EgressService::new(
            Arc::new(admission),
            executor,
            UpdatePublisher::new(Bus::new()),
            ServiceOptions {
                drain_timeout: Duration::from_millis(200),
                terminal_retention: Duration::from_secs(60),
            },
        )
    }

    fn track_request() -> StartEgressRequest {
        StartEgressRequest {
            room_id: "RM_1".into(),
            ws_url: "ws://localhost".into(),
            request: StartEgressPayload::Track(TrackEgressRequest {
                room_name: "room".into(),
                track_id: "TR_1".into(),
                output: json!({"file": "out.ogg"}),
            }),
        }
    }

    async fn next_status(sub: &mut UpdateSubscription) -> EgressStatus {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("update in time")
            .expect("subscription open")
            .status
    }

    #[tokio::test]
    async fn idle_status_only_has_cpu_load() {
        let svc = service(Arc::new(UntilStopped));
        let status = svc.status();
        let obj = status.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("CpuLoad"));
    }

    #[tokio::test]
    async fn stop_on_ending_is_invalid_and_on_terminal_not_found() {
        let svc = service(Arc::new(UntilStopped));
        let mut sub = svc.subscribe_updates();
        let info = svc.start(track_request()).unwrap();
        let id = info.egress_id.clone();
        assert_eq!(next_status(&mut sub).await, EgressStatus::Starting);
        assert_eq!(next_status(&mut sub).await, EgressStatus::Active);

        assert_eq!(svc.stop(&id).unwrap().status, EgressStatus::Ending);
        assert!(matches!(
            svc.stop(&id),
            Err(ServiceError::InvalidState { .. }) | Err(ServiceError::NotFound { .. })
        ));
        assert_eq!(next_status(&mut sub).await, EgressStatus::Ending);
        assert_eq!(next_status(&mut sub).await, EgressStatus::Complete);

        assert!(matches!(svc.stop(&id), Err(ServiceError::NotFound { .. })));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn unknown_job_stop_is_not_found() {
        let svc = service(Arc::new(UntilStopped));
        let resp = svc.handle(
            "c1",
            BusRequest::Egress(egress_protocol::EgressRequest::stop("EG_nope")),
        );
        assert_eq!(resp.error.unwrap().status, 404);
    }

    #[tokio::test]
    async fn panicking_executor_aborts_the_job() {
        let svc = service(Arc::new(Panics));
        let mut sub = svc.subscribe_updates();
        let id = svc.start(track_request()).unwrap().egress_id;
        assert_eq!(next_status(&mut sub).await, EgressStatus::Starting);
        assert_eq!(next_status(&mut sub).await, EgressStatus::Aborted);
        let info = svc.get(&id).unwrap();
        assert_eq!(info.error, "pipeline panicked");
        assert_eq!(svc.admission().active_count(egress_protocol::RequestKind::Track), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let svc = service(Arc::new(UntilStopped));
        svc.shutdown(true).await;
        assert_eq!(svc.start(track_request()), Err(ServiceError::ShuttingDown));
    }

    #[tokio::test]
    async fn graceful_shutdown_terminates_after_drain_timeout() {
        let svc = service(Arc::new(UntilStopped));
        let mut sub = svc.subscribe_updates();
        let id = svc.start(track_request()).unwrap().egress_id;
        assert_eq!(next_status(&mut sub).await, EgressStatus::Starting);
        assert_eq!(next_status(&mut sub).await, EgressStatus::Active);

        tokio::time::timeout(Duration::from_secs(3), svc.shutdown(true))
            .await
            .expect("shutdown is bounded");
        let info = svc.get(&id).unwrap();
        assert_eq!(info.status, EgressStatus::Aborted);
        assert_eq!(info.error, MSG_TERMINATED);
    }
}
