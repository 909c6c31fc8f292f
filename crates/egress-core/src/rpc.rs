use std::sync::Arc;
use std::time::Duration;

use egress_protocol::{
    BusRequest, EgressInfo, EgressRequest, ProblemDetails, RpcRequest, RpcResponse,
    StartEgressRequest, Wire,
};
use egress_topics::{
    inbox_subject, job_updates_subject, SUBJECT_EGRESS_REQUEST, SUBJECT_EGRESS_UPDATES,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::EgressService;
use crate::transport::{Inbox, Message, Transport};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves `egress.request` for one service instance.
pub struct RpcServer {
    service: EgressService,
    transport: Arc<dyn Transport>,
    concurrency: usize,
}

impl RpcServer {
    pub fn new(service: EgressService, transport: Arc<dyn Transport>, concurrency: usize) -> Self {
        Self {
            service,
            transport,
            concurrency: concurrency.max(1),
        }
    }

    /// Subscribe first, then hand the loop to a task, so requests published
    /// after this returns are never missed.
    pub async fn spawn(self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let inbox = self.transport.subscribe(SUBJECT_EGRESS_REQUEST).await?;
        info!(
            subject = SUBJECT_EGRESS_REQUEST,
            concurrency = self.concurrency,
            "rpc server listening"
        );
        Ok(tokio::spawn(self.serve(inbox, shutdown)))
    }

    async fn serve(self, mut inbox: Inbox, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = inbox.next() => msg,
            };
            let Some(msg) = msg else {
                warn!("request subscription closed");
                break;
            };
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let service = self.service.clone();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handle_message(&service, transport.as_ref(), msg).await;
            });
        }
        debug!("rpc server stopped");
    }
}

async fn handle_message(service: &EgressService, transport: &dyn Transport, msg: Message) {
    let response = match RpcRequest::from_wire(&msg.payload) {
        Ok(req) => service.handle(&req.correlation_id, req.request),
        Err(err) => {
            let correlation_id = serde_json::from_slice::<serde_json::Value>(&msg.payload)
                .ok()
                .and_then(|v| v.get("correlation_id")?.as_str().map(str::to_string))
                .unwrap_or_default();
            warn!(%err, %correlation_id, "malformed egress request");
            RpcResponse::problem(
                correlation_id,
                ProblemDetails::new(400, "bad_request", "malformed request")
                    .with_detail(err.to_string()),
            )
        }
    };
    let Some(reply) = msg.reply else {
        debug!(correlation_id = %response.correlation_id, "request carried no reply subject");
        return;
    };
    match response.to_wire() {
        Ok(bytes) => {
            if let Err(err) = transport.publish(&reply, None, bytes).await {
                warn!(%err, %reply, "failed to send reply");
            }
        }
        Err(err) => warn!(%err, "failed to encode reply"),
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,
    #[error("remote error {}: {}", .0.status, .0.title)]
    Remote(ProblemDetails),
    /// The node turned the egress away; `info` carries the populated `error`.
    #[error("egress rejected ({}): {}", .problem.status, .info.error)]
    Rejected {
        problem: ProblemDetails,
        info: Box<EgressInfo>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl RpcError {
    pub fn problem(&self) -> Option<&ProblemDetails> {
        match self {
            RpcError::Remote(problem) | RpcError::Rejected { problem, .. } => Some(problem),
            _ => None,
        }
    }

    /// The info the node returned alongside its refusal, if any.
    pub fn egress_info(&self) -> Option<&EgressInfo> {
        match self {
            RpcError::Rejected { info, .. } => Some(info),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Decode(err.to_string())
    }
}

/// Caller side of the egress request/response protocol.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and wait for its single reply.
    pub async fn request(&self, request: BusRequest) -> Result<RpcResponse, RpcError> {
        let correlation_id = uuid::Uuid::new_v4().simple().to_string();
        let reply = inbox_subject(&correlation_id);
        let mut inbox = self
            .transport
            .subscribe(&reply)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let bytes = RpcRequest {
            correlation_id: correlation_id.clone(),
            request,
        }
        .to_wire()?;
        self.transport
            .publish(SUBJECT_EGRESS_REQUEST, Some(&reply), bytes)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let msg = tokio::time::timeout(self.timeout, inbox.next())
            .await
            .map_err(|_| RpcError::Timeout)?
            .ok_or_else(|| RpcError::Transport("reply inbox closed".into()))?;
        let response = RpcResponse::from_wire(&msg.payload)?;
        if response.correlation_id != correlation_id {
            return Err(RpcError::Decode(format!(
                "correlation id mismatch: {}",
                response.correlation_id
            )));
        }
        Ok(response)
    }

    pub async fn send_start(&self, request: StartEgressRequest) -> Result<EgressInfo, RpcError> {
        into_info(self.request(BusRequest::Start(request)).await?)
    }

    pub async fn send_stop(&self, egress_id: &str) -> Result<EgressInfo, RpcError> {
        into_info(
            self.request(BusRequest::Egress(EgressRequest::stop(egress_id)))
                .await?,
        )
    }

    pub async fn list(&self) -> Result<Vec<EgressInfo>, RpcError> {
        let response = self.request(BusRequest::List).await?;
        if let Some(problem) = response.error {
            return Err(RpcError::Remote(problem));
        }
        response
            .items
            .ok_or_else(|| RpcError::Decode("response carries no items".into()))
    }

    /// Open an update stream: every job when `egress_id` is `None`.
    pub async fn subscribe_updates(
        &self,
        egress_id: Option<&str>,
    ) -> Result<UpdateStream, RpcError> {
        let subject = match egress_id {
            Some(id) => job_updates_subject(id),
            None => SUBJECT_EGRESS_UPDATES.to_string(),
        };
        let inbox = self
            .transport
            .subscribe(&subject)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(UpdateStream { inbox })
    }
}

fn into_info(response: RpcResponse) -> Result<EgressInfo, RpcError> {
    if let Some(problem) = response.error {
        return Err(match response.info {
            Some(info) => RpcError::Rejected {
                problem,
                info: Box::new(info),
            },
            None => RpcError::Remote(problem),
        });
    }
    response
        .info
        .ok_or_else(|| RpcError::Decode("response carries no egress info".into()))
}

/// Decoded `EgressInfo` updates from the bus.
pub struct UpdateStream {
    inbox: Inbox,
}

impl UpdateStream {
    pub async fn next(&mut self) -> Option<EgressInfo> {
        loop {
            let msg = self.inbox.next().await?;
            match EgressInfo::from_wire(&msg.payload) {
                Ok(info) => return Some(info),
                Err(err) => warn!(%err, subject = %msg.subject, "dropping undecodable update"),
            }
        }
    }

    pub fn close(self) {
        self.inbox.close();
    }
}
