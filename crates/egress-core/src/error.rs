use egress_protocol::{EgressStatus, ProblemDetails, RequestKind};
use thiserror::Error;

/// Startup configuration failures. Fatal: the node does not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "not enough cpu: need at least {minimum} cores (recommended {recommended}), \
         have {available}"
    )]
    InsufficientCapacity {
        minimum: f64,
        recommended: f64,
        available: f64,
    },
    #[error("invalid cpu cost for {kind}: {value}")]
    InvalidCost { kind: RequestKind, value: f64 },
    #[error("config load failed: {0}")]
    Load(String),
}

/// Errors surfaced synchronously by the service orchestrator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("not enough cpu available to start {kind} egress")]
    ResourceExhausted { kind: RequestKind },
    #[error("egress {egress_id} not found")]
    NotFound { egress_id: String },
    #[error("egress {egress_id} cannot move from {from} to {to}")]
    InvalidState {
        egress_id: String,
        from: EgressStatus,
        to: EgressStatus,
    },
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::ResourceExhausted { .. } => "resource_exhausted",
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::InvalidState { .. } => "invalid_state",
            ServiceError::ShuttingDown => "shutting_down",
            ServiceError::Transport(_) => "transport",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ServiceError::ResourceExhausted { .. } => 429,
            ServiceError::NotFound { .. } => 404,
            ServiceError::InvalidState { .. } => 409,
            ServiceError::ShuttingDown => 503,
            ServiceError::Transport(_) => 502,
        }
    }

    pub fn to_problem(&self) -> ProblemDetails {
        let problem = ProblemDetails::new(self.status(), self.code(), self.to_string());
        match self {
            ServiceError::NotFound { egress_id } | ServiceError::InvalidState { egress_id, .. } => {
                problem.with_instance(egress_id.clone())
            }
            _ => problem,
        }
    }
}

/// Failure reported by a pipeline executor. Always terminal for the job.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}")]
pub struct PipelineFailure {
    pub message: String,
}

impl PipelineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for PipelineFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<std::io::Error> for PipelineFailure {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}
