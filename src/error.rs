use thiserror::Error;

/// Convenience alias for Results returning [`FleetError`].
pub type Result<T> = std::result::Result<T, FleetError>;

/// Error kinds for the fleet-core engine.
///
/// Variants map onto the taxonomy in the design doc: validation/precondition
/// failures are synchronous and never persist; `Locked`/`Io` come from the
/// task store; `ExternalFailure`/`A2AFailure` come from the milestone-sync
/// and A2A-turn boundaries respectively.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("stop guard blocked completion: {remaining_steps:?}")]
    StopGuard { remaining_steps: Vec<String> },

    #[error("lock not acquired for {resource} within retry budget")]
    Locked { resource: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("external service failure: {message}")]
    ExternalFailure { message: String },

    #[error("a2a failure ({reason}): {message}")]
    A2AFailure { reason: String, message: String },

    #[error("concurrency gate timeout for agent {agent_id} flow {flow_id} (active={active}, timeout={timeout_ms}ms)")]
    GateTimeout {
        agent_id: String,
        flow_id: String,
        active: usize,
        timeout_ms: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    pub fn validation(msg: impl Into<String>) -> Self {
        FleetError::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        FleetError::Precondition(msg.into())
    }
}
