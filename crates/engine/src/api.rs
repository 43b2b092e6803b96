use async_trait::async_trait;
use folkhart_protocol::{CompletionResult, RunDescriptor, RunKind, StartRunRequest, VersionInfo};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The run id is unknown or no longer valid on the server.
    #[error("run not found: {0}")]
    RunGone(String),

    #[error("insufficient currency: {0}")]
    InsufficientFunds(String),

    /// A 4xx that is neither of the above (auth, validation of a start, ...).
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// The game backend, as far as the adventure controller is concerned.
#[async_trait]
pub trait GameApi: Send + Sync {
    async fn start_run(
        &self,
        kind: RunKind,
        request: &StartRunRequest,
    ) -> Result<RunDescriptor, ApiError>;

    async fn active_run(&self, kind: RunKind) -> Result<Option<RunDescriptor>, ApiError>;

    async fn complete_run(&self, kind: RunKind, run_id: &str)
        -> Result<CompletionResult, ApiError>;

    async fn fast_finish(&self, kind: RunKind, run_id: &str)
        -> Result<CompletionResult, ApiError>;

    async fn version(&self) -> Result<VersionInfo, ApiError>;
}
