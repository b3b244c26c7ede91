/// Errors originating from the node/transport layer.
///
/// Every variant is treated as retryable by the core.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Node is shut down")]
    ShutDown,
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("An unknown error occurred: {0}")]
    Other(anyhow::Error),
}
