use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockflowError {
    // Registry / model errors
    #[error("Block type not registered: {0}")]
    BlockNotFound(String),

    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("Invalid flow document: {0}")]
    InvalidFlow(String),

    // Block errors
    #[error("Block execution failed: {node}: {message}")]
    BlockExecution { node: String, message: String },

    #[error("Block timeout after {timeout_secs}s: {node}")]
    BlockTimeout { node: String, timeout_secs: u64 },

    /// A filter block stopped its branch. Not a failure.
    #[error("Branch halted: {0}")]
    Halted(String),

    // Subscription errors
    #[error("Block does not support subscriptions: {0}")]
    NotSubscribable(String),

    #[error("Subscription error: {node}: {message}")]
    Subscription { node: String, message: String },

    // Wallet / signer errors
    #[error("No signer available for {0}")]
    SignerUnavailable(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BlockflowError {
    /// Shorthand for a block failure attributed to `node`.
    pub fn block(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BlockExecution {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a filter halt rather than a failure.
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halted(_))
    }
}

pub type Result<T> = std::result::Result<T, BlockflowError>;
