use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metadata endpoint returned status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("failed to decode metadata response: {0}")]
    Decode(#[source] serde_json::Error),
}

impl PartialEq for MetadataError {
    /// Structural enough for the monitor loop's duplicate-error circuit
    /// breaker: same variant and same rendered message counts as "the
    /// same failure happening again", regardless of which opaque error
    /// type produced it.
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.to_string() == other.to_string()
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
    #[error("node {0} has no status.nodeInfo.bootID")]
    MissingBootId(String),
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook template is missing placeholder {0:?}")]
    MissingPlaceholder(&'static str),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] cordon_types::ConfigError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error("metrics server failed: {0}")]
    Metrics(#[source] std::io::Error),
}
