use trove_core::AggregateError;

#[derive(Debug, thiserror::Error)]
pub enum GitSourceError {
    #[error("no adapter can handle repository {0}")]
    Unsupported(String),

    #[error("upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("`git {command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("rejected webhook: {0}")]
    Webhook(String),

    #[error("{0}")]
    Aggregate(AggregateError<GitSourceError>),
}

impl GitSourceError {
    /// HTTP-like status of an upstream failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Permission problems that will not heal by retrying.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Aggregate(aggregate) => aggregate.errors.iter().any(Self::is_retryable),
            _ => !self.is_auth_failure(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }
}

pub type Result<T> = std::result::Result<T, GitSourceError>;
