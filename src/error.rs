use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by a live page. `Closed` is the only one that ends a run.
#[derive(Debug, Clone, Error)]
pub enum PageError {
    #[error("page closed: {0}")]
    Closed(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("script failed: {0}")]
    Script(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl PageError {
    /// Maps a raw CDP/browser error message onto the taxonomy.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        const CLOSED_HINTS: &[&str] = &[
            "connection closed",
            "target closed",
            "channel closed",
            "no such target",
            "browser has disconnected",
            "underlying connection is closed",
        ];
        if CLOSED_HINTS.iter().any(|hint| lower.contains(hint)) {
            PageError::Closed(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            PageError::Timeout(0)
        } else if lower.contains("could not find node") || lower.contains("no node") {
            PageError::NotFound(message)
        } else {
            PageError::Other(message)
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PageError::Closed(_))
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("fatal: {0}")]
    FatalIo(String),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("artifact sink: {0}")]
    Sink(#[from] SinkError),
    #[error("browser: {0}")]
    Browser(String),
}

impl From<PageError> for AgentError {
    fn from(err: PageError) -> Self {
        match err {
            PageError::Closed(msg) => AgentError::FatalIo(msg),
            other => AgentError::Browser(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unknown run {0}")]
    UnknownRun(String),
}

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("escalation disabled: {0}")]
    Disabled(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("unparseable reply: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no element matches {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_messages_are_fatal() {
        assert!(PageError::from_message("Unable to make method calls because underlying connection is closed").is_fatal());
        assert!(PageError::from_message("Target closed").is_fatal());
        assert!(!PageError::from_message("Could not find node with given id").is_fatal());
    }

    #[test]
    fn closed_page_becomes_fatal_agent_error() {
        let err: AgentError = PageError::Closed("gone".into()).into();
        assert!(matches!(err, AgentError::FatalIo(_)));
        let err: AgentError = PageError::Script("boom".into()).into();
        assert!(matches!(err, AgentError::Browser(_)));
    }
}
