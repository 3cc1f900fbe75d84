//! Agent error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by agent phases and the transport
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    JobConfig(#[from] kiln_common::JobConfigError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("`{command}` exited with {}{}", describe_code(.code), describe_stderr(.stderr))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("connection error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] kiln_common::ProtocolError),

    #[error("invalid controller URL `{0}`: expected http, https, ws or wss")]
    InvalidUrl(String),

    #[error("invalid cache path `{template}`: {reason}")]
    InvalidCachePath { template: String, reason: String },

    #[error("invalid cache options: {0}")]
    CacheOptions(#[from] serde_json::Error),

    #[error("{what} timed out after {}", describe_duration(.after))]
    Timeout { what: String, after: Duration },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    /// Wrap an I/O error with a description of what was being attempted
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// I/O error on a specific path
    pub fn io_path(action: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::io(format!("failed to {} {}", action, path.display()), source)
    }

    pub fn invalid_cache_path(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCachePath {
            template: template.into(),
            reason: reason.into(),
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn describe_duration(after: &Duration) -> String {
    humantime::format_duration(*after).to_string()
}

fn describe_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

/// Extension for attaching a path to I/O results
pub(crate) trait IoResultExt<T> {
    fn with_path(self, action: &str, path: &std::path::Path) -> AgentResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, action: &str, path: &std::path::Path) -> AgentResult<T> {
        self.map_err(|e| AgentError::io_path(action, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = AgentError::CommandFailed {
            command: "docker load".to_string(),
            code: Some(1),
            stderr: "no space left\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`docker load` exited with exit code 1: no space left"
        );

        let err = AgentError::CommandFailed {
            command: "git".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_timeout_display() {
        let err = AgentError::Timeout {
            what: "build".to_string(),
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "build timed out after 1m 30s");
    }

    #[test]
    fn test_io_path_context() {
        let err = AgentError::io_path(
            "create",
            std::path::Path::new("/tmp/x"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "failed to create /tmp/x: denied");
    }
}
