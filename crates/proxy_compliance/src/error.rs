use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Exit code reserved for proxy-traversal failures.
pub const EXIT_MISSING_URL: i32 = 3;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing dependency command: {command}")]
    MissingCommand { command: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("required path does not exist: {path}")]
    MissingPath { path: PathBuf },

    #[error("failed to create sandbox at {path}: {reason}")]
    SandboxCreation { path: PathBuf, reason: String },

    #[error("failed to remove sandbox at {path}: {source}")]
    SandboxTeardown {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy did not produce {cert_path} within {}ms", .timeout.as_millis())]
    ProxyStartupTimeout { cert_path: PathBuf, timeout: Duration },

    #[error("proxy exited before becoming ready (exit={exit_code:?})")]
    ProxyExitedEarly { exit_code: Option<i32> },

    #[error("invalid proxy state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("client invocation failed: {command} (exit={exit_code:?}): {message}")]
    Invocation {
        command: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("{} of {total} fetched url(s) bypassed the proxy: {}", .missing.len(), .missing.join(", "))]
    MissingUrl { missing: Vec<String>, total: usize },

    #[error("{message}")]
    Exit { code: i32, message: String },
}

impl HarnessError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exit { code, .. } => *code,
            Self::Invocation {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            Self::MissingUrl { .. } => EXIT_MISSING_URL,
            _ => 1,
        }
    }

    #[must_use]
    pub fn exit(code: i32, message: impl Into<String>) -> Self {
        Self::Exit {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn sandbox(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SandboxCreation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
