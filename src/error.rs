use std::fmt;

use thiserror::Error;

use crate::phase::SessionPhase;

/// Structured failure kinds for repository operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    InvalidPath,
    NotARepo,
    NoSuchRef,
    NoSuchPath,
    RangeInvalid,
}

impl fmt::Display for RepoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidPath => "invalid_path",
            Self::NotARepo => "not_a_repo",
            Self::NoSuchRef => "no_such_ref",
            Self::NoSuchPath => "no_such_path",
            Self::RangeInvalid => "range_invalid",
        };
        write!(f, "{}", s)
    }
}

/// A fix-required issue blocking `finish`, surfaced in the 409 payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UnresolvedIssue {
    pub id: String,
    pub title: String,
    pub file: String,
    pub severity: String,
}

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("operation {operation} not allowed in {actual} (expected {expected})")]
    State {
        operation: String,
        expected: String,
        actual: SessionPhase,
    },

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionPhase,
        to: SessionPhase,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("issue not found: {0}")]
    IssueNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("preset not found: {0}")]
    PresetNotFound(String),

    #[error("{} unresolved issues remain", .0.len())]
    UnresolvedIssues(Vec<UnresolvedIssue>),

    #[error("repository error ({kind}): {message}")]
    Repo {
        kind: RepoErrorKind,
        message: String,
    },

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ReviewError {
    pub fn repo(kind: RepoErrorKind, message: impl Into<String>) -> Self {
        Self::Repo {
            kind,
            message: message.into(),
        }
    }

    pub fn state(
        operation: impl Into<String>,
        expected: impl Into<String>,
        actual: SessionPhase,
    ) -> Self {
        Self::State {
            operation: operation.into(),
            expected: expected.into(),
            actual,
        }
    }

    /// Stable kind tag used by the adapter boundary and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Auth(_) => "authentication",
            Self::State { .. } | Self::InvalidTransition { .. } => "state",
            Self::SessionNotFound(_)
            | Self::IssueNotFound(_)
            | Self::AgentNotFound(_)
            | Self::PresetNotFound(_) => "not_found",
            Self::UnresolvedIssues(_) => "conflict",
            Self::Repo { .. } => "repo",
            Self::Subprocess(_) => "subprocess",
            Self::Storage(_) | Self::Io(_) | Self::Json(_) | Self::Toml(_) => "storage",
            Self::Config(_) => "validation",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReviewError>;
