use std::sync::Arc;

use parley_llm::CompletionError;
use parley_storage::{SessionName, StorageError};
use snafu::Snafu;

/// Coarse grouping callers branch on when deciding how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally; nothing was sent anywhere.
    Precondition,
    Store,
    Completion,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("message text is empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("session '{name}' does not exist"))]
    UnknownSession {
        stage: &'static str,
        name: SessionName,
    },
    #[snafu(display("session name is invalid on `{stage}`, {source}"))]
    InvalidSessionName {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session '{name}' already exists"))]
    DuplicateSession {
        stage: &'static str,
        name: SessionName,
    },
    #[snafu(display("session '{name}' was deleted while a send was in flight"))]
    SessionDeleted {
        stage: &'static str,
        name: SessionName,
    },
    #[snafu(display("session store failed on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: Arc<StorageError>,
    },
    #[snafu(display("completion failed on `{stage}`, {source}"))]
    Completion {
        stage: &'static str,
        source: CompletionError,
    },
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyMessage { .. }
            | Self::UnknownSession { .. }
            | Self::InvalidSessionName { .. } => ErrorKind::Precondition,
            Self::DuplicateSession { .. } | Self::SessionDeleted { .. } | Self::Store { .. } => {
                ErrorKind::Store
            }
            Self::Completion { .. } => ErrorKind::Completion,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::EmptyMessage { stage }
            | Self::UnknownSession { stage, .. }
            | Self::InvalidSessionName { stage, .. }
            | Self::DuplicateSession { stage, .. }
            | Self::SessionDeleted { stage, .. }
            | Self::Store { stage, .. }
            | Self::Completion { stage, .. } => stage,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Completion { source, .. } if source.is_timeout())
    }

    /// Wraps a store failure that was not produced through a shared query.
    pub(crate) fn store(stage: &'static str, source: StorageError) -> Self {
        Self::Store {
            stage,
            source: Arc::new(source),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
