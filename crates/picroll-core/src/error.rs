//! Error handling for picroll

use crate::types::{TaskId, TaskKind};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected HTTP status {0}")]
    Http(u16),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::InvalidPayload(err.to_string())
        } else if let Some(status) = err.status() {
            Error::Http(status.as_u16())
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Decode(err.to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Category of a recoverable problem surfaced to the presentation layer.
///
/// None of these stop the pipeline. Retrying happens on the next natural
/// trigger (an `advance`, a configuration change, a completed download).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The metadata query failed (connect, TLS, timeout, malformed payload).
    MetadataFetchFailed,
    /// The remote service returned an empty batch for the current filters.
    NoMatchingItems,
    /// A content transfer failed, either for viewing or for export.
    ContentFetchFailed(TaskKind),
    /// The asset is gone upstream (HTTP 404).
    ContentUnavailable,
    /// `back()` was asked for an item older than the history holds.
    NoPreviousItem,
    /// `request_export()` was issued while nothing is shown.
    NothingToExport,
}

impl ErrorKind {
    /// Informational kinds carry no retry and no network cause.
    pub fn is_informational(&self) -> bool {
        matches!(self, ErrorKind::NoPreviousItem | ErrorKind::NothingToExport)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::MetadataFetchFailed => write!(f, "metadata fetch failed"),
            ErrorKind::NoMatchingItems => write!(f, "no items match the current filters"),
            ErrorKind::ContentFetchFailed(TaskKind::View) => write!(f, "fetching content failed"),
            ErrorKind::ContentFetchFailed(TaskKind::Export) => write!(f, "saving content failed"),
            ErrorKind::ContentUnavailable => write!(f, "content unavailable"),
            ErrorKind::NoPreviousItem => write!(f, "no previous item"),
            ErrorKind::NothingToExport => write!(f, "nothing to export"),
        }
    }
}

/// A recoverable error, as shown to the user.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub task: Option<TaskId>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, task: Option<TaskId>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            task,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

impl std::fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.task {
            Some(task) if self.detail.is_empty() => write!(f, "{} ({})", self.kind, task),
            Some(task) => write!(f, "{} ({}): {}", self.kind, task, self.detail),
            None if self.detail.is_empty() => write!(f, "{}", self.kind),
            None => write!(f, "{}: {}", self.kind, self.detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_informational_kinds() {
        assert!(ErrorKind::NoPreviousItem.is_informational());
        assert!(ErrorKind::NothingToExport.is_informational());
        assert!(!ErrorKind::ContentFetchFailed(TaskKind::Export).is_informational());
        assert!(!ErrorKind::MetadataFetchFailed.is_informational());
    }

    #[test]
    fn test_event_display() {
        let event = ErrorEvent::new(
            ErrorKind::ContentFetchFailed(TaskKind::View),
            Some(TaskId(7)),
            "connection reset",
        );
        assert_eq!(event.to_string(), "fetching content failed (task-7): connection reset");

        let event = ErrorEvent::new(ErrorKind::NoPreviousItem, None, "");
        assert_eq!(event.to_string(), "no previous item");
    }
}
