//! Developer notification channel
//!
//! Configuration problems found while serving a request (a connection field
//! pointing at a missing object, a join key without a unique index) are reported
//! here instead of being surfaced to the end user.

use std::fmt;

/// What kind of problem is being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// A connection field cannot be resolved and was skipped
    MissingLinkTarget,
    /// A join key column is not backed by a unique index
    NonUniqueJoinKey,
    /// A table or column name is not a valid identifier
    InvalidIdentifier,
    /// A stored query or data collection could not be used
    InvalidDefinition,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NoticeKind::MissingLinkTarget => "missing_link_target",
            NoticeKind::NonUniqueJoinKey => "non_unique_join_key",
            NoticeKind::InvalidIdentifier => "invalid_identifier",
            NoticeKind::InvalidDefinition => "invalid_definition",
        };
        f.write_str(s)
    }
}

/// Receives configuration problems for the platform's developers
pub trait DeveloperNotifier: Send + Sync {
    fn notify(&self, kind: NoticeKind, message: &str, context: serde_json::Value);
}

/// Default notifier: writes the notice to the `tracing` error stream
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl DeveloperNotifier for TracingNotifier {
    fn notify(&self, kind: NoticeKind, message: &str, context: serde_json::Value) {
        tracing::error!(kind = %kind, context = %context, "{}", message);
    }
}
