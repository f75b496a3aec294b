//! Change events emitted by trigger sources.

use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// A change observed in a repository that may start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Repository id or url the change happened in.
    pub repository: String,
    /// Branch of the change, either a full ref or a short name.
    pub branch: String,
    /// Revision (commit id) of the change.
    pub revision: String,
    /// When the change was observed.
    pub timestamp: Timestamp,
}

impl ChangeEvent {
    /// Creates a change event stamped with the current time.
    #[must_use]
    pub fn new(
        repository: impl Into<String>,
        branch: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            revision: revision.into(),
            timestamp: now_utc(),
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The short branch name, with `refs/heads/` stripped.
    #[must_use]
    pub fn short_branch(&self) -> &str {
        short_branch_name(&self.branch)
    }
}

/// Strips a leading `refs/heads/` from a branch name.
#[must_use]
pub fn short_branch_name(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

/// Expands a short branch name into a full `refs/heads/` ref.
#[must_use]
pub fn full_branch_ref(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{branch}")
    }
}
