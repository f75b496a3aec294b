//! Run listing: filters, opaque paging tokens and the lazy page iterator.

use super::instance::{Run, RunSummary};
use super::store::RunStateStore;
use crate::core::{short_branch_name, RunStatus};
use crate::errors::{BuildchainError, BuildchainResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

const TOKEN_PREFIX: &str = "runs:";

/// Which runs a listing returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    /// Only runs with this status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    /// Only runs triggered on this branch (full ref or short name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Only runs that include this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl RunFilter {
    /// Matches every run.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts to a status.
    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to a branch.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Restricts to runs containing a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Returns true if the run passes the filter.
    #[must_use]
    pub fn matches(&self, run: &Run) -> bool {
        self.status.map_or(true, |s| run.status == s)
            && self.branch.as_deref().map_or(true, |b| {
                short_branch_name(b) == short_branch_name(&run.trigger.branch)
            })
            && self
                .stage
                .as_deref()
                .map_or(true, |s| run.instances.contains_key(s))
    }
}

/// Opaque cursor resuming a listing after the last run of a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    pub(crate) fn after(sequence: u64) -> Self {
        Self(URL_SAFE_NO_PAD.encode(format!("{TOKEN_PREFIX}{sequence}")))
    }

    pub(crate) fn sequence(&self) -> BuildchainResult<u64> {
        let invalid = || BuildchainError::InvalidPageToken(self.0.clone());
        let bytes = URL_SAFE_NO_PAD.decode(&self.0).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        text.strip_prefix(TOKEN_PREFIX)
            .and_then(|n| n.parse().ok())
            .ok_or_else(invalid)
    }

    /// The encoded token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PageToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for PageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One request for a page of runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Resume after this token; `None` starts at the newest run.
    pub token: Option<PageToken>,
    /// Maximum runs per page.
    pub limit: usize,
}

impl PageRequest {
    /// The first page.
    #[must_use]
    pub fn first(limit: usize) -> Self {
        Self { token: None, limit }
    }

    /// The page after `token`.
    #[must_use]
    pub fn after(token: PageToken, limit: usize) -> Self {
        Self {
            token: Some(token),
            limit,
        }
    }
}

/// A page of run summaries, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPage {
    /// Summaries on this page.
    pub runs: Vec<RunSummary>,
    /// Token of the next page, `None` on the last page.
    pub next: Option<PageToken>,
}

/// Lazily fetches pages of a listing.
///
/// Each call to `next` queries the store for one page. Iteration ends after
/// the last page; a new iterator can resume from any returned token.
pub struct RunPages<'a> {
    store: &'a RunStateStore,
    filter: RunFilter,
    limit: usize,
    next: Option<Option<PageToken>>,
}

impl<'a> RunPages<'a> {
    pub(crate) fn new(store: &'a RunStateStore, filter: RunFilter, limit: usize) -> Self {
        Self {
            store,
            filter,
            limit: limit.max(1),
            next: Some(None),
        }
    }

    /// Restarts the listing after `token`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageToken` if the token was not issued by a store.
    pub fn resume(mut self, token: PageToken) -> BuildchainResult<Self> {
        token.sequence()?;
        self.next = Some(Some(token));
        Ok(self)
    }

    /// Iterates over individual summaries instead of pages.
    pub fn summaries(self) -> impl Iterator<Item = RunSummary> + 'a {
        self.flat_map(|page| page.runs)
    }
}

impl Iterator for RunPages<'_> {
    type Item = RunPage;

    fn next(&mut self) -> Option<RunPage> {
        let token = self.next.take()?;
        let request = PageRequest {
            token,
            limit: self.limit,
        };
        // tokens are validated on entry, so listing cannot fail here
        let page = self.store.list_runs(&self.filter, &request).ok()?;
        self.next = page.next.clone().map(Some);
        Some(page)
    }
}
