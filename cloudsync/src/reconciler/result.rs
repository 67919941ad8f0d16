//! Sync result counters and issues.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{IssueKind, SyncError};
use crate::model::ResourceKind;

/// Branch of a reconcile an issue was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Open,
    Compare,
    Delete,
    Update,
    Add,
    Cascade,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Open => "open",
            Phase::Compare => "compare",
            Phase::Delete => "delete",
            Phase::Update => "update",
            Phase::Add => "add",
            Phase::Cascade => "cascade",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncIssue {
    pub kind: IssueKind,
    pub phase: Phase,
    /// Local id or upstream global id the issue concerns, if any.
    pub object: Option<String>,
    pub message: String,
}

/// Outcome of a child reconcile below one parent row.
#[derive(Debug, Clone, Serialize)]
pub struct ChildSync {
    pub parent_id: String,
    pub result: SyncResult,
}

/// Counters and issues of one reconcile.
///
/// `update` counts matched pairs that were looked at; `changed` counts the
/// ones whose mirrored fields actually moved.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub kind: ResourceKind,
    pub add: usize,
    pub add_errors: usize,
    pub update: usize,
    pub changed: usize,
    pub update_errors: usize,
    pub delete: usize,
    pub delete_errors: usize,
    /// Rows left alone because a task on them is still in flight.
    pub skipped: usize,
    pub issues: Vec<SyncIssue>,
    pub cancelled: bool,
    /// The scope could not be opened or listed; nothing was mutated.
    pub aborted: bool,
    pub children: Vec<ChildSync>,
    pub request_cost: Duration,
    pub store_cost: Duration,
}

impl SyncResult {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            add: 0,
            add_errors: 0,
            update: 0,
            changed: 0,
            update_errors: 0,
            delete: 0,
            delete_errors: 0,
            skipped: 0,
            issues: Vec::new(),
            cancelled: false,
            aborted: false,
            children: Vec::new(),
            request_cost: Duration::ZERO,
            store_cost: Duration::ZERO,
        }
    }

    pub fn record(&mut self, phase: Phase, object: Option<&str>, err: &SyncError) {
        self.issue(err.issue_kind(), phase, object, err.to_string());
        if err.is_cancelled() {
            self.cancelled = true;
        }
    }

    pub fn issue(
        &mut self,
        kind: IssueKind,
        phase: Phase,
        object: Option<&str>,
        message: impl Into<String>,
    ) {
        self.issues.push(SyncIssue {
            kind,
            phase,
            object: object.map(str::to_string),
            message: message.into(),
        });
    }

    /// Abort before any mutation.
    pub fn abort(&mut self, phase: Phase, err: &SyncError) {
        self.aborted = true;
        self.record(phase, None, err);
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn is_error(&self) -> bool {
        self.aborted
            || self.add_errors + self.update_errors + self.delete_errors > 0
            || self.children.iter().any(|c| c.result.is_error())
    }

    /// Adds, real changes and deletes, children included.
    pub fn total_changes(&self) -> usize {
        self.add
            + self.changed
            + self.delete
            + self
                .children
                .iter()
                .map(|c| c.result.total_changes())
                .sum::<usize>()
    }

    /// Child results of `kind`, over all parents.
    pub fn child(&self, kind: ResourceKind) -> impl Iterator<Item = &SyncResult> {
        self.children
            .iter()
            .map(|c| &c.result)
            .filter(move |r| r.kind == kind)
    }

    pub fn summary(&self) -> String {
        format!(
            "removed {} failed {} updated {} changed {} failed {} added {} failed {} skipped {}",
            self.delete,
            self.delete_errors,
            self.update,
            self.changed,
            self.update_errors,
            self.add,
            self.add_errors,
            self.skipped
        )
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.summary())?;
        if self.cancelled {
            f.write_str(" (cancelled)")?;
        }
        if self.aborted {
            f.write_str(" (aborted)")?;
        }
        Ok(())
    }
}

/// Results of a provider-wide sync, one entry per kind and scope.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResultSet {
    results: BTreeMap<String, SyncResult>,
}

impl SyncResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope_key: &str, result: SyncResult) {
        self.results
            .insert(format!("{}@{}", result.kind, scope_key), result);
    }

    pub fn merge(&mut self, other: SyncResultSet) {
        self.results.extend(other.results);
    }

    pub fn get(&self, kind: ResourceKind, scope_key: &str) -> Option<&SyncResult> {
        self.results.get(&format!("{}@{}", kind, scope_key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SyncResult)> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.results.values().any(SyncResult::is_error)
    }

    pub fn cancelled(&self) -> bool {
        self.results.values().any(|r| r.cancelled)
    }

    pub fn summary(&self) -> String {
        let (mut add, mut changed, mut delete, mut errors) = (0, 0, 0, 0);
        for r in self.results.values() {
            add += r.add;
            changed += r.changed;
            delete += r.delete;
            errors += r.add_errors + r.update_errors + r.delete_errors;
        }
        format!(
            "{} scopes: added {} changed {} removed {} errors {}",
            self.results.len(),
            add,
            changed,
            delete,
            errors
        )
    }
}
