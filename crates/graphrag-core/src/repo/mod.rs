//! Repository access: the git facts the indexers consume.
//!
//! Indexers only talk to [`RepositoryAccessor`]; [`git::GitRepository`] is
//! the libgit2-backed implementation used outside tests.

pub mod git;

#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;

use serde::Serialize;

use crate::errors::GraphResult;

/// Where file listings and contents come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Revision {
    Commit(String),
    /// The files on disk, including uncommitted changes.
    WorkTree,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ChangedPath {
    pub path: String,
    pub change: ChangeKind,
}

impl ChangedPath {
    pub fn new(path: impl Into<String>, change: ChangeKind) -> Self {
        Self {
            path: path.into(),
            change,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.change == ChangeKind::Deleted
    }
}

/// Git primitives needed by the master and feature indexers.  Paths are
/// repository-relative and `/`-separated.
pub trait RepositoryAccessor {
    fn root(&self) -> &Path;

    fn head_commit(&self) -> GraphResult<String>;

    /// Short name of the checked-out branch; `None` when HEAD is detached.
    fn current_branch(&self) -> GraphResult<Option<String>>;

    fn branch_tip(&self, branch: &str) -> GraphResult<String>;

    /// Best common ancestor of two revisions.  Fails when there is none.
    fn merge_base(&self, a: &str, b: &str) -> GraphResult<String>;

    /// True when `ancestor` is reachable from `descendant` (or equal to it).
    /// An unknown `ancestor` is reported as `false`.
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> GraphResult<bool>;

    /// Commits reachable from `tip` but not from `base`, oldest first.
    fn commits_between(&self, base: &str, tip: &str) -> GraphResult<Vec<String>>;

    /// Files that differ between two commits.  `from = None` reports every
    /// file at `to` as added.  Renames are reported as delete + add.
    fn changed_paths(&self, from: Option<&str>, to: &str) -> GraphResult<Vec<ChangedPath>>;

    fn list_files(&self, revision: &Revision) -> GraphResult<Vec<String>>;

    /// Batch read; `None` marks a path absent at `revision`.
    fn read_files(
        &self,
        revision: &Revision,
        paths: &[String],
    ) -> GraphResult<Vec<(String, Option<Vec<u8>>)>>;

    /// Staged, unstaged and untracked changes relative to HEAD.
    fn dirty_files(&self) -> GraphResult<Vec<ChangedPath>>;
}

/// Normalise a path to the `/`-separated repository-relative form.
pub fn normalize_path(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let trimmed = replaced.trim_start_matches("./");
    trimmed.trim_start_matches('/').to_string()
}
