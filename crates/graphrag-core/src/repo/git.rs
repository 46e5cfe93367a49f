//! libgit2-backed [`RepositoryAccessor`].
//!
//! A fresh `git2::Repository` handle is opened per call, so the accessor is
//! cheap to share and never holds the repository lock between operations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git2::{
    BranchType, Commit, Delta, ErrorCode, Oid, Repository, Sort, Status, StatusOptions,
    TreeWalkMode, TreeWalkResult,
};
use tracing::debug;

use crate::errors::{GraphError, GraphResult};
use crate::repo::{normalize_path, ChangeKind, ChangedPath, RepositoryAccessor, Revision};

#[derive(Clone, Debug)]
pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    /// Locate the repository containing `path`.  Bare repositories are
    /// rejected: the working tree is needed for the feature snapshot.
    pub fn discover(path: impl AsRef<Path>) -> GraphResult<Self> {
        let path = path.as_ref();
        let repo = Repository::discover(path).map_err(|e| {
            GraphError::repository(format!("no git repository at {}: {e}", path.display()))
        })?;
        let root = repo
            .workdir()
            .ok_or_else(|| GraphError::repository("repository has no working directory"))?
            .to_path_buf();
        Ok(Self { root })
    }

    fn open(&self) -> GraphResult<Repository> {
        Ok(Repository::open(&self.root)?)
    }
}

fn resolve_commit<'r>(repo: &'r Repository, rev: &str) -> GraphResult<Commit<'r>> {
    let object = repo
        .revparse_single(rev)
        .map_err(|e| GraphError::repository(format!("cannot resolve {rev}: {e}")))?;
    Ok(object.peel_to_commit()?)
}

fn resolve_oid(repo: &Repository, rev: &str) -> GraphResult<Oid> {
    Ok(resolve_commit(repo, rev)?.id())
}

impl RepositoryAccessor for GitRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn head_commit(&self) -> GraphResult<String> {
        let repo = self.open()?;
        let head = repo
            .head()
            .map_err(|e| GraphError::repository(format!("cannot read HEAD: {e}")))?;
        let id = head.peel_to_commit()?.id().to_string();
        Ok(id)
    }

    fn current_branch(&self) -> GraphResult<Option<String>> {
        let repo = self.open()?;
        if repo.head_detached()? {
            return Ok(None);
        }
        let branch = match repo.head() {
            Ok(head) if head.is_branch() => {
                let name = head.shorthand().map(str::to_string);
                Ok(name)
            }
            Ok(_) => Ok(None),
            // Freshly initialised repository: HEAD names a branch with no commits.
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let head = repo.find_reference("HEAD")?;
                let name = head
                    .symbolic_target()
                    .map(|target| target.trim_start_matches("refs/heads/").to_string());
                Ok(name)
            }
            Err(e) => Err(e.into()),
        };
        branch
    }

    fn branch_tip(&self, branch: &str) -> GraphResult<String> {
        let repo = self.open()?;
        let found = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|e| GraphError::repository(format!("branch {branch} not found: {e}")))?;
        let id = found.get().peel_to_commit()?.id().to_string();
        Ok(id)
    }

    fn merge_base(&self, a: &str, b: &str) -> GraphResult<String> {
        let repo = self.open()?;
        let a_oid = resolve_oid(&repo, a)?;
        let b_oid = resolve_oid(&repo, b)?;
        let base = repo.merge_base(a_oid, b_oid).map_err(|e| {
            GraphError::repository(format!("no merge-base between {a} and {b}: {e}"))
        })?;
        Ok(base.to_string())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> GraphResult<bool> {
        let repo = self.open()?;
        let ancestor_oid = match resolve_commit(&repo, ancestor) {
            Ok(commit) => commit.id(),
            Err(_) => return Ok(false),
        };
        let descendant_oid = resolve_oid(&repo, descendant)?;
        if ancestor_oid == descendant_oid {
            return Ok(true);
        }
        Ok(repo.graph_descendant_of(descendant_oid, ancestor_oid)?)
    }

    fn commits_between(&self, base: &str, tip: &str) -> GraphResult<Vec<String>> {
        let repo = self.open()?;
        let mut revwalk = repo.revwalk()?;
        revwalk.push(resolve_oid(&repo, tip)?)?;
        revwalk.hide(resolve_oid(&repo, base)?)?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;

        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(oid?.to_string());
        }
        Ok(commits)
    }

    fn changed_paths(&self, from: Option<&str>, to: &str) -> GraphResult<Vec<ChangedPath>> {
        let repo = self.open()?;
        let to_tree = resolve_commit(&repo, to)?.tree()?;
        let from_tree = match from {
            Some(rev) => Some(resolve_commit(&repo, rev)?.tree()?),
            None => None,
        };
        let diff = repo.diff_tree_to_tree(from_tree.as_ref(), Some(&to_tree), None)?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let old_path = delta
                .old_file()
                .path()
                .map(|p| normalize_path(&p.to_string_lossy()));
            let new_path = delta
                .new_file()
                .path()
                .map(|p| normalize_path(&p.to_string_lossy()));
            match delta.status() {
                Delta::Added | Delta::Copied => {
                    if let Some(path) = new_path {
                        changes.push(ChangedPath::new(path, ChangeKind::Added));
                    }
                }
                Delta::Modified | Delta::Typechange => {
                    if let Some(path) = new_path {
                        changes.push(ChangedPath::new(path, ChangeKind::Modified));
                    }
                }
                Delta::Deleted => {
                    if let Some(path) = old_path {
                        changes.push(ChangedPath::new(path, ChangeKind::Deleted));
                    }
                }
                Delta::Renamed => {
                    if let Some(path) = old_path {
                        changes.push(ChangedPath::new(path, ChangeKind::Deleted));
                    }
                    if let Some(path) = new_path {
                        changes.push(ChangedPath::new(path, ChangeKind::Added));
                    }
                }
                other => debug!(status = ?other, "skipping diff delta"),
            }
        }
        Ok(changes)
    }

    fn list_files(&self, revision: &Revision) -> GraphResult<Vec<String>> {
        match revision {
            Revision::Commit(rev) => {
                let repo = self.open()?;
                let tree = resolve_commit(&repo, rev)?.tree()?;
                let mut files = Vec::new();
                tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
                    if entry.kind() == Some(git2::ObjectType::Blob) {
                        if let Some(name) = entry.name() {
                            files.push(normalize_path(&format!("{dir}{name}")));
                        }
                    }
                    TreeWalkResult::Ok
                })?;
                files.sort();
                Ok(files)
            }
            Revision::WorkTree => {
                let mut files = Vec::new();
                for entry in ignore::WalkBuilder::new(&self.root).build() {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            debug!(error = %e, "skipping unreadable path");
                            continue;
                        }
                    };
                    if !entry.file_type().is_some_and(|t| t.is_file()) {
                        continue;
                    }
                    if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                        files.push(normalize_path(&relative.to_string_lossy()));
                    }
                }
                files.sort();
                Ok(files)
            }
        }
    }

    fn read_files(
        &self,
        revision: &Revision,
        paths: &[String],
    ) -> GraphResult<Vec<(String, Option<Vec<u8>>)>> {
        let mut contents = Vec::with_capacity(paths.len());
        match revision {
            Revision::Commit(rev) => {
                let repo = self.open()?;
                let tree = resolve_commit(&repo, rev)?.tree()?;
                for path in paths {
                    let content = match tree.get_path(Path::new(path)) {
                        Ok(entry) => {
                            let object = entry.to_object(&repo)?;
                            object.as_blob().map(|blob| blob.content().to_vec())
                        }
                        Err(e) if e.code() == ErrorCode::NotFound => None,
                        Err(e) => return Err(e.into()),
                    };
                    contents.push((path.clone(), content));
                }
            }
            Revision::WorkTree => {
                for path in paths {
                    let content = match std::fs::read(self.root.join(path)) {
                        Ok(bytes) => Some(bytes),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => return Err(e.into()),
                    };
                    contents.push((path.clone(), content));
                }
            }
        }
        Ok(contents)
    }

    fn dirty_files(&self) -> GraphResult<Vec<ChangedPath>> {
        let repo = self.open()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .include_unreadable(false);
        let statuses = repo.statuses(Some(&mut opts))?;

        let mut dirty = BTreeMap::new();
        for entry in statuses.iter() {
            let status = entry.status();
            if status == Status::CURRENT || status.is_ignored() {
                continue;
            }
            let Some(path) = entry.path() else {
                continue;
            };
            let path = normalize_path(path);
            let change = if !self.root.join(&path).is_file() {
                ChangeKind::Deleted
            } else if status.intersects(Status::WT_NEW | Status::INDEX_NEW) {
                ChangeKind::Added
            } else {
                ChangeKind::Modified
            };
            dirty.insert(path, change);
        }
        Ok(dirty
            .into_iter()
            .map(|(path, change)| ChangedPath { path, change })
            .collect())
    }
}
