//! In-memory repository double for indexer tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::errors::{GraphError, GraphResult};
use crate::repo::{ChangeKind, ChangedPath, RepositoryAccessor, Revision};

type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Clone, Debug)]
struct FakeCommit {
    parents: Vec<String>,
    tree: Tree,
}

#[derive(Clone, Debug)]
enum Head {
    Branch(String),
    Detached(String),
}

#[derive(Debug)]
struct State {
    commits: HashMap<String, FakeCommit>,
    branches: BTreeMap<String, String>,
    head: Head,
    worktree: Tree,
    next_id: usize,
}

impl State {
    fn resolve(&self, rev: &str) -> GraphResult<String> {
        if let Some(tip) = self.branches.get(rev) {
            return Ok(tip.clone());
        }
        if self.commits.contains_key(rev) {
            return Ok(rev.to_string());
        }
        Err(GraphError::repository(format!("cannot resolve {rev}")))
    }

    fn head_commit(&self) -> Option<String> {
        match &self.head {
            Head::Branch(name) => self.branches.get(name).cloned(),
            Head::Detached(hash) => Some(hash.clone()),
        }
    }

    fn tree(&self, hash: &str) -> GraphResult<&Tree> {
        self.commits
            .get(hash)
            .map(|c| &c.tree)
            .ok_or_else(|| GraphError::repository(format!("unknown commit {hash}")))
    }

    /// Ancestors including `hash` itself.
    fn ancestors(&self, hash: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![hash.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&current) {
                stack.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }
}

/// Commits are named `c1`, `c2`, ...; committing snapshots the work tree
/// onto the checked-out branch.
#[derive(Debug)]
pub struct FakeRepository {
    root: PathBuf,
    state: Mutex<State>,
}

impl FakeRepository {
    /// Empty repository with `branch` checked out and no commits.
    pub fn new(branch: &str) -> Self {
        Self {
            root: PathBuf::from("/fake-repo"),
            state: Mutex::new(State {
                commits: HashMap::new(),
                branches: BTreeMap::new(),
                head: Head::Branch(branch.to_string()),
                worktree: Tree::new(),
                next_id: 1,
            }),
        }
    }

    pub fn write(&self, path: &str, content: &str) {
        self.state
            .lock()
            .worktree
            .insert(path.to_string(), content.as_bytes().to_vec());
    }

    pub fn remove(&self, path: &str) {
        self.state.lock().worktree.remove(path);
    }

    /// Commit the current work tree on HEAD and return the new hash.
    pub fn commit(&self) -> String {
        let mut state = self.state.lock();
        let hash = format!("c{}", state.next_id);
        state.next_id += 1;
        let parents: Vec<String> = state.head_commit().into_iter().collect();
        let tree = state.worktree.clone();
        state
            .commits
            .insert(hash.clone(), FakeCommit { parents, tree });
        match state.head.clone() {
            Head::Branch(name) => {
                state.branches.insert(name, hash.clone());
            }
            Head::Detached(_) => state.head = Head::Detached(hash.clone()),
        }
        hash
    }

    /// Write the given files, then commit.
    pub fn commit_files(&self, files: &[(&str, &str)]) -> String {
        for (path, content) in files {
            self.write(path, content);
        }
        self.commit()
    }

    /// Create `branch` at HEAD and check it out.
    pub fn create_branch(&self, branch: &str) {
        {
            let mut state = self.state.lock();
            let head = state.head_commit().unwrap_or_default();
            state.branches.insert(branch.to_string(), head);
        }
        self.checkout(branch);
    }

    /// Switch to `branch`, replacing the work tree with its tip.
    pub fn checkout(&self, branch: &str) {
        let mut state = self.state.lock();
        let tree = state
            .branches
            .get(branch)
            .and_then(|tip| state.commits.get(tip))
            .map(|c| c.tree.clone())
            .unwrap_or_default();
        state.worktree = tree;
        state.head = Head::Branch(branch.to_string());
    }

    /// Move `branch` to an arbitrary commit (history rewrite).
    pub fn reset_branch(&self, branch: &str, hash: &str) {
        let mut state = self.state.lock();
        state.branches.insert(branch.to_string(), hash.to_string());
        if matches!(&state.head, Head::Branch(name) if name == branch) {
            let tree = state
                .commits
                .get(hash)
                .map(|c| c.tree.clone())
                .unwrap_or_default();
            state.worktree = tree;
        }
    }

    pub fn detach(&self) {
        let mut state = self.state.lock();
        if let Some(hash) = state.head_commit() {
            state.head = Head::Detached(hash);
        }
    }
}

fn diff_trees(from: &Tree, to: &Tree) -> Vec<ChangedPath> {
    let mut changes = Vec::new();
    for (path, content) in to {
        match from.get(path) {
            None => changes.push(ChangedPath::new(path.clone(), ChangeKind::Added)),
            Some(old) if old != content => {
                changes.push(ChangedPath::new(path.clone(), ChangeKind::Modified))
            }
            Some(_) => {}
        }
    }
    for path in from.keys() {
        if !to.contains_key(path) {
            changes.push(ChangedPath::new(path.clone(), ChangeKind::Deleted));
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

impl RepositoryAccessor for FakeRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn head_commit(&self) -> GraphResult<String> {
        self.state
            .lock()
            .head_commit()
            .ok_or_else(|| GraphError::repository("HEAD has no commits"))
    }

    fn current_branch(&self) -> GraphResult<Option<String>> {
        Ok(match &self.state.lock().head {
            Head::Branch(name) => Some(name.clone()),
            Head::Detached(_) => None,
        })
    }

    fn branch_tip(&self, branch: &str) -> GraphResult<String> {
        self.state
            .lock()
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| GraphError::repository(format!("branch {branch} not found")))
    }

    fn merge_base(&self, a: &str, b: &str) -> GraphResult<String> {
        let state = self.state.lock();
        let a = state.resolve(a)?;
        let b = state.resolve(b)?;
        let a_ancestors = state.ancestors(&a);
        let mut queue = VecDeque::from([b.clone()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if a_ancestors.contains(&current) {
                return Ok(current);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(commit) = state.commits.get(&current) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        Err(GraphError::repository(format!(
            "no merge-base between {a} and {b}"
        )))
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> GraphResult<bool> {
        let state = self.state.lock();
        let Ok(ancestor) = state.resolve(ancestor) else {
            return Ok(false);
        };
        let descendant = state.resolve(descendant)?;
        Ok(state.ancestors(&descendant).contains(&ancestor))
    }

    fn commits_between(&self, base: &str, tip: &str) -> GraphResult<Vec<String>> {
        let state = self.state.lock();
        let hidden = state.ancestors(&state.resolve(base)?);
        let tip = state.resolve(tip)?;

        // Post-order over parents yields ancestors first.
        let mut ordered = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(tip, false)];
        while let Some((hash, expanded)) = stack.pop() {
            if hidden.contains(&hash) {
                continue;
            }
            if expanded {
                ordered.push(hash);
                continue;
            }
            if !visited.insert(hash.clone()) {
                continue;
            }
            stack.push((hash.clone(), true));
            if let Some(commit) = state.commits.get(&hash) {
                for parent in commit.parents.iter().rev() {
                    stack.push((parent.clone(), false));
                }
            }
        }
        Ok(ordered)
    }

    fn changed_paths(&self, from: Option<&str>, to: &str) -> GraphResult<Vec<ChangedPath>> {
        let state = self.state.lock();
        let to_tree = state.tree(&state.resolve(to)?)?;
        let empty = Tree::new();
        let from_tree = match from {
            Some(rev) => state.tree(&state.resolve(rev)?)?,
            None => &empty,
        };
        Ok(diff_trees(from_tree, to_tree))
    }

    fn list_files(&self, revision: &Revision) -> GraphResult<Vec<String>> {
        let state = self.state.lock();
        let tree = match revision {
            Revision::Commit(rev) => state.tree(&state.resolve(rev)?)?,
            Revision::WorkTree => &state.worktree,
        };
        Ok(tree.keys().cloned().collect())
    }

    fn read_files(
        &self,
        revision: &Revision,
        paths: &[String],
    ) -> GraphResult<Vec<(String, Option<Vec<u8>>)>> {
        let state = self.state.lock();
        let tree = match revision {
            Revision::Commit(rev) => state.tree(&state.resolve(rev)?)?,
            Revision::WorkTree => &state.worktree,
        };
        Ok(paths
            .iter()
            .map(|p| (p.clone(), tree.get(p).cloned()))
            .collect())
    }

    fn dirty_files(&self) -> GraphResult<Vec<ChangedPath>> {
        let state = self.state.lock();
        let empty = Tree::new();
        let head_tree = match state.head_commit() {
            Some(hash) => state.tree(&hash)?,
            None => &empty,
        };
        Ok(diff_trees(head_tree, &state.worktree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_history_queries() {
        let repo = FakeRepository::new("master");
        let base = repo.commit_files(&[("A.swift", "struct A {}")]);
        repo.create_branch("feature");
        let f1 = repo.commit_files(&[("B.swift", "struct B {}")]);
        let f2 = repo.commit_files(&[("C.swift", "struct C {}")]);
        repo.checkout("master");
        let m1 = repo.commit_files(&[("M.swift", "struct M {}")]);

        assert_eq!(repo.merge_base(&m1, "feature").unwrap(), base);
        assert_eq!(repo.commits_between(&base, "feature").unwrap(), vec![f1.clone(), f2]);
        assert!(repo.is_ancestor(&base, &f1).unwrap());
        assert!(!repo.is_ancestor(&f1, &m1).unwrap());
        assert!(repo.dirty_files().unwrap().is_empty());

        repo.write("A.swift", "struct A { let x = 1 }");
        repo.remove("M.swift");
        assert_eq!(
            repo.dirty_files().unwrap(),
            vec![
                ChangedPath::new("A.swift", ChangeKind::Modified),
                ChangedPath::new("M.swift", ChangeKind::Deleted),
            ]
        );
    }
}
