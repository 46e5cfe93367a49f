//! Master indexer: mirrors the primary branch into the master store.

use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use crate::errors::GraphResult;
use crate::indexer::pipeline::{apply_with_retry, build_batch, PassContext};
use crate::models::IndexWarning;
use crate::repo::{ChangeKind, ChangedPath, Revision};
use crate::store::database::EntityStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterOutcome {
    /// First full scan of an empty store.
    Initialized,
    /// Incremental diff from the last indexed commit.
    Updated,
    /// Last indexed commit is no longer an ancestor of the tip.
    Rescanned,
    UpToDate,
    /// `init` on a store that already has data; nothing was written.
    AlreadyInitialized,
}

#[derive(Clone, Debug, Serialize)]
pub struct MasterReport {
    pub outcome: MasterOutcome,
    pub commit: String,
    pub files_parsed: usize,
    pub files_deleted: usize,
    pub warnings: Vec<IndexWarning>,
}

impl MasterReport {
    fn unchanged(outcome: MasterOutcome, commit: String) -> Self {
        Self {
            outcome,
            commit,
            files_parsed: 0,
            files_deleted: 0,
            warnings: Vec::new(),
        }
    }
}

pub struct MasterIndexer<'a> {
    ctx: PassContext<'a>,
    store: &'a EntityStore,
}

impl<'a> MasterIndexer<'a> {
    pub fn new(ctx: PassContext<'a>, store: &'a EntityStore) -> Self {
        Self { ctx, store }
    }

    /// `init` on an empty store, `update` otherwise.
    pub fn run(&self) -> GraphResult<MasterReport> {
        if self.store.index_state()?.is_empty() {
            self.init()
        } else {
            self.update()
        }
    }

    /// Full scan of the primary branch tip.  A store that already holds
    /// data is left untouched.
    pub fn init(&self) -> GraphResult<MasterReport> {
        let state = self.store.index_state()?;
        if let Some(last) = state.last_commit_hash {
            info!(commit = %last, "master store already initialized");
            return Ok(MasterReport::unchanged(
                MasterOutcome::AlreadyInitialized,
                last,
            ));
        }
        let tip = self.primary_tip()?;
        self.full_scan(&tip, MasterOutcome::Initialized)
    }

    /// Bring the store from its last indexed commit up to the primary tip.
    pub fn update(&self) -> GraphResult<MasterReport> {
        let state = self.store.index_state()?;
        let Some(last) = state.last_commit_hash else {
            let tip = self.primary_tip()?;
            return self.full_scan(&tip, MasterOutcome::Initialized);
        };
        let tip = self.primary_tip()?;
        if last == tip {
            info!(commit = %tip, "master store up to date");
            return Ok(MasterReport::unchanged(MasterOutcome::UpToDate, tip));
        }
        if !self.ctx.repo.is_ancestor(&last, &tip)? {
            info!(last = %last, tip = %tip, "history rewritten, rescanning primary branch");
            return self.full_scan(&tip, MasterOutcome::Rescanned);
        }

        let changes = self.ctx.repo.changed_paths(Some(&last), &tip)?;
        self.apply(&tip, &changes, MasterOutcome::Updated)
    }

    fn primary_tip(&self) -> GraphResult<String> {
        self.ctx.repo.branch_tip(&self.ctx.settings.primary_branch)
    }

    /// Every indexable file at `tip`, plus tombstones for live documents
    /// that no longer exist there.
    fn full_scan(&self, tip: &str, outcome: MasterOutcome) -> GraphResult<MasterReport> {
        let revision = Revision::Commit(tip.to_string());
        let files = self.ctx.repo.list_files(&revision)?;
        let present: HashSet<&str> = files.iter().map(String::as_str).collect();

        let mut changes: Vec<ChangedPath> = self
            .store
            .live_document_paths()?
            .into_iter()
            .filter(|path| !present.contains(path.as_str()))
            .map(|path| ChangedPath::new(path, ChangeKind::Deleted))
            .collect();
        changes.extend(
            files
                .iter()
                .map(|path| ChangedPath::new(path.clone(), ChangeKind::Added)),
        );
        self.apply(tip, &changes, outcome)
    }

    fn apply(
        &self,
        tip: &str,
        changes: &[ChangedPath],
        outcome: MasterOutcome,
    ) -> GraphResult<MasterReport> {
        let revision = Revision::Commit(tip.to_string());
        let (modules, mut warnings) = self.ctx.module_index(&revision)?;
        let (mut batch, parse_warnings) =
            build_batch(&self.ctx, &modules, tip, &revision, changes)?;
        warnings.extend(parse_warnings);
        // Versions tagged with rewritten-away commits must not stay current.
        batch.rescan = outcome == MasterOutcome::Rescanned;

        self.ctx.cancel.check()?;
        let files_parsed = batch.files.len();
        let files_deleted = batch.deleted.len();
        apply_with_retry(self.store, batch, &mut warnings)?;

        info!(
            commit = %tip,
            outcome = ?outcome,
            files_parsed,
            files_deleted,
            warnings = warnings.len(),
            "master pass complete"
        );
        Ok(MasterReport {
            outcome,
            commit: tip.to_string(),
            files_parsed,
            files_deleted,
            warnings,
        })
    }
}
