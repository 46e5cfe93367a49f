//! Feature branch indexer: replays the commits unique to the checked-out
//! branch on top of its merge-base and overlays uncommitted work as a
//! synthetic `worktree:<branch>` snapshot.

use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{GraphError, GraphResult};
use crate::indexer::manifest::ModuleIndex;
use crate::indexer::pipeline::{apply_with_retry, build_batch, PassContext};
use crate::models::{worktree_hash, IndexWarning};
use crate::repo::{ChangedPath, Revision};
use crate::store::database::EntityStore;

#[derive(Clone, Debug, Default, Serialize)]
pub struct FeatureReport {
    pub branch: Option<String>,
    pub merge_base: Option<String>,
    /// The store was wiped before this run (branch switch or rebase).
    pub reset_performed: bool,
    pub commits_replayed: Vec<String>,
    /// Uncommitted files written under the synthetic snapshot.
    pub worktree_files: usize,
    pub worktree_deleted: usize,
    pub skipped_reason: Option<String>,
    pub warnings: Vec<IndexWarning>,
}

impl FeatureReport {
    fn skipped(branch: String, reason: &str) -> Self {
        Self {
            branch: Some(branch),
            skipped_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

pub struct FeatureIndexer<'a> {
    ctx: PassContext<'a>,
    store: &'a EntityStore,
}

impl<'a> FeatureIndexer<'a> {
    pub fn new(ctx: PassContext<'a>, store: &'a EntityStore) -> Self {
        Self { ctx, store }
    }

    pub fn run(&self) -> GraphResult<FeatureReport> {
        let primary = self.ctx.settings.primary_branch.as_str();
        let branch = self
            .ctx
            .repo
            .current_branch()?
            .ok_or_else(|| GraphError::repository("HEAD is detached; no feature branch to index"))?;
        if branch == primary {
            debug!(branch = %branch, "on primary branch, skipping feature pass");
            return Ok(FeatureReport::skipped(branch, "on primary branch"));
        }

        let mut report = FeatureReport {
            branch: Some(branch.clone()),
            ..Default::default()
        };

        let state = self.store.index_state()?;
        if state.tracked_branch.as_deref() != Some(branch.as_str()) {
            info!(
                previous = state.tracked_branch.as_deref().unwrap_or("-"),
                branch = %branch,
                "feature store tracks a different branch, resetting"
            );
            self.retrack(&branch)?;
            report.reset_performed = true;
        }

        let primary_tip = self.ctx.repo.branch_tip(primary)?;
        let head = self.ctx.repo.head_commit()?;
        let base = self.ctx.repo.merge_base(&primary_tip, &head)?;
        let sequence = self.ctx.repo.commits_between(&base, &head)?;
        report.merge_base = Some(base.clone());

        // Recorded real snapshots must be a prefix of the branch's commit
        // sequence; anything else means the branch was rebased or rewritten.
        let recorded: Vec<String> = self
            .store
            .commit_snapshots()?
            .into_iter()
            .filter(|s| !s.is_synthetic)
            .map(|s| s.commit_hash)
            .collect();
        let is_prefix = recorded.len() <= sequence.len()
            && recorded.iter().zip(&sequence).all(|(a, b)| a == b);
        let done = if is_prefix {
            recorded.len()
        } else {
            info!(branch = %branch, base = %base, "branch history rewritten, resetting feature store");
            self.retrack(&branch)?;
            report.reset_performed = true;
            0
        };

        // Module provenance follows the manifests as they are checked out.
        let (modules, manifest_warnings) = self.ctx.module_index(&Revision::WorkTree)?;
        report.warnings.extend(manifest_warnings);

        let synthetic = worktree_hash(&branch);
        let pending = &sequence[done..];
        if !pending.is_empty() {
            self.store.discard_commit(&synthetic)?;
        }

        let mut previous = if done == 0 {
            base.clone()
        } else {
            sequence[done - 1].clone()
        };
        for commit in pending {
            self.ctx.cancel.check()?;
            let changes = self.ctx.repo.changed_paths(Some(&previous), commit)?;
            let revision = Revision::Commit(commit.clone());
            self.apply(&modules, commit, &revision, &changes, &mut report)?;
            report.commits_replayed.push(commit.clone());
            previous = commit.clone();
        }

        self.ctx.cancel.check()?;
        self.index_worktree(&modules, &synthetic, &mut report)?;

        info!(
            branch = %branch,
            base = %base,
            replayed = report.commits_replayed.len(),
            worktree_files = report.worktree_files,
            reset = report.reset_performed,
            warnings = report.warnings.len(),
            "feature pass complete"
        );
        Ok(report)
    }

    fn retrack(&self, branch: &str) -> GraphResult<()> {
        self.store.reset()?;
        self.store.track_branch(branch)
    }

    /// Replace the synthetic snapshot with the current dirty set, or drop
    /// it when the work tree is clean.
    fn index_worktree(
        &self,
        modules: &ModuleIndex,
        synthetic: &str,
        report: &mut FeatureReport,
    ) -> GraphResult<()> {
        let dirty: Vec<ChangedPath> = self
            .ctx
            .repo
            .dirty_files()?
            .into_iter()
            .filter(|c| self.ctx.is_indexable(&c.path))
            .collect();
        if dirty.is_empty() {
            if self.store.discard_commit(synthetic)? {
                debug!(snapshot = %synthetic, "work tree clean, dropped synthetic snapshot");
            }
            return Ok(());
        }

        let (files, deleted) =
            self.apply(modules, synthetic, &Revision::WorkTree, &dirty, report)?;
        report.worktree_files = files;
        report.worktree_deleted = deleted;
        Ok(())
    }

    fn apply(
        &self,
        modules: &ModuleIndex,
        commit_hash: &str,
        revision: &Revision,
        changes: &[ChangedPath],
        report: &mut FeatureReport,
    ) -> GraphResult<(usize, usize)> {
        let (batch, parse_warnings) =
            build_batch(&self.ctx, modules, commit_hash, revision, changes)?;
        report.warnings.extend(parse_warnings);

        let counts = (batch.files.len(), batch.deleted.len());
        apply_with_retry(self.store, batch, &mut report.warnings)?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::indexer::pipeline::CancellationFlag;
    use crate::indexer::swift::SwiftParser;
    use crate::models::QueryFilter;
    use crate::repo::fake::FakeRepository;
    use crate::repo::RepositoryAccessor;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: EntityStore,
        settings: Settings,
        cancel: CancellationFlag,
        repo: FakeRepository,
    }

    impl Fixture {
        /// `master` with one commit holding `A.swift`.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = EntityStore::open(dir.path().join("master.feature.db")).unwrap();
            let repo = FakeRepository::new("master");
            repo.commit_files(&[("A.swift", "struct A {}")]);
            Self {
                _dir: dir,
                store,
                settings: Settings {
                    parse_workers: 2,
                    ..Settings::default()
                },
                cancel: CancellationFlag::new(),
                repo,
            }
        }

        fn run(&self) -> GraphResult<FeatureReport> {
            FeatureIndexer::new(
                PassContext {
                    settings: &self.settings,
                    repo: &self.repo,
                    parser: &SwiftParser,
                    cancel: &self.cancel,
                },
                &self.store,
            )
            .run()
        }

        fn names(&self) -> Vec<String> {
            self.store
                .query_current(&QueryFilter::default())
                .unwrap()
                .into_iter()
                .map(|e| e.name)
                .collect()
        }
    }

    #[test]
    fn test_skips_primary_branch() {
        let fx = Fixture::new();
        let report = fx.run().unwrap();
        assert_eq!(report.skipped_reason.as_deref(), Some("on primary branch"));
        assert!(fx.store.index_state().unwrap().tracked_branch.is_none());
    }

    #[test]
    fn test_detached_head_is_error() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/x");
        fx.repo.detach();
        let err = fx.run().unwrap_err();
        assert!(matches!(err, GraphError::Repository(_)));
    }

    #[test]
    fn test_replays_only_commits_after_merge_base() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/cart");
        let f1 = fx.repo.commit_files(&[("Cart.swift", "struct Cart {}")]);
        fx.repo.checkout("master");
        fx.repo.commit_files(&[("Later.swift", "struct Later {}")]);
        fx.repo.checkout("feature/cart");

        let report = fx.run().unwrap();
        assert!(report.reset_performed);
        assert_eq!(report.commits_replayed, vec![f1.clone()]);
        assert_eq!(fx.names(), vec!["Cart"]);

        let state = fx.store.index_state().unwrap();
        assert_eq!(state.tracked_branch.as_deref(), Some("feature/cart"));
        assert_eq!(state.last_commit_hash, Some(f1));

        let again = fx.run().unwrap();
        assert!(!again.reset_performed);
        assert!(again.commits_replayed.is_empty());
        assert_eq!(fx.store.commit_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn test_resumes_after_new_commit() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/cart");
        fx.repo.commit_files(&[("Cart.swift", "struct Cart {}")]);
        fx.run().unwrap();

        let f2 = fx.repo.commit_files(&[("Cart.swift", "struct Cart {}\nstruct Line {}")]);
        let report = fx.run().unwrap();
        assert_eq!(report.commits_replayed, vec![f2]);
        assert_eq!(fx.names(), vec!["Cart", "Line"]);
    }

    #[test]
    fn test_branch_switch_isolates_stores() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/one");
        fx.repo.commit_files(&[("One.swift", "struct One {}")]);
        fx.run().unwrap();
        assert_eq!(fx.names(), vec!["One"]);

        fx.repo.checkout("master");
        fx.repo.create_branch("feature/two");
        fx.repo.commit_files(&[("Two.swift", "struct Two {}")]);
        let report = fx.run().unwrap();
        assert!(report.reset_performed);
        assert_eq!(fx.names(), vec!["Two"]);
        assert_eq!(
            fx.store.index_state().unwrap().tracked_branch.as_deref(),
            Some("feature/two")
        );
    }

    #[test]
    fn test_synthetic_snapshot_is_replaced() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/wip");
        fx.repo.commit_files(&[("Committed.swift", "struct Committed {}")]);

        fx.repo.write("X.swift", "struct X {}");
        let report = fx.run().unwrap();
        assert_eq!(report.worktree_files, 1);
        assert_eq!(fx.names(), vec!["Committed", "X"]);

        fx.repo.remove("X.swift");
        fx.repo.write("Y.swift", "struct Y {}");
        fx.run().unwrap();
        assert_eq!(fx.names(), vec!["Committed", "Y"]);
        let synthetic: Vec<_> = fx
            .store
            .commit_snapshots()
            .unwrap()
            .into_iter()
            .filter(|s| s.is_synthetic)
            .collect();
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].commit_hash, "worktree:feature/wip");

        fx.repo.remove("Y.swift");
        fx.run().unwrap();
        assert_eq!(fx.names(), vec!["Committed"]);
        assert!(fx.store.commit_snapshots().unwrap().iter().all(|s| !s.is_synthetic));
    }

    #[test]
    fn test_uncommitted_deletion_tombstones() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/rm");
        fx.repo.commit_files(&[("Gone.swift", "struct Gone {}")]);
        fx.run().unwrap();

        fx.repo.remove("Gone.swift");
        let report = fx.run().unwrap();
        assert_eq!(report.worktree_deleted, 1);
        assert!(fx.names().is_empty());
    }

    #[test]
    fn test_synthetic_dropped_before_replaying_new_commits() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/wip");
        fx.repo.write("Draft.swift", "struct Draft {}");
        fx.run().unwrap();
        assert_eq!(fx.names(), vec!["Draft"]);

        let commit = fx.repo.commit();
        let report = fx.run().unwrap();
        assert_eq!(report.commits_replayed, vec![commit.clone()]);
        let snapshots = fx.store.commit_snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].commit_hash, commit);
        assert_eq!(fx.names(), vec!["Draft"]);
    }

    #[test]
    fn test_rebase_resets_store() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/rebase");
        fx.repo.commit_files(&[("Old.swift", "struct Old {}")]);
        fx.run().unwrap();

        let master_tip = fx.repo.branch_tip("master").unwrap();
        fx.repo.reset_branch("feature/rebase", &master_tip);
        fx.repo.remove("Old.swift");
        let new = fx.repo.commit_files(&[("New.swift", "struct New {}")]);
        let report = fx.run().unwrap();
        assert!(report.reset_performed);
        assert_eq!(report.commits_replayed, vec![new]);
        assert_eq!(fx.names(), vec!["New"]);
    }

    #[test]
    fn test_cancellation_between_commits() {
        let fx = Fixture::new();
        fx.repo.create_branch("feature/cancel");
        fx.repo.commit_files(&[("One.swift", "struct One {}")]);
        fx.cancel.cancel();
        let err = fx.run().unwrap_err();
        assert!(matches!(err, GraphError::Cancelled));
        assert!(fx.store.commit_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_feature_files_resolve_against_worktree_manifest() {
        let mut fx = Fixture::new();
        fx.settings.build_system = crate::indexer::manifest::BuildSystem::SwiftPackage;
        fx.repo.create_branch("feature/tests");
        fx.repo.commit_files(&[(
            "Tests/KitTests/CartTests.swift",
            "final class CartTests {}",
        )]);
        fx.repo.write(
            "Package.swift",
            r#"let package = Package(name: "Kit", targets: [.target(name: "Kit"), .testTarget(name: "KitTests")])"#,
        );

        let report = fx.run().unwrap();
        assert!(report.warnings.is_empty());
        let hits = fx.store.query_current(&QueryFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].properties.module, "KitTests");
        assert_eq!(
            hits[0].properties.target_type,
            crate::models::TargetType::Test
        );
    }

    #[test]
    fn test_geko_nested_tests_belong_to_owning_module() {
        let mut fx = Fixture::new();
        fx.settings.build_system = crate::indexer::manifest::BuildSystem::Geko;
        fx.repo.create_branch("feature/payments");
        fx.repo.commit_files(&[
            (
                "Modules/Payments/Project.swift",
                r#"let module = Module(
    .Module(
        name: "Payments",
        targets: [
            .Target(
                name: "Payments",
                product: .framework,
                sources: ["Sources/**"],
                tests: [.Tests(testsType: .unit, sources: ["Tests/**"])]
            ),
        ]
    )
)"#,
            ),
            ("Modules/Payments/Sources/Wallet.swift", "struct Wallet {}"),
            (
                "Modules/Payments/Tests/WalletTests.swift",
                "final class WalletTests {}",
            ),
        ]);

        let report = fx.run().unwrap();
        assert!(report.warnings.is_empty());
        let hits = fx.store.query_current(&QueryFilter::default()).unwrap();
        let names: Vec<&str> = hits.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["Wallet", "WalletTests"]);
        assert_eq!(hits[0].properties.module, "Payments");
        assert_eq!(
            hits[0].properties.target_type,
            crate::models::TargetType::App
        );
        assert_eq!(hits[1].properties.module, "Payments");
        assert_eq!(
            hits[1].properties.target_type,
            crate::models::TargetType::Test
        );
        assert_eq!(hits[1].properties.product.as_deref(), Some("framework"));
    }
}
