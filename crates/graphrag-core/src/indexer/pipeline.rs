//! Indexing pipeline orchestration with Rayon-based parallelism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::errors::{GraphError, GraphResult};
use crate::indexer::feature::{FeatureIndexer, FeatureReport};
use crate::indexer::filesystem::{content_hash, is_indexable};
use crate::indexer::manifest::{BuildSystem, ModuleIndex};
use crate::indexer::master::{MasterIndexer, MasterReport};
use crate::indexer::parser::SourceParser;
use crate::indexer::swift::SwiftParser;
use crate::models::{CommitBatch, CommitReceipt, FileFacts, IndexWarning, WarningKind};
use crate::repo::git::GitRepository;
use crate::repo::{ChangedPath, RepositoryAccessor, Revision};
use crate::store::database::EntityStore;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation, checked between commit transactions.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> GraphResult<()> {
        if self.is_cancelled() {
            Err(GraphError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Shared pass context
// ---------------------------------------------------------------------------

/// Collaborators every indexing pass needs.
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub settings: &'a Settings,
    pub repo: &'a dyn RepositoryAccessor,
    pub parser: &'a dyn SourceParser,
    pub cancel: &'a CancellationFlag,
}

impl PassContext<'_> {
    pub fn is_indexable(&self, path: &str) -> bool {
        is_indexable(path, &self.settings.source_extensions)
    }

    /// Module index built from the manifests present at `revision`.
    pub fn module_index(&self, revision: &Revision) -> GraphResult<(ModuleIndex, Vec<IndexWarning>)> {
        let build_system = self.settings.build_system;
        let (index, warnings) = ModuleIndex::load(build_system, self.repo, revision)?;
        if index.is_empty() && build_system != BuildSystem::None {
            debug!(%build_system, "no modules declared, files fall back to their directory");
        } else {
            debug!(%build_system, modules = index.len(), "loaded module index");
        }
        Ok((index, warnings))
    }
}

// ---------------------------------------------------------------------------
// Parallel extraction
// ---------------------------------------------------------------------------

pub struct ExtractionResult {
    pub files: Vec<FileFacts>,
    pub warnings: Vec<IndexWarning>,
}

fn extract_file_worker(
    parser: &dyn SourceParser,
    modules: &ModuleIndex,
    path: &str,
    bytes: &[u8],
) -> Result<FileFacts, IndexWarning> {
    match parser.parse(path, bytes) {
        Ok(entities) => {
            debug!(path, entities = entities.len(), "parsed file");
            Ok(FileFacts {
                path: path.to_string(),
                content_hash: content_hash(bytes),
                module: modules.resolve(path),
                entities,
            })
        }
        Err(e) => {
            warn!(path, error = %e, "skipping file that failed to parse");
            Err(IndexWarning::new(WarningKind::Parse, path, e.to_string()))
        }
    }
}

/// Parse every file on a worker pool; results keep input order.  Files
/// that fail to parse become warnings and are left out.
pub fn parallel_extract(
    parser: &dyn SourceParser,
    modules: &ModuleIndex,
    sources: &[(String, Vec<u8>)],
    workers: usize,
) -> ExtractionResult {
    if sources.is_empty() {
        return ExtractionResult {
            files: Vec::new(),
            warnings: Vec::new(),
        };
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();

    let results: Vec<Result<FileFacts, IndexWarning>> = match pool {
        Ok(pool) => pool.install(|| {
            sources
                .par_iter()
                .map(|(path, bytes)| extract_file_worker(parser, modules, path, bytes))
                .collect()
        }),
        Err(e) => {
            debug!(error = %e, "parse pool unavailable, parsing sequentially");
            sources
                .iter()
                .map(|(path, bytes)| extract_file_worker(parser, modules, path, bytes))
                .collect()
        }
    };

    let mut files = Vec::with_capacity(results.len());
    let mut warnings = Vec::new();
    for result in results {
        match result {
            Ok(facts) => files.push(facts),
            Err(warning) => warnings.push(warning),
        }
    }
    ExtractionResult { files, warnings }
}

/// Read and parse the indexable subset of `changes` at `revision` into one
/// commit batch.  Paths missing at the revision count as deleted.
pub fn build_batch(
    ctx: &PassContext<'_>,
    modules: &ModuleIndex,
    commit_hash: &str,
    revision: &Revision,
    changes: &[ChangedPath],
) -> GraphResult<(CommitBatch, Vec<IndexWarning>)> {
    let mut batch = CommitBatch::new(commit_hash);
    let mut to_read = Vec::new();
    for change in changes {
        if !ctx.is_indexable(&change.path) {
            continue;
        }
        batch.touched.push(change.path.clone());
        if change.is_deleted() {
            batch.deleted.push(change.path.clone());
        } else {
            to_read.push(change.path.clone());
        }
    }

    let mut sources = Vec::with_capacity(to_read.len());
    for (path, content) in ctx.repo.read_files(revision, &to_read)? {
        match content {
            Some(bytes) => sources.push((path, bytes)),
            None => batch.deleted.push(path),
        }
    }

    let extracted = parallel_extract(ctx.parser, modules, &sources, ctx.settings.parse_workers);
    batch.files = extracted.files;
    Ok((batch, extracted.warnings))
}

/// Apply `batch`; a row-write failure drops the offending file and retries
/// the same commit without it.
pub fn apply_with_retry(
    store: &EntityStore,
    mut batch: CommitBatch,
    warnings: &mut Vec<IndexWarning>,
) -> GraphResult<CommitReceipt> {
    loop {
        match store.apply_commit(&batch) {
            Ok(receipt) => return Ok(receipt),
            Err(GraphError::RowWrite { path, source }) => {
                if !batch.without_file(&path) {
                    return Err(GraphError::RowWrite { path, source });
                }
                warn!(commit = %batch.commit_hash, path = %path, error = %source, "dropping file and retrying commit");
                warnings.push(IndexWarning::new(
                    WarningKind::RowWrite,
                    &path,
                    source.to_string(),
                ));
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Full run
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub master: MasterReport,
    pub feature: Option<FeatureReport>,
    /// Every recovered error from both passes.
    pub warnings: Vec<IndexWarning>,
    pub elapsed_ms: u64,
}

/// Which master operation a run performs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    Init,
    #[default]
    Update,
}

/// Master pass, then (when enabled) the feature pass.
pub fn run_index(
    mode: RunMode,
    settings: &Settings,
    repo: &dyn RepositoryAccessor,
    parser: &dyn SourceParser,
    master_store: &EntityStore,
    feature_store: Option<&EntityStore>,
    cancel: &CancellationFlag,
) -> GraphResult<RunReport> {
    let started = Instant::now();
    let ctx = PassContext {
        settings,
        repo,
        parser,
        cancel,
    };

    let indexer = MasterIndexer::new(ctx, master_store);
    let master = match mode {
        RunMode::Init => indexer.init()?,
        RunMode::Update => indexer.update()?,
    };
    let mut warnings = master.warnings.clone();

    let feature = match feature_store {
        Some(store) if settings.feature_enabled => {
            cancel.check()?;
            let report = FeatureIndexer::new(ctx, store).run()?;
            warnings.extend(report.warnings.iter().cloned());
            Some(report)
        }
        _ => None,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        master = ?master.outcome,
        feature_commits = feature.as_ref().map(|f| f.commits_replayed.len()).unwrap_or(0),
        warnings = warnings.len(),
        elapsed_ms,
        "indexing run finished"
    );
    Ok(RunReport {
        master,
        feature,
        warnings,
        elapsed_ms,
    })
}

/// Open the git repository at `settings.repo_path` and both stores, then
/// run the Swift pipeline.  Relative database paths are anchored at the
/// repository root.
pub fn index_repository(
    mut settings: Settings,
    mode: RunMode,
    cancel: &CancellationFlag,
) -> GraphResult<RunReport> {
    let repo = GitRepository::discover(&settings.repo_path)?;
    settings.anchor_to_repo(repo.root());
    let master = EntityStore::open(&settings.master_db_path)?;
    let feature = if settings.feature_enabled {
        Some(EntityStore::open(settings.feature_db_path())?)
    } else {
        None
    };
    run_index(
        mode,
        &settings,
        &repo,
        &SwiftParser,
        &master,
        feature.as_ref(),
        cancel,
    )
}
