//! graphrag-index: CLI entry point for the Swift entity indexer.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use graphrag_core::config::{load_settings, Settings};
use graphrag_core::indexer::manifest::BuildSystem;
use graphrag_core::indexer::pipeline::{index_repository, CancellationFlag, RunMode};
use graphrag_core::models::QueryFilter;
use graphrag_core::query::guards::{clamp_limit, truncate_query};
use graphrag_core::query::overlay::OverlayReader;
use graphrag_core::repo::git::GitRepository;
use graphrag_core::repo::RepositoryAccessor;
use graphrag_core::store::reader::StoreReader;

#[derive(Parser)]
#[command(
    name = "graphrag-index",
    about = "Incremental, git-aware Swift entity index"
)]
#[command(version, propagate_version = true)]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository path (defaults to the configured `repo_path`)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Master database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Feature database path
    #[arg(long, global = true)]
    feature_db: Option<PathBuf>,

    /// Skip the feature branch pass
    #[arg(long, global = true)]
    no_feature: bool,

    #[arg(long, global = true)]
    primary_branch: Option<String>,

    /// none, tuist, geko or swiftpm
    #[arg(long, global = true)]
    build_system: Option<BuildSystem>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full scan of the primary branch, then the feature pass
    Init,

    /// Incremental update of the primary branch, then the feature pass
    Update,

    /// Show index state, snapshots and row counts of both stores
    Status,

    /// Search current entities across master and feature stores
    Search {
        /// Name substring
        name: String,

        /// Entity kind (class, struct, enum, protocol, extension, actor)
        #[arg(long)]
        kind: Option<String>,

        /// Glob over the declaring path
        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        module: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Include members in the output
        #[arg(long)]
        members: bool,
    },

    /// Declaration of the entity with exactly this name
    Definition {
        name: String,

        /// Prefer a declaration in this file
        #[arg(long)]
        path: Option<String>,
    },

    /// Types and extensions whose inheritance clause names this type
    Implementations {
        /// Protocol or superclass name
        name: String,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Every recorded version of one entity in the master store
    History {
        /// Identity key, e.g. `struct:Cart@Sources/Cart.swift`
        identity_key: String,

        /// Read the feature store instead
        #[arg(long)]
        feature: bool,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("graphrag_core={level}")));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn absolute(path: PathBuf) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Config file, then environment, then flags.
fn resolve_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(repo) = &cli.repo {
        settings.repo_path = repo.clone();
    }
    if let Some(db) = &cli.db {
        settings.master_db_path = absolute(db.clone())?;
    }
    if let Some(db) = &cli.feature_db {
        settings.feature_db_path = Some(absolute(db.clone())?);
    }
    if cli.no_feature {
        settings.feature_enabled = false;
    }
    if let Some(branch) = &cli.primary_branch {
        settings.primary_branch = branch.clone();
    }
    if let Some(build_system) = cli.build_system {
        settings.build_system = build_system;
    }
    Ok(settings)
}

/// Database paths as `index_repository` would resolve them.
fn store_paths(settings: &Settings) -> anyhow::Result<(PathBuf, PathBuf)> {
    let mut settings = settings.clone();
    let repo = GitRepository::discover(&settings.repo_path)?;
    settings.anchor_to_repo(repo.root());
    let feature = settings.feature_db_path();
    Ok((settings.master_db_path, feature))
}

/// Master + feature overlay; the master store must exist.
fn open_overlay(settings: &Settings) -> anyhow::Result<OverlayReader> {
    let (master, feature) = store_paths(settings)?;
    let master = StoreReader::new(&master);
    if !master.exists() {
        anyhow::bail!(
            "no index at {}; run `graphrag-index init` first",
            master.path().display()
        );
    }
    let feature = settings
        .feature_enabled
        .then(|| StoreReader::new(&feature));
    Ok(OverlayReader::new(master, feature))
}

fn store_status(path: &Path) -> anyhow::Result<serde_json::Value> {
    let reader = StoreReader::new(path);
    if !reader.exists() {
        return Ok(json!({ "db_path": path.display().to_string(), "exists": false }));
    }
    Ok(json!({
        "db_path": path.display().to_string(),
        "exists": true,
        "state": reader.index_state()?,
        "snapshots": reader.commit_snapshots()?,
        "stats": reader.stats()?,
    }))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let settings = resolve_settings(&cli)?;

    let output = match &cli.command {
        Commands::Init | Commands::Update => {
            let mode = if matches!(cli.command, Commands::Init) {
                RunMode::Init
            } else {
                RunMode::Update
            };
            let report = index_repository(settings, mode, &CancellationFlag::new())
                .context("indexing failed")?;
            serde_json::to_value(&report)?
        }
        Commands::Status => {
            let (master, feature) = store_paths(&settings)?;
            json!({
                "master": store_status(&master)?,
                "feature": store_status(&feature)?,
            })
        }
        Commands::Search {
            name,
            kind,
            path,
            module,
            limit,
            members,
        } => {
            let overlay = open_overlay(&settings)?;
            let filter = QueryFilter {
                name: Some(truncate_query(name)),
                kind: kind.clone(),
                path_glob: path.clone(),
                module: module.clone(),
                limit: clamp_limit(*limit, &settings.query),
                include_members: *members,
                ..Default::default()
            };
            serde_json::to_value(overlay.query_current(&filter)?)?
        }
        Commands::Definition { name, path } => {
            let overlay = open_overlay(&settings)?;
            let name = truncate_query(name);
            match overlay.definition(&name, path.as_deref())? {
                Some(hit) => serde_json::to_value(hit)?,
                None => json!({ "name": name, "found": false }),
            }
        }
        Commands::Implementations { name, limit } => {
            let overlay = open_overlay(&settings)?;
            let limit = clamp_limit(*limit, &settings.query);
            serde_json::to_value(overlay.implementations(&truncate_query(name), limit)?)?
        }
        Commands::History {
            identity_key,
            feature,
        } => {
            let (master, feature_path) = store_paths(&settings)?;
            let reader = StoreReader::new(if *feature { &feature_path } else { &master });
            if !reader.exists() {
                anyhow::bail!("no index at {}", reader.path().display());
            }
            serde_json::to_value(reader.entity_history(identity_key)?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_and_implementations_parse() {
        let cli = Cli::try_parse_from(["graphrag-index", "definition", "Cart", "--path", "Cart.swift"])
            .unwrap();
        match cli.command {
            Commands::Definition { name, path } => {
                assert_eq!(name, "Cart");
                assert_eq!(path.as_deref(), Some("Cart.swift"));
            }
            _ => panic!("expected definition"),
        }

        let cli = Cli::try_parse_from([
            "graphrag-index",
            "--no-feature",
            "implementations",
            "PricingService",
            "-l",
            "5",
        ])
        .unwrap();
        assert!(cli.no_feature);
        match cli.command {
            Commands::Implementations { name, limit } => {
                assert_eq!(name, "PricingService");
                assert_eq!(limit, Some(5));
            }
            _ => panic!("expected implementations"),
        }
    }
}
