//! Settings for indexing runs, loaded from TOML with environment overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{GraphError, GraphResult};
use crate::indexer::manifest::BuildSystem;

pub const ENV_FEATURE_DB_PATH: &str = "GRAPHRAG_FEATURE_DB_PATH";
pub const ENV_PRIMARY_BRANCH: &str = "GRAPHRAG_PRIMARY_BRANCH";
pub const ENV_BUILD_SYSTEM: &str = "GRAPHRAG_BUILD_SYSTEM";

const DEFAULT_MASTER_DB: &str = ".graphrag/master.db";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_limit: 25,
            max_limit: 200,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub repo_path: PathBuf,
    pub master_db_path: PathBuf,
    /// `None` means "next to the master database".
    pub feature_db_path: Option<PathBuf>,
    pub feature_enabled: bool,
    pub primary_branch: String,
    pub build_system: BuildSystem,
    pub parse_workers: usize,
    pub source_extensions: Vec<String>,
    pub query: QuerySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            master_db_path: PathBuf::from(DEFAULT_MASTER_DB),
            feature_db_path: None,
            feature_enabled: true,
            primary_branch: "master".to_string(),
            build_system: BuildSystem::None,
            parse_workers: default_workers(),
            source_extensions: vec!["swift".to_string()],
            query: QuerySettings::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Settings {
    /// Resolved feature database path.
    pub fn feature_db_path(&self) -> PathBuf {
        match &self.feature_db_path {
            Some(path) => path.clone(),
            None => sibling_feature_db(&self.master_db_path),
        }
    }

    /// Paths relative to the config file's directory are anchored there;
    /// a leading `~` is expanded.
    fn anchor_paths(&mut self, base: &Path) {
        self.repo_path = anchor(base, &self.repo_path);
        self.master_db_path = anchor(base, &self.master_db_path);
        if let Some(path) = self.feature_db_path.take() {
            self.feature_db_path = Some(anchor(base, &path));
        }
    }

    /// Relative database paths that are still relative once loading is done
    /// live under the repository root.
    pub fn anchor_to_repo(&mut self, root: &Path) {
        if self.master_db_path.is_relative() {
            self.master_db_path = root.join(&self.master_db_path);
        }
        if let Some(path) = self.feature_db_path.take() {
            self.feature_db_path = Some(if path.is_relative() {
                root.join(path)
            } else {
                path
            });
        }
    }

    fn apply_env(&mut self) -> GraphResult<()> {
        if let Some(value) = env_value(ENV_FEATURE_DB_PATH) {
            self.feature_db_path = Some(expand_tilde(&value));
        }
        if let Some(value) = env_value(ENV_PRIMARY_BRANCH) {
            self.primary_branch = value;
        }
        if let Some(value) = env_value(ENV_BUILD_SYSTEM) {
            self.build_system = value.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> GraphResult<()> {
        if self.primary_branch.trim().is_empty() {
            return Err(GraphError::Config("primary_branch must not be empty".into()));
        }
        if self.source_extensions.is_empty() {
            return Err(GraphError::Config(
                "source_extensions must name at least one extension".into(),
            ));
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            return Err(GraphError::Config(format!(
                "query.default_limit must be within 1..={}",
                self.query.max_limit
            )));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `index.db` -> `index.feature.db`, in the same directory.
pub fn sibling_feature_db(master: &Path) -> PathBuf {
    let stem = master
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "master".to_string());
    master.with_file_name(format!("{stem}.feature.db"))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_tilde(&path.to_string_lossy());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Parse settings from TOML text without touching the environment.
pub fn parse_settings(text: &str) -> GraphResult<Settings> {
    let settings: Settings =
        toml::from_str(text).map_err(|e| GraphError::Config(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from `config_path` when given (a missing file is an error),
/// else defaults; environment overrides are applied last.
pub fn load_settings(config_path: Option<&Path>) -> GraphResult<Settings> {
    let mut settings = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                GraphError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            let mut parsed = parse_settings(&text)?;
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            parsed.anchor_paths(base);
            parsed
        }
        None => Settings::default(),
    };
    settings.apply_env()?;
    settings.validate()?;
    Ok(settings)
}
