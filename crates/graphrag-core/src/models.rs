//! Shared typed models used across indexing, storage, and query layers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved prefix of the synthetic working-tree commit identity.
pub const WORKTREE_HASH_PREFIX: &str = "worktree";

/// Signatures are cut to this many characters.
pub const MAX_SIGNATURE_CHARS: usize = 240;

/// Synthetic commit identity for the uncommitted state of `branch`.
pub fn worktree_hash(branch: &str) -> String {
    format!("{WORKTREE_HASH_PREFIX}:{branch}")
}

pub fn is_synthetic_hash(hash: &str) -> bool {
    hash.starts_with(&format!("{WORKTREE_HASH_PREFIX}:"))
}

/// Stable identity of an entity: qualified name + kind + declaring file.
pub fn identity_key(kind: EntityKind, qualified_name: &str, path: &str) -> String {
    format!("{}:{}@{}", kind.as_str(), qualified_name, path)
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Classification of the build target owning a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    App,
    Test,
    #[default]
    Unknown,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::App => "app",
            TargetType::Test => "test",
            TargetType::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "app" => Some(TargetType::App),
            "test" => Some(TargetType::Test),
            "unknown" => Some(TargetType::Unknown),
            _ => None,
        }
    }

    /// Classify a declared product (`.app`, `.framework`, `.unitTests`, ...).
    pub fn from_product(product: &str) -> Self {
        if product.to_lowercase().contains("test") {
            TargetType::Test
        } else {
            TargetType::App
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Class,
    Struct,
    Enum,
    Protocol,
    Extension,
    Actor,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Class => "class",
            EntityKind::Struct => "struct",
            EntityKind::Enum => "enum",
            EntityKind::Protocol => "protocol",
            EntityKind::Extension => "extension",
            EntityKind::Actor => "actor",
        }
    }

    /// Map a declaration keyword to its kind.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "class" => Some(EntityKind::Class),
            "struct" => Some(EntityKind::Struct),
            "enum" => Some(EntityKind::Enum),
            "protocol" => Some(EntityKind::Protocol),
            "extension" => Some(EntityKind::Extension),
            "actor" => Some(EntityKind::Actor),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Method,
    Initializer,
    Deinitializer,
    Subscript,
    Property,
    Case,
    Typealias,
    AssociatedType,
}

impl MemberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberKind::Method => "method",
            MemberKind::Initializer => "initializer",
            MemberKind::Deinitializer => "deinitializer",
            MemberKind::Subscript => "subscript",
            MemberKind::Property => "property",
            MemberKind::Case => "case",
            MemberKind::Typealias => "typealias",
            MemberKind::AssociatedType => "associatedtype",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "func" => Some(MemberKind::Method),
            "init" => Some(MemberKind::Initializer),
            "deinit" => Some(MemberKind::Deinitializer),
            "subscript" => Some(MemberKind::Subscript),
            "var" | "let" => Some(MemberKind::Property),
            "case" => Some(MemberKind::Case),
            "typealias" => Some(MemberKind::Typealias),
            "associatedtype" => Some(MemberKind::AssociatedType),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Parser output
// ---------------------------------------------------------------------------

/// A declaration nested directly under an entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberFacts {
    pub name: String,
    pub kind: MemberKind,
    pub signature: String,
    pub visibility: String,
    pub start_line: i64,
    pub is_static: bool,
}

/// Raw facts about one entity, as produced by a [`crate::indexer::parser::SourceParser`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityFacts {
    pub identity_key: String,
    pub name: String,
    pub qualified_name: String,
    pub kind: EntityKind,
    pub start_line: i64,
    pub end_line: i64,
    pub signature: String,
    pub docstring: Option<String>,
    pub visibility: String,
    pub inherits: Vec<String>,
    pub extended_type: Option<String>,
    pub members: Vec<MemberFacts>,
}

// ---------------------------------------------------------------------------
// Manifest provenance
// ---------------------------------------------------------------------------

/// Module and target provenance resolved for one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module: String,
    pub target_type: TargetType,
    pub product: Option<String>,
}

impl ModuleInfo {
    pub fn unresolved(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            target_type: TargetType::Unknown,
            product: None,
        }
    }
}

/// Serialized `entity_versions.properties` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityProperties {
    pub signature: String,
    pub docstring: Option<String>,
    pub module: String,
    pub target_type: TargetType,
    pub product: Option<String>,
    pub visibility: String,
    pub extended_type: Option<String>,
    pub inherits: Vec<String>,
    pub start_line: i64,
    pub end_line: i64,
    pub member_count: usize,
}

impl EntityProperties {
    pub fn from_facts(facts: &EntityFacts, module: &ModuleInfo) -> Self {
        Self {
            signature: facts.signature.clone(),
            docstring: facts.docstring.clone(),
            module: module.module.clone(),
            target_type: module.target_type,
            product: module.product.clone(),
            visibility: facts.visibility.clone(),
            extended_type: facts.extended_type.clone(),
            inherits: facts.inherits.clone(),
            start_line: facts.start_line,
            end_line: facts.end_line,
            member_count: facts.members.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Write batches
// ---------------------------------------------------------------------------

/// Everything the store needs to write for one parsed file.
#[derive(Clone, Debug)]
pub struct FileFacts {
    pub path: String,
    pub content_hash: String,
    pub module: ModuleInfo,
    pub entities: Vec<EntityFacts>,
}

/// One commit-tagged unit of work for [`crate::store::database::EntityStore::apply_commit`].
#[derive(Clone, Debug, Default)]
pub struct CommitBatch {
    pub commit_hash: String,
    pub is_synthetic: bool,
    /// Successfully parsed files, upserted under `commit_hash`.
    pub files: Vec<FileFacts>,
    /// Files removed in this commit; their entities are tombstoned.
    pub deleted: Vec<String>,
    /// Every file considered by the pass, including ones that failed to parse.
    pub touched: Vec<String>,
    /// Write a new version for every file, even when its content is unchanged.
    pub rescan: bool,
}

impl CommitBatch {
    pub fn new(commit_hash: impl Into<String>) -> Self {
        let commit_hash = commit_hash.into();
        Self {
            is_synthetic: is_synthetic_hash(&commit_hash),
            commit_hash,
            ..Default::default()
        }
    }

    /// Drop a file from the batch; returns true when something was removed.
    pub fn without_file(&mut self, path: &str) -> bool {
        let before = self.files.len() + self.deleted.len();
        self.files.retain(|f| f.path != path);
        self.deleted.retain(|p| p != path);
        self.touched.retain(|p| p != path);
        before != self.files.len() + self.deleted.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub commit_hash: String,
    pub sequence_position: i64,
    pub files_written: usize,
    pub files_unchanged: usize,
    pub versions_written: usize,
    pub tombstones_written: usize,
}

// ---------------------------------------------------------------------------
// Store read models
// ---------------------------------------------------------------------------

/// Singleton per store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexState {
    pub last_commit_hash: Option<String>,
    pub last_sequence_position: i64,
    pub last_indexed_at: Option<String>,
    pub tracked_branch: Option<String>,
    pub indexed_files: Vec<String>,
}

impl IndexState {
    pub fn is_empty(&self) -> bool {
        self.last_commit_hash.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitSnapshot {
    pub commit_hash: String,
    pub sequence_position: i64,
    pub is_synthetic: bool,
    pub indexed_at: String,
}

/// Member row as stored, read back alongside its owning entity version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemberRecord {
    pub name: String,
    pub kind: String,
    pub signature: Option<String>,
    pub visibility: Option<String>,
    pub start_line: Option<i64>,
    pub is_static: bool,
}

/// Latest non-tombstoned version of one entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CurrentEntity {
    pub identity_key: String,
    pub name: String,
    pub qualified_name: String,
    pub kind: String,
    pub declaring_path: String,
    pub commit_hash: String,
    pub sequence_position: i64,
    pub properties: EntityProperties,
    pub members: Vec<MemberRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityVersionRecord {
    pub commit_hash: String,
    pub sequence_position: i64,
    pub tombstoned: bool,
    pub properties: EntityProperties,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: i64,
    pub live_documents: i64,
    pub entities: i64,
    pub entity_versions: i64,
    pub tombstones: i64,
    pub members: i64,
    pub commit_snapshots: i64,
}

/// Filter accepted by `query_current`.
#[derive(Clone, Debug, Default)]
pub struct QueryFilter {
    /// Substring of the entity name (case-insensitive) unless `exact_name`.
    pub name: Option<String>,
    pub exact_name: bool,
    pub kind: Option<String>,
    /// SQLite GLOB over the declaring path.
    pub path_glob: Option<String>,
    pub module: Option<String>,
    pub target_type: Option<TargetType>,
    /// Exact entry of the entity's inheritance clause.
    pub inherits: Option<String>,
    pub limit: usize,
    pub include_members: bool,
}

// ---------------------------------------------------------------------------
// Run reporting
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Parse,
    Manifest,
    RowWrite,
}

/// A recovered error, surfaced to the caller instead of aborting the run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexWarning {
    pub kind: WarningKind,
    pub path: String,
    pub message: String,
}

impl IndexWarning {
    pub fn new(kind: WarningKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}
