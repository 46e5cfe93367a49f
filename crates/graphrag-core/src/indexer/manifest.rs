//! Build-manifest parsing and file → module resolution.
//!
//! Manifests (`Project.swift`, `Package.swift`) are Swift source, but only a
//! handful of call shapes matter, so they are read with a small
//! string-aware call scanner instead of a full parser.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{GraphError, GraphResult};
use crate::models::{IndexWarning, ModuleInfo, TargetType, WarningKind};
use crate::repo::{RepositoryAccessor, Revision};

// ---------------------------------------------------------------------------
// Build system selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    #[default]
    None,
    Tuist,
    Geko,
    #[serde(rename = "swiftpm", alias = "spm")]
    SwiftPackage,
}

impl BuildSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildSystem::None => "none",
            BuildSystem::Tuist => "tuist",
            BuildSystem::Geko => "geko",
            BuildSystem::SwiftPackage => "swiftpm",
        }
    }

    /// File name of the manifests this adapter reads.
    pub fn manifest_name(&self) -> Option<&'static str> {
        match self {
            BuildSystem::None => None,
            BuildSystem::Tuist | BuildSystem::Geko => Some("Project.swift"),
            BuildSystem::SwiftPackage => Some("Package.swift"),
        }
    }

    /// Parse one manifest located in `manifest_dir` (repository-relative,
    /// empty for the root).
    pub fn parse_manifest(
        &self,
        manifest_path: &str,
        manifest_dir: &str,
        text: &str,
    ) -> GraphResult<Vec<ManifestModule>> {
        let text = strip_comments(text);
        let modules = match self {
            BuildSystem::None => Vec::new(),
            BuildSystem::Tuist => parse_tuist(manifest_path, &text)?,
            BuildSystem::Geko => parse_geko(manifest_path, &text)?,
            BuildSystem::SwiftPackage => parse_swiftpm(manifest_path, &text)?,
        };
        Ok(modules
            .into_iter()
            .map(|m| m.anchored_at(manifest_dir))
            .collect())
    }
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildSystem {
    type Err = GraphError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "none" => Ok(BuildSystem::None),
            "tuist" => Ok(BuildSystem::Tuist),
            "geko" => Ok(BuildSystem::Geko),
            "swiftpm" | "spm" => Ok(BuildSystem::SwiftPackage),
            other => Err(GraphError::Config(format!("unknown build system: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest model
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TestTarget {
    pub name: String,
    pub source_globs: Vec<String>,
    pub dependencies: Vec<String>,
}

/// One build target declared in a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManifestModule {
    pub name: String,
    pub source_globs: Vec<String>,
    pub target_type: TargetType,
    pub product: Option<String>,
    /// `kind:name`, e.g. `target:Core`, `external:Alamofire`.
    pub dependencies: Vec<String>,
    pub test_targets: Vec<TestTarget>,
}

impl ManifestModule {
    /// Rewrite globs from manifest-relative to repository-relative.
    fn anchored_at(mut self, manifest_dir: &str) -> Self {
        self.source_globs = self
            .source_globs
            .iter()
            .map(|g| join_relative(manifest_dir, g))
            .collect();
        for test in &mut self.test_targets {
            test.source_globs = test
                .source_globs
                .iter()
                .map(|g| join_relative(manifest_dir, g))
                .collect();
        }
        self
    }
}

/// Lexically join and normalise `dir/rel` (`.` and `..` collapsed).
pub fn join_relative(dir: &str, rel: &str) -> String {
    let rel = rel.trim().replace('\\', "/");
    let mut parts: Vec<&str> = if rel.starts_with('/') {
        Vec::new()
    } else {
        dir.split('/').filter(|p| !p.is_empty()).collect()
    };
    for part in rel.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Module for files no manifest claims: the parent directory, or `root`.
pub fn fallback_module(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => "root".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Call scanner
// ---------------------------------------------------------------------------

/// Non-ASCII bytes count as identifier bytes so scanning never stops inside
/// a multi-byte character.
fn is_ident_byte(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphanumeric() || !b.is_ascii()
}

/// Index one past the closing quote of the string starting at `start`.
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let multiline = bytes[start..].starts_with(b"\"\"\"");
    let mut i = start + if multiline { 3 } else { 1 };
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if multiline {
            if bytes[i..].starts_with(b"\"\"\"") {
                return i + 3;
            }
        } else if bytes[i] == b'"' {
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Blank `//` and `/* */` comments, leaving string literals intact.
fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut copied = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = skip_string(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                out.push_str(&text[copied..i]);
                let end = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|p| i + p)
                    .unwrap_or(bytes.len());
                i = end;
                copied = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                out.push_str(&text[copied..i]);
                let end = text[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(bytes.len());
                out.push(' ');
                i = end;
                copied = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// Offset of the delimiter closing the one at `open`.
fn matching_close(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[derive(Debug)]
struct Call<'a> {
    name: &'a str,
    args: &'a str,
}

/// Non-overlapping calls to any of `names`, left to right.  Calls nested in
/// a matched call's arguments are not reported.
fn find_calls<'a>(path: &str, text: &'a str, names: &[&'a str]) -> GraphResult<Vec<Call<'a>>> {
    let bytes = text.as_bytes();
    let mut calls = Vec::new();
    let mut i = 0;
    'scan: while i < bytes.len() {
        if bytes[i] == b'"' {
            i = skip_string(bytes, i);
            continue;
        }
        let boundary = i == 0 || !is_ident_byte(bytes[i - 1]);
        if boundary {
            for &name in names {
                if !bytes[i..].starts_with(name.as_bytes()) {
                    continue;
                }
                let after = i + name.len();
                if bytes.get(after).copied().is_some_and(is_ident_byte) {
                    continue;
                }
                let open = after
                    + bytes[after..]
                        .iter()
                        .take_while(|b| b.is_ascii_whitespace())
                        .count();
                if bytes.get(open) != Some(&b'(') {
                    continue;
                }
                let close = matching_close(bytes, open).ok_or_else(|| GraphError::Manifest {
                    path: path.to_string(),
                    message: format!("unbalanced parentheses in {name} call"),
                })?;
                calls.push(Call {
                    name,
                    args: &text[open + 1..close],
                });
                i = close + 1;
                continue 'scan;
            }
        }
        i += 1;
    }
    Ok(calls)
}

/// Split on commas outside brackets and strings.
fn split_top_level(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut last = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(&text[last..i]);
                last = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&text[last..]);
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Labelled arguments of a call; unlabelled ones are skipped.
fn labelled_args(args: &str) -> IndexMap<&str, &str> {
    let mut labelled = IndexMap::new();
    for arg in split_top_level(args) {
        let label_len = arg.bytes().take_while(|&b| is_ident_byte(b)).count();
        if label_len == 0 {
            continue;
        }
        let rest = arg[label_len..].trim_start();
        if let Some(value) = rest.strip_prefix(':') {
            if !value.starts_with(':') {
                labelled.insert(&arg[..label_len], value.trim());
            }
        }
    }
    labelled
}

fn string_literal(value: &str) -> Option<String> {
    let value = value.trim();
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.replace("\\\"", "\"").replace("\\\\", "\\"))
}

/// First string literal anywhere in `value`.
fn first_string(value: &str) -> Option<String> {
    let start = value.find('"')?;
    let end = skip_string(value.as_bytes(), start);
    string_literal(&value[start..end])
}

/// `["a", "b"]`, `"a"` or `.glob("a", excluding: ...)` entries.
fn string_list(value: &str) -> Vec<String> {
    let value = value.trim();
    match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        Some(inner) => split_top_level(inner)
            .into_iter()
            .filter_map(|item| string_literal(item).or_else(|| first_string(item)))
            .collect(),
        None => first_string(value).into_iter().collect(),
    }
}

fn enum_value(value: &str) -> Option<String> {
    let value = value.trim().trim_start_matches('.');
    let len = value.bytes().take_while(|&b| is_ident_byte(b)).count();
    (len > 0).then(|| value[..len].to_string())
}

/// `[.target(name: "Core"), .external(name: "X"), "Plain"]` → `kind:name`.
fn dependency_list(value: &str) -> Vec<String> {
    let value = value.trim();
    let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) else {
        return Vec::new();
    };
    let mut dependencies = Vec::new();
    for item in split_top_level(inner) {
        if let Some(name) = string_literal(item) {
            dependencies.push(format!("target:{name}"));
            continue;
        }
        let Some(open) = item.find('(') else {
            continue;
        };
        let qualifier = item[..open].trim().trim_start_matches('.');
        let args = labelled_args(item[open + 1..].trim_end().trim_end_matches(')'));
        let name = ["name", "target", "product"]
            .iter()
            .find_map(|label| args.get(label).and_then(|v| string_literal(v)));
        if let Some(name) = name {
            dependencies.push(format!("{qualifier}:{name}"));
        }
    }
    dependencies
}

fn required_name(path: &str, call: &Call<'_>, args: &IndexMap<&str, &str>) -> GraphResult<String> {
    args.get("name")
        .and_then(|v| string_literal(v))
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| GraphError::Manifest {
            path: path.to_string(),
            message: format!("{} call without a string name", call.name),
        })
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

fn parse_tuist(path: &str, text: &str) -> GraphResult<Vec<ManifestModule>> {
    let mut modules = Vec::new();
    for call in find_calls(path, text, &["Target"])? {
        let args = labelled_args(call.args);
        let name = required_name(path, &call, &args)?;
        let product = args.get("product").and_then(|v| enum_value(v));
        let target_type = TargetType::from_product(product.as_deref().unwrap_or("app"));
        let mut source_globs = args.get("sources").map(|v| string_list(v)).unwrap_or_default();
        if source_globs.is_empty() {
            source_globs.push(format!("Targets/{name}/Sources/**"));
        }
        modules.push(ManifestModule {
            name,
            source_globs,
            target_type,
            product,
            dependencies: args
                .get("dependencies")
                .map(|v| dependency_list(v))
                .unwrap_or_default(),
            test_targets: Vec::new(),
        });
    }
    Ok(modules)
}

fn geko_target_type(name: &str, product: Option<&str>) -> TargetType {
    if product.is_some_and(|p| p.to_lowercase().contains("test")) {
        return TargetType::Test;
    }
    if name.to_lowercase().ends_with("tests") {
        return TargetType::Test;
    }
    TargetType::App
}

fn parse_geko(path: &str, text: &str) -> GraphResult<Vec<ManifestModule>> {
    let module_calls = find_calls(path, text, &[".Module"])?;
    if module_calls.is_empty() {
        return Err(GraphError::Manifest {
            path: path.to_string(),
            message: "no .Module declaration".to_string(),
        });
    }

    let mut modules = Vec::new();
    for module_call in module_calls {
        let module_args = labelled_args(module_call.args);
        let Some(targets) = module_args.get("targets") else {
            continue;
        };
        for call in find_calls(path, targets, &[".Target"])? {
            let args = labelled_args(call.args);
            let name = required_name(path, &call, &args)?;
            let product = args.get("product").and_then(|v| enum_value(v));
            let mut test_targets = Vec::new();
            if let Some(tests) = args.get("tests") {
                for test_call in find_calls(path, tests, &[".Tests"])? {
                    let test_args = labelled_args(test_call.args);
                    let kind = test_args
                        .get("testsType")
                        .and_then(|v| enum_value(v))
                        .unwrap_or_else(|| "unknown".to_string());
                    test_targets.push(TestTarget {
                        name: format!("{name}:{kind}"),
                        source_globs: test_args
                            .get("sources")
                            .map(|v| string_list(v))
                            .unwrap_or_default(),
                        dependencies: test_args
                            .get("dependencies")
                            .map(|v| dependency_list(v))
                            .unwrap_or_default(),
                    });
                }
            }
            modules.push(ManifestModule {
                target_type: geko_target_type(&name, product.as_deref()),
                source_globs: args.get("sources").map(|v| string_list(v)).unwrap_or_default(),
                dependencies: args
                    .get("dependencies")
                    .map(|v| dependency_list(v))
                    .unwrap_or_default(),
                name,
                product,
                test_targets,
            });
        }
    }
    Ok(modules)
}

fn parse_swiftpm(path: &str, text: &str) -> GraphResult<Vec<ManifestModule>> {
    let mut modules = Vec::new();
    let calls = find_calls(
        path,
        text,
        &[".target", ".executableTarget", ".testTarget", ".macro"],
    )?;
    for call in calls {
        let args = labelled_args(call.args);
        let name = required_name(path, &call, &args)?;
        let is_test = call.name == ".testTarget";
        let default_dir = if is_test { "Tests" } else { "Sources" };
        let dir = args
            .get("path")
            .and_then(|v| string_literal(v))
            .unwrap_or_else(|| format!("{default_dir}/{name}"));
        let dir = dir.trim_end_matches('/');
        let mut source_globs: Vec<String> = args
            .get("sources")
            .map(|v| string_list(v))
            .unwrap_or_default()
            .into_iter()
            .map(|s| format!("{dir}/{s}"))
            .collect();
        if source_globs.is_empty() {
            source_globs.push(format!("{dir}/**"));
        }
        modules.push(ManifestModule {
            name,
            source_globs,
            target_type: if is_test {
                TargetType::Test
            } else {
                TargetType::App
            },
            product: Some(call.name.trim_start_matches('.').to_string()),
            dependencies: args
                .get("dependencies")
                .map(|v| dependency_list(v))
                .unwrap_or_default(),
            test_targets: Vec::new(),
        });
    }
    Ok(modules)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Expand `{a,b}` alternatives; the `glob` crate treats braces literally.
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close_rel) = pattern[open..].find('}') else {
        return vec![pattern.to_string()];
    };
    let close = open + close_rel;
    let (head, tail) = (&pattern[..open], &pattern[close + 1..]);
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{head}{alt}{tail}")))
        .collect()
}

#[derive(Debug)]
struct CompiledGlob {
    module: usize,
    is_test: bool,
    root: String,
    depth: usize,
    pattern: Option<glob::Pattern>,
}

impl CompiledGlob {
    fn new(module: usize, is_test: bool, raw: &str) -> Self {
        let cut = raw.find(['*', '?', '[', '{']).unwrap_or(raw.len());
        let wildcard = cut < raw.len();
        let literal = &raw[..cut];
        let base = if wildcard && !literal.ends_with('/') {
            literal.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
        } else {
            literal
        };
        let root = base.trim_end_matches('/').to_string();
        let depth = root.split('/').filter(|p| !p.is_empty()).count();
        let pattern = if wildcard {
            glob::Pattern::new(raw).ok()
        } else {
            None
        };
        Self {
            module,
            is_test,
            root,
            depth,
            pattern,
        }
    }

    fn claims(&self, path: &str) -> bool {
        let within = self.root.is_empty()
            || path == self.root
            || (path.starts_with(&self.root) && path[self.root.len()..].starts_with('/'));
        if !within {
            return false;
        }
        match &self.pattern {
            Some(pattern) => pattern.matches(path),
            None => true,
        }
    }
}

/// Deterministic file → module lookup built from every manifest at one
/// revision.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    modules: IndexMap<String, ManifestModule>,
    globs: Vec<CompiledGlob>,
}

impl ModuleIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Modules with the same name are merged in declaration order.
    pub fn from_modules(modules: Vec<ManifestModule>) -> Self {
        let mut merged: IndexMap<String, ManifestModule> = IndexMap::new();
        for module in modules {
            match merged.get_mut(&module.name) {
                Some(existing) => {
                    existing.source_globs.extend(module.source_globs);
                    existing.test_targets.extend(module.test_targets);
                    existing.dependencies.extend(module.dependencies);
                }
                None => {
                    merged.insert(module.name.clone(), module);
                }
            }
        }

        let mut globs = Vec::new();
        for (idx, module) in merged.values().enumerate() {
            for raw in &module.source_globs {
                for expanded in expand_braces(raw) {
                    globs.push(CompiledGlob::new(idx, false, &expanded));
                }
            }
            for test in &module.test_targets {
                for raw in &test.source_globs {
                    for expanded in expand_braces(raw) {
                        globs.push(CompiledGlob::new(idx, true, &expanded));
                    }
                }
            }
        }
        Self {
            modules: merged,
            globs,
        }
    }

    /// Read and parse every manifest of `build_system` present at `revision`.
    /// Malformed manifests become warnings and contribute no modules.
    pub fn load(
        build_system: BuildSystem,
        repo: &dyn RepositoryAccessor,
        revision: &Revision,
    ) -> GraphResult<(Self, Vec<IndexWarning>)> {
        let Some(manifest_name) = build_system.manifest_name() else {
            return Ok((Self::empty(), Vec::new()));
        };
        let manifests: Vec<String> = repo
            .list_files(revision)?
            .into_iter()
            .filter(|p| p.rsplit('/').next() == Some(manifest_name))
            .collect();

        let mut modules = Vec::new();
        let mut warnings = Vec::new();
        for (path, content) in repo.read_files(revision, &manifests)? {
            let Some(bytes) = content else {
                continue;
            };
            let dir = path
                .rsplit_once('/')
                .map(|(dir, _)| dir)
                .unwrap_or("")
                .to_string();
            let parsed = std::str::from_utf8(&bytes)
                .map_err(|e| GraphError::Manifest {
                    path: path.clone(),
                    message: format!("invalid UTF-8: {e}"),
                })
                .and_then(|text| build_system.parse_manifest(&path, &dir, text));
            match parsed {
                Ok(found) => {
                    debug!(manifest = %path, modules = found.len(), "parsed manifest");
                    modules.extend(found);
                }
                Err(e) => {
                    warn!(manifest = %path, error = %e, "skipping malformed manifest");
                    warnings.push(IndexWarning::new(WarningKind::Manifest, &path, e.to_string()));
                }
            }
        }
        Ok((Self::from_modules(modules), warnings))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Deepest literal root wins; on a tie a test target beats its module.
    pub fn resolve(&self, path: &str) -> ModuleInfo {
        let mut best: Option<&CompiledGlob> = None;
        for glob in self.globs.iter().filter(|g| g.claims(path)) {
            let better = match best {
                None => true,
                Some(current) => {
                    glob.depth > current.depth
                        || (glob.depth == current.depth && glob.is_test && !current.is_test)
                }
            };
            if better {
                best = Some(glob);
            }
        }

        let Some(glob) = best else {
            return ModuleInfo::unresolved(fallback_module(path));
        };
        let Some((_, module)) = self.modules.get_index(glob.module) else {
            return ModuleInfo::unresolved(fallback_module(path));
        };
        ModuleInfo {
            module: module.name.clone(),
            target_type: if glob.is_test {
                TargetType::Test
            } else {
                module.target_type
            },
            product: module.product.clone(),
        }
    }
}
