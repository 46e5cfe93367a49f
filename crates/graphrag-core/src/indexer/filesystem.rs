//! Path filtering and content hashing shared by the indexing passes.

use sha2::{Digest, Sha256};

/// Build-output and dependency checkouts that never hold first-party source.
const IMPLICIT_IGNORED_DIRS: &[&str] = &[
    ".git",
    ".graphrag",
    ".build",
    ".swiftpm",
    "DerivedData",
    "Pods",
    "Carthage",
    "Tuist/.build",
];

fn extension_of(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext)
}

fn in_ignored_dir(path: &str) -> bool {
    IMPLICIT_IGNORED_DIRS.iter().any(|dir| {
        path.starts_with(&format!("{dir}/")) || path.contains(&format!("/{dir}/"))
    })
}

/// True when `path` carries one of `extensions` (compared case-insensitively,
/// without the leading dot) and is outside the implicitly ignored dirs.
pub fn is_indexable(path: &str, extensions: &[String]) -> bool {
    let Some(ext) = extension_of(path) else {
        return false;
    };
    if in_ignored_dir(path) {
        return false;
    }
    extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Keep only indexable paths, preserving order.
pub fn filter_indexable(paths: Vec<String>, extensions: &[String]) -> Vec<String> {
    paths
        .into_iter()
        .filter(|p| is_indexable(p, extensions))
        .collect()
}

/// Hex SHA-256 of a file's bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swift() -> Vec<String> {
        vec!["swift".to_string()]
    }

    #[test]
    fn test_is_indexable() {
        assert!(is_indexable("Sources/App/Main.swift", &swift()));
        assert!(is_indexable("Main.SWIFT", &swift()));
        assert!(!is_indexable("Sources/App/Main.m", &swift()));
        assert!(!is_indexable("README", &swift()));
        assert!(!is_indexable(".swift", &swift()));
    }

    #[test]
    fn test_ignored_dirs() {
        assert!(!is_indexable(".build/checkouts/Foo.swift", &swift()));
        assert!(!is_indexable("App/Pods/Alamofire/Request.swift", &swift()));
        assert!(is_indexable("App/PodsHelper/Request.swift", &swift()));
    }

    #[test]
    fn test_extensions_accept_leading_dot() {
        assert!(is_indexable("A.swift", &[".swift".to_string()]));
        assert_eq!(
            filter_indexable(vec!["A.swift".into(), "B.txt".into()], &swift()),
            vec!["A.swift".to_string()]
        );
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"").len(), 64);
    }
}
