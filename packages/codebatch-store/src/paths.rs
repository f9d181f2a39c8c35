//! Path canonicalization and key normalization
//!
//! Every file path that enters the store goes through [`canonicalize`] once,
//! producing the original display form (`path`) and the normalized lookup
//! form (`path_key`). All listings sort by `(path_key ASC, insertion order)`.

use unicode_normalization::UnicodeNormalization;

use crate::error::{Result, StoreError};

/// A canonicalized path pair.
///
/// - `path`: separators normalized to `/`, trailing slash stripped, original
///   case and composition preserved.
/// - `path_key`: the NFC, lowercased form of `path`. Used for ordering,
///   sharding, and collision detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPath {
    pub path: String,
    pub path_key: String,
}

/// Canonicalize a raw relative path.
///
/// Rules:
/// - OS separators (`\`) are replaced with `/`
/// - absolute paths are rejected
/// - `.` and `..` segments are rejected
/// - empty paths and empty segments (`a//b`) are rejected
/// - a single trailing `/` is stripped
///
/// # Errors
///
/// Returns `ErrorKind::InvalidPath` when any rule is violated.
pub fn canonicalize(raw: &str) -> Result<CanonicalPath> {
    if raw.is_empty() {
        return Err(StoreError::invalid_path("empty path"));
    }

    let mut path = raw.replace('\\', "/");

    if path.ends_with('/') {
        path.pop();
    }

    if is_absolute(&path) {
        return Err(StoreError::invalid_path(format!(
            "absolute path not allowed: {raw:?}"
        )));
    }

    for segment in path.split('/') {
        match segment {
            "" => {
                return Err(StoreError::invalid_path(format!(
                    "empty segment in {raw:?}"
                )))
            }
            "." | ".." => {
                return Err(StoreError::invalid_path(format!(
                    "relative segment {segment:?} in {raw:?}"
                )))
            }
            _ => {}
        }
    }

    let path_key = path_key_of(&path);
    Ok(CanonicalPath { path, path_key })
}

/// Compute the normalized key form of an already-canonical path.
pub fn path_key_of(path: &str) -> String {
    path.nfc().collect::<String>().to_lowercase()
}

fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    // Windows drive prefix, e.g. `c:/...`
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Sort entries by `(path_key ASC)` preserving insertion order on ties.
///
/// The key extractor keeps callers generic over their entry type.
pub fn sort_canonical<T, F>(entries: &mut [T], key: F)
where
    F: Fn(&T) -> &str,
{
    entries.sort_by(|a, b| key(a).cmp(key(b)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonicalize_simple() {
        let c = canonicalize("src/main.rs").unwrap();
        assert_eq!(c.path, "src/main.rs");
        assert_eq!(c.path_key, "src/main.rs");
    }

    #[test]
    fn test_canonicalize_backslash() {
        let c = canonicalize("src\\lib.rs").unwrap();
        assert_eq!(c.path, "src/lib.rs");
    }

    #[test]
    fn test_canonicalize_case() {
        let c = canonicalize("Src/README.md").unwrap();
        assert_eq!(c.path, "Src/README.md");
        assert_eq!(c.path_key, "src/readme.md");
    }

    #[test]
    fn test_canonicalize_trailing_slash() {
        let c = canonicalize("a/b/").unwrap();
        assert_eq!(c.path, "a/b");
    }

    #[test]
    fn test_canonicalize_rejects_absolute() {
        assert!(canonicalize("/etc/passwd").is_err());
        assert!(canonicalize("C:\\Windows").is_err());
        assert!(canonicalize("c:/windows").is_err());
    }

    #[test]
    fn test_canonicalize_rejects_dot_segments() {
        assert!(canonicalize("./a").is_err());
        assert!(canonicalize("a/../b").is_err());
        assert!(canonicalize("..").is_err());
    }

    #[test]
    fn test_canonicalize_rejects_empty() {
        assert!(canonicalize("").is_err());
        assert!(canonicalize("a//b").is_err());
    }

    #[test]
    fn test_path_key_nfc() {
        // U+0065 U+0301 (e + combining acute) normalizes to U+00E9
        let decomposed = "caf\u{0065}\u{0301}.txt";
        let composed = "caf\u{00e9}.txt";
        assert_eq!(path_key_of(decomposed), path_key_of(composed));
    }

    #[test]
    fn test_sort_canonical_stable() {
        let entries = [("b", 0), ("A", 1), ("a", 2), ("B", 3)];
        // keys computed ahead of sorting, as the snapshot builder does
        let mut keyed: Vec<(String, i32)> = entries
            .iter()
            .map(|e| (path_key_of(e.0), e.1))
            .collect();
        sort_canonical(&mut keyed, |e| e.0.as_str());
        let order: Vec<i32> = keyed.iter().map(|e| e.1).collect();
        // "A" and "a" share a key; insertion order (1 before 2) is preserved
        assert_eq!(order, vec![1, 2, 0, 3]);
    }

    proptest! {
        #[test]
        fn prop_canonicalize_idempotent(s in "[a-zA-Z0-9_.]{1,8}(/[a-zA-Z0-9_.]{1,8}){0,3}") {
            prop_assume!(canonicalize(&s).is_ok());
            let once = canonicalize(&s).unwrap();
            let twice = canonicalize(&once.path).unwrap();
            prop_assert_eq!(&once.path, &twice.path);
            prop_assert_eq!(&once.path_key, &twice.path_key);
        }

        #[test]
        fn prop_path_key_lowercase(s in "[a-zA-Z]{1,16}") {
            let c = canonicalize(&s).unwrap();
            prop_assert_eq!(c.path_key, s.to_lowercase());
        }
    }
}
