//! KB corpus fingerprinting.
//!
//! Derives a stable content signature for the file set matching a glob
//! pattern, so the index manager can detect corpus changes cheaply without
//! re-reading file contents. The digest folds `(path, size, mtime)` of every
//! matching file in lexicographic path order; any addition, removal, or
//! modification changes the fingerprint.
//!
//! Files that disappear between listing and stat are skipped silently —
//! freshness is best-effort, not a correctness guarantee under concurrent
//! corpus mutation.

use anyhow::Result;
use globset::{Glob, GlobMatcher};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Opaque digest over a file set's identity, size, and mtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stat snapshot of one corpus file. Immutable, used only for fingerprinting.
#[derive(Debug, Clone)]
pub struct FileStamp {
    pub path: String,
    pub byte_size: u64,
    pub modified_secs: i64,
}

/// Compute the fingerprint of all files matching `glob_pattern`.
///
/// No side effects. An unmatched pattern yields the digest of the empty
/// file set, which is itself stable.
pub fn fingerprint(glob_pattern: &str) -> Result<Fingerprint> {
    let entries = stat_matching_files(glob_pattern)?;
    Ok(digest_entries(entries))
}

/// Enumerate and stat files matching the pattern.
///
/// Returned order is unspecified; [`digest_entries`] sorts before folding.
pub fn stat_matching_files(glob_pattern: &str) -> Result<Vec<FileStamp>> {
    let matcher: GlobMatcher = Glob::new(glob_pattern)?.compile_matcher();
    let root = literal_prefix(glob_pattern);

    let mut entries = Vec::new();
    for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !matcher.is_match(path) {
            continue;
        }
        // Stat may race with deletion; skip rather than fail the digest.
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let modified_secs = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        entries.push(FileStamp {
            path: path.to_string_lossy().to_string(),
            byte_size: metadata.len(),
            modified_secs,
        });
    }

    Ok(entries)
}

/// Fold file stamps into a single digest, sorting by path first so the
/// result is independent of enumeration order.
pub fn digest_entries(mut entries: Vec<FileStamp>) -> Fingerprint {
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for stamp in &entries {
        let payload = format!("{}|{}|{}", stamp.path, stamp.byte_size, stamp.modified_secs);
        hasher.update(payload.as_bytes());
    }
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// The longest leading path with no glob metacharacters — the walk root.
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        let text = match component {
            Component::Normal(s) => s.to_string_lossy(),
            other => {
                prefix.push(other.as_os_str());
                continue;
            }
        };
        if text.contains(['*', '?', '[', '{']) {
            break;
        }
        prefix.push(component.as_os_str());
    }
    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};

    fn stamp(path: &str, size: u64, mtime: i64) -> FileStamp {
        FileStamp {
            path: path.to_string(),
            byte_size: size,
            modified_secs: mtime,
        }
    }

    #[test]
    fn test_digest_is_order_independent() {
        let a = vec![
            stamp("kb/a.txt", 10, 100),
            stamp("kb/b.txt", 20, 200),
            stamp("kb/c.txt", 30, 300),
        ];
        let b = vec![
            stamp("kb/c.txt", 30, 300),
            stamp("kb/a.txt", 10, 100),
            stamp("kb/b.txt", 20, 200),
        ];
        assert_eq!(digest_entries(a), digest_entries(b));
    }

    #[test]
    fn test_digest_changes_on_size() {
        let a = vec![stamp("kb/a.txt", 10, 100)];
        let b = vec![stamp("kb/a.txt", 11, 100)];
        assert_ne!(digest_entries(a), digest_entries(b));
    }

    #[test]
    fn test_digest_changes_on_mtime() {
        let a = vec![stamp("kb/a.txt", 10, 100)];
        let b = vec![stamp("kb/a.txt", 10, 101)];
        assert_ne!(digest_entries(a), digest_entries(b));
    }

    #[test]
    fn test_digest_changes_on_added_file() {
        let a = vec![stamp("kb/a.txt", 10, 100)];
        let b = vec![stamp("kb/a.txt", 10, 100), stamp("kb/b.txt", 5, 100)];
        assert_ne!(digest_entries(a), digest_entries(b));
    }

    #[test]
    fn test_fingerprint_stable_across_calls() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("one.txt"), "alpha").unwrap();
        fs::write(tmp.path().join("two.txt"), "beta").unwrap();

        let pattern = format!("{}/*.txt", tmp.path().display());
        let first = fingerprint(&pattern).unwrap();
        let second = fingerprint(&pattern).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fingerprint_changes_when_file_grows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("one.txt");
        fs::write(&file, "alpha").unwrap();

        let pattern = format!("{}/*.txt", tmp.path().display());
        let before = fingerprint(&pattern).unwrap();

        fs::write(&file, "alpha and more").unwrap();
        let after = fingerprint(&pattern).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_fingerprint_changes_on_touched_mtime() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("one.txt");
        fs::write(&file, "alpha").unwrap();

        let pattern = format!("{}/*.txt", tmp.path().display());
        let before = fingerprint(&pattern).unwrap();

        let handle = fs::File::options().write(true).open(&file).unwrap();
        handle
            .set_modified(SystemTime::now() + Duration::from_secs(120))
            .unwrap();
        drop(handle);

        let after = fingerprint(&pattern).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_empty_match_is_stable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pattern = format!("{}/*.md", tmp.path().display());
        assert_eq!(
            fingerprint(&pattern).unwrap(),
            fingerprint(&pattern).unwrap()
        );
    }
}
