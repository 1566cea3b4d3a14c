//! Input digests and rebuild detection.
//!
//! Uses SHA256 over actual content, not mtimes, so a stage is rebuilt only
//! when one of its declared inputs really changed.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Hash a sequence of byte slices into one digest.
pub fn hash_bytes(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        // Length-prefix separator so ("ab","c") != ("a","bc").
        hasher.update((part.len() as u64).to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Hash a single file's contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("reading {} for hashing", path.display()))?;
    Ok(hash_bytes(&[&content]))
}

/// Hash a directory tree: relative paths, entry kinds, file contents and
/// symlink targets, in sorted order. Two trees with the same digest have
/// identical structure and content.
pub fn hash_tree(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir entry outside its root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        hasher.update(rel.to_string_lossy().as_bytes());

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"/d");
        } else if file_type.is_symlink() {
            hasher.update(b"/l");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else {
            hasher.update(b"/f");
            hasher.update(
                &fs::read(entry.path())
                    .with_context(|| format!("reading {} for hashing", entry.path().display()))?,
            );
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read a recorded digest from a .hash file.
/// Logs a warning if the file exists but can't be read.
pub fn read_recorded(hash_file: &Path) -> Option<String> {
    if !hash_file.exists() {
        return None;
    }
    match fs::read_to_string(hash_file) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            eprintln!(
                "  [WARN] Failed to read hash file {}: {} (will rebuild)",
                hash_file.display(),
                e
            );
            None
        }
    }
}

/// Record a digest to a .hash file.
pub fn record(hash_file: &Path, digest: &str) -> Result<()> {
    if let Some(parent) = hash_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(hash_file, digest)?;
    Ok(())
}

/// Check whether `target` is current for `digest`: it exists and the
/// recorded digest matches. A missing or stale record means rebuild.
pub fn is_current(hash_file: &Path, digest: &str, target: &Path) -> bool {
    if !target.exists() {
        return false;
    }
    matches!(read_recorded(hash_file), Some(recorded) if recorded == digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::write_file_with_dirs;
    use tempfile::TempDir;

    #[test]
    fn test_hash_bytes_length_prefixed() {
        assert_ne!(hash_bytes(&[b"ab", b"c"]), hash_bytes(&[b"a", b"bc"]));
        assert_eq!(hash_bytes(&[b"ab", b"c"]), hash_bytes(&[b"ab", b"c"]));
    }

    #[test]
    fn test_hash_tree_deterministic_and_content_sensitive() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        for root in [&a, &b] {
            write_file_with_dirs(root.join("x/one.txt"), "1").unwrap();
            write_file_with_dirs(root.join("two.txt"), "2").unwrap();
        }
        assert_eq!(hash_tree(&a).unwrap(), hash_tree(&b).unwrap());

        write_file_with_dirs(b.join("two.txt"), "changed").unwrap();
        assert_ne!(hash_tree(&a).unwrap(), hash_tree(&b).unwrap());
    }

    #[test]
    fn test_is_current_requires_target_and_match() {
        let tmp = TempDir::new().unwrap();
        let hash_file = tmp.path().join(".stage.hash");
        let target = tmp.path().join("snapshot");

        assert!(!is_current(&hash_file, "abc", &target));

        std::fs::create_dir_all(&target).unwrap();
        assert!(!is_current(&hash_file, "abc", &target));

        record(&hash_file, "abc").unwrap();
        assert!(is_current(&hash_file, "abc", &target));
        assert!(!is_current(&hash_file, "def", &target));
    }
}
