//! Content digests of directory trees.
//!
//! The digest covers relative paths, entry kinds, file contents and symlink
//! targets in sorted order. Timestamps, permissions and ownership are left
//! out, so two trees with the same content hash the same.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Compute `sha256:<hex>` over the tree rooted at `root`.
pub fn tree_digest(root: &Path) -> Result<String> {
    if !root.is_dir() {
        return Err(anyhow!("cannot digest {}: not a directory", root.display()));
    }
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name().min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let rel = rel.to_string_lossy();
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("read link {}", entry.path().display()))?;
            hasher.update(b"L\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"D\0");
            hasher.update(rel.as_bytes());
        } else {
            let contents = fs::read(entry.path())
                .with_context(|| format!("read {}", entry.path().display()))?;
            hasher.update(b"F\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(&contents);
        }
        hasher.update(b"\n");
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
