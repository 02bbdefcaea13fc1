//! Filesystem composition: seeding stage bases, importing exports and the
//! source tree, and checking the runtime filesystem for build residue.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::stage_graph::BaseRef;

/// Counts reported after a copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
}

/// Materialize `base` as the starting tree of a fresh `rootfs`.
pub fn seed_base(base: &BaseRef, rootfs: &Path) -> Result<CopyStats> {
    if rootfs.exists() {
        fs::remove_dir_all(rootfs)
            .with_context(|| format!("clear stale rootfs {}", rootfs.display()))?;
    }
    fs::create_dir_all(rootfs).with_context(|| format!("create rootfs {}", rootfs.display()))?;
    match base {
        BaseRef::Scratch => Ok(CopyStats::default()),
        BaseRef::Directory(dir) => {
            if !dir.is_dir() {
                return Err(anyhow!("base directory {} does not exist", dir.display()));
            }
            let stats = copy_tree(dir, rootfs, &[])?;
            debug!(base = %dir.display(), files = stats.files, "seeded stage base");
            Ok(stats)
        }
    }
}

/// Recursively copy `src` into `dest`, skipping entries named in `ignore`.
///
/// `src` may be a single file. Files already present in `dest` are
/// overwritten; symlinks are recreated rather than followed.
pub fn copy_tree(src: &Path, dest: &Path, ignore: &[String]) -> Result<CopyStats> {
    let meta = fs::symlink_metadata(src).with_context(|| format!("stat {}", src.display()))?;
    let mut stats = CopyStats::default();
    if !meta.is_dir() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        copy_entry(src, dest, meta.file_type().is_symlink(), &mut stats)?;
        return Ok(stats);
    }

    let walker = WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !ignore.iter().any(|name| entry.file_name() == name.as_str())
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create directory {}", target.display()))?;
            stats.dirs += 1;
        } else {
            copy_entry(entry.path(), &target, file_type.is_symlink(), &mut stats)?;
        }
    }
    Ok(stats)
}

fn copy_entry(src: &Path, dest: &Path, is_symlink: bool, stats: &mut CopyStats) -> Result<()> {
    if fs::symlink_metadata(dest).is_ok_and(|meta| !meta.is_dir()) {
        fs::remove_file(dest).with_context(|| format!("replace {}", dest.display()))?;
    }
    if is_symlink {
        let target = fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
        symlink(&target, dest).with_context(|| format!("link {}", dest.display()))?;
        stats.symlinks += 1;
    } else {
        fs::copy(src, dest)
            .with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
        stats.files += 1;
    }
    Ok(())
}

/// Fail if any `forbidden` rootfs-relative path exists in `rootfs`.
pub fn verify_no_residue(rootfs: &Path, forbidden: &[String]) -> Result<()> {
    let found: Vec<PathBuf> = forbidden
        .iter()
        .map(|rel| rootfs.join(rel))
        .filter(|path| fs::symlink_metadata(path).is_ok())
        .collect();
    if !found.is_empty() {
        let listed: Vec<String> = found
            .iter()
            .filter_map(|path| path.strip_prefix(rootfs).ok())
            .map(|rel| format!("/{}", rel.display()))
            .collect();
        return Err(anyhow!(
            "runtime filesystem contains build residue: {}",
            listed.join(", ")
        ));
    }
    info!(
        rootfs = %rootfs.display(),
        checked = forbidden.len(),
        "runtime filesystem is free of build residue"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn seed_scratch_creates_empty_rootfs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let rootfs = temp.path().join("rootfs");
        let stats = seed_base(&BaseRef::Scratch, &rootfs).expect("seed");
        assert_eq!(stats, CopyStats::default());
        assert!(rootfs.is_dir());
        assert_eq!(fs::read_dir(&rootfs).expect("read").count(), 0);
    }

    #[test]
    fn seed_directory_copies_base() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().join("base");
        write(&base, "usr/bin/python3", "#!fake");
        let rootfs = temp.path().join("rootfs");
        seed_base(&BaseRef::Directory(base), &rootfs).expect("seed");
        assert!(rootfs.join("usr/bin/python3").is_file());
    }

    #[test]
    fn seed_missing_base_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = seed_base(
            &BaseRef::Directory(temp.path().join("nope")),
            &temp.path().join("rootfs"),
        )
        .expect_err("missing base");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn copy_tree_skips_ignored_names_and_keeps_links() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        write(&src, "service/main.py", "app = None\n");
        write(&src, "service/__pycache__/main.pyc", "junk");
        write(&src, ".git/HEAD", "ref");
        symlink("main.py", src.join("service/entry.py")).expect("symlink");

        let dest = temp.path().join("app");
        let stats = copy_tree(&src, &dest, &["__pycache__".to_string(), ".git".to_string()])
            .expect("copy");
        assert!(dest.join("service/main.py").is_file());
        assert!(!dest.join("service/__pycache__").exists());
        assert!(!dest.join(".git").exists());
        assert_eq!(
            fs::read_link(dest.join("service/entry.py")).expect("link"),
            PathBuf::from("main.py")
        );
        assert_eq!(stats.files, 1);
        assert_eq!(stats.symlinks, 1);
    }

    #[test]
    fn copy_tree_overwrites_existing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        write(&src, "config.txt", "new");
        let dest = temp.path().join("dest");
        write(&dest, "config.txt", "old");
        copy_tree(&src, &dest, &[]).expect("copy");
        assert_eq!(fs::read_to_string(dest.join("config.txt")).expect("read"), "new");
    }

    #[test]
    fn residue_check_lists_offenders() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "usr/bin/gcc", "");
        let forbidden = vec!["usr/bin/gcc".to_string(), "root/.cache/pip".to_string()];
        let err = verify_no_residue(temp.path(), &forbidden).expect_err("residue");
        assert!(err.to_string().contains("/usr/bin/gcc"));
        assert!(!err.to_string().contains("pip"));

        fs::remove_file(temp.path().join("usr/bin/gcc")).expect("remove");
        verify_no_residue(temp.path(), &forbidden).expect("clean");
    }
}
