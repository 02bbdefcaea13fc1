//! Deterministic mapping between container paths, rootfs directories and the
//! build context.

use std::path::{Component, Path, PathBuf};

/// Check that `path` is an absolute container path without `..` components.
pub fn validate_container_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("container path must not be empty".to_string());
    }
    let candidate = Path::new(path);
    if !candidate.has_root() {
        return Err(format!("container path '{path}' must be absolute"));
    }
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                return Err(format!("container path '{path}' must not contain '..'"));
            }
            Component::Prefix(_) => {
                return Err(format!("container path '{path}' has a platform prefix"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check that `path` is relative and stays inside the build context.
pub fn validate_context_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("context path must not be empty".to_string());
    }
    let candidate = Path::new(path);
    if candidate.has_root() {
        return Err(format!("context path '{path}' must be relative"));
    }
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(format!("context path '{path}' escapes the build context"));
    }
    Ok(())
}

/// Map the container path `path` onto the host directory `rootfs`.
pub fn host_path(rootfs: &Path, path: &str) -> Result<PathBuf, String> {
    validate_container_path(path)?;
    Ok(join_normal(rootfs, Path::new(path)))
}

/// Resolve `path` inside the build context `context`.
pub fn context_path(context: &Path, path: &str) -> Result<PathBuf, String> {
    validate_context_path(path)?;
    Ok(join_normal(context, Path::new(path)))
}

fn join_normal(base: &Path, path: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_path_strips_root() {
        let mapped = host_path(Path::new("/tmp/rootfs"), "/usr/local/lib").expect("map");
        assert_eq!(mapped, PathBuf::from("/tmp/rootfs/usr/local/lib"));
    }

    #[test]
    fn host_path_of_root_is_rootfs() {
        let mapped = host_path(Path::new("/tmp/rootfs"), "/").expect("map");
        assert_eq!(mapped, PathBuf::from("/tmp/rootfs"));
    }

    #[test]
    fn container_path_rejects_relative_and_parent() {
        assert!(validate_container_path("app").is_err());
        assert!(validate_container_path("/app/../etc").is_err());
        assert!(validate_container_path("").is_err());
        assert!(validate_container_path("/app/./src").is_ok());
    }

    #[test]
    fn context_path_rejects_escapes() {
        assert!(context_path(Path::new("/ctx"), "../secret").is_err());
        assert!(context_path(Path::new("/ctx"), "/etc/passwd").is_err());
        let resolved = context_path(Path::new("/ctx"), "./src").expect("resolve");
        assert_eq!(resolved, PathBuf::from("/ctx/src"));
    }
}
