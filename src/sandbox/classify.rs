//! Mount classification of the real root's top-level entries.
//!
//! Every top-level directory becomes a [`MountCandidate`]. A candidate is
//! overlay-eligible unless the filesystem mounted exactly on it is a kernel
//! virtual filesystem or removable media; those are either bridged in
//! afterwards or left out of the sandbox.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace, warn};

use super::session::NamespaceSession;

/// Filesystem types that are never overlaid.
///
/// `devtmpfs`, `proc` and `sysfs` are live kernel views, `tmpfs` is scratch
/// storage that the sandbox replaces with its own, and `vfat` is removable media.
pub const DEFAULT_EXCLUDED_FS_TYPES: &[&str] = &["devtmpfs", "proc", "sysfs", "tmpfs", "vfat"];

/// One top-level directory of the real filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCandidate {
    /// Absolute path on the host (e.g. `/usr`).
    pub path: PathBuf,
    /// Path relative to the root (e.g. `usr`), used under every workspace subtree.
    pub rel: PathBuf,
    /// Filesystem mounted exactly here, if the path is a mount boundary.
    pub fs_type: Option<String>,
    /// Whether an overlay should be built for this entry.
    pub eligible: bool,
}

/// A top-level symlink of the real root (e.g. `/bin -> usr/bin`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevelLink {
    /// Name relative to the root.
    pub rel: PathBuf,
    /// Link target, verbatim.
    pub target: PathBuf,
}

/// Classifies the top-level directories of `root`, sorted by path.
///
/// Non-directories are skipped. A failed or empty type query yields
/// `fs_type: None` and the candidate stays eligible.
///
/// # Errors
///
/// Returns the I/O error if `root` itself cannot be listed.
#[instrument(skip(session, excluded), fields(root = %root.display()))]
pub fn classify<S: NamespaceSession + ?Sized>(
    root: &Path,
    session: &S,
    excluded: &[String],
) -> std::io::Result<Vec<MountCandidate>> {
    let mut candidates = Vec::new();

    for (path, name) in sorted_entries(root)? {
        let is_dir = fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_dir())
            .unwrap_or(false);
        if !is_dir {
            trace!(path = %path.display(), "Skipping non-directory");
            continue;
        }

        let fs_type = session.filesystem_type(&path);
        let eligible = match &fs_type {
            Some(t) => !excluded.iter().any(|e| e == t),
            None => true,
        };

        debug!(
            path = %path.display(),
            fs_type = fs_type.as_deref().unwrap_or("-"),
            eligible,
            "Classified"
        );

        candidates.push(MountCandidate {
            path,
            rel: PathBuf::from(name),
            fs_type,
            eligible,
        });
    }

    Ok(candidates)
}

/// Lists the top-level symlinks of `root`, sorted by name.
///
/// Unreadable links are logged and left out.
///
/// # Errors
///
/// Returns the I/O error if `root` itself cannot be listed.
pub fn top_level_links(root: &Path) -> std::io::Result<Vec<TopLevelLink>> {
    let mut links = Vec::new();

    for (path, name) in sorted_entries(root)? {
        let is_link = fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            continue;
        }
        match fs::read_link(&path) {
            Ok(target) => links.push(TopLevelLink {
                rel: PathBuf::from(name),
                target,
            }),
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read top-level symlink"),
        }
    }

    Ok(links)
}

fn sorted_entries(root: &Path) -> std::io::Result<Vec<(PathBuf, std::ffi::OsString)>> {
    let mut entries: Vec<(PathBuf, std::ffi::OsString)> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| (e.path(), e.file_name()))
        .collect();
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::session::DryRunSession;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn excluded() -> Vec<String> {
        DEFAULT_EXCLUDED_FS_TYPES.iter().map(|s| (*s).to_string()).collect()
    }

    fn fake_root() -> TempDir {
        let root = TempDir::new().expect("failed to create temp dir");
        for dir in ["usr", "proc", "dev", "opt"] {
            fs::create_dir(root.path().join(dir)).expect("mkdir");
        }
        fs::write(root.path().join("vmlinuz"), "kernel").expect("write file");
        std::os::unix::fs::symlink("usr/bin", root.path().join("bin")).expect("symlink");
        root
    }

    fn session_for(root: &Path) -> DryRunSession {
        let types: HashMap<PathBuf, String> = [
            (root.join("usr"), "ext4"),
            (root.join("proc"), "proc"),
            (root.join("dev"), "devtmpfs"),
        ]
        .into_iter()
        .map(|(p, t)| (p, t.to_string()))
        .collect();
        DryRunSession::with_fs_types(types)
    }

    #[test]
    fn test_classify_excludes_kernel_filesystems() {
        let root = fake_root();
        let session = session_for(root.path());

        let candidates = classify(root.path(), &session, &excluded()).expect("classify failed");
        let eligible: Vec<_> = candidates
            .iter()
            .filter(|c| c.eligible)
            .map(|c| c.rel.clone())
            .collect();

        assert_eq!(eligible, vec![PathBuf::from("opt"), PathBuf::from("usr")]);
        let proc = candidates
            .iter()
            .find(|c| c.rel == Path::new("proc"))
            .expect("proc is listed");
        assert!(!proc.eligible);
        assert_eq!(proc.fs_type.as_deref(), Some("proc"));
    }

    #[test]
    fn test_classify_skips_files_and_symlinks() {
        let root = fake_root();
        let session = session_for(root.path());

        let candidates = classify(root.path(), &session, &excluded()).expect("classify failed");
        assert!(candidates.iter().all(|c| c.rel != Path::new("vmlinuz")));
        assert!(candidates.iter().all(|c| c.rel != Path::new("bin")));
    }

    #[test]
    fn test_unknown_type_is_eligible() {
        let root = fake_root();
        let session = session_for(root.path());

        let candidates = classify(root.path(), &session, &excluded()).expect("classify failed");
        let opt = candidates
            .iter()
            .find(|c| c.rel == Path::new("opt"))
            .expect("opt is listed");
        assert!(opt.fs_type.is_none());
        assert!(opt.eligible);
    }

    #[test]
    fn test_classify_is_sorted_and_deterministic() {
        let root = fake_root();
        let session = session_for(root.path());

        let first = classify(root.path(), &session, &excluded()).expect("classify failed");
        let second = classify(root.path(), &session, &excluded()).expect("classify failed");
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(first, sorted);
    }

    #[test]
    fn test_top_level_links() {
        let root = fake_root();
        let links = top_level_links(root.path()).expect("listing failed");
        assert_eq!(
            links,
            vec![TopLevelLink {
                rel: PathBuf::from("bin"),
                target: PathBuf::from("usr/bin"),
            }]
        );
    }

    #[test]
    fn test_classify_missing_root_errors() {
        let session = DryRunSession::default();
        let result = classify(Path::new("/nonexistent/cowroot-root"), &session, &excluded());
        assert!(result.is_err());
    }
}
