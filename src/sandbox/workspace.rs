//! Filesystem layout of a sandbox workspace.
//!
//! A workspace is the staging area for exactly one sandbox session:
//!
//! ```text
//! {workspace}/
//! ├── upper/      # per-directory OverlayFS write layers
//! │   └── {rel}/
//! ├── tempdir/    # per-directory OverlayFS work directories (kernel internal)
//! │   └── {rel}/
//! └── chroot/     # assembled sandbox root, one mountpoint per {rel}
//!     └── {rel}/
//! ```
//!
//! Layer directories are never reused: OverlayFS refuses a non-empty work
//! directory, and a non-empty upper directory means another session (or a
//! crashed one) owns this workspace.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};

use crate::error::WorkspaceError;

/// Layer directories: owner read/write/execute only (0700).
const LAYER_PERMISSIONS: u32 = 0o700;

/// The sandbox root must stay traversable for every uid inside it.
const CHROOT_PERMISSIONS: u32 = 0o755;

/// Paths making up one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Workspace root as given by the caller.
    pub root: PathBuf,
    /// Parent of all upper layers.
    pub upper: PathBuf,
    /// Parent of all OverlayFS work directories.
    pub tempdir: PathBuf,
    /// Assembled sandbox root.
    pub chroot: PathBuf,
}

impl Workspace {
    /// Computes the layout under `root`. Nothing is created.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            upper: root.join("upper"),
            tempdir: root.join("tempdir"),
            chroot: root.join("chroot"),
            root,
        }
    }

    /// Creates the workspace root and its three subtrees.
    ///
    /// Existing directories are accepted; per-directory layers are checked for
    /// leftovers later, when each overlay is prepared.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::Invalid` if the root exists but is not a
    /// directory, or `WorkspaceError::IoError` if creation fails.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn prepare(&self) -> Result<(), WorkspaceError> {
        if self.root.as_os_str().is_empty() {
            return Err(WorkspaceError::Invalid {
                path: self.root.clone(),
                reason: "path is empty".to_string(),
            });
        }

        if self.root.exists() && !self.root.is_dir() {
            return Err(WorkspaceError::Invalid {
                path: self.root.clone(),
                reason: "not a directory".to_string(),
            });
        }

        for dir in [&self.upper, &self.tempdir] {
            ensure_dir_with_permissions(dir, LAYER_PERMISSIONS)?;
        }
        ensure_dir_with_permissions(&self.chroot, CHROOT_PERMISSIONS)?;

        debug!("Workspace layout ready");
        Ok(())
    }

    /// Upper layer for the top-level entry `rel`.
    #[must_use]
    pub fn upper_for(&self, rel: &Path) -> PathBuf {
        self.upper.join(rel)
    }

    /// OverlayFS work directory for the top-level entry `rel`.
    #[must_use]
    pub fn work_for(&self, rel: &Path) -> PathBuf {
        self.tempdir.join(rel)
    }

    /// Mountpoint inside the sandbox root for the top-level entry `rel`.
    #[must_use]
    pub fn mountpoint_for(&self, rel: &Path) -> PathBuf {
        self.chroot.join(rel)
    }

    /// Returns true if any layer directory under `upper/` or `tempdir/` has content.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if a layer parent cannot be listed.
    pub fn has_stale_layers(&self) -> Result<bool, WorkspaceError> {
        for parent in [&self.upper, &self.tempdir] {
            if !parent.exists() {
                continue;
            }
            let entries = fs::read_dir(parent).map_err(|e| WorkspaceError::IoError {
                context: format!("failed to list {}", parent.display()),
                source: e,
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && !is_empty_dir(&path)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Creates `path` (and parents) for use as an overlay layer.
///
/// An already existing but empty directory is accepted. A directory with any
/// content is refused with `WorkspaceError::StaleLayer`.
///
/// # Errors
///
/// Returns `WorkspaceError::StaleLayer` for leftovers, `WorkspaceError::IoError`
/// if creation fails.
pub fn create_fresh_dir(path: &Path) -> Result<(), WorkspaceError> {
    if path.exists() {
        if !path.is_dir() {
            return Err(WorkspaceError::StaleLayer {
                path: path.to_path_buf(),
            });
        }
        if !is_empty_dir(path)? {
            return Err(WorkspaceError::StaleLayer {
                path: path.to_path_buf(),
            });
        }
        trace!(path = %path.display(), "Reusing empty layer directory");
        return Ok(());
    }

    ensure_dir_with_permissions(path, LAYER_PERMISSIONS)
}

/// Creates a mountpoint directory (and parents). Existing directories are kept.
///
/// # Errors
///
/// Returns `WorkspaceError::IoError` if the path cannot be created.
pub fn ensure_mountpoint(path: &Path) -> Result<(), WorkspaceError> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to create mountpoint: {}", path.display()),
        source: e,
    })
}

/// Checks if two paths are on the same filesystem.
///
/// # Errors
///
/// Returns `WorkspaceError::IoError` if either path cannot be stat'ed.
pub fn same_filesystem(path1: &Path, path2: &Path) -> Result<bool, WorkspaceError> {
    let meta1 = fs::metadata(path1).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to get metadata for: {}", path1.display()),
        source: e,
    })?;

    let meta2 = fs::metadata(path2).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to get metadata for: {}", path2.display()),
        source: e,
    })?;

    Ok(meta1.dev() == meta2.dev())
}

fn is_empty_dir(path: &Path) -> Result<bool, WorkspaceError> {
    let mut entries = fs::read_dir(path).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to read directory: {}", path.display()),
        source: e,
    })?;
    Ok(entries.next().is_none())
}

fn ensure_dir_with_permissions(path: &Path, mode: u32) -> Result<(), WorkspaceError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to create directory: {}", path.display()),
            source: e,
        })?;
    }

    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to set permissions on: {}", path.display()),
        source: e,
    })?;

    Ok(())
}
