//! Thin wrappers over mount(2) for the live namespace.
//!
//! Each helper performs exactly one kernel call and maps `nix` errors into
//! [`MountError`] with the affected path. Callers decide whether a failure is
//! fatal; the pipeline never treats it as such.

use std::path::Path;

use nix::mount::{MsFlags, mount};
use tracing::{debug, instrument, trace};

use crate::error::MountError;

/// Mounts OverlayFS at `target` with a prebuilt option string.
///
/// # Errors
///
/// Returns `MountError::OverlayMount` if the mount operation fails.
#[instrument(skip_all, fields(target = %target.display()))]
pub fn mount_overlay(options: &str, target: &Path) -> Result<(), MountError> {
    trace!(options = %options, "OverlayFS mount options");

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options),
    )
    .map_err(|e| MountError::OverlayMount {
        target: target.to_path_buf(),
        reason: e.to_string(),
    })?;

    debug!("OverlayFS mounted");
    Ok(())
}

/// Mounts a fresh procfs at `target`.
///
/// # Errors
///
/// Returns `MountError::PseudoMount` if the mount operation fails.
#[instrument(skip_all, fields(target = %target.display()))]
pub fn mount_proc(target: &Path) -> Result<(), MountError> {
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| MountError::PseudoMount {
        fs_type: "proc".to_string(),
        target: target.to_path_buf(),
        reason: e.to_string(),
    })?;

    debug!("procfs mounted");
    Ok(())
}

/// Mounts tmpfs at `target` with a size limit and sticky world-writable mode.
///
/// # Errors
///
/// Returns `MountError::PseudoMount` if the mount operation fails.
#[instrument(skip_all, fields(target = %target.display(), size_mb = %size_mb))]
pub fn mount_tmp(target: &Path, size_mb: u32) -> Result<(), MountError> {
    let options = tmpfs_options(size_mb);

    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(options.as_str()),
    )
    .map_err(|e| MountError::PseudoMount {
        fs_type: "tmpfs".to_string(),
        target: target.to_path_buf(),
        reason: e.to_string(),
    })?;

    debug!("tmpfs mounted");
    Ok(())
}

/// Option string for the scratch tmpfs.
#[must_use]
pub fn tmpfs_options(size_mb: u32) -> String {
    format!("size={}m,mode=1777", size_mb)
}

/// Recursively bind-mounts `source` at `target`, submounts included.
///
/// # Errors
///
/// Returns `MountError::BindMount` if the mount operation fails.
#[instrument(skip_all, fields(source = %source.display(), target = %target.display()))]
pub fn bind_mount_rec(source: &Path, target: &Path) -> Result<(), MountError> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| MountError::BindMount {
        source_path: source.to_path_buf(),
        target: target.to_path_buf(),
        reason: e.to_string(),
    })?;

    trace!("Recursive bind mount created");
    Ok(())
}

/// Marks every mount under `/` private so nothing propagates back to the host.
///
/// # Errors
///
/// Returns the `nix` error as a string.
pub fn make_root_private() -> Result<(), String> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| e.to_string())
}
