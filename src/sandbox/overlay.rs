//! Per-directory OverlayFS construction.
//!
//! Each eligible top-level directory gets its own overlay:
//!
//! - lower: the real directory (never written)
//! - upper: `{workspace}/upper/{rel}`
//! - work: `{workspace}/tempdir/{rel}`
//! - merged: `{workspace}/chroot/{rel}`
//!
//! # OverlayFS Requirements
//!
//! - Work directory must be empty before mount
//! - Work directory must be on same filesystem as upper directory
//! - Unprivileged mounts (user namespace, kernel 5.11+) need `userxattr`

use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use super::classify::{MountCandidate, TopLevelLink};
use super::report::{MountKind, MountRecord};
use super::session::NamespaceSession;
use super::workspace::{Workspace, create_fresh_dir, ensure_mountpoint, same_filesystem};
use crate::error::MountError;

/// Option that stores overlay metadata in `user.overlay.*` xattrs, so that
/// whiteouts work without `CAP_SYS_ADMIN` in the initial namespace.
pub const UNPRIVILEGED_XATTR_OPTION: &str = "userxattr";

/// Everything needed to mount one overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub lowerdir: PathBuf,
    pub upperdir: PathBuf,
    pub workdir: PathBuf,
    pub mountpoint: PathBuf,
    pub privileged: bool,
}

impl OverlaySpec {
    /// Lays out the overlay for `candidate` inside `workspace`.
    #[must_use]
    pub fn for_candidate(candidate: &MountCandidate, workspace: &Workspace, privileged: bool) -> Self {
        Self {
            lowerdir: candidate.path.clone(),
            upperdir: workspace.upper_for(&candidate.rel),
            workdir: workspace.work_for(&candidate.rel),
            mountpoint: workspace.mountpoint_for(&candidate.rel),
            privileged,
        }
    }

    /// Mount data string: `lowerdir=…,upperdir=…,workdir=…[,userxattr]`.
    #[must_use]
    pub fn options(&self) -> String {
        let mut options = format!(
            "lowerdir={},upperdir={},workdir={}",
            escape_option_path(&self.lowerdir),
            escape_option_path(&self.upperdir),
            escape_option_path(&self.workdir)
        );
        if !self.privileged {
            options.push(',');
            options.push_str(UNPRIVILEGED_XATTR_OPTION);
        }
        options
    }

    /// Creates upper, work and mountpoint directories.
    ///
    /// Upper and work must be new or empty.
    ///
    /// # Errors
    ///
    /// Returns `MountError::Prepare` naming the mountpoint when a layer has
    /// leftovers or a directory cannot be created.
    pub fn prepare(&self) -> Result<(), MountError> {
        let prepare_err = |source| MountError::Prepare {
            target: self.mountpoint.clone(),
            source,
        };

        create_fresh_dir(&self.upperdir).map_err(prepare_err)?;
        create_fresh_dir(&self.workdir).map_err(prepare_err)?;
        ensure_mountpoint(&self.mountpoint).map_err(prepare_err)?;

        match same_filesystem(&self.upperdir, &self.workdir) {
            Ok(true) => {}
            Ok(false) => warn!(
                upper = %self.upperdir.display(),
                work = %self.workdir.display(),
                "Upper and work directories are on different filesystems - OverlayFS may fail"
            ),
            Err(e) => warn!(error = %e, "Cannot compare upper and work filesystems"),
        }

        Ok(())
    }
}

/// Escapes `\`, `,` and `:` so paths survive overlay option parsing.
#[must_use]
pub fn escape_option_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | ',' | ':') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Builds one overlay per eligible candidate, in order.
///
/// Ineligible candidates are recorded as skipped. A failure for one candidate
/// is recorded and the loop carries on with the next.
#[instrument(skip_all, fields(count = candidates.len(), privileged = privileged))]
pub fn build_overlays<S: NamespaceSession + ?Sized>(
    candidates: &[MountCandidate],
    workspace: &Workspace,
    privileged: bool,
    session: &mut S,
) -> Vec<MountRecord> {
    let mut records = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let target = sandbox_path(&candidate.rel);

        if !candidate.eligible {
            let fs_type = candidate.fs_type.as_deref().unwrap_or("unknown");
            records.push(MountRecord::skipped(
                MountKind::Overlay,
                target,
                format!("excluded filesystem type {fs_type}"),
            ));
            continue;
        }

        let spec = OverlaySpec::for_candidate(candidate, workspace, privileged);
        let result = spec.prepare().and_then(|()| session.mount_overlay(&spec));

        match result {
            Ok(()) => {
                debug!(target = %target.display(), "Overlay mounted");
                records.push(MountRecord::mounted(MountKind::Overlay, target));
            }
            Err(e) => {
                warn!(target = %target.display(), error = %e, "Overlay mount failed");
                records.push(MountRecord::failed(
                    MountKind::Overlay,
                    target,
                    error_chain(&e),
                ));
            }
        }
    }

    records
}

/// Recreates the real root's top-level symlinks under the sandbox root.
///
/// An existing identical link is accepted, so a partially built workspace can
/// still be inspected with `--dry-run`.
#[instrument(skip_all, fields(count = links.len()))]
pub fn mirror_links(links: &[TopLevelLink], workspace: &Workspace) -> Vec<MountRecord> {
    links
        .iter()
        .map(|link| {
            let target = sandbox_path(&link.rel);
            let path = workspace.mountpoint_for(&link.rel);

            if let Ok(existing) = std::fs::read_link(&path) {
                if existing == link.target {
                    return MountRecord::mounted(MountKind::Symlink, target);
                }
            }

            match std::os::unix::fs::symlink(&link.target, &path) {
                Ok(()) => MountRecord::mounted(MountKind::Symlink, target),
                Err(e) => MountRecord::failed(MountKind::Symlink, target, e.to_string()),
            }
        })
        .collect()
}

/// `usr` → `/usr`
pub(crate) fn sandbox_path(rel: &Path) -> PathBuf {
    Path::new("/").join(rel)
}

/// Flattens an error and its sources into one line.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn usr_candidate() -> MountCandidate {
        MountCandidate {
            path: PathBuf::from("/usr"),
            rel: PathBuf::from("usr"),
            fs_type: Some("ext4".to_string()),
            eligible: true,
        }
    }

    #[test]
    fn test_spec_layout() {
        let ws = Workspace::new("/ws");
        let spec = OverlaySpec::for_candidate(&usr_candidate(), &ws, false);
        assert_eq!(spec.lowerdir, PathBuf::from("/usr"));
        assert_eq!(spec.upperdir, PathBuf::from("/ws/upper/usr"));
        assert_eq!(spec.workdir, PathBuf::from("/ws/tempdir/usr"));
        assert_eq!(spec.mountpoint, PathBuf::from("/ws/chroot/usr"));
    }

    #[test]
    fn test_unprivileged_options_end_with_userxattr() {
        let ws = Workspace::new("/ws");
        let spec = OverlaySpec::for_candidate(&usr_candidate(), &ws, false);
        assert_eq!(
            spec.options(),
            "lowerdir=/usr,upperdir=/ws/upper/usr,workdir=/ws/tempdir/usr,userxattr"
        );
    }

    #[test]
    fn test_privileged_options_omit_userxattr() {
        let ws = Workspace::new("/ws");
        let spec = OverlaySpec::for_candidate(&usr_candidate(), &ws, true);
        assert_eq!(
            spec.options(),
            "lowerdir=/usr,upperdir=/ws/upper/usr,workdir=/ws/tempdir/usr"
        );
        assert!(!spec.options().contains(UNPRIVILEGED_XATTR_OPTION));
    }

    #[test]
    fn test_escape_option_path() {
        assert_eq!(escape_option_path(Path::new("/plain/path")), "/plain/path");
        assert_eq!(escape_option_path(Path::new("/a,b")), "/a\\,b");
        assert_eq!(escape_option_path(Path::new("/a:b")), "/a\\:b");
        assert_eq!(escape_option_path(Path::new("/a\\b")), "/a\\\\b");
    }

    #[test]
    fn test_prepare_creates_directories() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let ws = Workspace::new(temp.path());
        let spec = OverlaySpec::for_candidate(&usr_candidate(), &ws, false);

        spec.prepare().expect("prepare failed");
        assert!(spec.upperdir.is_dir());
        assert!(spec.workdir.is_dir());
        assert!(spec.mountpoint.is_dir());
    }

    #[test]
    fn test_prepare_refuses_dirty_workdir() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let ws = Workspace::new(temp.path());
        let spec = OverlaySpec::for_candidate(&usr_candidate(), &ws, false);
        std::fs::create_dir_all(&spec.workdir).expect("mkdir work");
        std::fs::create_dir(spec.workdir.join("work")).expect("mkdir leftover");

        let err = spec.prepare().unwrap_err();
        assert!(matches!(err, MountError::Prepare { .. }));
        assert!(error_chain(&err).contains("not empty"));
    }

    #[test]
    fn test_mirror_links() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let ws = Workspace::new(temp.path());
        ws.prepare().expect("prepare failed");
        let links = vec![TopLevelLink {
            rel: PathBuf::from("bin"),
            target: PathBuf::from("usr/bin"),
        }];

        let records = mirror_links(&links, &ws);
        assert_eq!(records, vec![MountRecord::mounted(MountKind::Symlink, "/bin")]);
        assert_eq!(
            std::fs::read_link(ws.chroot.join("bin")).expect("link exists"),
            PathBuf::from("usr/bin")
        );

        // Second run finds the identical link.
        let again = mirror_links(&links, &ws);
        assert!(!again[0].is_failed());
    }

    #[test]
    fn test_error_chain() {
        let err = MountError::Prepare {
            target: PathBuf::from("/ws/chroot/usr"),
            source: crate::error::WorkspaceError::StaleLayer {
                path: PathBuf::from("/ws/tempdir/usr"),
            },
        };
        assert_eq!(
            error_chain(&err),
            "Cannot prepare /ws/chroot/usr: Layer directory /ws/tempdir/usr is not empty (left over from a previous run)"
        );
    }
}
