//! The namespace session handle threaded through the pipeline.
//!
//! Every kernel-facing step (filesystem type queries, mounts, the final
//! namespace entry) goes through [`NamespaceSession`]. [`LiveSession`] talks to
//! the kernel; [`DryRunSession`] only records and logs, so the whole pipeline
//! can run against a scratch tree without privileges.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::sched::{CloneFlags, unshare};
use nix::unistd::{chdir, chroot};
use tracing::{debug, info, instrument, warn};

use super::bridge::PseudoFs;
use super::entry::{LaunchMode, LaunchPlan};
use super::mountinfo;
use super::mounts;
use super::overlay::OverlaySpec;
use crate::error::{LaunchError, MountError};

/// Kernel operations the sandbox pipeline needs.
pub trait NamespaceSession {
    /// Type of the filesystem mounted exactly at `path`, if `path` is a mount boundary.
    fn filesystem_type(&self, path: &Path) -> Option<String>;

    /// Mounts one overlay at `spec.mountpoint`.
    fn mount_overlay(&mut self, spec: &OverlaySpec) -> Result<(), MountError>;

    /// Recursively bind-mounts `source` at `target`.
    fn bind_mount(&mut self, source: &Path, target: &Path) -> Result<(), MountError>;

    /// Mounts a fresh pseudo-filesystem at `target`.
    fn mount_pseudo(&mut self, fs: PseudoFs, target: &Path) -> Result<(), MountError>;

    /// How launch plans for this session are resolved.
    fn launch_mode(&self) -> LaunchMode {
        LaunchMode::Live
    }

    /// Enters a nested mount namespace rooted at `plan.root` and runs the command.
    ///
    /// A live session only returns on failure; the process image is replaced
    /// on success.
    fn enter(&mut self, plan: &LaunchPlan) -> Result<(), LaunchError>;
}

/// Session backed by real mount(2)/unshare(2)/chroot(2) calls.
#[derive(Debug, Default)]
pub struct LiveSession;

impl LiveSession {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl NamespaceSession for LiveSession {
    fn filesystem_type(&self, path: &Path) -> Option<String> {
        match mountinfo::read_self() {
            Ok(entries) => mountinfo::fs_type_at(&entries, path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read mountinfo, treating type as unknown");
                None
            }
        }
    }

    fn mount_overlay(&mut self, spec: &OverlaySpec) -> Result<(), MountError> {
        mounts::mount_overlay(&spec.options(), &spec.mountpoint)
    }

    fn bind_mount(&mut self, source: &Path, target: &Path) -> Result<(), MountError> {
        mounts::bind_mount_rec(source, target)
    }

    fn mount_pseudo(&mut self, fs: PseudoFs, target: &Path) -> Result<(), MountError> {
        match fs {
            PseudoFs::Proc => mounts::mount_proc(target),
            PseudoFs::Tmpfs { size_mb } => mounts::mount_tmp(target, size_mb),
        }
    }

    #[instrument(skip_all, fields(root = %plan.root.display(), program = %plan.program.display()))]
    fn enter(&mut self, plan: &LaunchPlan) -> Result<(), LaunchError> {
        unshare(CloneFlags::CLONE_NEWNS).map_err(|e| LaunchError::Namespace {
            operation: "unshare(CLONE_NEWNS)".to_string(),
            reason: e.to_string(),
        })?;

        mounts::make_root_private().map_err(|reason| LaunchError::Namespace {
            operation: "making / private".to_string(),
            reason,
        })?;

        chroot(&plan.root).map_err(|e| LaunchError::Namespace {
            operation: format!("chroot({})", plan.root.display()),
            reason: e.to_string(),
        })?;

        if let Err(e) = chdir(&plan.working_dir) {
            warn!(
                working_dir = %plan.working_dir.display(),
                error = %e,
                "Working directory unavailable inside the sandbox, using /"
            );
            chdir("/").map_err(|e| LaunchError::Namespace {
                operation: "chdir(/)".to_string(),
                reason: e.to_string(),
            })?;
        }

        debug!(args = ?plan.args, "Executing");
        let err = Command::new(&plan.program)
            .args(&plan.args)
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .exec();

        Err(LaunchError::Exec {
            program: plan.program.clone(),
            source: err,
        })
    }
}

/// A call recorded by [`DryRunSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Overlay {
        target: PathBuf,
        options: String,
    },
    Bind {
        source: PathBuf,
        target: PathBuf,
    },
    Pseudo {
        fs_type: String,
        target: PathBuf,
        options: Option<String>,
    },
    Enter(LaunchPlan),
}

/// Session that performs no kernel calls.
///
/// Filesystem types come from an optional table; every mount succeeds and is
/// recorded.
#[derive(Debug, Default)]
pub struct DryRunSession {
    fs_types: HashMap<PathBuf, String>,
    calls: Vec<SessionCall>,
}

impl DryRunSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers type queries from `fs_types`; unknown paths report no type.
    #[must_use]
    pub fn with_fs_types(fs_types: HashMap<PathBuf, String>) -> Self {
        Self {
            fs_types,
            calls: Vec::new(),
        }
    }

    /// Answers type queries from this process's real mount table.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if `/proc/self/mountinfo` cannot be read.
    pub fn from_host() -> std::io::Result<Self> {
        let fs_types = mountinfo::read_self()?
            .into_iter()
            .map(|e| (e.mount_point, e.fs_type))
            .collect();
        Ok(Self::with_fs_types(fs_types))
    }

    /// Everything that would have been done, in order.
    #[must_use]
    pub fn calls(&self) -> &[SessionCall] {
        &self.calls
    }
}

impl NamespaceSession for DryRunSession {
    fn launch_mode(&self) -> LaunchMode {
        LaunchMode::Preview
    }

    fn filesystem_type(&self, path: &Path) -> Option<String> {
        self.fs_types.get(path).cloned()
    }

    fn mount_overlay(&mut self, spec: &OverlaySpec) -> Result<(), MountError> {
        let options = spec.options();
        info!(target = %spec.mountpoint.display(), %options, "[dry-run] mount overlay");
        self.calls.push(SessionCall::Overlay {
            target: spec.mountpoint.clone(),
            options,
        });
        Ok(())
    }

    fn bind_mount(&mut self, source: &Path, target: &Path) -> Result<(), MountError> {
        info!(source = %source.display(), target = %target.display(), "[dry-run] bind mount");
        self.calls.push(SessionCall::Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn mount_pseudo(&mut self, fs: PseudoFs, target: &Path) -> Result<(), MountError> {
        info!(fs_type = fs.fs_type(), target = %target.display(), "[dry-run] mount");
        self.calls.push(SessionCall::Pseudo {
            fs_type: fs.fs_type().to_string(),
            target: target.to_path_buf(),
            options: fs.options(),
        });
        Ok(())
    }

    fn enter(&mut self, plan: &LaunchPlan) -> Result<(), LaunchError> {
        info!(
            root = %plan.root.display(),
            working_dir = %plan.working_dir.display(),
            program = %plan.program.display(),
            args = ?plan.args,
            "[dry-run] enter sandbox"
        );
        self.calls.push(SessionCall::Enter(plan.clone()));
        Ok(())
    }
}
