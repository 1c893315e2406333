//! Kernel-virtual filesystems attached to the sandbox root.
//!
//! Device nodes, process info and the kernel object tree are live kernel state
//! and cannot be overlaid. They are attached after every overlay is in place,
//! since a bridge mountpoint may sit inside an overlay (a non-tmpfs `/tmp` is
//! overlaid first and then covered by the scratch tmpfs).

use std::path::PathBuf;

use tracing::{debug, instrument, warn};

use super::overlay::{error_chain, sandbox_path};
use super::report::{MountKind, MountRecord};
use super::session::NamespaceSession;
use super::workspace::{Workspace, ensure_mountpoint};
use crate::sandbox::mounts::tmpfs_options;

/// A pseudo-filesystem mounted fresh inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoFs {
    Proc,
    Tmpfs { size_mb: u32 },
}

impl PseudoFs {
    #[must_use]
    pub fn fs_type(&self) -> &'static str {
        match self {
            Self::Proc => "proc",
            Self::Tmpfs { .. } => "tmpfs",
        }
    }

    #[must_use]
    pub fn options(&self) -> Option<String> {
        match self {
            Self::Proc => None,
            Self::Tmpfs { size_mb } => Some(tmpfs_options(*size_mb)),
        }
    }
}

/// How one bridge entry is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Recursive bind mount of a host tree.
    BindHost(PathBuf),
    /// Fresh pseudo-filesystem.
    Mount(PseudoFs),
}

/// One fixed bridge mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEntry {
    /// Path under the sandbox root, e.g. `dev`.
    pub rel: PathBuf,
    pub action: BridgeAction,
}

/// The fixed bridge set, in mount order.
#[must_use]
pub fn bridge_entries(tmp_size_mb: u32) -> Vec<BridgeEntry> {
    vec![
        BridgeEntry {
            rel: PathBuf::from("dev"),
            action: BridgeAction::BindHost(PathBuf::from("/dev")),
        },
        BridgeEntry {
            rel: PathBuf::from("proc"),
            action: BridgeAction::Mount(PseudoFs::Proc),
        },
        BridgeEntry {
            rel: PathBuf::from("sys"),
            action: BridgeAction::BindHost(PathBuf::from("/sys")),
        },
        BridgeEntry {
            rel: PathBuf::from("tmp"),
            action: BridgeAction::Mount(PseudoFs::Tmpfs {
                size_mb: tmp_size_mb,
            }),
        },
    ]
}

/// Attaches every bridge entry under the sandbox root.
///
/// Each failure is recorded and the next entry is still attempted.
#[instrument(skip_all, fields(chroot = %workspace.chroot.display()))]
pub fn attach_bridges<S: NamespaceSession + ?Sized>(
    entries: &[BridgeEntry],
    workspace: &Workspace,
    session: &mut S,
) -> Vec<MountRecord> {
    entries
        .iter()
        .map(|entry| attach_one(entry, workspace, session))
        .collect()
}

fn attach_one<S: NamespaceSession + ?Sized>(
    entry: &BridgeEntry,
    workspace: &Workspace,
    session: &mut S,
) -> MountRecord {
    let target = sandbox_path(&entry.rel);
    let kind = match entry.action {
        BridgeAction::BindHost(_) => MountKind::Bind,
        BridgeAction::Mount(_) => MountKind::Pseudo,
    };
    let mountpoint = workspace.mountpoint_for(&entry.rel);

    if let Err(e) = ensure_mountpoint(&mountpoint) {
        warn!(target = %target.display(), error = %e, "Cannot create bridge mountpoint");
        return MountRecord::failed(kind, target, error_chain(&e));
    }

    let result = match &entry.action {
        BridgeAction::BindHost(source) => session.bind_mount(source, &mountpoint),
        BridgeAction::Mount(fs) => session.mount_pseudo(*fs, &mountpoint),
    };

    match result {
        Ok(()) => {
            debug!(target = %target.display(), %kind, "Bridge attached");
            MountRecord::mounted(kind, target)
        }
        Err(e) => {
            warn!(target = %target.display(), error = %e, "Bridge mount failed");
            MountRecord::failed(kind, target, error_chain(&e))
        }
    }
}
