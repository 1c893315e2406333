//! Error types for cowroot.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! Only [`LaunchError`] (and an unusable workspace root) is meant to end a run.
//! Mount and classification problems are folded into per-target outcomes by the
//! pipeline, see [`crate::sandbox::MountOutcome`].

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Workspace layout could not be prepared
    #[error("Workspace error")]
    #[diagnostic(code(cowroot::workspace))]
    Workspace(#[from] WorkspaceError),

    /// The interactive session could not be started
    #[error("Failed to launch sandbox session")]
    #[diagnostic(code(cowroot::launch))]
    Launch(#[from] LaunchError),

    /// Host preflight failed
    #[error("System requirements check failed")]
    #[diagnostic(code(cowroot::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Build report could not be written
    #[error("Failed to write build report to {path}")]
    #[diagnostic(code(cowroot::report))]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(cowroot::io))]
    Io(#[from] std::io::Error),
}

/// Errors related to the staging workspace layout.
#[derive(Error, Debug, Diagnostic)]
pub enum WorkspaceError {
    /// The workspace path is not usable at all
    #[error("Invalid workspace {path}: {reason}")]
    #[diagnostic(
        code(cowroot::workspace::invalid),
        help("Pass a directory path that is unique to this sandbox session")
    )]
    Invalid { path: PathBuf, reason: String },

    /// A layer directory survives from an earlier run
    #[error("Layer directory {path} is not empty (left over from a previous run)")]
    #[diagnostic(
        code(cowroot::workspace::stale_layer),
        help("OverlayFS needs an empty work directory; use a fresh workspace path")
    )]
    StaleLayer { path: PathBuf },

    /// Filesystem operation on the workspace failed
    #[error("{context}")]
    #[diagnostic(code(cowroot::workspace::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to individual mount operations.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// Failed to mount an OverlayFS instance
    #[error("OverlayFS mount at {target} failed: {reason}")]
    #[diagnostic(code(cowroot::mount::overlay))]
    OverlayMount { target: PathBuf, reason: String },

    /// Failed to bind-mount a host tree
    #[error("Bind mount of {source_path} at {target} failed: {reason}")]
    #[diagnostic(code(cowroot::mount::bind))]
    BindMount {
        source_path: PathBuf,
        target: PathBuf,
        reason: String,
    },

    /// Failed to mount a fresh pseudo-filesystem
    #[error("{fs_type} mount at {target} failed: {reason}")]
    #[diagnostic(code(cowroot::mount::pseudo))]
    PseudoMount {
        fs_type: String,
        target: PathBuf,
        reason: String,
    },

    /// Failed to create the directories a mount needs
    #[error("Cannot prepare {target}")]
    #[diagnostic(code(cowroot::mount::prepare))]
    Prepare {
        target: PathBuf,
        #[source]
        source: WorkspaceError,
    },
}

/// Errors that stop the sandbox session from starting.
#[derive(Error, Debug, Diagnostic)]
pub enum LaunchError {
    /// Shell (or command) binary is missing from the sandbox
    #[error("{program} not found inside the sandbox")]
    #[diagnostic(
        code(cowroot::launch::not_found),
        help("Set --shell or $SHELL to a binary that exists under the mirrored root")
    )]
    ProgramNotFound { program: PathBuf },

    /// No command to run
    #[error("Empty command line")]
    #[diagnostic(code(cowroot::launch::empty_command))]
    EmptyCommand,

    /// Startup file could not be staged
    #[error("Failed to stage startup file {path}")]
    #[diagnostic(code(cowroot::launch::rc_file))]
    StartupFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A namespace, chroot or chdir call failed
    #[error("{operation} failed: {reason}")]
    #[diagnostic(
        code(cowroot::launch::namespace),
        help("The outer process must already run in user + mount + PID namespaces")
    )]
    Namespace { operation: String, reason: String },

    /// exec(2) returned
    #[error("Failed to execute {program}")]
    #[diagnostic(code(cowroot::launch::exec))]
    Exec {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to host preflight checks.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Kernel version too old
    #[error("Kernel version {found} is below minimum required {required}")]
    #[diagnostic(
        code(cowroot::system::kernel_version),
        help("Unprivileged OverlayFS with userxattr needs kernel 5.11 or later")
    )]
    KernelTooOld { found: String, required: String },

    /// OverlayFS missing from /proc/filesystems
    #[error("OverlayFS is not available on this system")]
    #[diagnostic(
        code(cowroot::system::overlayfs),
        help("Load the module with: modprobe overlay")
    )]
    OverlayUnavailable,

    /// Not root inside the current namespace
    #[error("Mounting requires uid 0 in the current namespace (found uid {uid})")]
    #[diagnostic(
        code(cowroot::system::privileges),
        help("Run inside `unshare --user --map-root-user --mount --pid --fork`, or as root with --asroot")
    )]
    MissingPrivileges { uid: u32 },

    /// Still in the initial PID namespace, so a fresh procfs cannot be mounted
    #[error("Process is in the initial PID namespace; mounting a fresh /proc will fail")]
    #[diagnostic(
        code(cowroot::system::pid_namespace),
        help("Add --pid --fork to the unshare invocation")
    )]
    InitialPidNamespace,

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(cowroot::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
