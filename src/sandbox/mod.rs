//! Copy-on-write sandbox construction.
//!
//! The pipeline runs in a fixed order:
//!
//! 1. prepare the workspace layout (`upper/`, `tempdir/`, `chroot/`)
//! 2. classify the real root's top-level directories by filesystem type
//! 3. mount one overlay per eligible directory, mirror top-level symlinks
//! 4. attach the kernel-filesystem bridge (`/dev`, `/proc`, `/sys`, `/tmp`)
//! 5. enter a nested mount namespace rooted at `chroot/` and run the shell
//!
//! Steps 2 to 4 are best effort: every target gets a [`MountRecord`] and a
//! failure never stops the next target. Only step 5 can end the run.
//!
//! # Example
//!
//! ```no_run
//! use cowroot::sandbox::{CallerEnv, DryRunSession, SandboxConfig, build_sandbox, launch};
//!
//! let config = SandboxConfig::new("/var/tmp/cowroot-1").with_shell("/bin/bash");
//! let mut session = DryRunSession::from_host()?;
//!
//! let summary = build_sandbox(&config, &mut session, &mut std::io::stdout())?;
//! println!("{}", summary.summary_line());
//!
//! launch(&config, &mut session, &CallerEnv::from_process())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod bridge;
mod classify;
mod config;
mod entry;
mod mountinfo;
mod mounts;
mod overlay;
mod report;
mod session;
mod workspace;

use std::io::Write;

use tracing::{info, instrument, warn};

pub use bridge::{BridgeAction, BridgeEntry, PseudoFs, attach_bridges, bridge_entries};
pub use classify::{
    DEFAULT_EXCLUDED_FS_TYPES, MountCandidate, TopLevelLink, classify, top_level_links,
};
pub use config::{DEFAULT_TMP_SIZE_MB, SandboxConfig};
pub use entry::{
    CallerEnv, DEFAULT_SHELL, LaunchMode, LaunchPlan, PROMPT_MARKER, SANDBOX_ENV_MARKER, STARTUP_DIR,
    ShellKind, plan_launch, resolve_shell,
};
pub use overlay::{OverlaySpec, UNPRIVILEGED_XATTR_OPTION, build_overlays, mirror_links};
pub use report::{BuildSummary, MountKind, MountOutcome, MountRecord};
pub use session::{DryRunSession, LiveSession, NamespaceSession, SessionCall};
pub use workspace::Workspace;

use crate::error::{LaunchError, Result};

/// Builds the sandbox root described by `config`.
///
/// One line per failed target is written to `out` after each stage, followed
/// by a summary line.
///
/// # Errors
///
/// Returns `Error::Workspace` if the workspace root cannot be used at all, or
/// `Error::Io` if writing to `out` fails. Individual mount failures are in the
/// returned summary.
#[instrument(skip_all, fields(workspace = %config.workspace.display(), privileged = config.privileged))]
pub fn build_sandbox<S, W>(config: &SandboxConfig, session: &mut S, out: &mut W) -> Result<BuildSummary>
where
    S: NamespaceSession + ?Sized,
    W: Write + ?Sized,
{
    let workspace = Workspace::new(&config.workspace);
    workspace.prepare()?;

    match workspace.has_stale_layers() {
        Ok(true) => warn!("Workspace holds layers from a previous run, those directories will fail"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Cannot inspect workspace layers"),
    }

    let mut summary = BuildSummary::new(&workspace.root, &workspace.chroot);

    let candidates = match classify(&config.root, session, &config.excluded_fs_types) {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(root = %config.root.display(), error = %e, "Cannot list root, no overlays will be built");
            summary.classification_error = Some(format!("cannot list {}: {e}", config.root.display()));
            Vec::new()
        }
    };
    let overlays = build_overlays(&candidates, &workspace, config.privileged, session);
    report_failures(&overlays, out)?;
    summary.extend(overlays);

    let links = match top_level_links(&config.root) {
        Ok(links) => mirror_links(&links, &workspace),
        Err(e) => {
            warn!(error = %e, "Cannot list top-level symlinks");
            Vec::new()
        }
    };
    report_failures(&links, out)?;
    summary.extend(links);

    let bridges = attach_bridges(&bridge_entries(config.tmp_size_mb), &workspace, session);
    report_failures(&bridges, out)?;
    summary.extend(bridges);

    writeln!(out, "{}", summary.summary_line())?;
    info!(
        overlays = summary.count(MountKind::Overlay),
        failed = summary.failed().len(),
        "Sandbox constructed"
    );
    Ok(summary)
}

/// Plans the session for an already built sandbox and enters it.
///
/// With a [`LiveSession`] this only returns on failure.
///
/// # Errors
///
/// Returns `LaunchError` if the program is missing, the startup file cannot be
/// staged, or the namespace cannot be entered.
pub fn launch<S>(config: &SandboxConfig, session: &mut S, caller: &CallerEnv) -> std::result::Result<(), LaunchError>
where
    S: NamespaceSession + ?Sized,
{
    let workspace = Workspace::new(&config.workspace);
    let plan = plan_launch(config, &workspace, caller, session.launch_mode())?;
    session.enter(&plan)
}

fn report_failures<W: Write + ?Sized>(records: &[MountRecord], out: &mut W) -> std::io::Result<()> {
    for line in records.iter().filter_map(MountRecord::failure_line) {
        writeln!(out, "{line}")?;
    }
    Ok(())
}
