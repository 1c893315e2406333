//! cowroot - Entry Point
//!
//! Builds the copy-on-write sandbox in the given workspace and enters it.
//! Expected to run inside an existing user + mount + PID namespace, e.g.
//! `unshare --user --map-root-user --mount --pid --fork cowroot /var/tmp/ws`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use cowroot::Error;
use cowroot::sandbox::{
    BuildSummary, CallerEnv, DryRunSession, LiveSession, NamespaceSession, SandboxConfig,
    build_sandbox, launch,
};
use cowroot::system;

/// Exit status when the sandbox was built with failures and not entered.
const EXIT_INCOMPLETE: u8 = 2;

/// cowroot - Copy-on-write sandbox over the whole filesystem.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace directory holding upper/, tempdir/ and chroot/
    workspace: PathBuf,

    /// Running as real root: mount overlays without the userxattr option
    #[arg(long, env = "COWROOT_ASROOT")]
    asroot: bool,

    /// Filesystem root to mirror
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Shell to start (defaults to $SHELL, then /bin/sh)
    #[arg(long, env = "COWROOT_SHELL")]
    shell: Option<PathBuf>,

    /// Log the mounts and the launch without performing them
    #[arg(long)]
    dry_run: bool,

    /// Do not enter the sandbox if any mount failed
    #[arg(long)]
    strict: bool,

    /// Write the build summary as JSON to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Skip host preflight checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Command to run instead of an interactive shell
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Args {
    fn config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::new(&self.workspace)
            .with_root(&self.root)
            .with_privileged(self.asroot)
            .with_command(self.command.iter().cloned());
        if let Some(shell) = &self.shell {
            config = config.with_shell(shell);
        }
        config
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr, stdout carries the per-mount failure lines
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("cowroot v{}", env!("CARGO_PKG_VERSION"));

    if args.skip_checks {
        warn!("Skipping system requirements checks (--skip-checks)");
    } else {
        preflight(args.asroot);
    }

    let config = args.config();
    if args.dry_run {
        let mut session = DryRunSession::from_host().into_diagnostic()?;
        run(&args, &config, &mut session)
    } else {
        run(&args, &config, &mut LiveSession::new())
    }
}

/// Builds, reports and enters. Returns only when the session was not replaced.
fn run<S: NamespaceSession>(args: &Args, config: &SandboxConfig, session: &mut S) -> Result<ExitCode> {
    let mut out = std::io::stdout().lock();
    let summary = build_sandbox(config, session, &mut out)?;
    out.flush().into_diagnostic()?;
    drop(out);

    if let Some(path) = &args.report {
        write_report(&summary, path)?;
    }

    if args.strict && !summary.is_complete() {
        warn!("Not entering an incomplete sandbox (--strict)");
        return Ok(ExitCode::from(EXIT_INCOMPLETE));
    }

    launch(config, session, &CallerEnv::from_process())?;

    // Only a dry run gets here.
    if summary.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_INCOMPLETE))
    }
}

fn write_report(summary: &BuildSummary, path: &Path) -> Result<()> {
    let json = summary.to_json().map_err(|e| Error::Report {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    std::fs::write(path, json).map_err(|e| Error::Report {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!(path = %path.display(), "Build report written");
    Ok(())
}

/// Preflight never aborts: it explains the mount failures that would follow.
fn preflight(privileged: bool) {
    match system::check_all(privileged) {
        Ok(reqs) => info!(
            "System requirements satisfied: kernel {}, overlayfs: {}, uid: {}",
            reqs.kernel_version, reqs.overlayfs, reqs.uid
        ),
        Err(e) => {
            let reason = std::error::Error::source(&e).map_or_else(|| e.to_string(), ToString::to_string);
            warn!(%reason, "System requirements check failed, mounts are likely to fail");
        }
    }
}
