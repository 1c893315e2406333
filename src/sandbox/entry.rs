//! Second-stage namespace entry: what to run inside the sandbox, and how.
//!
//! Building a [`LaunchPlan`] resolves the program against the assembled
//! sandbox root and, for shells that support it, stages a startup file under
//! the scratch tmpfs that sources the user's own rc file and marks the prompt.
//! The plan is then handed to [`NamespaceSession::enter`]. A dry run plans in
//! [`LaunchMode::Preview`], against the real root, since nothing is mounted.
//!
//! [`NamespaceSession::enter`]: super::session::NamespaceSession::enter

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use super::config::SandboxConfig;
use super::workspace::Workspace;
use crate::error::LaunchError;

/// Shell used when neither `--shell` nor `$SHELL` names one.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Variable set in every sandbox session, holding the workspace path.
pub const SANDBOX_ENV_MARKER: &str = "COWROOT";

/// Prompt prefix marking a sandbox shell.
pub const PROMPT_MARKER: &str = "(cowroot) ";

/// Directory (inside the sandbox) holding generated startup files.
pub const STARTUP_DIR: &str = "/tmp/.cowroot";

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Everything [`NamespaceSession::enter`] needs.
///
/// [`NamespaceSession::enter`]: super::session::NamespaceSession::enter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Sandbox root on the host side (`{workspace}/chroot`).
    pub root: PathBuf,
    /// Working directory inside the sandbox.
    pub working_dir: PathBuf,
    /// Program path inside the sandbox.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Whether a plan is for a real entry or only for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Overlays are mounted; resolve and stage inside `chroot/`.
    Live,
    /// Nothing is mounted; resolve against the real root, write nothing.
    Preview,
}

/// Startup-file handling a shell supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    /// `--rcfile <file>`
    Bash,
    /// `ZDOTDIR=<dir>`
    Zsh,
    /// Environment marker only.
    Other,
}

impl ShellKind {
    #[must_use]
    pub fn detect(program: &Path) -> Self {
        match program.file_name().and_then(|n| n.to_str()) {
            Some("bash") => Self::Bash,
            Some("zsh") => Self::Zsh,
            _ => Self::Other,
        }
    }
}

/// The caller's environment, captured once so tests can supply their own.
#[derive(Debug, Clone, Default)]
pub struct CallerEnv {
    pub shell: Option<OsString>,
    pub path: Option<OsString>,
    pub cwd: PathBuf,
}

impl CallerEnv {
    /// Reads `$SHELL`, `$PATH` and the current directory.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            shell: std::env::var_os("SHELL"),
            path: std::env::var_os("PATH"),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    }
}

/// Picks the shell: explicit configuration, then `$SHELL`, then [`DEFAULT_SHELL`].
#[must_use]
pub fn resolve_shell(configured: Option<&Path>, env_shell: Option<&OsString>) -> PathBuf {
    if let Some(shell) = configured {
        return shell.to_path_buf();
    }
    match env_shell {
        Some(shell) if !shell.is_empty() => PathBuf::from(shell),
        _ => PathBuf::from(DEFAULT_SHELL),
    }
}

/// Finds `program` under the sandbox root and returns its in-sandbox path.
///
/// Absolute programs are checked directly, bare names are searched along `path`.
///
/// # Errors
///
/// Returns `LaunchError::ProgramNotFound` if nothing matches.
pub fn locate_in_sandbox(
    chroot: &Path,
    program: &Path,
    path: Option<&OsString>,
) -> Result<PathBuf, LaunchError> {
    let not_found = || LaunchError::ProgramNotFound {
        program: program.to_path_buf(),
    };

    if program.is_absolute() {
        return if host_view(chroot, program).is_file() {
            Ok(program.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    if program.components().count() > 1 {
        return Err(not_found());
    }

    let search = path
        .cloned()
        .unwrap_or_else(|| OsString::from(FALLBACK_PATH));
    std::env::split_paths(&search)
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(program))
        .find(|candidate| host_view(chroot, candidate).is_file())
        .ok_or_else(not_found)
}

/// Host-side path of an in-sandbox absolute path.
fn host_view(chroot: &Path, inside: &Path) -> PathBuf {
    chroot.join(inside.strip_prefix("/").unwrap_or(inside))
}

/// Extra arguments and environment that point `kind` at the staged startup files.
#[must_use]
pub fn startup_launch_args(kind: ShellKind) -> (Vec<String>, Vec<(String, String)>) {
    match kind {
        ShellKind::Bash => (
            vec![
                "--rcfile".to_string(),
                format!("{STARTUP_DIR}/bashrc"),
                "-i".to_string(),
            ],
            Vec::new(),
        ),
        ShellKind::Zsh => (
            Vec::new(),
            vec![("ZDOTDIR".to_string(), STARTUP_DIR.to_string())],
        ),
        ShellKind::Other => (Vec::new(), Vec::new()),
    }
}

/// Writes the startup file(s) for `kind` under the sandbox root.
///
/// # Errors
///
/// Returns `LaunchError::StartupFile` if the files cannot be written.
pub fn write_startup_files(chroot: &Path, kind: ShellKind) -> Result<(), LaunchError> {
    let files: Vec<(&str, String)> = match kind {
        ShellKind::Bash => vec![("bashrc", bashrc())],
        ShellKind::Zsh => vec![(".zshenv", zshenv()), (".zshrc", zshrc())],
        ShellKind::Other => return Ok(()),
    };

    let dir = host_view(chroot, Path::new(STARTUP_DIR));
    fs::create_dir_all(&dir).map_err(|e| LaunchError::StartupFile {
        path: dir.clone(),
        source: e,
    })?;

    for (name, content) in &files {
        let path = dir.join(name);
        fs::write(&path, content).map_err(|e| LaunchError::StartupFile { path, source: e })?;
    }
    debug!(dir = %dir.display(), ?kind, "Staged startup files");
    Ok(())
}

fn bashrc() -> String {
    format!(
        "# Generated by cowroot for this sandbox session.\n\
         [ -f /etc/bash.bashrc ] && . /etc/bash.bashrc\n\
         [ -f \"$HOME/.bashrc\" ] && . \"$HOME/.bashrc\"\n\
         PS1=\"{PROMPT_MARKER}$PS1\"\n"
    )
}

fn zshenv() -> String {
    "# Generated by cowroot for this sandbox session.\n\
     [ -f \"$HOME/.zshenv\" ] && . \"$HOME/.zshenv\"\n"
        .to_string()
}

fn zshrc() -> String {
    format!(
        "# Generated by cowroot for this sandbox session.\n\
         [ -f \"$HOME/.zshrc\" ] && . \"$HOME/.zshrc\"\n\
         PROMPT=\"{PROMPT_MARKER}$PROMPT\"\n"
    )
}

/// Builds the launch for this session and stages whatever the shell needs.
///
/// With a configured command the command runs as-is; otherwise the resolved
/// shell runs interactively. In [`LaunchMode::Preview`] the program is looked
/// up in the real root (what the overlays will show once mounted) and no
/// startup file is written.
///
/// # Errors
///
/// Returns `LaunchError` if the program cannot be found inside the sandbox or
/// the startup file cannot be written. Both are fatal.
#[instrument(skip_all, fields(chroot = %workspace.chroot.display(), ?mode))]
pub fn plan_launch(
    config: &SandboxConfig,
    workspace: &Workspace,
    caller: &CallerEnv,
    mode: LaunchMode,
) -> Result<LaunchPlan, LaunchError> {
    let lookup_root = match mode {
        LaunchMode::Live => workspace.chroot.as_path(),
        LaunchMode::Preview => config.root.as_path(),
    };

    let working_dir = config
        .working_dir
        .clone()
        .unwrap_or_else(|| caller.cwd.clone());

    let mut env = vec![(
        SANDBOX_ENV_MARKER.to_string(),
        workspace.root.to_string_lossy().into_owned(),
    )];

    let (program, args) = if let Some((first, rest)) = config.command.split_first() {
        if first.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        let program = locate_in_sandbox(lookup_root, Path::new(first), caller.path.as_ref())?;
        (program, rest.to_vec())
    } else {
        let shell = resolve_shell(config.shell.as_deref(), caller.shell.as_ref());
        let program = locate_in_sandbox(lookup_root, &shell, caller.path.as_ref())?;
        let kind = ShellKind::detect(&program);
        if mode == LaunchMode::Live {
            write_startup_files(&workspace.chroot, kind)?;
        }
        let (args, shell_env) = startup_launch_args(kind);
        env.extend(shell_env);
        (program, args)
    };

    debug!(program = %program.display(), ?args, "Launch planned");
    Ok(LaunchPlan {
        root: workspace.chroot.clone(),
        working_dir,
        program,
        args,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox_with(programs: &[&str]) -> (TempDir, Workspace) {
        let temp = TempDir::new().expect("failed to create temp dir");
        let ws = Workspace::new(temp.path());
        ws.prepare().expect("prepare failed");
        for program in programs {
            let path = host_view(&ws.chroot, Path::new(program));
            fs::create_dir_all(path.parent().expect("has parent")).expect("mkdir");
            fs::write(&path, "#!/bin/true\n").expect("write program");
        }
        (temp, ws)
    }

    fn caller(shell: Option<&str>) -> CallerEnv {
        CallerEnv {
            shell: shell.map(OsString::from),
            path: Some(OsString::from("/usr/bin:/bin")),
            cwd: PathBuf::from("/home/me/project"),
        }
    }

    #[test]
    fn test_resolve_shell_precedence() {
        let env_shell = OsString::from("/bin/zsh");
        assert_eq!(
            resolve_shell(Some(Path::new("/bin/bash")), Some(&env_shell)),
            PathBuf::from("/bin/bash")
        );
        assert_eq!(resolve_shell(None, Some(&env_shell)), PathBuf::from("/bin/zsh"));
        assert_eq!(
            resolve_shell(None, Some(&OsString::new())),
            PathBuf::from(DEFAULT_SHELL)
        );
        assert_eq!(resolve_shell(None, None), PathBuf::from(DEFAULT_SHELL));
    }

    #[test]
    fn test_shell_kind_detect() {
        assert_eq!(ShellKind::detect(Path::new("/bin/bash")), ShellKind::Bash);
        assert_eq!(ShellKind::detect(Path::new("/usr/bin/zsh")), ShellKind::Zsh);
        assert_eq!(ShellKind::detect(Path::new("/bin/dash")), ShellKind::Other);
    }

    #[test]
    fn test_locate_absolute_and_search() {
        let (_temp, ws) = sandbox_with(&["/usr/bin/fish"]);
        let path = OsString::from("/usr/local/bin:/usr/bin");

        assert_eq!(
            locate_in_sandbox(&ws.chroot, Path::new("/usr/bin/fish"), None).expect("absolute"),
            PathBuf::from("/usr/bin/fish")
        );
        assert_eq!(
            locate_in_sandbox(&ws.chroot, Path::new("fish"), Some(&path)).expect("searched"),
            PathBuf::from("/usr/bin/fish")
        );
        assert!(matches!(
            locate_in_sandbox(&ws.chroot, Path::new("/bin/fish"), None),
            Err(LaunchError::ProgramNotFound { .. })
        ));
    }

    #[test]
    fn test_plan_bash_stages_rcfile() {
        let (_temp, ws) = sandbox_with(&["/bin/bash"]);
        let config = SandboxConfig::new(&ws.root);

        let plan = plan_launch(&config, &ws, &caller(Some("/bin/bash")), LaunchMode::Live).expect("plan");

        assert_eq!(plan.program, PathBuf::from("/bin/bash"));
        assert_eq!(plan.args, vec!["--rcfile", "/tmp/.cowroot/bashrc", "-i"]);
        assert_eq!(plan.working_dir, PathBuf::from("/home/me/project"));
        assert_eq!(plan.root, ws.chroot);
        assert!(plan.env.iter().any(|(k, _)| k == SANDBOX_ENV_MARKER));

        let rc = fs::read_to_string(ws.chroot.join("tmp/.cowroot/bashrc")).expect("rc staged");
        assert!(rc.contains("$HOME/.bashrc"));
        assert!(rc.contains(PROMPT_MARKER));
    }

    #[test]
    fn test_plan_zsh_sets_zdotdir() {
        let (_temp, ws) = sandbox_with(&["/usr/bin/zsh"]);
        let config = SandboxConfig::new(&ws.root).with_shell("/usr/bin/zsh");

        let plan = plan_launch(&config, &ws, &caller(None), LaunchMode::Live).expect("plan");

        assert!(plan.args.is_empty());
        assert!(
            plan.env
                .contains(&("ZDOTDIR".to_string(), STARTUP_DIR.to_string()))
        );
        assert!(ws.chroot.join("tmp/.cowroot/.zshrc").is_file());
        assert!(ws.chroot.join("tmp/.cowroot/.zshenv").is_file());
    }

    #[test]
    fn test_plan_other_shell_only_marker() {
        let (_temp, ws) = sandbox_with(&["/bin/sh"]);
        let config = SandboxConfig::new(&ws.root);

        let plan = plan_launch(&config, &ws, &caller(None), LaunchMode::Live).expect("plan");

        assert_eq!(plan.program, PathBuf::from(DEFAULT_SHELL));
        assert!(plan.args.is_empty());
        assert_eq!(plan.env.len(), 1);
        assert!(!ws.chroot.join("tmp/.cowroot").exists());
    }

    #[test]
    fn test_plan_command_skips_staging() {
        let (_temp, ws) = sandbox_with(&["/usr/bin/make", "/bin/bash"]);
        let config = SandboxConfig::new(&ws.root)
            .with_command(["make", "-j4"])
            .with_working_dir("/src");

        let plan = plan_launch(&config, &ws, &caller(Some("/bin/bash")), LaunchMode::Live).expect("plan");

        assert_eq!(plan.program, PathBuf::from("/usr/bin/make"));
        assert_eq!(plan.args, vec!["-j4"]);
        assert_eq!(plan.working_dir, PathBuf::from("/src"));
        assert!(!ws.chroot.join("tmp/.cowroot").exists());
    }

    #[test]
    fn test_preview_resolves_in_real_root_without_staging() {
        let (_temp, ws) = sandbox_with(&[]);
        let real_root = TempDir::new().expect("failed to create root");
        fs::create_dir_all(real_root.path().join("usr/bin")).expect("mkdir");
        fs::write(real_root.path().join("usr/bin/bash"), "").expect("write shell");
        std::os::unix::fs::symlink("usr/bin", real_root.path().join("bin")).expect("symlink");
        let config = SandboxConfig::new(&ws.root)
            .with_root(real_root.path())
            .with_shell("/bin/bash");

        let plan = plan_launch(&config, &ws, &caller(None), LaunchMode::Preview).expect("plan");

        assert_eq!(plan.program, PathBuf::from("/bin/bash"));
        assert_eq!(plan.root, ws.chroot);
        assert_eq!(plan.args, vec!["--rcfile", "/tmp/.cowroot/bashrc", "-i"]);
        assert!(!ws.chroot.join("tmp/.cowroot").exists());
    }

    #[test]
    fn test_plan_missing_shell_is_fatal() {
        let (_temp, ws) = sandbox_with(&[]);
        let config = SandboxConfig::new(&ws.root).with_shell("/bin/bash");

        let err = plan_launch(&config, &ws, &caller(None), LaunchMode::Live).unwrap_err();
        assert!(matches!(err, LaunchError::ProgramNotFound { .. }));
        assert!(err.to_string().contains("/bin/bash"));
    }
}
