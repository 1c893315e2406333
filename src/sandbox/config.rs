//! Configuration for sandbox construction.

use std::path::PathBuf;

use super::classify::DEFAULT_EXCLUDED_FS_TYPES;

/// Default size of the scratch tmpfs mounted at `/tmp`, in megabytes.
pub const DEFAULT_TMP_SIZE_MB: u32 = 1024;

/// Configuration for one sandbox session.
///
/// Use the builder methods to customize the sandbox behavior.
///
/// # Example
///
/// ```
/// use cowroot::sandbox::SandboxConfig;
///
/// let config = SandboxConfig::new("/var/tmp/cowroot-1")
///     .with_privileged(true)
///     .with_shell("/bin/bash")
///     .with_working_dir("/home/me");
/// ```
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Staging area holding `upper/`, `tempdir/` and `chroot/`.
    pub workspace: PathBuf,

    /// Real filesystem root whose top-level directories get overlaid.
    pub root: PathBuf,

    /// Mount overlays with real capabilities instead of `userxattr`.
    pub privileged: bool,

    /// Shell to launch; `None` means `$SHELL`, then `/bin/sh`.
    pub shell: Option<PathBuf>,

    /// Command to run instead of an interactive shell.
    pub command: Vec<String>,

    /// Working directory inside the sandbox; `None` means the caller's.
    pub working_dir: Option<PathBuf>,

    /// Filesystem types that are never overlaid.
    pub excluded_fs_types: Vec<String>,

    /// Size limit for the scratch tmpfs in megabytes.
    pub tmp_size_mb: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::new(),
            root: PathBuf::from("/"),
            privileged: false,
            shell: None,
            command: Vec::new(),
            working_dir: None,
            excluded_fs_types: DEFAULT_EXCLUDED_FS_TYPES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            tmp_size_mb: DEFAULT_TMP_SIZE_MB,
        }
    }
}

impl SandboxConfig {
    /// Creates a configuration for the given workspace with default values.
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    /// Sets the real root to mirror.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Selects privileged or unprivileged overlay options.
    #[must_use]
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Sets the shell to launch.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Runs a command instead of an interactive shell.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory used inside the sandbox.
    #[must_use]
    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(path.into());
        self
    }

    /// Adds a filesystem type to the excluded set.
    #[must_use]
    pub fn with_excluded_fs_type(mut self, fs_type: impl Into<String>) -> Self {
        let fs_type = fs_type.into();
        if !self.excluded_fs_types.contains(&fs_type) {
            self.excluded_fs_types.push(fs_type);
        }
        self
    }

    /// Sets the scratch tmpfs size limit in megabytes.
    #[must_use]
    pub fn with_tmp_size_mb(mut self, size_mb: u32) -> Self {
        self.tmp_size_mb = size_mb;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.root, PathBuf::from("/"));
        assert!(!config.privileged);
        assert!(config.shell.is_none());
        assert!(config.command.is_empty());
        assert_eq!(config.tmp_size_mb, DEFAULT_TMP_SIZE_MB);
        assert!(config.excluded_fs_types.iter().any(|t| t == "proc"));
    }

    #[test]
    fn test_builder_chain() {
        let config = SandboxConfig::new("/tmp/ws")
            .with_root("/srv/root")
            .with_privileged(true)
            .with_shell("/bin/zsh")
            .with_command(["make", "test"])
            .with_working_dir("/src")
            .with_tmp_size_mb(64);

        assert_eq!(config.workspace, PathBuf::from("/tmp/ws"));
        assert_eq!(config.root, PathBuf::from("/srv/root"));
        assert!(config.privileged);
        assert_eq!(config.shell, Some(PathBuf::from("/bin/zsh")));
        assert_eq!(config.command, vec!["make".to_string(), "test".to_string()]);
        assert_eq!(config.working_dir, Some(PathBuf::from("/src")));
        assert_eq!(config.tmp_size_mb, 64);
    }

    #[test]
    fn test_excluded_fs_type_not_duplicated() {
        let config = SandboxConfig::default()
            .with_excluded_fs_type("nfs")
            .with_excluded_fs_type("nfs")
            .with_excluded_fs_type("proc");

        let nfs = config.excluded_fs_types.iter().filter(|t| *t == "nfs").count();
        let proc = config.excluded_fs_types.iter().filter(|t| *t == "proc").count();
        assert_eq!(nfs, 1);
        assert_eq!(proc, 1);
    }
}
