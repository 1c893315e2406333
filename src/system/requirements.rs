//! System requirements checking implementation.

use std::fs;

use crate::error::{Result, SystemRequirementsError};

/// Minimum kernel version (major, minor) for the `userxattr` overlay option.
pub const MIN_USERXATTR_KERNEL: (u32, u32) = (5, 11);

/// Results of all preflight checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Kernel version string (e.g., "6.7.0")
    pub kernel_version: String,
    /// Parsed kernel major version
    pub kernel_major: u32,
    /// Parsed kernel minor version
    pub kernel_minor: u32,
    /// Whether overlay is listed in /proc/filesystems
    pub overlayfs: bool,
    /// Effective uid inside the current namespace
    pub uid: u32,
    /// Whether the process runs in a nested PID namespace
    pub pid_namespace: bool,
}

impl SystemRequirements {
    /// Check if all requirements are met for the given privilege mode.
    #[must_use]
    pub fn is_satisfied(&self, privileged: bool) -> bool {
        let kernel_ok = privileged || kernel_at_least(self.kernel_major, self.kernel_minor);
        let procfs_ok = privileged || self.pid_namespace;
        kernel_ok && procfs_ok && self.overlayfs && self.uid == 0
    }
}

/// Run every preflight check for the given privilege mode.
///
/// Returns `Ok(SystemRequirements)` with all check results, or
/// `Err` with the first failing requirement.
pub fn check_all(privileged: bool) -> Result<SystemRequirements> {
    let (kernel_version, kernel_major, kernel_minor) = check_kernel_version(privileged)?;
    let overlayfs = check_overlay_support()?;
    let uid = check_privileges()?;
    let pid_namespace = check_pid_namespace()?;
    if !privileged && !pid_namespace {
        return Err(SystemRequirementsError::InitialPidNamespace.into());
    }

    Ok(SystemRequirements {
        kernel_version,
        kernel_major,
        kernel_minor,
        overlayfs,
        uid,
        pid_namespace,
    })
}

/// Check the running kernel.
///
/// In unprivileged mode the kernel must be at least 5.11, otherwise overlay
/// rejects `userxattr`. Privileged mode accepts any version.
///
/// # Errors
///
/// Returns error if the version cannot be read, or is too old for unprivileged mode.
pub fn check_kernel_version(privileged: bool) -> Result<(String, u32, u32)> {
    let uname = nix::sys::utsname::uname().map_err(|e| SystemRequirementsError::ReadFailed {
        context: "uname syscall".to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    let release = uname.release().to_string_lossy().to_string();
    let (major, minor) = parse_kernel_version(&release)?;

    if !privileged && !kernel_at_least(major, minor) {
        return Err(SystemRequirementsError::KernelTooOld {
            found: release,
            required: format!("{}.{}", MIN_USERXATTR_KERNEL.0, MIN_USERXATTR_KERNEL.1),
        }
        .into());
    }

    Ok((release, major, minor))
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    major > MIN_USERXATTR_KERNEL.0
        || (major == MIN_USERXATTR_KERNEL.0 && minor >= MIN_USERXATTR_KERNEL.1)
}

/// Parse kernel version string into (major, minor).
pub fn parse_kernel_version(version: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = version.split('.').collect();

    if parts.len() < 2 {
        return Err(SystemRequirementsError::ReadFailed {
            context: format!("Failed to parse kernel version: {version}"),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid kernel version format",
            ),
        }
        .into());
    }

    let major = parts[0]
        .parse::<u32>()
        .map_err(|_| SystemRequirementsError::ReadFailed {
            context: format!("Failed to parse kernel major version: {}", parts[0]),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "Invalid major version"),
        })?;

    // Minor version might have suffix like "11-generic", extract just the number
    let minor_str = parts[1]
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("0");
    let minor = minor_str
        .parse::<u32>()
        .map_err(|_| SystemRequirementsError::ReadFailed {
            context: format!("Failed to parse kernel minor version: {}", parts[1]),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "Invalid minor version"),
        })?;

    Ok((major, minor))
}

/// Check that overlay is a registered filesystem.
///
/// # Errors
///
/// Returns error if `/proc/filesystems` cannot be read or has no `overlay` line.
pub fn check_overlay_support() -> Result<bool> {
    let content =
        fs::read_to_string("/proc/filesystems").map_err(|e| SystemRequirementsError::ReadFailed {
            context: "/proc/filesystems".to_string(),
            source: e,
        })?;

    if !lists_overlay(&content) {
        return Err(SystemRequirementsError::OverlayUnavailable.into());
    }

    Ok(true)
}

/// Lines look like `nodev\toverlay` or `\text4`; the name is the last column.
fn lists_overlay(filesystems: &str) -> bool {
    filesystems
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|name| name == "overlay")
}

/// Check that we are uid 0 in the current (possibly user) namespace.
///
/// # Errors
///
/// Returns error with the effective uid otherwise.
pub fn check_privileges() -> Result<u32> {
    let uid = nix::unistd::geteuid().as_raw();
    if uid != 0 {
        return Err(SystemRequirementsError::MissingPrivileges { uid }.into());
    }
    Ok(uid)
}

/// Check whether this process runs below the initial PID namespace.
///
/// An unprivileged fresh procfs mount is only allowed to the owner of the
/// current PID namespace, which is never the case for the initial one.
///
/// # Errors
///
/// Returns error if `/proc/self/status` cannot be read.
pub fn check_pid_namespace() -> Result<bool> {
    let status =
        fs::read_to_string("/proc/self/status").map_err(|e| SystemRequirementsError::ReadFailed {
            context: "/proc/self/status".to_string(),
            source: e,
        })?;

    // Kernels without NSpid predate PID namespace reporting; assume nested.
    Ok(nspid_depth(&status).is_none_or(|depth| depth > 1))
}

/// Number of PID namespaces the process is visible in, from the `NSpid:` line.
fn nspid_depth(status: &str) -> Option<usize> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .map(|pids| pids.split_whitespace().count())
}
