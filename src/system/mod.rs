//! Host preflight checks.
//!
//! This module provides functions to check that the host can actually perform
//! the mounts the sandbox pipeline is about to attempt.

mod requirements;

pub use requirements::{
    MIN_USERXATTR_KERNEL, SystemRequirements, check_all, check_kernel_version,
    check_overlay_support, check_pid_namespace, check_privileges, parse_kernel_version,
};
