//! cowroot - Copy-on-write view of the whole filesystem.
//!
//! This crate assembles a sandbox root in which every top-level directory of
//! the real filesystem is an OverlayFS mount: reads see the real files, writes
//! land in a per-session upper layer. Kernel filesystems (`/dev`, `/proc`,
//! `/sys`) are bridged in live and `/tmp` gets a fresh tmpfs. A shell (or a
//! command) is then started inside a nested mount namespace rooted there.
//!
//! # Platform Requirements
//!
//! - Linux with OverlayFS
//! - Kernel 5.11+ for unprivileged (`userxattr`) overlays
//! - The process must already run inside user + mount + PID namespaces
//!   (`unshare --user --map-root-user --mount --pid --fork`), or as root
//!   with `privileged` set
//!
//! # Example
//!
//! ```no_run
//! use cowroot::sandbox::{CallerEnv, LiveSession, SandboxConfig, build_sandbox, launch};
//!
//! fn main() -> miette::Result<()> {
//!     let config = SandboxConfig::new("/var/tmp/cowroot-1");
//!     let mut session = LiveSession::new();
//!
//!     build_sandbox(&config, &mut session, &mut std::io::stdout())?;
//!     launch(&config, &mut session, &CallerEnv::from_process())?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use error::{Error, Result};
pub use sandbox::{BuildSummary, SandboxConfig};
