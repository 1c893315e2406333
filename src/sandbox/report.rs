//! Per-target outcomes of sandbox construction and their summary.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// What kind of attachment a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// OverlayFS over a real top-level directory.
    Overlay,
    /// Recursive bind mount of a host tree.
    Bind,
    /// Fresh pseudo-filesystem (procfs, tmpfs).
    Pseudo,
    /// Recreated top-level symlink.
    Symlink,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlay => write!(f, "overlay"),
            Self::Bind => write!(f, "bind"),
            Self::Pseudo => write!(f, "pseudo"),
            Self::Symlink => write!(f, "symlink"),
        }
    }
}

/// Result for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MountOutcome {
    Mounted,
    Skipped { reason: String },
    Failed { reason: String },
}

/// One attempted (or deliberately skipped) attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountRecord {
    pub kind: MountKind,
    /// Path as seen from inside the sandbox, e.g. `/usr`.
    pub target: PathBuf,
    #[serde(flatten)]
    pub outcome: MountOutcome,
}

impl MountRecord {
    #[must_use]
    pub fn mounted(kind: MountKind, target: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            target: target.into(),
            outcome: MountOutcome::Mounted,
        }
    }

    #[must_use]
    pub fn skipped(kind: MountKind, target: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            outcome: MountOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    #[must_use]
    pub fn failed(kind: MountKind, target: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            outcome: MountOutcome::Failed {
                reason: reason.into(),
            },
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, MountOutcome::Failed { .. })
    }

    /// The operator-facing line for a failed record, `None` otherwise.
    #[must_use]
    pub fn failure_line(&self) -> Option<String> {
        let MountOutcome::Failed { reason } = &self.outcome else {
            return None;
        };
        let target = self.target.display();
        let line = match self.kind {
            MountKind::Overlay => format!("Failed to overlay mount {target}: {reason}"),
            MountKind::Bind | MountKind::Pseudo => format!("Failed to mount {target}: {reason}"),
            MountKind::Symlink => format!("Failed to link {target}: {reason}"),
        };
        Some(line)
    }
}

/// Everything the pipeline did, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    /// Workspace the sandbox was assembled in.
    pub workspace: PathBuf,
    /// Sandbox root handed to the namespace entry.
    pub chroot: PathBuf,
    /// Classification problem that left the candidate list empty, if any.
    pub classification_error: Option<String>,
    pub records: Vec<MountRecord>,
}

impl BuildSummary {
    #[must_use]
    pub fn new(workspace: &Path, chroot: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            chroot: chroot.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = MountRecord>) {
        self.records.extend(records);
    }

    /// True when nothing failed. Skipped targets do not count as failures.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.classification_error.is_none() && !self.records.iter().any(MountRecord::is_failed)
    }

    #[must_use]
    pub fn failed(&self) -> Vec<&MountRecord> {
        self.records.iter().filter(|r| r.is_failed()).collect()
    }

    #[must_use]
    pub fn count(&self, kind: MountKind) -> usize {
        self.records
            .iter()
            .filter(|r| r.kind == kind && r.outcome == MountOutcome::Mounted)
            .count()
    }

    /// Targets of one kind, in pipeline order, regardless of outcome.
    #[must_use]
    pub fn targets(&self, kind: MountKind) -> Vec<&Path> {
        self.records
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.target.as_path())
            .collect()
    }

    /// One-line human summary printed after construction.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let failed = self.failed().len();
        let state = if self.is_complete() {
            "sandbox ready"
        } else {
            "sandbox partially built"
        };
        format!(
            "{state}: {} overlays, {} bridge mounts, {} failed",
            self.count(MountKind::Overlay),
            self.count(MountKind::Bind) + self.count(MountKind::Pseudo),
            failed
        )
    }

    /// Pretty JSON for `--report`.
    ///
    /// # Errors
    ///
    /// Propagates serialization errors.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BuildSummary {
        let mut summary = BuildSummary::new(Path::new("/ws"), Path::new("/ws/chroot"));
        summary.extend([
            MountRecord::mounted(MountKind::Overlay, "/usr"),
            MountRecord::skipped(MountKind::Overlay, "/proc", "excluded filesystem type proc"),
            MountRecord::failed(MountKind::Overlay, "/opt", "EBUSY"),
            MountRecord::mounted(MountKind::Bind, "/dev"),
            MountRecord::mounted(MountKind::Pseudo, "/proc"),
        ]);
        summary
    }

    #[test]
    fn test_failure_lines() {
        let rec = MountRecord::failed(MountKind::Overlay, "/usr", "stale layer");
        assert_eq!(
            rec.failure_line().as_deref(),
            Some("Failed to overlay mount /usr: stale layer")
        );
        let rec = MountRecord::failed(MountKind::Bind, "/dev", "EPERM");
        assert_eq!(rec.failure_line().as_deref(), Some("Failed to mount /dev: EPERM"));
        assert!(MountRecord::mounted(MountKind::Pseudo, "/tmp").failure_line().is_none());
    }

    #[test]
    fn test_summary_counts() {
        let summary = sample();
        assert!(!summary.is_complete());
        assert_eq!(summary.failed().len(), 1);
        assert_eq!(summary.count(MountKind::Overlay), 1);
        assert_eq!(
            summary.summary_line(),
            "sandbox partially built: 1 overlays, 2 bridge mounts, 1 failed"
        );
    }

    #[test]
    fn test_skipped_is_not_failure() {
        let mut summary = BuildSummary::new(Path::new("/ws"), Path::new("/ws/chroot"));
        summary.extend([MountRecord::skipped(MountKind::Overlay, "/sys", "excluded")]);
        assert!(summary.is_complete());
    }

    #[test]
    fn test_json_report_shape() {
        let json = sample().to_json().expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse back");
        let records = value["records"].as_array().expect("records array");
        assert_eq!(records.len(), 5);
        assert_eq!(records[0]["kind"], "overlay");
        assert_eq!(records[0]["status"], "mounted");
        assert_eq!(records[2]["status"], "failed");
        assert_eq!(records[2]["reason"], "EBUSY");
    }
}
