//! Parsing of `/proc/self/mountinfo`.
//!
//! Used to answer "which filesystem is mounted exactly at this path". A path
//! that is not itself a mount boundary has no entry, which callers treat as
//! "type unknown".

use std::fs;
use std::path::{Path, PathBuf};

/// Field index for mount point in /proc/self/mountinfo.
const MOUNT_POINT_FIELD: usize = 4;

/// First field that may be an optional field or the `-` separator.
const OPTIONAL_FIELDS_START: usize = 6;

/// One line of mountinfo reduced to what classification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Parses mountinfo text.
///
/// Lines have the form
/// `36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue`,
/// where the optional fields end with a lone `-` and the filesystem type follows it.
/// Malformed lines are skipped.
#[must_use]
pub fn parse(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let mount_point = fields.get(MOUNT_POINT_FIELD)?;
            let separator = OPTIONAL_FIELDS_START
                + fields
                    .iter()
                    .skip(OPTIONAL_FIELDS_START)
                    .position(|f| *f == "-")?;
            let fs_type = fields.get(separator + 1)?;
            Some(MountEntry {
                mount_point: PathBuf::from(unescape(mount_point)),
                fs_type: (*fs_type).to_string(),
            })
        })
        .collect()
}

/// Returns the type of the filesystem mounted exactly at `path`.
///
/// When several mounts stack on one path the last (topmost) one wins.
#[must_use]
pub fn fs_type_at(entries: &[MountEntry], path: &Path) -> Option<String> {
    entries
        .iter()
        .rev()
        .find(|e| e.mount_point == path)
        .map(|e| e.fs_type.clone())
}

/// Reads and parses the calling process's mount table.
pub fn read_self() -> std::io::Result<Vec<MountEntry>> {
    fs::read_to_string("/proc/self/mountinfo").map(|content| parse(&content))
}

/// Undoes the octal escaping mountinfo applies to spaces, tabs, newlines and backslashes.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_triplet(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_triplet(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec shared:12 - proc proc rw
24 22 0:5 / /dev rw,nosuid shared:2 - devtmpfs udev rw,size=8000k
25 22 0:22 / /sys rw,nosuid,nodev,noexec shared:7 - sysfs sysfs rw
26 22 8:2 / /home rw,relatime - xfs /dev/sda2 rw
27 22 0:30 / /mnt/my\\040disk rw - vfat /dev/sdb1 rw
";

    #[test]
    fn test_parse_sample() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[0].fs_type, "ext4");
        assert_eq!(entries[2].fs_type, "devtmpfs");
    }

    #[test]
    fn test_fs_type_at_exact_boundary_only() {
        let entries = parse(SAMPLE);
        assert_eq!(fs_type_at(&entries, Path::new("/proc")).as_deref(), Some("proc"));
        assert_eq!(fs_type_at(&entries, Path::new("/home")).as_deref(), Some("xfs"));
        assert_eq!(fs_type_at(&entries, Path::new("/usr")), None);
    }

    #[test]
    fn test_unescape_space() {
        let entries = parse(SAMPLE);
        assert_eq!(entries[5].mount_point, PathBuf::from("/mnt/my disk"));
        assert_eq!(unescape("/plain"), "/plain");
        assert_eq!(unescape("/a\\011b"), "/a\tb");
        assert_eq!(unescape("/trailing\\"), "/trailing\\");
    }

    #[test]
    fn test_topmost_mount_wins() {
        let content = "\
30 22 0:40 / /tmp rw - ext4 /dev/sda1 rw
31 30 0:41 / /tmp rw - tmpfs tmpfs rw
";
        let entries = parse(content);
        assert_eq!(fs_type_at(&entries, Path::new("/tmp")).as_deref(), Some("tmpfs"));
    }

    #[test]
    fn test_dash_mount_point_is_not_separator() {
        let content = "40 22 0:50 - /- rw - ext4 /dev/sdc1 rw\n41 22 0:51 / - rw shared:3 - xfs /dev/sdd1 rw\n";
        let entries = parse(content);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mount_point, PathBuf::from("/-"));
        assert_eq!(entries[0].fs_type, "ext4");
        assert_eq!(entries[1].mount_point, PathBuf::from("-"));
        assert_eq!(entries[1].fs_type, "xfs");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let entries = parse("garbage\n1 2 3\n");
        assert!(entries.is_empty());
    }
}
