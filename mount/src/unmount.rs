use crate::error::MountError;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use std::path::{Path, PathBuf};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Decodes the octal escapes (`\040` and friends) used in mountinfo paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let v = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(v as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points from a mountinfo table.
pub fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Mount points at or below `root`, deepest first.
pub fn mounts_under(table: &[PathBuf], root: &Path) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = table
        .iter()
        .filter(|m| m.starts_with(root))
        .cloned()
        .collect();
    mounts.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| b.cmp(a))
    });
    mounts
}

/// Force-unmounts `root` and every mount below it. Paths that are not
/// mounted are skipped; busy mounts fall back to a lazy detach.
pub fn unmount_recursive(root: &Path) -> Result<(), MountError> {
    let content = match std::fs::read_to_string(MOUNTINFO) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for target in mounts_under(&parse_mountinfo(&content), root) {
        unmount(&target)?;
    }
    Ok(())
}

/// Force-unmounts a single mount point.
pub fn unmount(target: &Path) -> Result<(), MountError> {
    tracing::debug!(target = %target.display(), "Unmounting");

    match umount2(target, MntFlags::MNT_FORCE) {
        Ok(()) => {}
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => return Ok(()),
        Err(Errno::EBUSY) => {
            tracing::warn!(target = %target.display(), "Mount busy, detaching");
            umount2(target, MntFlags::MNT_DETACH).map_err(|errno| MountError::Unmount {
                target: target.to_path_buf(),
                errno,
            })?;
        }
        Err(errno) => {
            return Err(MountError::Unmount {
                target: target.to_path_buf(),
                errno,
            });
        }
    }

    tracing::info!(target = %target.display(), "Unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 0:35 / /run/skiff/c1/rootfs rw shared:20 - overlay overlay rw,lowerdir=/l
41 40 0:36 / /run/skiff/c1/rootfs/proc rw - proc proc rw
42 40 8:1 /data /run/skiff/c1/rootfs/mnt/my\\040data rw - ext4 /dev/sda1 rw
43 22 0:37 / /run/skiff/c10/rootfs rw - overlay overlay rw
";

    #[test]
    fn test_parse_mountinfo_unescapes() {
        let mounts = parse_mountinfo(TABLE);
        assert_eq!(mounts.len(), 5);
        assert_eq!(
            mounts[3],
            PathBuf::from("/run/skiff/c1/rootfs/mnt/my data")
        );
    }

    #[test]
    fn test_mounts_under_deepest_first() {
        let mounts = parse_mountinfo(TABLE);
        let under = mounts_under(&mounts, Path::new("/run/skiff/c1/rootfs"));
        assert_eq!(
            under,
            vec![
                PathBuf::from("/run/skiff/c1/rootfs/mnt/my data"),
                PathBuf::from("/run/skiff/c1/rootfs/proc"),
                PathBuf::from("/run/skiff/c1/rootfs"),
            ]
        );
    }

    #[test]
    fn test_unmount_recursive_without_mounts() {
        let tmp = tempfile::TempDir::new().unwrap();
        unmount_recursive(tmp.path()).unwrap();
    }
}
