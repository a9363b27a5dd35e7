use crate::Platform;
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CACHE_METADATA_FILE: &str = "metadata.json";
pub const CACHE_ROOTFS_DIR: &str = "rootfs";
pub const CACHE_EXT4_FILE: &str = "rootfs.ext4";
pub const CACHE_IMAGE_FILE: &str = "image.json";
pub const CACHE_RECORD_FILE: &str = "cache-metadata.json";
pub const CONVERTED_DIR: &str = "converted";
pub const OCI_LAYOUT_PREFIX: &str = "oci-layout-";

pub const CACHE_DIR_PERM: u32 = 0o755;
pub const CACHE_FILE_PERM: u32 = 0o644;

pub const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_IMAGE_SIZE: u64 = 1024 * 1024 * 1024;

/// `oci-layout-` followed by the ref with `/` and `:` replaced by `_`.
pub fn oci_layout_dir_name(image_ref: &str) -> String {
    let sanitized: String = image_ref
        .chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect();
    format!("{}{}", OCI_LAYOUT_PREFIX, sanitized)
}

/// `<oci_layout>/converted/<os>_<arch>`
pub fn converted_dir(oci_layout: &Path, platform: &Platform) -> PathBuf {
    oci_layout.join(CONVERTED_DIR).join(platform.dir_name())
}

pub(crate) fn create_dir_all(path: &Path) -> std::io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(CACHE_DIR_PERM)
        .create(path)
}

/// Writes to a temporary sibling, then renames over `path` so readers never
/// observe a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(CACHE_FILE_PERM)
        .open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::set_permissions(&tmp, Permissions::from_mode(CACHE_FILE_PERM))?;
    fs::rename(&tmp, path)
}

/// Total apparent size of regular files below `path`.
pub(crate) fn dir_size(path: &Path) -> u64 {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return 0,
    };
    if meta.is_file() {
        return meta.len();
    }
    if !meta.is_dir() {
        return 0;
    }
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|e| dir_size(&e.path()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_oci_layout_dir_name() {
        assert_eq!(
            oci_layout_dir_name("docker.io/library/alpine:latest"),
            "oci-layout-docker.io_library_alpine_latest"
        );
        assert_eq!(oci_layout_dir_name("nonexistent:1"), "oci-layout-nonexistent_1");
    }

    #[test]
    fn test_converted_dir() {
        let dir = converted_dir(Path::new("/cache/oci-layout-x"), &Platform::linux_arm64());
        assert_eq!(dir, PathBuf::from("/cache/oci-layout-x/converted/linux_arm64"));
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("image.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, CACHE_FILE_PERM);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_dir_size() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a"), vec![0u8; 10]).unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d").join("b"), vec![0u8; 5]).unwrap();
        assert_eq!(dir_size(tmp.path()), 15);
    }
}
