use crate::error::ImageError;
use crate::extract::pack_rootfs;
use crate::paths::{MAX_IMAGE_SIZE, create_dir_all, dir_size};
use async_trait::async_trait;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Fixed identifiers keep repeated builds of the same tree byte-identical.
const FS_UUID: &str = "6b1f3a4e-2c1d-4f7e-9a52-0d3c5e7b8a91";
const FS_HASH_SEED: &str = "1d5e0f6a-7b2c-4e3d-8f91-a0b1c2d3e4f5";
const MIN_IMAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Turns a rootfs directory into a single-file ext4 block image.
#[async_trait]
pub trait Ext4Builder: Send + Sync {
    async fn build(&self, rootfs: &Path, output: &Path) -> Result<(), ImageError>;
}

/// Builds images with `mkfs.ext4 -d`, fed from a deterministic tar of the
/// rootfs.
pub struct MkfsExt4Builder {
    tool: PathBuf,
    max_size: u64,
}

impl Default for MkfsExt4Builder {
    fn default() -> Self {
        Self::new("mkfs.ext4")
    }
}

impl MkfsExt4Builder {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            max_size: MAX_IMAGE_SIZE,
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }
}

/// Twice the content size, rounded up to a MiB and clamped to
/// `[64 MiB, max]`.
pub fn image_size(content_bytes: u64, max: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    let wanted = content_bytes.saturating_mul(2).div_ceil(MIB) * MIB;
    wanted.clamp(MIN_IMAGE_SIZE.min(max), max)
}

#[async_trait]
impl Ext4Builder for MkfsExt4Builder {
    async fn build(&self, rootfs: &Path, output: &Path) -> Result<(), ImageError> {
        let content = {
            let rootfs = rootfs.to_path_buf();
            tokio::task::spawn_blocking(move || dir_size(&rootfs))
                .await
                .map_err(|e| ImageError::Ext4Build(e.to_string()))?
        };
        if content > self.max_size {
            return Err(ImageError::ImageTooLarge {
                size: content,
                max: self.max_size,
            });
        }

        let parent = output
            .parent()
            .ok_or_else(|| ImageError::Ext4Build(format!("invalid output {}", output.display())))?;
        create_dir_all(parent)?;

        let tar_path = output.with_extension("tar");
        let tmp_path = output.with_extension("ext4.tmp");

        {
            let rootfs = rootfs.to_path_buf();
            let tar_path = tar_path.clone();
            tokio::task::spawn_blocking(move || -> Result<u64, ImageError> {
                let file = fs::File::create(&tar_path)?;
                pack_rootfs(&rootfs, BufWriter::new(file))
            })
            .await
            .map_err(|e| ImageError::Ext4Build(e.to_string()))??;
        }

        let size_kib = image_size(content, self.max_size) / 1024;
        let _ = fs::remove_file(&tmp_path);

        tracing::debug!(
            tool = %self.tool.display(),
            rootfs = %rootfs.display(),
            size_kib,
            "Building ext4 image"
        );

        let output_result = Command::new(&self.tool)
            .arg("-q")
            .arg("-F")
            .arg("-t")
            .arg("ext4")
            .arg("-O")
            .arg("inline_data")
            .arg("-U")
            .arg(FS_UUID)
            .arg("-E")
            .arg(format!("hash_seed={},root_owner=0:0", FS_HASH_SEED))
            .arg("-d")
            .arg(&tar_path)
            .arg(&tmp_path)
            .arg(format!("{}k", size_kib))
            .env("E2FSPROGS_FAKE_TIME", "1")
            .output()
            .await;

        let _ = fs::remove_file(&tar_path);

        let out = output_result.map_err(|e| {
            ImageError::Ext4Build(format!("failed to run {}: {}", self.tool.display(), e))
        })?;
        if !out.status.success() {
            let _ = fs::remove_file(&tmp_path);
            return Err(ImageError::Ext4Build(format!(
                "{} exited with {}: {}",
                self.tool.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        fs::rename(&tmp_path, output)?;
        tracing::info!(output = %output.display(), "Built ext4 image");
        Ok(())
    }
}
