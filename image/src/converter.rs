use crate::error::ImageError;
use crate::ext4::Ext4Builder;
use crate::extract::extract_layers;
use crate::layout::{clean_index, select_manifest};
use crate::paths::{
    CACHE_EXT4_FILE, CACHE_IMAGE_FILE, CACHE_METADATA_FILE, CACHE_ROOTFS_DIR, converted_dir,
    create_dir_all, write_atomic,
};
use crate::types::{ConvertedImage, Platform};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Turns an OCI layout into a rootfs directory and ext4 image for one
/// platform.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        oci_layout: &Path,
        platform: &Platform,
    ) -> Result<ConvertedImage, ImageError>;
}

/// Extracts the platform's layers, builds the ext4 image and writes the
/// `metadata.json` and `image.json` sidecars under
/// `<oci_layout>/converted/<os>_<arch>/`.
pub struct OciFilesystemConverter {
    ext4: Arc<dyn Ext4Builder>,
}

impl OciFilesystemConverter {
    pub fn new(ext4: Arc<dyn Ext4Builder>) -> Self {
        Self { ext4 }
    }
}

struct Prepared {
    dest: PathBuf,
    rootfs: PathBuf,
    manifest_digest: String,
    metadata: crate::types::ImageConfig,
}

fn prepare_rootfs(oci_layout: &Path, platform: &Platform) -> Result<Prepared, ImageError> {
    clean_index(oci_layout)?;
    let selected = select_manifest(oci_layout, platform)?;

    let dest = converted_dir(oci_layout, platform);
    let rootfs = dest.join(CACHE_ROOTFS_DIR);

    // A previous attempt may have left a partial tree behind.
    match fs::remove_dir_all(&rootfs) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    create_dir_all(&dest)?;

    tracing::info!(
        layout = %oci_layout.display(),
        platform = %platform,
        digest = %selected.descriptor.digest,
        layers = selected.manifest.layers.len(),
        "Extracting image layers"
    );
    extract_layers(oci_layout, &selected.manifest.layers, &rootfs)?;

    Ok(Prepared {
        dest,
        rootfs,
        manifest_digest: selected.descriptor.digest,
        metadata: selected.config,
    })
}

#[async_trait]
impl Converter for OciFilesystemConverter {
    async fn convert(
        &self,
        oci_layout: &Path,
        platform: &Platform,
    ) -> Result<ConvertedImage, ImageError> {
        let prepared = {
            let oci_layout = oci_layout.to_path_buf();
            let platform = platform.clone();
            tokio::task::spawn_blocking(move || prepare_rootfs(&oci_layout, &platform))
                .await
                .map_err(|e| ImageError::InvalidLayout(format!("conversion task failed: {}", e)))??
        };

        let ext4_path = prepared.dest.join(CACHE_EXT4_FILE);
        self.ext4.build(&prepared.rootfs, &ext4_path).await?;

        let metadata_path = prepared.dest.join(CACHE_METADATA_FILE);
        write_atomic(
            &metadata_path,
            &serde_json::to_vec_pretty(&prepared.metadata)?,
        )?;

        let converted = ConvertedImage {
            rootfs_path: prepared.rootfs,
            ext4_path,
            metadata_path,
            metadata: prepared.metadata,
            platform: platform.clone(),
            manifest_digest: prepared.manifest_digest,
            cached_at: Utc::now(),
        };
        write_atomic(
            &prepared.dest.join(CACHE_IMAGE_FILE),
            &serde_json::to_vec_pretty(&converted)?,
        )?;

        tracing::info!(
            rootfs = %converted.rootfs_path.display(),
            ext4 = %converted.ext4_path.display(),
            "Converted image"
        );
        Ok(converted)
    }
}

/// Memoizes another converter, first in memory and then through the
/// `image.json` sidecar. Entries whose artifacts vanished are rebuilt.
pub struct CachedConverter {
    inner: Arc<dyn Converter>,
    converted: Mutex<HashMap<String, ConvertedImage>>,
}

impl CachedConverter {
    pub fn new(inner: Arc<dyn Converter>) -> Self {
        Self {
            inner,
            converted: Mutex::new(HashMap::new()),
        }
    }

    fn key(oci_layout: &Path, platform: &Platform) -> String {
        format!("{}-{}-{}", oci_layout.display(), platform.os, platform.arch)
    }
}

/// Loads the `image.json` sidecar for `(oci_layout, platform)` if it is
/// present and every artifact it names still exists.
pub fn load_converted(oci_layout: &Path, platform: &Platform) -> Option<ConvertedImage> {
    let path = converted_dir(oci_layout, platform).join(CACHE_IMAGE_FILE);
    let data = fs::read(&path).ok()?;
    match serde_json::from_slice::<ConvertedImage>(&data) {
        Ok(image) if image.is_valid() => Some(image),
        Ok(_) => {
            tracing::debug!(sidecar = %path.display(), "Cached image artifacts missing");
            None
        }
        Err(e) => {
            tracing::warn!(sidecar = %path.display(), error = %e, "Ignoring unreadable sidecar");
            None
        }
    }
}

#[async_trait]
impl Converter for CachedConverter {
    async fn convert(
        &self,
        oci_layout: &Path,
        platform: &Platform,
    ) -> Result<ConvertedImage, ImageError> {
        let key = Self::key(oci_layout, platform);
        let mut converted = self.converted.lock().await;

        if let Some(image) = converted.get(&key) {
            if image.is_valid() {
                tracing::debug!(key = %key, "Converted image found in memory cache");
                return Ok(image.clone());
            }
            converted.remove(&key);
        }

        if let Some(image) = load_converted(oci_layout, platform) {
            tracing::debug!(key = %key, "Converted image found on disk");
            converted.insert(key, image.clone());
            return Ok(image);
        }

        let image = self.inner.convert(oci_layout, platform).await?;
        converted.insert(key, image.clone());
        Ok(image)
    }
}
