use crate::error::ImageError;
use crate::extract::decompressed;
use crate::layout::INDEX_FILE;
use crate::paths::{create_dir_all, oci_layout_dir_name};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Resolves an image reference to an OCI layout directory on local disk.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_to_oci_layout(&self, image_ref: &str) -> Result<PathBuf, ImageError>;
}

fn has_index(dir: &Path) -> bool {
    dir.join(INDEX_FILE).is_file()
}

/// Serves images from archives held in memory, typically embedded in the
/// binary. Each archive is a (gzip) tar of an OCI layout wrapped in one
/// top-level directory.
pub struct MemoryMapFetcher {
    cache_dir: PathBuf,
    archives: HashMap<String, Arc<[u8]>>,
}

impl MemoryMapFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            archives: HashMap::new(),
        }
    }

    pub fn with_archive(mut self, image_ref: &str, archive: impl Into<Arc<[u8]>>) -> Self {
        self.archives.insert(image_ref.to_string(), archive.into());
        self
    }

    pub fn image_refs(&self) -> impl Iterator<Item = &str> {
        self.archives.keys().map(String::as_str)
    }
}

fn strip_first_component(path: &Path) -> Option<PathBuf> {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir | Component::RootDir));
    components.next()?;
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() || rest.components().any(|c| c == Component::ParentDir) {
        None
    } else {
        Some(rest)
    }
}

fn unpack_archive(image_ref: &str, data: &[u8], dest: &Path) -> Result<(), ImageError> {
    let stream = decompressed(data, image_ref)
        .map_err(|e| ImageError::FetchFailed(format!("{}: {}", image_ref, e)))?;
    let mut archive = Archive::new(stream);
    create_dir_all(dest)?;

    let entries = archive
        .entries()
        .map_err(|e| ImageError::FetchFailed(format!("{}: {}", image_ref, e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| ImageError::FetchFailed(format!("{}: {}", image_ref, e)))?;
        let path = entry
            .path()
            .map_err(|e| ImageError::FetchFailed(format!("{}: {}", image_ref, e)))?
            .into_owned();
        let Some(rel) = strip_first_component(&path) else {
            continue;
        };
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

#[async_trait]
impl Fetcher for MemoryMapFetcher {
    async fn fetch_to_oci_layout(&self, image_ref: &str) -> Result<PathBuf, ImageError> {
        let data = self
            .archives
            .get(image_ref)
            .cloned()
            .ok_or_else(|| ImageError::NotFound(image_ref.to_string()))?;

        let dest = self.cache_dir.join(oci_layout_dir_name(image_ref));
        if has_index(&dest) {
            return Ok(dest);
        }

        tracing::info!(image = %image_ref, dest = %dest.display(), "Extracting embedded image");

        let image_ref_owned = image_ref.to_string();
        let dest_clone = dest.clone();
        tokio::task::spawn_blocking(move || unpack_archive(&image_ref_owned, &data, &dest_clone))
            .await
            .map_err(|e| ImageError::FetchFailed(e.to_string()))??;

        if !has_index(&dest) {
            return Err(ImageError::InvalidLayout(format!(
                "archive for {} has no {}",
                image_ref, INDEX_FILE
            )));
        }
        Ok(dest)
    }
}

/// Fetches by running an external copy tool:
/// `<tool> copy docker://<ref> oci:<dest>`.
pub struct ExecImageFetcher {
    tool: PathBuf,
    cache_dir: PathBuf,
}

impl ExecImageFetcher {
    pub fn new(tool: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            cache_dir: cache_dir.into(),
        }
    }
}

#[async_trait]
impl Fetcher for ExecImageFetcher {
    async fn fetch_to_oci_layout(&self, image_ref: &str) -> Result<PathBuf, ImageError> {
        let dest = self.cache_dir.join(oci_layout_dir_name(image_ref));
        tracing::info!(
            image = %image_ref,
            tool = %self.tool.display(),
            dest = %dest.display(),
            "Fetching image"
        );

        let result = Command::new(&self.tool)
            .arg("copy")
            .arg(format!("docker://{}", image_ref))
            .arg(format!("oci:{}", dest.display()))
            .output()
            .await;

        let failure = match result {
            Ok(out) if out.status.success() => None,
            Ok(out) => Some(format!(
                "{} exited with {}: {}",
                self.tool.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Err(e) => Some(format!("failed to run {}: {}", self.tool.display(), e)),
        };

        if let Some(reason) = failure {
            if let Err(e) = tokio::fs::remove_dir_all(&dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dest = %dest.display(), error = %e, "Failed to remove partial fetch");
                }
            }
            return Err(ImageError::FetchFailed(format!("{}: {}", image_ref, reason)));
        }

        Ok(dest)
    }
}

/// Maps refs to OCI layouts that already exist on disk.
#[derive(Default)]
pub struct LocalLayoutFetcher {
    layouts: HashMap<String, PathBuf>,
}

impl LocalLayoutFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(mut self, image_ref: &str, layout: impl Into<PathBuf>) -> Self {
        self.layouts.insert(image_ref.to_string(), layout.into());
        self
    }
}

#[async_trait]
impl Fetcher for LocalLayoutFetcher {
    async fn fetch_to_oci_layout(&self, image_ref: &str) -> Result<PathBuf, ImageError> {
        match self.layouts.get(image_ref) {
            Some(dir) if has_index(dir) => Ok(dir.clone()),
            _ => Err(ImageError::NotFound(image_ref.to_string())),
        }
    }
}

/// Memoizes another fetcher in memory and reuses layouts already present
/// under `cache_dir`.
pub struct CachedFetcher {
    inner: Arc<dyn Fetcher>,
    cache_dir: PathBuf,
    fetched: Mutex<HashMap<String, PathBuf>>,
}

impl CachedFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
            fetched: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Fetcher for CachedFetcher {
    async fn fetch_to_oci_layout(&self, image_ref: &str) -> Result<PathBuf, ImageError> {
        let mut fetched = self.fetched.lock().await;

        if let Some(dir) = fetched.get(image_ref) {
            if has_index(dir) {
                tracing::debug!(image = %image_ref, "Image layout found in memory cache");
                return Ok(dir.clone());
            }
            fetched.remove(image_ref);
        }

        let on_disk = self.cache_dir.join(oci_layout_dir_name(image_ref));
        if has_index(&on_disk) {
            tracing::debug!(image = %image_ref, dir = %on_disk.display(), "Image layout found on disk");
            fetched.insert(image_ref.to_string(), on_disk.clone());
            return Ok(on_disk);
        }

        let dir = self.inner.fetch_to_oci_layout(image_ref).await?;
        fetched.insert(image_ref.to_string(), dir.clone());
        Ok(dir)
    }
}
