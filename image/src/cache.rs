use crate::converter::{CachedConverter, Converter, OciFilesystemConverter};
use crate::error::ImageError;
use crate::ext4::Ext4Builder;
use crate::fetcher::{CachedFetcher, ExecImageFetcher, Fetcher};
use crate::paths::{
    CACHE_RECORD_FILE, DEFAULT_CACHE_EXPIRATION, OCI_LAYOUT_PREFIX, create_dir_all, dir_size,
    oci_layout_dir_name, write_atomic,
};
use crate::types::{ConvertedImage, Platform};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Artifacts recorded for one converted manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub rootfs_path: PathBuf,
    pub ext4_path: PathBuf,
    pub metadata_path: PathBuf,
    pub oci_layout_path: PathBuf,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
    pub platform: Platform,
}

impl ManifestRecord {
    pub fn is_valid(&self) -> bool {
        self.rootfs_path.is_dir()
            && self.ext4_path.is_file()
            && self.metadata_path.is_file()
            && self.oci_layout_path.is_dir()
    }

    fn converted_dir(&self) -> Option<&Path> {
        self.ext4_path.parent()
    }
}

/// Per-ref cache record kept in `cache-metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub image_ref: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// platform -> manifest digest
    pub platforms: BTreeMap<String, String>,
    /// manifest digest -> artifacts
    pub manifests: BTreeMap<String, ManifestRecord>,
}

impl CacheRecord {
    fn new(image_ref: &str, now: DateTime<Utc>, expiration: Duration) -> Self {
        Self {
            image_ref: image_ref.to_string(),
            cached_at: now,
            expires_at: now + expiration,
            platforms: BTreeMap::new(),
            manifests: BTreeMap::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The manifest recorded for `platform`, if all its files still exist.
    pub fn valid_manifest(&self, platform: &Platform) -> Option<&ManifestRecord> {
        let digest = self.platforms.get(&platform.to_string())?;
        self.manifests.get(digest).filter(|m| m.is_valid())
    }

    pub fn size(&self) -> u64 {
        self.manifests.values().map(|m| m.size).sum()
    }
}

/// Outcome of a GC pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed: Vec<String>,
    pub reclaimed_bytes: u64,
}

/// Two-tier image cache: a fetcher produces an OCI layout, a converter turns
/// it into a rootfs and ext4 image. Nothing is evicted implicitly; expired
/// entries are only removed through [`ImageCache::clean_expired_cache`] and
/// [`ImageCache::clear_cache`].
pub struct ImageCache {
    root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    converter: Arc<dyn Converter>,
    expiration: Duration,
    records: Mutex<()>,
}

impl ImageCache {
    pub fn new(
        root: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            root: root.into(),
            fetcher,
            converter,
            expiration: Duration::from_std(DEFAULT_CACHE_EXPIRATION)
                .unwrap_or_else(|_| Duration::hours(24)),
            records: Mutex::new(()),
        }
    }

    /// Cache backed by an external copy tool and the filesystem converter,
    /// both wrapped in their memoizing layers.
    pub fn with_fetch_tool(
        root: impl Into<PathBuf>,
        fetch_tool: impl Into<PathBuf>,
        ext4: Arc<dyn Ext4Builder>,
    ) -> Self {
        let root = root.into();
        let fetcher = CachedFetcher::new(
            Arc::new(ExecImageFetcher::new(fetch_tool, root.clone())),
            root.clone(),
        );
        let converter = CachedConverter::new(Arc::new(OciFilesystemConverter::new(ext4)));
        Self::new(root, Arc::new(fetcher), Arc::new(converter))
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, image_ref: &str) -> PathBuf {
        self.root
            .join(oci_layout_dir_name(image_ref))
            .join(CACHE_RECORD_FILE)
    }

    /// Resolves `image_ref` for `platform`, fetching and converting on
    /// first use.
    pub async fn fetch_and_convert(
        &self,
        image_ref: &str,
        platform: &Platform,
    ) -> Result<ConvertedImage, ImageError> {
        tracing::debug!(image = %image_ref, platform = %platform, "Resolving image");

        let layout = self.fetcher.fetch_to_oci_layout(image_ref).await?;
        let image = self.converter.convert(&layout, platform).await?;

        self.record(image_ref, &layout, &image).await?;
        Ok(image)
    }

    async fn record(
        &self,
        image_ref: &str,
        layout: &Path,
        image: &ConvertedImage,
    ) -> Result<(), ImageError> {
        let _guard = self.records.lock().await;
        let path = self.record_path(image_ref);
        let now = Utc::now();

        let mut record = read_record(&path)
            .unwrap_or_else(|| CacheRecord::new(image_ref, now, self.expiration));
        record.cached_at = now;
        record.expires_at = now + self.expiration;

        let size = {
            let rootfs = image.rootfs_path.clone();
            let ext4 = image.ext4_path.clone();
            tokio::task::spawn_blocking(move || dir_size(&rootfs) + dir_size(&ext4))
                .await
                .unwrap_or_default()
        };

        record
            .platforms
            .insert(image.platform.to_string(), image.manifest_digest.clone());
        record.manifests.insert(
            image.manifest_digest.clone(),
            ManifestRecord {
                rootfs_path: image.rootfs_path.clone(),
                ext4_path: image.ext4_path.clone(),
                metadata_path: image.metadata_path.clone(),
                oci_layout_path: layout.to_path_buf(),
                size,
                cached_at: image.cached_at,
                platform: image.platform.clone(),
            },
        );

        write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }

    /// Every readable cache record under the root, sorted by ref.
    pub async fn list_cached_images(&self) -> Result<Vec<CacheRecord>, ImageError> {
        let root = self.root.clone();
        let mut records: Vec<CacheRecord> = tokio::task::spawn_blocking(move || {
            ref_dirs(&root).map(|dirs| {
                dirs.iter()
                    .filter_map(|dir| read_record(&dir.join(CACHE_RECORD_FILE)))
                    .collect()
            })
        })
        .await
        .map_err(|e| ImageError::Io(std::io::Error::other(e)))??;
        records.sort_by(|a, b| a.image_ref.cmp(&b.image_ref));
        Ok(records)
    }

    /// Removes every ref whose record expired at or before `now`.
    pub async fn clean_expired_cache(&self, now: DateTime<Utc>) -> Result<CleanReport, ImageError> {
        let _guard = self.records.lock().await;
        let root = self.root.clone();
        let report = tokio::task::spawn_blocking(move || {
            remove_refs(&root, |record| record.is_some_and(|r| r.is_expired(now)))
        })
        .await
        .map_err(|e| ImageError::Io(std::io::Error::other(e)))??;

        tracing::info!(
            removed = report.removed.len(),
            reclaimed_bytes = report.reclaimed_bytes,
            "Cleaned expired images"
        );
        Ok(report)
    }

    /// Removes every cached ref, with or without a record.
    pub async fn clear_cache(&self) -> Result<CleanReport, ImageError> {
        let _guard = self.records.lock().await;
        let root = self.root.clone();
        let report = tokio::task::spawn_blocking(move || remove_refs(&root, |_| true))
            .await
            .map_err(|e| ImageError::Io(std::io::Error::other(e)))??;

        tracing::info!(
            removed = report.removed.len(),
            reclaimed_bytes = report.reclaimed_bytes,
            "Cleared image cache"
        );
        Ok(report)
    }
}

fn read_record(path: &Path) -> Option<CacheRecord> {
    let data = fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(record = %path.display(), error = %e, "Ignoring unreadable cache record");
            None
        }
    }
}

fn ref_dirs(root: &Path) -> Result<Vec<PathBuf>, ImageError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let is_ref = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(OCI_LAYOUT_PREFIX));
        if is_ref && entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn remove_tree(path: &Path) -> Result<u64, ImageError> {
    let size = dir_size(path);
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn remove_refs(
    root: &Path,
    select: impl Fn(Option<&CacheRecord>) -> bool,
) -> Result<CleanReport, ImageError> {
    create_dir_all(root)?;
    let mut report = CleanReport::default();

    for dir in ref_dirs(root)? {
        let record = read_record(&dir.join(CACHE_RECORD_FILE));
        if !select(record.as_ref()) {
            continue;
        }

        // Layouts outside the cache root only lose their converted output.
        if let Some(record) = &record {
            for manifest in record.manifests.values() {
                if manifest.oci_layout_path.starts_with(&dir) {
                    continue;
                }
                if let Some(converted) = manifest.converted_dir() {
                    report.reclaimed_bytes += remove_tree(converted)?;
                }
            }
        }

        report.reclaimed_bytes += remove_tree(&dir)?;
        let name = record.map(|r| r.image_ref).unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        tracing::debug!(image = %name, dir = %dir.display(), "Removed cached image");
        report.removed.push(name);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::layout_archive;
    use crate::converter::tests::{FakeExt4Builder, alpine_layout};
    use crate::fetcher::{LocalLayoutFetcher, MemoryMapFetcher};
    use tempfile::TempDir;

    fn memory_cache(root: &Path) -> ImageCache {
        let src = TempDir::new().unwrap();
        alpine_layout(src.path());
        let archive = layout_archive(src.path(), "alpine").unwrap();

        let fetcher = MemoryMapFetcher::new(root)
            .with_archive("docker.io/library/alpine:latest", archive);
        let converter = CachedConverter::new(Arc::new(OciFilesystemConverter::new(Arc::new(
            FakeExt4Builder,
        ))));
        ImageCache::new(root, Arc::new(fetcher), Arc::new(converter))
    }

    #[tokio::test]
    async fn test_fetch_and_convert_records_artifacts() {
        let root = TempDir::new().unwrap();
        let cache = memory_cache(root.path());
        let platform = Platform::linux_arm64();

        let image = cache
            .fetch_and_convert("docker.io/library/alpine:latest", &platform)
            .await
            .unwrap();
        assert!(image.is_valid());
        assert!(image.rootfs_path.starts_with(
            root.path()
                .join("oci-layout-docker.io_library_alpine_latest/converted/linux_arm64")
        ));

        let records = cache.list_cached_images().await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.image_ref, "docker.io/library/alpine:latest");
        assert_eq!(record.platforms["linux/arm64"], image.manifest_digest);
        assert!(record.expires_at > record.cached_at);
        assert!(record.valid_manifest(&platform).is_some());
        assert!(record.size() > 0);

        fs::remove_file(&image.ext4_path).unwrap();
        let records = cache.list_cached_images().await.unwrap();
        assert!(records[0].valid_manifest(&platform).is_none());
    }

    #[tokio::test]
    async fn test_missing_ref_is_not_found() {
        let root = TempDir::new().unwrap();
        let cache = memory_cache(root.path());

        let err = cache
            .fetch_and_convert("nonexistent:1", &Platform::linux_arm64())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
        assert!(cache.list_cached_images().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_expired_cache() {
        let root = TempDir::new().unwrap();
        let cache = memory_cache(root.path());
        cache
            .fetch_and_convert("docker.io/library/alpine:latest", &Platform::linux_amd64())
            .await
            .unwrap();

        let report = cache.clean_expired_cache(Utc::now()).await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(cache.list_cached_images().await.unwrap().len(), 1);

        let later = Utc::now() + Duration::hours(25);
        let report = cache.clean_expired_cache(later).await.unwrap();
        assert_eq!(report.removed, vec!["docker.io/library/alpine:latest"]);
        assert!(report.reclaimed_bytes > 0);
        assert!(cache.list_cached_images().await.unwrap().is_empty());
        assert!(
            !root
                .path()
                .join("oci-layout-docker.io_library_alpine_latest")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_clear_cache_keeps_external_layouts() {
        let root = TempDir::new().unwrap();
        let external = TempDir::new().unwrap();
        alpine_layout(external.path());

        let fetcher = LocalLayoutFetcher::new().with_layout("local/alpine:1", external.path());
        let converter = OciFilesystemConverter::new(Arc::new(FakeExt4Builder));
        let cache = ImageCache::new(root.path(), Arc::new(fetcher), Arc::new(converter));

        let image = cache
            .fetch_and_convert("local/alpine:1", &Platform::linux_arm64())
            .await
            .unwrap();
        assert!(image.rootfs_path.starts_with(external.path()));

        let report = cache.clear_cache().await.unwrap();
        assert_eq!(report.removed, vec!["local/alpine:1"]);
        assert!(!image.rootfs_path.exists());
        assert!(external.path().join("index.json").is_file());
    }
}
