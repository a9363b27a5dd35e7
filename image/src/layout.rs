use crate::error::ImageError;
use crate::paths::write_atomic;
use crate::types::{Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "index.json";
pub const LAYOUT_FILE: &str = "oci-layout";
pub const BLOBS_DIR: &str = "blobs";

/// A manifest chosen for a platform, with the config it points to.
#[derive(Debug, Clone)]
pub struct SelectedImage {
    pub descriptor: Descriptor,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

pub fn read_index(layout: &Path) -> Result<ImageIndex, ImageError> {
    let path = layout.join(INDEX_FILE);
    let data = match fs::read(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ImageError::InvalidLayout(format!(
                "missing {}",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&data)?)
}

/// Drops descriptors that repeat an earlier `(digest, mediaType)` pair.
/// The index is only rewritten when something was dropped.
pub fn clean_index(layout: &Path) -> Result<bool, ImageError> {
    let mut index = read_index(layout)?;
    let original = index.manifests.len();

    let mut seen = HashSet::new();
    index.manifests.retain(|m| {
        let key = format!("{}:{}", m.digest, m.media_type);
        if seen.insert(key) {
            true
        } else {
            tracing::warn!(
                digest = %m.digest,
                media_type = %m.media_type,
                "Removing duplicate manifest entry from index"
            );
            false
        }
    });

    if index.manifests.len() == original {
        return Ok(false);
    }

    let data = serde_json::to_vec_pretty(&index)?;
    write_atomic(&layout.join(INDEX_FILE), &data)?;

    tracing::info!(
        original_count = original,
        cleaned_count = index.manifests.len(),
        "Cleaned duplicate manifest entries"
    );

    Ok(true)
}

/// `sha256:<hex>` -> `<layout>/blobs/sha256/<hex>`
pub fn blob_path(layout: &Path, digest: &str) -> Result<PathBuf, ImageError> {
    let (alg, hex) = digest
        .split_once(':')
        .ok_or_else(|| ImageError::InvalidLayout(format!("malformed digest: {}", digest)))?;

    let valid_alg = !alg.is_empty()
        && alg
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_hex = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !valid_alg || !valid_hex {
        return Err(ImageError::InvalidLayout(format!(
            "malformed digest: {}",
            digest
        )));
    }

    Ok(layout.join(BLOBS_DIR).join(alg).join(hex))
}

pub fn read_blob(layout: &Path, digest: &str) -> Result<Vec<u8>, ImageError> {
    let path = blob_path(layout, digest)?;
    match fs::read(&path) {
        Ok(d) => Ok(d),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ImageError::InvalidLayout(
            format!("missing blob {}", digest),
        )),
        Err(e) => Err(e.into()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(layout: &Path, digest: &str) -> Result<T, ImageError> {
    let data = read_blob(layout, digest)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Flattens `index.json` one level deep: nested indexes contribute their
/// manifests, everything else is returned as is.
fn manifest_candidates(layout: &Path) -> Result<Vec<Descriptor>, ImageError> {
    let index = read_index(layout)?;
    let mut out = Vec::new();
    for desc in index.manifests {
        if desc.is_index() {
            let nested: ImageIndex = read_json(layout, &desc.digest)?;
            out.extend(nested.manifests.into_iter().filter(|d| !d.is_index()));
        } else {
            out.push(desc);
        }
    }
    Ok(out)
}

/// Picks the single manifest matching `platform`. Descriptors without a
/// platform field are resolved through their image config.
pub fn select_manifest(layout: &Path, platform: &Platform) -> Result<SelectedImage, ImageError> {
    let mut available = Vec::new();
    let mut matches: Vec<SelectedImage> = Vec::new();

    for desc in manifest_candidates(layout)? {
        let manifest: ImageManifest = read_json(layout, &desc.digest)?;
        let config: ImageConfig = read_json(layout, &manifest.config.digest)?;

        let (os, arch, variant) = match &desc.platform {
            Some(p) => (p.os.clone(), p.architecture.clone(), p.variant.clone()),
            None => (
                config.os.clone(),
                config.architecture.clone(),
                config.variant.clone(),
            ),
        };

        match &variant {
            Some(v) => available.push(format!("{}/{}/{}", os, arch, v)),
            None => available.push(format!("{}/{}", os, arch)),
        }

        if platform.matches(&os, &arch, variant.as_deref()) {
            matches.push(SelectedImage {
                descriptor: desc,
                manifest,
                config,
            });
        }
    }

    match matches.len() {
        0 => Err(ImageError::PlatformUnavailable {
            platform: platform.to_string(),
            available,
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(ImageError::AmbiguousPlatform {
            platform: platform.to_string(),
            digests: matches.into_iter().map(|m| m.descriptor.digest).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{LayerEntry, OciLayoutBuilder};
    use tempfile::TempDir;

    fn simple_layout(dir: &Path, platforms: &[Platform]) {
        let mut builder = OciLayoutBuilder::new(dir);
        for p in platforms {
            builder
                .add_image(
                    p,
                    &[vec![LayerEntry::file("etc/os", &p.to_string(), 0o644)]],
                    &["/bin/sh"],
                )
                .unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_clean_index_removes_duplicates() {
        let tmp = TempDir::new().unwrap();
        simple_layout(tmp.path(), &[Platform::linux_arm64()]);

        let mut index = read_index(tmp.path()).unwrap();
        let dup = index.manifests[0].clone();
        index.manifests.push(dup);
        fs::write(
            tmp.path().join(INDEX_FILE),
            serde_json::to_vec(&index).unwrap(),
        )
        .unwrap();

        assert!(clean_index(tmp.path()).unwrap());
        assert_eq!(read_index(tmp.path()).unwrap().manifests.len(), 1);

        let before = fs::read(tmp.path().join(INDEX_FILE)).unwrap();
        assert!(!clean_index(tmp.path()).unwrap());
        let after = fs::read(tmp.path().join(INDEX_FILE)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_clean_index_keeps_same_digest_with_other_media_type() {
        let tmp = TempDir::new().unwrap();
        simple_layout(tmp.path(), &[Platform::linux_arm64()]);

        let mut index = read_index(tmp.path()).unwrap();
        let mut other = index.manifests[0].clone();
        other.media_type = "application/vnd.docker.distribution.manifest.v2+json".to_string();
        index.manifests.push(other);
        fs::write(
            tmp.path().join(INDEX_FILE),
            serde_json::to_vec(&index).unwrap(),
        )
        .unwrap();

        assert!(!clean_index(tmp.path()).unwrap());
        assert_eq!(read_index(tmp.path()).unwrap().manifests.len(), 2);
    }

    #[test]
    fn test_select_manifest_by_platform() {
        let tmp = TempDir::new().unwrap();
        simple_layout(
            tmp.path(),
            &[Platform::linux_amd64(), Platform::linux_arm64()],
        );

        let selected = select_manifest(tmp.path(), &Platform::linux_arm64()).unwrap();
        assert_eq!(selected.config.architecture, "arm64");
        assert_eq!(selected.manifest.layers.len(), 1);

        let err = select_manifest(tmp.path(), &"linux/s390x".parse().unwrap()).unwrap_err();
        match err {
            ImageError::PlatformUnavailable { available, .. } => {
                assert_eq!(available.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_select_manifest_reports_ambiguity() {
        let tmp = TempDir::new().unwrap();
        let mut builder = OciLayoutBuilder::new(tmp.path());
        builder
            .add_image(
                &Platform::linux_arm64(),
                &[vec![LayerEntry::file("a", "1", 0o644)]],
                &["/bin/sh"],
            )
            .unwrap();
        builder
            .add_image(
                &Platform::linux_arm64(),
                &[vec![LayerEntry::file("a", "2", 0o644)]],
                &["/bin/sh"],
            )
            .unwrap();
        builder.finish().unwrap();

        let err = select_manifest(tmp.path(), &Platform::linux_arm64()).unwrap_err();
        assert!(matches!(err, ImageError::AmbiguousPlatform { ref digests, .. } if digests.len() == 2));
    }

    #[test]
    fn test_blob_path_rejects_traversal() {
        let root = Path::new("/layout");
        assert_eq!(
            blob_path(root, "sha256:abcdef").unwrap(),
            PathBuf::from("/layout/blobs/sha256/abcdef")
        );
        assert!(blob_path(root, "sha256:../../etc").is_err());
        assert!(blob_path(root, "nodigest").is_err());
        assert!(blob_path(root, "../x:abc").is_err());
    }

    #[test]
    fn test_missing_index_is_invalid_layout() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            read_index(tmp.path()),
            Err(ImageError::InvalidLayout(_))
        ));
    }
}
