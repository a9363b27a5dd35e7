use crate::error::ImageError;
use crate::layout::{BLOBS_DIR, INDEX_FILE, LAYOUT_FILE};
use crate::paths::create_dir_all;
use crate::types::{
    ContainerConfig, Descriptor, ImageConfig, ImageIndex, ImageManifest, MEDIA_TYPE_OCI_CONFIG,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST, OciPlatform,
    Platform,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

#[derive(Debug, Clone)]
pub enum LayerEntryKind {
    Dir,
    File(Vec<u8>),
    Symlink(String),
    Hardlink(String),
    Fifo,
}

/// One entry of a synthetic image layer.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    pub path: String,
    pub mode: u32,
    pub kind: LayerEntryKind,
}

impl LayerEntry {
    pub fn dir(path: &str, mode: u32) -> Self {
        Self {
            path: path.to_string(),
            mode,
            kind: LayerEntryKind::Dir,
        }
    }

    pub fn file(path: &str, contents: &str, mode: u32) -> Self {
        Self::file_bytes(path, contents.as_bytes(), mode)
    }

    pub fn file_bytes(path: &str, contents: &[u8], mode: u32) -> Self {
        Self {
            path: path.to_string(),
            mode,
            kind: LayerEntryKind::File(contents.to_vec()),
        }
    }

    pub fn symlink(path: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            mode: 0o777,
            kind: LayerEntryKind::Symlink(target.to_string()),
        }
    }

    pub fn hardlink(path: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            mode: 0o644,
            kind: LayerEntryKind::Hardlink(target.to_string()),
        }
    }

    pub fn fifo(path: &str) -> Self {
        Self {
            path: path.to_string(),
            mode: 0o644,
            kind: LayerEntryKind::Fifo,
        }
    }
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn header_for(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header
}

/// Uncompressed tar of `entries`, in the given order.
pub fn layer_tar(entries: &[LayerEntry]) -> Result<Vec<u8>, ImageError> {
    let mut builder = Builder::new(Vec::new());
    for entry in entries {
        match &entry.kind {
            LayerEntryKind::Dir => {
                let mut header = header_for(EntryType::Directory, entry.mode, 0);
                builder.append_data(&mut header, &entry.path, std::io::empty())?;
            }
            LayerEntryKind::File(data) => {
                let mut header = header_for(EntryType::Regular, entry.mode, data.len() as u64);
                builder.append_data(&mut header, &entry.path, data.as_slice())?;
            }
            LayerEntryKind::Symlink(target) => {
                let mut header = header_for(EntryType::Symlink, entry.mode, 0);
                builder.append_link(&mut header, &entry.path, target)?;
            }
            LayerEntryKind::Hardlink(target) => {
                let mut header = header_for(EntryType::Link, entry.mode, 0);
                builder.append_link(&mut header, &entry.path, target)?;
            }
            LayerEntryKind::Fifo => {
                let mut header = header_for(EntryType::Fifo, entry.mode, 0);
                builder.append_data(&mut header, &entry.path, std::io::empty())?;
            }
        }
    }
    Ok(builder.into_inner()?)
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, ImageError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Writes a standard OCI image layout: content-addressed blobs, one
/// manifest per added image and an `index.json` listing them.
pub struct OciLayoutBuilder {
    root: PathBuf,
    manifests: Vec<Descriptor>,
}

impl OciLayoutBuilder {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            manifests: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn add_blob(&self, data: &[u8]) -> Result<(String, i64), ImageError> {
        let digest = sha256_digest(data);
        let (alg, hex) = digest.split_once(':').unwrap_or(("sha256", digest.as_str()));
        let dir = self.root.join(BLOBS_DIR).join(alg);
        create_dir_all(&dir)?;
        fs::write(dir.join(hex), data)?;
        Ok((digest, data.len() as i64))
    }

    /// Adds an image built from `layers` (lowest first) and records its
    /// manifest in the index with a platform field.
    pub fn add_image(
        &mut self,
        platform: &Platform,
        layers: &[Vec<LayerEntry>],
        cmd: &[&str],
    ) -> Result<Descriptor, ImageError> {
        let mut layer_descs = Vec::new();
        let mut diff_ids = Vec::new();
        for entries in layers {
            let tar = layer_tar(entries)?;
            diff_ids.push(serde_json::Value::String(sha256_digest(&tar)));
            let (digest, size) = self.add_blob(&gzip(&tar)?)?;
            layer_descs.push(Descriptor::new(MEDIA_TYPE_OCI_LAYER_GZIP, &digest, size));
        }

        let mut extra = serde_json::Map::new();
        extra.insert(
            "rootfs".to_string(),
            serde_json::json!({ "type": "layers", "diff_ids": diff_ids }),
        );
        let config = ImageConfig {
            architecture: platform.arch.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
            created: None,
            config: Some(ContainerConfig {
                env: Some(vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                ]),
                cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }),
            extra,
        };
        let (config_digest, config_size) = self.add_blob(&serde_json::to_vec(&config)?)?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, &config_digest, config_size),
            layers: layer_descs,
            annotations: BTreeMap::new(),
        };
        let (digest, size) = self.add_blob(&serde_json::to_vec(&manifest)?)?;

        let mut desc = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, &digest, size);
        desc.platform = Some(OciPlatform::from(platform));
        self.manifests.push(desc.clone());
        Ok(desc)
    }

    pub fn finish(self) -> Result<PathBuf, ImageError> {
        create_dir_all(&self.root)?;
        fs::write(
            self.root.join(LAYOUT_FILE),
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: self.manifests,
            extra: serde_json::Map::new(),
        };
        fs::write(
            self.root.join(INDEX_FILE),
            serde_json::to_vec_pretty(&index)?,
        )?;
        Ok(self.root)
    }
}

/// Gzip-compressed tar of the layout directory below a single top-level
/// directory named `top`, the shape the memory fetcher expects.
pub fn layout_archive(layout: &Path, top: &str) -> Result<Vec<u8>, ImageError> {
    let mut builder = Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);
    builder.append_dir_all(top, layout)?;
    let tar = builder.into_inner()?;
    gzip(&tar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{blob_path, read_index};
    use tempfile::TempDir;

    #[test]
    fn test_builder_writes_content_addressed_blobs() {
        let tmp = TempDir::new().unwrap();
        let mut builder = OciLayoutBuilder::new(tmp.path());
        let desc = builder
            .add_image(
                &Platform::linux_arm64(),
                &[vec![LayerEntry::file("hello", "world", 0o644)]],
                &["echo", "hello"],
            )
            .unwrap();
        builder.finish().unwrap();

        let manifest_bytes = fs::read(blob_path(tmp.path(), &desc.digest).unwrap()).unwrap();
        assert_eq!(sha256_digest(&manifest_bytes), desc.digest);
        assert_eq!(desc.size, manifest_bytes.len() as i64);

        let index = read_index(tmp.path()).unwrap();
        assert_eq!(index.manifests, vec![desc]);
        assert!(tmp.path().join(LAYOUT_FILE).is_file());
    }
}
