//! Layer extraction and rootfs repacking.
//!
//! Layers are applied in order into a single directory. Whiteout entries are
//! skipped rather than applied: the result is a read-only snapshot, so a
//! higher layer only needs to overwrite what it ships.

use crate::error::ImageError;
use crate::layout::blob_path;
use crate::paths::CACHE_DIR_PERM;
use crate::types::Descriptor;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType, Header};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    None,
}

/// Identifies a layer or archive by its leading bytes.
pub fn detect_compression(head: &[u8]) -> Option<Compression> {
    if head.starts_with(&GZIP_MAGIC) {
        return Some(Compression::Gzip);
    }
    if head.len() >= TAR_MAGIC_OFFSET + 5 && &head[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
    {
        return Some(Compression::None);
    }
    None
}

/// Opens a possibly-compressed tar stream from `reader`, sniffing the format.
pub fn decompressed<'a, R: Read + 'a>(
    mut reader: R,
    what: &str,
) -> Result<Box<dyn Read + 'a>, ImageError> {
    let mut head = vec![0u8; 512];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    let compression = detect_compression(&head)
        .ok_or_else(|| ImageError::corrupt_layer(what, "unrecognized archive format"))?;
    let stream = io::Cursor::new(head).chain(reader);
    Ok(match compression {
        Compression::Gzip => Box::new(GzDecoder::new(stream)),
        Compression::None => Box::new(stream),
    })
}

/// Relative path inside the destination, or `None` when the entry would
/// escape it.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn mkdir_all(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(CACHE_DIR_PERM)
        .create(path)
}

/// Symlinks followed while resolving one path, as in the kernel.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolves `rel` to a directory under `root` the way it would resolve with
/// `root` as `/`: symlinks are followed relative to `root` and `..` never
/// climbs above it, so the result cannot leave the rootfs. With `create`,
/// missing components are created and non-directories in the way are
/// replaced.
fn resolve_dir(root: &Path, rel: &Path, create: bool, digest: &str) -> Result<PathBuf, ImageError> {
    let mut resolved = PathBuf::new();
    let mut pending: Vec<OsString> = Vec::new();
    push_components(&mut pending, rel);
    let mut hops = 0;

    while let Some(name) = pending.pop() {
        if name == ".." {
            resolved.pop();
            continue;
        }
        let candidate = root.join(&resolved).join(&name);
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(ImageError::corrupt_layer(
                        digest,
                        format!("too many symlinks resolving {}", rel.display()),
                    ));
                }
                let link = fs::read_link(&candidate)?;
                if link.has_root() {
                    resolved.clear();
                }
                push_components(&mut pending, &link);
            }
            Ok(meta) if meta.is_dir() => resolved.push(&name),
            Ok(_) if create => {
                fs::remove_file(&candidate)?;
                mkdir(&candidate)?;
                resolved.push(&name);
            }
            Err(e) if create && e.kind() == io::ErrorKind::NotFound => {
                mkdir(&candidate)?;
                resolved.push(&name);
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("{} is not a directory", candidate.display()),
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(root.join(resolved))
}

/// Queues the components of `path` so that the first one is popped next.
fn push_components(pending: &mut Vec<OsString>, path: &Path) {
    for component in path.components().rev() {
        match component {
            Component::Normal(c) => pending.push(c.to_os_string()),
            Component::ParentDir => pending.push(OsString::from("..")),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
}

fn mkdir(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new().mode(CACHE_DIR_PERM).create(path)
}

/// Host path for the archive path `rel`, with its parent resolved inside
/// `root`.
fn resolve_entry(root: &Path, rel: &Path, create: bool, digest: &str) -> Result<PathBuf, ImageError> {
    let parent = rel.parent().unwrap_or(Path::new(""));
    let name = rel
        .file_name()
        .ok_or_else(|| ImageError::corrupt_layer(digest, format!("bad path {}", rel.display())))?;
    Ok(resolve_dir(root, parent, create, digest)?.join(name))
}

fn remove_non_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Clears `target` for a link entry. A directory is left alone and the entry
/// skipped.
fn replace_with(target: &Path, rel: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {
            tracing::warn!(path = %rel.display(), "Not replacing directory with a link");
            Ok(false)
        }
        Ok(_) => fs::remove_file(target).map(|()| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

/// Applies one uncompressed tar stream on top of `dest`.
pub fn extract_layer<R: Read>(reader: R, dest: &Path, digest: &str) -> Result<(), ImageError> {
    let mut archive = Archive::new(reader);

    let entries = archive
        .entries()
        .map_err(|e| ImageError::corrupt_layer(digest, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ImageError::corrupt_layer(digest, e))?;

        let raw_path = entry
            .path()
            .map_err(|e| ImageError::corrupt_layer(digest, e))?
            .into_owned();

        let Some(rel) = sanitize(&raw_path) else {
            if raw_path.components().any(|c| c == Component::ParentDir) {
                tracing::warn!(path = %raw_path.display(), "Skipping entry outside of rootfs");
            }
            continue;
        };

        let is_whiteout = rel
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(".wh."))
            .unwrap_or(false);
        if is_whiteout {
            continue;
        }

        let target = resolve_entry(dest, &rel, true, digest)?;

        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let entry_type = entry.header().entry_type();

        match entry_type {
            EntryType::Directory => {
                let is_dir = fs::symlink_metadata(&target)
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if !is_dir {
                    remove_non_dir(&target)?;
                    fs::DirBuilder::new().mode(mode).create(&target)?;
                }
                fs::set_permissions(&target, Permissions::from_mode(mode))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                // A fresh inode: never write through a lower layer's symlink
                // or into a file it hardlinked elsewhere.
                remove_non_dir(&target)?;
                let mut file = OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .mode(mode)
                    .open(&target)?;
                io::copy(&mut entry, &mut file)
                    .map_err(|e| ImageError::corrupt_layer(digest, e))?;
                file.flush()?;
                fs::set_permissions(&target, Permissions::from_mode(mode))?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| ImageError::corrupt_layer(digest, e))?
                    .ok_or_else(|| ImageError::corrupt_layer(digest, "symlink without target"))?
                    .into_owned();
                if !replace_with(&target, &rel)? {
                    continue;
                }
                std::os::unix::fs::symlink(&link, &target)?;
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| ImageError::corrupt_layer(digest, e))?
                    .ok_or_else(|| ImageError::corrupt_layer(digest, "hardlink without target"))?
                    .into_owned();
                let Some(link_rel) = sanitize(&link) else {
                    tracing::warn!(path = %rel.display(), link = %link.display(), "Skipping hardlink outside of rootfs");
                    continue;
                };
                let source = resolve_entry(dest, &link_rel, false, digest)?;
                if source == target {
                    continue;
                }
                if !replace_with(&target, &rel)? {
                    continue;
                }
                fs::hard_link(&source, &target)?;
            }
            other => {
                tracing::warn!(
                    path = %rel.display(),
                    entry_type = ?other,
                    "Skipping unsupported tar entry type"
                );
            }
        }
    }

    Ok(())
}

/// Extracts every layer of a manifest, lowest first, into `dest`.
pub fn extract_layers(layout: &Path, layers: &[Descriptor], dest: &Path) -> Result<(), ImageError> {
    mkdir_all(dest)?;

    for layer in layers {
        let path = blob_path(layout, &layer.digest)?;
        tracing::debug!(digest = %layer.digest, "Extracting layer");

        let file = fs::File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ImageError::InvalidLayout(format!("missing layer blob {}", layer.digest))
            }
            _ => e.into(),
        })?;
        let stream = decompressed(BufReader::new(file), &layer.digest)?;
        extract_layer(stream, dest, &layer.digest)?;
    }

    Ok(())
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn header(entry_type: EntryType, meta: &fs::Metadata, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(meta.mode() & 0o7777);
    header.set_size(size);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header
}

struct Packer<W: Write> {
    builder: tar::Builder<W>,
    links: HashMap<(u64, u64), PathBuf>,
    content_bytes: u64,
}

impl<W: Write> Packer<W> {
    fn walk(&mut self, root: &Path, rel: &Path) -> io::Result<()> {
        for entry in sorted_entries(&root.join(rel))? {
            let rel_path = rel.join(entry.file_name());
            let full = root.join(&rel_path);
            let meta = fs::symlink_metadata(&full)?;
            let file_type = meta.file_type();

            if file_type.is_dir() {
                let mut h = header(EntryType::Directory, &meta, 0);
                self.builder.append_data(&mut h, &rel_path, io::empty())?;
                self.walk(root, &rel_path)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(&full)?;
                let mut h = header(EntryType::Symlink, &meta, 0);
                self.builder.append_link(&mut h, &rel_path, &target)?;
            } else if file_type.is_file() {
                if meta.nlink() > 1 {
                    let key = (meta.dev(), meta.ino());
                    if let Some(first) = self.links.get(&key) {
                        let mut h = header(EntryType::Link, &meta, 0);
                        self.builder.append_link(&mut h, &rel_path, first)?;
                        continue;
                    }
                    self.links.insert(key, rel_path.clone());
                }
                let mut h = header(EntryType::Regular, &meta, meta.len());
                let file = fs::File::open(&full)?;
                self.builder.append_data(&mut h, &rel_path, file)?;
                self.content_bytes += meta.len();
            } else {
                tracing::warn!(path = %rel_path.display(), "Skipping special file while packing rootfs");
            }
        }
        Ok(())
    }
}

/// Writes `rootfs` as a deterministic tar stream: entries sorted by name,
/// zeroed timestamps and owners, hardlinks preserved. Returns the number of
/// regular-file content bytes written.
pub fn pack_rootfs<W: Write>(rootfs: &Path, out: W) -> Result<u64, ImageError> {
    let mut packer = Packer {
        builder: tar::Builder::new(out),
        links: HashMap::new(),
        content_bytes: 0,
    };
    packer.walk(rootfs, Path::new(""))?;
    packer.builder.finish()?;
    Ok(packer.content_bytes)
}
