//! OCI image cache: fetches image references into OCI layouts and converts
//! them into a per-platform rootfs directory plus an ext4 block image.

pub mod builder;
mod cache;
mod converter;
mod error;
mod ext4;
pub mod extract;
mod fetcher;
pub mod layout;
pub mod paths;
mod types;

pub use cache::{CacheRecord, CleanReport, ImageCache, ManifestRecord};
pub use converter::{CachedConverter, Converter, OciFilesystemConverter, load_converted};
pub use error::ImageError;
pub use ext4::{Ext4Builder, MkfsExt4Builder, image_size};
pub use fetcher::{CachedFetcher, ExecImageFetcher, Fetcher, LocalLayoutFetcher, MemoryMapFetcher};
pub use types::*;
