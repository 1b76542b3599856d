//! On-disk pool descriptor: a fixed-size JSON document sealed with a
//! CRC32.
//!
//! The manifest pins the geometry a pool directory was formatted with so
//! a restarted chunkserver cannot reinterpret existing files under a
//! different chunk or meta-page size. The document is padded with NUL
//! bytes to exactly [`MANIFEST_SIZE`](basin_types::MANIFEST_SIZE) and
//! written with synchronous-write semantics, so a successful persist is
//! durable. The `blockSize` key is optional for compatibility with
//! manifests written before the field existed; its presence changes the
//! CRC input, so readers must remember whether they saw it.

use basin_error::{PoolError, Result};
use basin_fs::{FileSystem, OpenFlags};
use basin_types::{DEFAULT_BLOCK_SIZE, MANIFEST_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Magic bytes mixed into the CRC so the seal cannot be satisfied by an
/// arbitrary JSON blob of the right shape.
pub const POOL_MAGIC: &[u8] = b"basin.filepool.v1";

/// Decoded pool descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolManifest {
    /// Payload bytes per pool file.
    pub chunk_size: u32,
    /// Header bytes per pool file.
    pub meta_page_size: u32,
    /// Alignment unit; `None` when the manifest predates the field.
    pub block_size: Option<u32>,
    /// Directory the pool files live in.
    pub pool_path: String,
}

/// Wire form. Key casing is fixed by deployments that already have
/// manifests on disk.
#[derive(Serialize, Deserialize)]
struct ManifestDoc {
    #[serde(rename = "chunkSize")]
    chunk_size: u32,
    #[serde(rename = "metaPageSize")]
    meta_page_size: u32,
    #[serde(rename = "blockSize", default, skip_serializing_if = "Option::is_none")]
    block_size: Option<u32>,
    #[serde(rename = "chunkfilepool_path")]
    pool_path: String,
    crc: u32,
}

impl PoolManifest {
    #[must_use]
    pub fn new(
        chunk_size: u32,
        meta_page_size: u32,
        block_size: u32,
        pool_path: impl Into<String>,
    ) -> Self {
        Self {
            chunk_size,
            meta_page_size,
            block_size: Some(block_size),
            pool_path: pool_path.into(),
        }
    }

    /// Effective alignment unit; legacy manifests fall back to the
    /// default.
    #[must_use]
    pub fn effective_block_size(&self) -> u32 {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    /// CRC32 over magic, the size fields in little-endian order (block
    /// size only when present), and the raw path bytes.
    #[must_use]
    pub fn crc32(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(POOL_MAGIC);
        hasher.update(&self.chunk_size.to_le_bytes());
        hasher.update(&self.meta_page_size.to_le_bytes());
        if let Some(block_size) = self.block_size {
            hasher.update(&block_size.to_le_bytes());
        }
        hasher.update(self.pool_path.as_bytes());
        hasher.finalize()
    }

    /// Write the manifest to `path` as a NUL-padded 4 KiB document.
    pub fn persist(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let doc = ManifestDoc {
            chunk_size: self.chunk_size,
            meta_page_size: self.meta_page_size,
            block_size: self.block_size,
            pool_path: self.pool_path.clone(),
            crc: self.crc32(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| PoolError::Manifest(format!("encode failed: {e}")))?;
        let region = MANIFEST_SIZE as usize;
        if json.len() > region {
            return Err(PoolError::Manifest(format!(
                "document is {} bytes, region is {region}",
                json.len()
            )));
        }
        let mut buf = vec![0_u8; region];
        buf[..json.len()].copy_from_slice(json.as_bytes());

        let file = fs
            .open(path, OpenFlags::read_write().with_create().with_sync())
            .map_err(|e| PoolError::Manifest(format!("open {} failed: {e}", path.display())))?;
        file.write_all_at(&buf, 0)
            .map_err(|e| PoolError::Manifest(format!("write {} failed: {e}", path.display())))?;
        debug!(
            target: "basin::manifest",
            path = %path.display(),
            crc = doc.crc,
            "manifest persisted"
        );
        Ok(())
    }

    /// Read `meta_file_size` bytes from `path` and decode them.
    pub fn load(fs: &dyn FileSystem, path: &Path, meta_file_size: u32) -> Result<Self> {
        let file = fs
            .open(path, OpenFlags::read_only())
            .map_err(|e| PoolError::Manifest(format!("open {} failed: {e}", path.display())))?;
        let mut buf = vec![0_u8; meta_file_size as usize];
        file.read_exact_at(&mut buf, 0)
            .map_err(|e| PoolError::Manifest(format!("read {} failed: {e}", path.display())))?;

        // The document ends at the first padding byte.
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let doc: ManifestDoc = serde_json::from_slice(&buf[..end])
            .map_err(|e| PoolError::Manifest(format!("parse {} failed: {e}", path.display())))?;

        if doc.block_size.is_none() {
            warn!(
                target: "basin::manifest",
                default = DEFAULT_BLOCK_SIZE,
                "manifest carries no blockSize, assuming default"
            );
        }

        let manifest = Self {
            chunk_size: doc.chunk_size,
            meta_page_size: doc.meta_page_size,
            block_size: doc.block_size,
            pool_path: doc.pool_path,
        };
        let computed = manifest.crc32();
        if computed != doc.crc {
            return Err(PoolError::Manifest(format!(
                "crc mismatch in {}: stored {}, computed {computed}",
                path.display(),
                doc.crc
            )));
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basin_fs::MemFileSystem;
    use proptest::prelude::*;

    fn mem() -> MemFileSystem {
        let fs = MemFileSystem::new();
        fs.mkdir_all(Path::new("/meta")).unwrap();
        fs
    }

    #[test]
    fn persist_load_roundtrip() {
        let fs = mem();
        let path = Path::new("/meta/pool.meta");
        let manifest = PoolManifest::new(16 * 1024 * 1024, 4096, 4096, "/data/pool");
        manifest.persist(&fs, path).unwrap();

        let loaded = PoolManifest::load(&fs, path, MANIFEST_SIZE).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn persisted_region_is_exactly_padded() {
        let fs = mem();
        let path = Path::new("/meta/pool.meta");
        PoolManifest::new(4096, 512, 512, "/p")
            .persist(&fs, path)
            .unwrap();

        let file = fs.open(path, OpenFlags::read_only()).unwrap();
        assert_eq!(file.len().unwrap(), u64::from(MANIFEST_SIZE));

        let mut buf = vec![0_u8; MANIFEST_SIZE as usize];
        file.read_exact_at(&mut buf, 0).unwrap();
        let end = buf.iter().position(|&b| b == 0).unwrap();
        assert!(end > 0);
        assert!(buf[end..].iter().all(|&b| b == 0), "padding must be NUL");
    }

    #[test]
    fn legacy_manifest_without_block_size_decodes_with_default() {
        let fs = mem();
        let path = Path::new("/meta/pool.meta");
        let legacy = PoolManifest {
            chunk_size: 4096,
            meta_page_size: 512,
            block_size: None,
            pool_path: "/p".to_owned(),
        };
        legacy.persist(&fs, path).unwrap();

        let loaded = PoolManifest::load(&fs, path, MANIFEST_SIZE).unwrap();
        assert_eq!(loaded.block_size, None);
        assert_eq!(loaded.effective_block_size(), DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn block_size_presence_changes_the_crc() {
        let with = PoolManifest::new(4096, 512, DEFAULT_BLOCK_SIZE, "/p");
        let without = PoolManifest {
            block_size: None,
            ..with.clone()
        };
        assert_ne!(with.crc32(), without.crc32());
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let fs = mem();
        let path = Path::new("/meta/pool.meta");
        PoolManifest::new(4096, 512, 512, "/p")
            .persist(&fs, path)
            .unwrap();

        // Flip one bit inside the JSON body (the path string).
        let file = fs.open(path, OpenFlags::read_write()).unwrap();
        let mut buf = vec![0_u8; MANIFEST_SIZE as usize];
        file.read_exact_at(&mut buf, 0).unwrap();
        let pos = buf
            .windows(4)
            .position(|w| w == b"\"/p\"")
            .expect("path literal present")
            + 1;
        buf[pos] ^= 0x01;
        file.write_all_at(&buf, 0).unwrap();

        assert!(matches!(
            PoolManifest::load(&fs, path, MANIFEST_SIZE),
            Err(PoolError::Manifest(_))
        ));
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let fs = mem();
        let path = Path::new("/meta/pool.meta");
        let mut buf = vec![0_u8; MANIFEST_SIZE as usize];
        let body = br#"{"chunkSize": 4096, "chunkfilepool_path": "/p", "crc": 0}"#;
        buf[..body.len()].copy_from_slice(body);
        let file = fs
            .open(path, OpenFlags::read_write().with_create())
            .unwrap();
        file.write_all_at(&buf, 0).unwrap();

        assert!(matches!(
            PoolManifest::load(&fs, path, MANIFEST_SIZE),
            Err(PoolError::Manifest(_))
        ));
    }

    #[test]
    fn truncated_region_is_rejected() {
        let fs = mem();
        let path = Path::new("/meta/pool.meta");
        let file = fs
            .open(path, OpenFlags::read_write().with_create())
            .unwrap();
        file.write_all_at(b"{}", 0).unwrap();

        // Shorter than the declared region size.
        assert!(matches!(
            PoolManifest::load(&fs, path, MANIFEST_SIZE),
            Err(PoolError::Manifest(_))
        ));
    }

    proptest! {
        #[test]
        fn roundtrip_identity(
            chunk_size in 1_u32..=1 << 28,
            meta_page_size in 1_u32..=1 << 16,
            block_size in proptest::option::of(512_u32..=65536),
            path_len in 1_usize..=64,
        ) {
            let fs = mem();
            let meta_path = Path::new("/meta/pool.meta");
            let manifest = PoolManifest {
                chunk_size,
                meta_page_size,
                block_size,
                pool_path: "p".repeat(path_len),
            };
            manifest.persist(&fs, meta_path).unwrap();
            let loaded = PoolManifest::load(&fs, meta_path, MANIFEST_SIZE).unwrap();
            prop_assert_eq!(loaded, manifest);
        }
    }
}
