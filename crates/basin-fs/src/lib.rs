#![forbid(unsafe_code)]
//! Local filesystem abstraction consumed by the basin file pool.
//!
//! Defines the object-safe [`FileSystem`] and [`FsFile`] traits plus two
//! implementations:
//!
//! - **[`PosixFileSystem`]**: `std::fs` with positioned I/O, `fallocate`
//!   (mode 0 and zero-range), `renameat2(RENAME_NOREPLACE)`, and a
//!   `statvfs` capacity query.
//! - **[`MemFileSystem`]**: an in-memory tree for tests, with the same
//!   no-replace rename semantics, a configurable capacity answer, and a
//!   write-failure injection hook.
//!
//! The no-replace rename is the one capability the pool cannot emulate:
//! it is what serializes concurrent callers creating the same target.

mod mem;
mod posix;

pub use mem::MemFileSystem;
pub use posix::PosixFileSystem;

use basin_error::Result;
use std::path::Path;

/// Open-mode flags for [`FileSystem::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    /// Synchronous writes (`O_SYNC`): data is durable when the write
    /// returns.
    pub sync: bool,
}

impl OpenFlags {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    #[must_use]
    pub fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }
}

/// Capacity snapshot from a statfs-style query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    /// Total filesystem size in bytes.
    pub total: u64,
    /// Bytes available to unprivileged writers.
    pub available: u64,
}

/// An open pool file. Implementations release the underlying handle on
/// drop, so every exit path of a caller closes the file.
pub trait FsFile: Send {
    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Flush file data and metadata to stable storage.
    fn sync(&self) -> Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;

    /// Reserve `len` bytes of backing store from offset 0 (`fallocate`
    /// mode 0): the file grows to at least `len`, existing data is kept.
    fn allocate(&self, len: u64) -> Result<()>;

    /// Convert `len` bytes at `offset` to zeros without a data write
    /// (`FALLOC_FL_ZERO_RANGE`).
    fn zero_range(&self, offset: u64, len: u64) -> Result<()>;
}

/// Local filesystem operations the pool needs.
///
/// Object-safe so the pool can hold an `Arc<dyn FileSystem>` and tests
/// can substitute [`MemFileSystem`].
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn FsFile>>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// Rename with replace semantics.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Rename that refuses to overwrite: an existing target yields
    /// [`basin_error::PoolError::TargetExists`] and leaves both paths
    /// untouched.
    fn rename_noreplace(&self, from: &Path, to: &Path) -> Result<()>;

    fn mkdir_all(&self, path: &Path) -> Result<()>;

    fn dir_exists(&self, path: &Path) -> bool;

    fn file_exists(&self, path: &Path) -> bool;

    /// Names of entries directly under `dir`, in no particular order.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;

    /// Capacity of the filesystem holding `path`.
    fn statfs(&self, path: &Path) -> Result<FsStats>;
}
