#![forbid(unsafe_code)]
//! Shared plain-data types for the basin file pool: runtime options, the
//! capacity policy, the allocated-file classifier, and the state/progress
//! snapshots the pool exposes.

use basin_error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Alignment unit assumed when a legacy manifest carries no explicit
/// block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Size of the on-disk manifest region in bytes.
pub const MANIFEST_SIZE: u32 = 4096;

/// Suffix carried by pool files whose body is known to be all zero.
pub const CLEAN_SUFFIX: &str = ".clean";

/// Upper bound for [`PoolOptions::bytes_per_write`] (1 MiB).
pub const MAX_BYTES_PER_WRITE: u32 = 1024 * 1024;

/// Zero-fill writes must be a whole number of 4 KiB pages.
pub const WRITE_ALIGNMENT: u32 = 4096;

/// How the pool's target on-disk footprint is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolCapacity {
    /// Absolute byte target.
    Bytes(u64),
    /// Percentage of the filesystem's total capacity, in `1..=100`.
    PercentOfDisk(u32),
}

impl PoolCapacity {
    /// Resolve the policy to a byte target given the filesystem's total
    /// size.
    #[must_use]
    pub fn resolve(self, fs_total: u64) -> u64 {
        match self {
            Self::Bytes(n) => n,
            Self::PercentOfDisk(p) => {
                let exact = u128::from(fs_total) * u128::from(p) / 100;
                u64::try_from(exact).unwrap_or(u64::MAX)
            }
        }
    }
}

/// Classifier for file names that count as already-allocated capacity
/// when startup accounting walks the copyset and recycle trees.
#[derive(Debug, Clone, Copy)]
pub enum AllocatedFilter {
    /// `chunk_<id>` data files and `chunk_<id>_snap_<sn>` snapshots.
    ChunkOrSnapshot,
    /// Chunk and snapshot files plus WAL segments, for pools that also
    /// back the raft log.
    ChunkOrSnapshotOrWal,
    /// Caller-provided predicate.
    Custom(fn(&str) -> bool),
}

impl AllocatedFilter {
    /// Whether `name` counts against the pool's capacity target.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::ChunkOrSnapshot => is_chunk_or_snapshot(name),
            Self::ChunkOrSnapshotOrWal => is_chunk_or_snapshot(name) || is_wal_segment(name),
            Self::Custom(pred) => pred(name),
        }
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_chunk_or_snapshot(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("chunk_") else {
        return false;
    };
    match rest.split_once("_snap_") {
        Some((id, sn)) => all_digits(id) && all_digits(sn),
        None => all_digits(rest),
    }
}

fn is_wal_segment(name: &str) -> bool {
    if let Some(rest) = name.strip_prefix("log_inprogress_") {
        return all_digits(rest);
    }
    if let Some(rest) = name.strip_prefix("log_") {
        if let Some((start, end)) = rest.split_once('_') {
            return all_digits(start) && all_digits(end);
        }
    }
    false
}

/// Runtime configuration for a file pool.
///
/// Not persisted; once a manifest exists on disk it is authoritative for
/// the size fields, and the pool resets mismatching values here during
/// initialization.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Claim files from the pre-allocated reservoir. When false, files
    /// are created on demand and recycled files are simply deleted.
    pub from_pool: bool,
    /// Flat directory holding the pre-allocated files.
    pub pool_dir: PathBuf,
    /// Path of the manifest file.
    pub meta_path: PathBuf,
    /// Payload bytes per file.
    pub file_size: u32,
    /// Header bytes per file, stamped by the caller at claim time.
    pub meta_page_size: u32,
    /// Alignment unit recorded in the manifest.
    pub block_size: u32,
    /// Size of the manifest region read at startup.
    pub meta_file_size: u32,
    /// Target on-disk footprint of the reservoir.
    pub capacity: PoolCapacity,
    /// Peer threads in the background format pass.
    pub format_threads: u32,
    /// Pause between file creations in each format thread.
    pub format_interval: Duration,
    /// Low watermark for [`has_enough`](PoolState) style checks.
    pub chunk_reserved: u64,
    /// Run the background clean worker.
    pub need_clean: bool,
    /// Write granularity of the clean worker's zero fill.
    pub bytes_per_write: u32,
    /// Token budget per second for clean writes; zero disables the
    /// throttle.
    pub clean_iops: u64,
    /// Attempts per `get_file` call.
    pub retry_times: u32,
    /// Copyset tree counted by startup capacity accounting.
    pub copyset_dir: PathBuf,
    /// Recycle tree counted by startup capacity accounting.
    pub recycle_dir: PathBuf,
    /// Classifier applied to entries of the two trees above.
    pub allocated_filter: AllocatedFilter,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            from_pool: true,
            pool_dir: PathBuf::new(),
            meta_path: PathBuf::new(),
            file_size: 16 * 1024 * 1024,
            meta_page_size: 4096,
            block_size: DEFAULT_BLOCK_SIZE,
            meta_file_size: MANIFEST_SIZE,
            capacity: PoolCapacity::Bytes(0),
            format_threads: 1,
            format_interval: Duration::from_millis(100),
            chunk_reserved: 100,
            need_clean: false,
            bytes_per_write: 64 * 1024,
            clean_iops: 0,
            retry_times: 5,
            copyset_dir: PathBuf::new(),
            recycle_dir: PathBuf::new(),
            allocated_filter: AllocatedFilter::ChunkOrSnapshot,
        }
    }
}

impl PoolOptions {
    /// Full on-disk size of one pool file.
    #[must_use]
    pub fn chunk_len(&self) -> u64 {
        u64::from(self.file_size) + u64::from(self.meta_page_size)
    }

    /// Reject configurations the pool cannot run with. Called once at
    /// startup; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.bytes_per_write == 0 || self.bytes_per_write > MAX_BYTES_PER_WRITE {
            return Err(PoolError::Validation {
                field: "bytes_per_write",
                reason: "must be in 1..=1048576",
            });
        }
        if self.bytes_per_write % WRITE_ALIGNMENT != 0 {
            return Err(PoolError::Validation {
                field: "bytes_per_write",
                reason: "must be a multiple of 4096",
            });
        }
        if self.from_pool {
            if self.format_threads == 0 {
                return Err(PoolError::Validation {
                    field: "format_threads",
                    reason: "must be nonzero",
                });
            }
            if self.retry_times == 0 {
                return Err(PoolError::Validation {
                    field: "retry_times",
                    reason: "must be nonzero",
                });
            }
            if let PoolCapacity::PercentOfDisk(p) = self.capacity {
                if p == 0 || p > 100 {
                    return Err(PoolError::Validation {
                        field: "capacity",
                        reason: "percent must be in 1..=100",
                    });
                }
            }
        }
        Ok(())
    }
}

/// Point-in-time snapshot of the pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub chunk_size: u32,
    pub meta_page_size: u32,
    pub block_size: u32,
    /// Files accounted against the capacity target: pool files plus
    /// allocated files under the copyset and recycle trees.
    pub chunk_num: u64,
    /// Pool files whose body content is arbitrary.
    pub dirty_left: u64,
    /// Pool files with all-zero bodies.
    pub clean_left: u64,
    /// `dirty_left + clean_left`.
    pub preallocated_left: u64,
}

/// Progress counters for the background format pass.
#[derive(Debug, Default)]
pub struct FormatStat {
    /// Number of files the pass was asked to produce. Fixed at startup.
    pub preallocate_target: u64,
    /// Files produced so far.
    pub formatted: AtomicU64,
    /// Set when any format worker hit an error; the pass is abandoned.
    pub failed: AtomicBool,
}

impl FormatStat {
    #[must_use]
    pub fn new(preallocate_target: u64) -> Self {
        Self {
            preallocate_target,
            formatted: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    /// Whether every requested file has been produced.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.formatted.load(Ordering::Acquire) == self.preallocate_target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_resolves_bytes_and_percent() {
        assert_eq!(PoolCapacity::Bytes(42).resolve(1 << 40), 42);
        assert_eq!(PoolCapacity::PercentOfDisk(80).resolve(1000), 800);
        // Large volumes must not overflow the intermediate product.
        assert_eq!(
            PoolCapacity::PercentOfDisk(50).resolve(u64::MAX),
            u64::MAX / 2
        );
    }

    #[test]
    fn chunk_filter_accepts_chunks_and_snapshots() {
        let filter = AllocatedFilter::ChunkOrSnapshot;
        assert!(filter.matches("chunk_100"));
        assert!(filter.matches("chunk_100_snap_2"));
        assert!(!filter.matches("chunk_"));
        assert!(!filter.matches("chunk_abc"));
        assert!(!filter.matches("chunk_1_snap_"));
        assert!(!filter.matches("log_1_2"));
        assert!(!filter.matches("somethingelse"));
    }

    #[test]
    fn wal_filter_additionally_accepts_segments() {
        let filter = AllocatedFilter::ChunkOrSnapshotOrWal;
        assert!(filter.matches("chunk_7"));
        assert!(filter.matches("log_inprogress_8"));
        assert!(filter.matches("log_10_20"));
        assert!(!filter.matches("log_10"));
        assert!(!filter.matches("log_inprogress_"));
    }

    #[test]
    fn custom_filter_delegates() {
        let filter = AllocatedFilter::Custom(|name| name.ends_with(".seg"));
        assert!(filter.matches("0001.seg"));
        assert!(!filter.matches("0001.tmp"));
    }

    #[test]
    fn bytes_per_write_bounds() {
        let mut opts = PoolOptions::default();
        for bad in [0_u32, 4095, MAX_BYTES_PER_WRITE + 1] {
            opts.bytes_per_write = bad;
            assert!(
                matches!(
                    opts.validate(),
                    Err(PoolError::Validation {
                        field: "bytes_per_write",
                        ..
                    })
                ),
                "bytes_per_write = {bad} must be rejected"
            );
        }
        for good in [4096_u32, 8192, MAX_BYTES_PER_WRITE] {
            opts.bytes_per_write = good;
            assert!(opts.validate().is_ok(), "bytes_per_write = {good}");
        }
    }

    #[test]
    fn percent_capacity_bounds() {
        let mut opts = PoolOptions::default();
        opts.capacity = PoolCapacity::PercentOfDisk(0);
        assert!(opts.validate().is_err());
        opts.capacity = PoolCapacity::PercentOfDisk(101);
        assert!(opts.validate().is_err());
        opts.capacity = PoolCapacity::PercentOfDisk(100);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn format_stat_done_tracks_target() {
        let stat = FormatStat::new(2);
        assert!(!stat.is_done());
        stat.formatted.fetch_add(2, Ordering::Release);
        assert!(stat.is_done());
        assert!(FormatStat::new(0).is_done());
    }
}
