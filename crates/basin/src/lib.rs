#![forbid(unsafe_code)]
//! Pre-allocated fixed-size file pool for chunkserver-style block
//! storage.
//!
//! Creating a chunk or WAL segment on the write path costs an open, an
//! `fallocate`, a zero fill, and an fsync — tens of milliseconds for a
//! 16 MiB file. The pool pays those costs ahead of time: a background
//! format pass keeps a reservoir of ready files in a flat directory,
//! callers claim one with [`FilePool::get_file`] (which stamps a
//! caller-supplied meta page and renames the file into place with
//! no-replace semantics), and retired files come back through
//! [`FilePool::recycle_file`]. An optional clean worker scrubs recycled
//! files back to all-zero bodies under an IOPS throttle, so callers that
//! need a zeroed file (`need_clean`) rarely pay for the scrub inline.
//!
//! File state is encoded in the directory itself: `<n>` is a *dirty*
//! file (arbitrary body content from a previous life), `<n>.clean` has
//! an all-zero body. Both are exactly `file_size + meta_page_size`
//! bytes. A 4 KiB [`manifest`] pins the geometry across restarts.

pub mod manifest;
mod sleeper;
mod throttle;

pub use basin_error::{PoolError, Result};
pub use basin_fs::{FileSystem, FsFile, FsStats, MemFileSystem, OpenFlags, PosixFileSystem};
pub use basin_types::{
    AllocatedFilter, FormatStat, PoolCapacity, PoolOptions, PoolState, CLEAN_SUFFIX,
    DEFAULT_BLOCK_SIZE, MANIFEST_SIZE,
};
pub use manifest::PoolManifest;
pub use sleeper::Sleeper;
pub use throttle::IopsThrottle;

use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Pause after a successful clean pass.
const CLEAN_SUCCESS_SLEEP: std::time::Duration = std::time::Duration::from_millis(10);
/// Back-off after a failed clean pass or an empty dirty queue.
const CLEAN_FAIL_SLEEP: std::time::Duration = std::time::Duration::from_millis(500);

/// Free lists and counters guarded by the pool mutex.
///
/// Invariant: `state.preallocated_left == dirty.len() + clean.len()`,
/// and a file number appears in at most one list.
#[derive(Debug, Default)]
struct FreeLists {
    /// File numbers with arbitrary body content; on-disk name `<n>`.
    dirty: Vec<u64>,
    /// File numbers with all-zero bodies; on-disk name `<n>.clean`.
    clean: Vec<u64>,
    state: PoolState,
}

/// A file popped from the free lists (or created on demand), not yet
/// renamed to its target.
struct Claimed {
    num: u64,
    /// The on-disk name carries the `.clean` suffix.
    clean: bool,
    /// Came from the free lists rather than an on-demand create.
    pooled: bool,
}

/// Shared pool state, loaned to the background workers through an `Arc`
/// so the workers never keep the [`FilePool`] handle itself alive.
struct PoolCore {
    fs: Arc<dyn FileSystem>,
    /// Reconciled against the manifest during init.
    opts: PoolOptions,
    lists: Mutex<FreeLists>,
    /// Wakes `get_file` callers parked behind the format pass.
    available: Condvar,
    /// Next unclaimed file number. Every consumer uses the value
    /// returned by `fetch_add`, so the stored value stays strictly
    /// greater than any number ever handed out.
    next_file_num: AtomicU64,
    format_stat: FormatStat,
    format_alive: AtomicBool,
    clean_alive: AtomicBool,
    format_sleeper: Sleeper,
    clean_sleeper: Sleeper,
    clean_throttle: IopsThrottle,
}

impl PoolCore {
    fn dir(&self) -> &Path {
        &self.opts.pool_dir
    }

    fn chunk_path(&self, num: u64, clean: bool) -> PathBuf {
        let mut name = num.to_string();
        if clean {
            name.push_str(CLEAN_SUFFIX);
        }
        self.dir().join(name)
    }

    // ── Low-level file operations ──────────────────────────────────────

    /// Create `path` at full pool-file size: reserve, zero-fill, fsync.
    fn allocate_chunk(&self, path: &Path) -> Result<()> {
        let len = self.opts.chunk_len();
        let file = self.fs.open(path, OpenFlags::read_write().with_create())?;
        file.allocate(len)?;
        let zeros = vec![0_u8; len as usize];
        file.write_all_at(&zeros, 0)?;
        file.sync()?;
        Ok(())
    }

    /// Stamp the caller's page over the header region of `path`.
    fn write_meta_page(&self, path: &Path, page: &[u8]) -> Result<()> {
        let file = self.fs.open(path, OpenFlags::read_write())?;
        file.write_all_at(page, 0)?;
        file.sync()?;
        Ok(())
    }

    /// Zero a dirty chunk's content and move it to its `.clean` name.
    ///
    /// `only_marked` uses a single zero-range call (no data writes);
    /// otherwise the body is overwritten in `bytes_per_write` slices,
    /// fsynced and throttled per slice. A rename failure leaves the file
    /// in place under its dirty name.
    fn clean_chunk(&self, num: u64, only_marked: bool) -> Result<()> {
        let path = self.chunk_path(num, false);
        let len = self.opts.chunk_len();
        {
            let file = self.fs.open(&path, OpenFlags::read_write())?;
            if only_marked {
                file.zero_range(0, len)?;
            } else {
                let step = u64::from(self.opts.bytes_per_write);
                let zeros = vec![0_u8; self.opts.bytes_per_write as usize];
                let mut written = 0_u64;
                while written < len {
                    let n = step.min(len - written);
                    file.write_all_at(&zeros[..n as usize], written)?;
                    file.sync()?;
                    self.clean_throttle.consume(step);
                    written += n;
                }
            }
        }
        self.fs.rename(&path, &self.chunk_path(num, true))
    }

    // ── Free-list bookkeeping ──────────────────────────────────────────

    fn pop_from(lists: &mut FreeLists, clean: bool) -> Option<(u64, bool)> {
        if clean {
            let num = lists.clean.pop()?;
            lists.state.clean_left -= 1;
            lists.state.preallocated_left -= 1;
            Some((num, true))
        } else {
            let num = lists.dirty.pop()?;
            lists.state.dirty_left -= 1;
            lists.state.preallocated_left -= 1;
            Some((num, false))
        }
    }

    fn pop_dirty(&self) -> Option<u64> {
        let mut lists = self.lists.lock();
        Self::pop_from(&mut lists, false).map(|(num, _)| num)
    }

    fn push_dirty(&self, num: u64) {
        {
            let mut lists = self.lists.lock();
            lists.dirty.push(num);
            lists.state.dirty_left += 1;
            lists.state.preallocated_left += 1;
        }
        self.available.notify_all();
    }

    fn push_clean(&self, num: u64) {
        {
            let mut lists = self.lists.lock();
            lists.clean.push(num);
            lists.state.clean_left += 1;
            lists.state.preallocated_left += 1;
        }
        self.available.notify_all();
    }

    /// Wake `get_file` waiters after changing format state that lives
    /// outside the list mutex (the alive/failed flags). Taking the lock
    /// first orders the wake against a waiter's condition check, so a
    /// caller between its check and its park cannot miss the signal.
    fn wake_waiters(&self) {
        drop(self.lists.lock());
        self.available.notify_all();
    }

    /// Put a claimed chunk back where it came from. On-demand files have
    /// no list to return to and are deleted.
    fn release(&self, claimed: &Claimed) {
        if claimed.pooled {
            if claimed.clean {
                self.push_clean(claimed.num);
            } else {
                self.push_dirty(claimed.num);
            }
        } else {
            let path = self.chunk_path(claimed.num, false);
            if let Err(e) = self.fs.delete(&path) {
                warn!(
                    target: "basin::pool",
                    path = %path.display(),
                    error = %e,
                    "orphan cleanup failed"
                );
            }
        }
    }

    // ── Claiming ───────────────────────────────────────────────────────

    /// The format pass is still expected to produce more files.
    fn formatting_active(&self) -> bool {
        !self.format_stat.is_done()
            && !self.format_stat.failed.load(Ordering::SeqCst)
            && self.format_alive.load(Ordering::SeqCst)
    }

    /// Pop a chunk, preferring the kind the caller asked for. Blocks
    /// while the format pass is running and nothing is buffered yet.
    fn claim_chunk(&self, need_clean: bool) -> Result<Claimed> {
        let (num, is_clean) = {
            let mut lists = self.lists.lock();
            while self.formatting_active() && lists.dirty.is_empty() && lists.clean.is_empty() {
                self.available.wait(&mut lists);
            }
            let popped = if need_clean {
                Self::pop_from(&mut lists, true).or_else(|| Self::pop_from(&mut lists, false))
            } else {
                Self::pop_from(&mut lists, false).or_else(|| Self::pop_from(&mut lists, true))
            };
            match popped {
                Some(pair) => pair,
                None => return Err(PoolError::Exhausted),
            }
        };

        if need_clean && !is_clean {
            // Inline promotion: punch the whole file to zero and take it
            // clean. Done outside the lock; the number is ours alone.
            if let Err(e) = self.clean_chunk(num, true) {
                warn!(target: "basin::pool", num, error = %e, "inline clean failed");
                self.push_dirty(num);
                return Err(e);
            }
            return Ok(Claimed {
                num,
                clean: true,
                pooled: true,
            });
        }
        Ok(Claimed {
            num,
            clean: is_clean,
            pooled: true,
        })
    }

    fn get_file(&self, target: &Path, meta_page: &[u8], need_clean: bool) -> Result<()> {
        if meta_page.len() != self.opts.meta_page_size as usize {
            return Err(PoolError::Validation {
                field: "meta_page",
                reason: "length must equal meta_page_size",
            });
        }

        let mut last_err = PoolError::Exhausted;
        for _ in 0..self.opts.retry_times {
            let claimed = if self.opts.from_pool {
                match self.claim_chunk(need_clean) {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        last_err = e;
                        continue;
                    }
                }
            } else {
                let num = self.next_file_num.fetch_add(1, Ordering::SeqCst);
                let path = self.chunk_path(num, false);
                if let Err(e) = self.allocate_chunk(&path) {
                    warn!(
                        target: "basin::pool",
                        path = %path.display(),
                        error = %e,
                        "on-demand allocation failed"
                    );
                    last_err = e;
                    continue;
                }
                Claimed {
                    num,
                    clean: false,
                    pooled: false,
                }
            };

            let src = self.chunk_path(claimed.num, claimed.clean);
            if let Err(e) = self.write_meta_page(&src, meta_page) {
                warn!(
                    target: "basin::pool",
                    src = %src.display(),
                    error = %e,
                    "meta page write failed"
                );
                self.release(&claimed);
                last_err = e;
                continue;
            }

            match self.fs.rename_noreplace(&src, target) {
                Ok(()) => {
                    info!(
                        target: "basin::pool",
                        target = %target.display(),
                        left = self.size(),
                        "file claimed"
                    );
                    return Ok(());
                }
                Err(e @ PoolError::TargetExists(_)) => {
                    // The target is owned by someone else; retrying the
                    // same path cannot succeed.
                    warn!(
                        target: "basin::pool",
                        target = %target.display(),
                        src = %src.display(),
                        "target already exists"
                    );
                    self.release(&claimed);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        target: "basin::pool",
                        target = %target.display(),
                        error = %e,
                        "rename failed"
                    );
                    self.release(&claimed);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn recycle_file(&self, path: &Path) -> Result<()> {
        if !self.opts.from_pool {
            return self.fs.delete(path);
        }

        let chunk_len = self.opts.chunk_len();
        let len = match self
            .fs
            .open(path, OpenFlags::read_write())
            .and_then(|file| file.len())
        {
            Ok(len) => len,
            Err(e) => {
                warn!(
                    target: "basin::pool",
                    path = %path.display(),
                    error = %e,
                    "recycled file unreadable, deleting"
                );
                return self.fs.delete(path);
            }
        };
        if len != chunk_len {
            warn!(
                target: "basin::pool",
                path = %path.display(),
                size = len,
                want = chunk_len,
                "recycled file has the wrong size, deleting"
            );
            return self.fs.delete(path);
        }

        let num = self.next_file_num.fetch_add(1, Ordering::SeqCst);
        self.fs.rename(path, &self.chunk_path(num, false))?;
        self.push_dirty(num);
        debug!(target: "basin::pool", num, pool = self.size(), "file recycled");
        Ok(())
    }

    fn size(&self) -> u64 {
        self.lists.lock().state.preallocated_left
    }

    fn state(&self) -> PoolState {
        self.lists.lock().state
    }

    // ── Background workers ─────────────────────────────────────────────

    /// Runs the peer format tasks and joins them.
    fn format_supervisor(self: Arc<Self>) {
        let target = self.format_stat.preallocate_target;
        let offset = self.next_file_num.fetch_add(target, Ordering::SeqCst);
        let index = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(self.opts.format_threads as usize);
        for i in 0..self.opts.format_threads {
            let core = Arc::clone(&self);
            let index = Arc::clone(&index);
            let spawned = thread::Builder::new()
                .name(format!("basin-format-{i}"))
                .spawn(move || core.format_task(offset, &index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(target: "basin::format", error = %e, "format thread spawn failed");
                    self.format_stat.failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
        for handle in workers {
            let _ = handle.join();
        }
        // Wake anyone still parked in get_file: the pass has settled one
        // way or the other.
        self.wake_waiters();

        if self.format_stat.failed.load(Ordering::SeqCst) {
            error!(target: "basin::format", "format pass failed");
        } else {
            info!(
                target: "basin::format",
                produced = self.format_stat.formatted.load(Ordering::SeqCst),
                "format pass done"
            );
        }
    }

    /// One peer of the format pass. Claims indexes from the shared
    /// counter until the range is drained, the pass fails, or the pool
    /// stops formatting.
    fn format_task(&self, offset: u64, index: &AtomicU64) {
        let target = self.format_stat.preallocate_target;
        while !self.format_stat.failed.load(Ordering::SeqCst)
            && self.format_alive.load(Ordering::SeqCst)
        {
            let idx = index.fetch_add(1, Ordering::SeqCst);
            if idx >= target {
                index.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            if !self.format_sleeper.wait_for(self.opts.format_interval) {
                break;
            }
            let num = offset + idx;
            let path = self.chunk_path(num, true);
            if let Err(e) = self.allocate_chunk(&path) {
                error!(
                    target: "basin::format",
                    path = %path.display(),
                    error = %e,
                    "chunk format failed"
                );
                self.format_stat.failed.store(true, Ordering::SeqCst);
                self.wake_waiters();
                break;
            }
            {
                let mut lists = self.lists.lock();
                lists.clean.push(num);
                lists.state.clean_left += 1;
                lists.state.preallocated_left += 1;
                lists.state.chunk_num += 1;
                self.format_stat.formatted.fetch_add(1, Ordering::SeqCst);
            }
            self.available.notify_all();
            trace!(target: "basin::format", num, "chunk formatted");
        }
    }

    /// Clean worker loop: drain the dirty list at a gentle pace until
    /// interrupted.
    fn clean_worker(&self) {
        let mut interval = CLEAN_SUCCESS_SLEEP;
        while self.clean_sleeper.wait_for(interval) {
            interval = if self.clean_one() {
                CLEAN_SUCCESS_SLEEP
            } else {
                CLEAN_FAIL_SLEEP
            };
        }
    }

    /// One clean pass: take the newest dirty chunk, scrub it, promote
    /// it. A failed scrub puts the chunk back.
    fn clean_one(&self) -> bool {
        let Some(num) = self.pop_dirty() else {
            return false;
        };
        match self.clean_chunk(num, false) {
            Ok(()) => {
                debug!(target: "basin::clean", num, "chunk cleaned");
                self.push_clean(num);
                true
            }
            Err(e) => {
                warn!(target: "basin::clean", num, error = %e, "clean failed, requeueing");
                self.push_dirty(num);
                false
            }
        }
    }
}

// ── Initialization helpers ─────────────────────────────────────────────

/// Apply the on-disk manifest over the runtime options. A missing
/// manifest is a first run, not an error; a present one is authoritative
/// for the geometry and the pool directory.
fn reconcile_manifest(fs: &dyn FileSystem, opts: &mut PoolOptions) -> Result<()> {
    if !fs.file_exists(&opts.meta_path) {
        info!(
            target: "basin::pool",
            path = %opts.meta_path.display(),
            "no manifest found, first initialization"
        );
        return Ok(());
    }
    let meta = PoolManifest::load(fs, &opts.meta_path, opts.meta_file_size)?;
    if opts.file_size != meta.chunk_size {
        warn!(
            target: "basin::pool",
            old = opts.file_size,
            new = meta.chunk_size,
            "resetting file size to the manifest value"
        );
        opts.file_size = meta.chunk_size;
    }
    if opts.meta_page_size != meta.meta_page_size {
        warn!(
            target: "basin::pool",
            old = opts.meta_page_size,
            new = meta.meta_page_size,
            "resetting meta page size to the manifest value"
        );
        opts.meta_page_size = meta.meta_page_size;
    }
    let block_size = meta.effective_block_size();
    if opts.block_size != block_size {
        warn!(
            target: "basin::pool",
            old = opts.block_size,
            new = block_size,
            "resetting block size to the manifest value"
        );
        opts.block_size = block_size;
    }
    opts.pool_dir = PathBuf::from(&meta.pool_path);
    Ok(())
}

/// Enumerate the pool directory and seed the free lists. Returns the
/// highest file number seen.
fn scan_pool_dir(fs: &dyn FileSystem, opts: &PoolOptions, lists: &mut FreeLists) -> Result<u64> {
    if !fs.dir_exists(&opts.pool_dir) {
        fs.mkdir_all(&opts.pool_dir)?;
    }
    let entries = fs.list(&opts.pool_dir).map_err(|e| {
        PoolError::Scan(format!("listing {} failed: {e}", opts.pool_dir.display()))
    })?;

    let chunk_len = opts.chunk_len();
    let mut max = 0_u64;
    for name in &entries {
        let (digits, is_clean) = match name.strip_suffix(CLEAN_SUFFIX) {
            Some(stem) => (stem, true),
            None => (name.as_str(), false),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PoolError::Scan(format!(
                "unexpected entry {name:?} in pool directory"
            )));
        }
        let path = opts.pool_dir.join(name);
        if !fs.file_exists(&path) {
            return Err(PoolError::Scan(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let len = fs
            .open(&path, OpenFlags::read_write())
            .and_then(|file| file.len())
            .map_err(|e| PoolError::Scan(format!("stat {} failed: {e}", path.display())))?;
        if len != chunk_len {
            return Err(PoolError::Scan(format!(
                "{} is {len} bytes, pool files must be {chunk_len}",
                path.display()
            )));
        }
        let num: u64 = digits
            .parse()
            .map_err(|_| PoolError::Scan(format!("file number in {name:?} does not fit in u64")))?;
        if num == 0 {
            // Reserved; never handed out.
            continue;
        }
        if is_clean {
            lists.clean.push(num);
        } else {
            lists.dirty.push(num);
        }
        max = max.max(num);
    }

    lists.state.chunk_num = entries.len() as u64
        + count_allocated(fs, &opts.copyset_dir, &opts.allocated_filter)
        + count_allocated(fs, &opts.recycle_dir, &opts.allocated_filter);
    lists.state.dirty_left = lists.dirty.len() as u64;
    lists.state.clean_left = lists.clean.len() as u64;
    lists.state.preallocated_left = lists.state.dirty_left + lists.state.clean_left;

    info!(
        target: "basin::pool",
        dir = %opts.pool_dir.display(),
        pool = lists.state.preallocated_left,
        chunks = lists.state.chunk_num,
        "pool directory scan done"
    );
    Ok(max)
}

/// Count files under `dir` (recursively) whose names the filter accepts.
fn count_allocated(fs: &dyn FileSystem, dir: &Path, filter: &AllocatedFilter) -> u64 {
    if dir.as_os_str().is_empty() {
        return 0;
    }
    let entries = match fs.list(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                target: "basin::pool",
                dir = %dir.display(),
                error = %e,
                "allocated-file count skipped"
            );
            return 0;
        }
    };
    let mut count = 0;
    for name in entries {
        let path = dir.join(&name);
        if fs.dir_exists(&path) {
            count += count_allocated(fs, &path, filter);
        } else if filter.matches(&name) {
            count += 1;
        }
    }
    count
}

/// Size the format pass: how many files are missing from the capacity
/// target, after checking the disk can hold them.
fn prepare_format(fs: &dyn FileSystem, opts: &PoolOptions, chunk_num: u64) -> Result<u64> {
    let stats = fs.statfs(&opts.pool_dir)?;
    let target_bytes = opts.capacity.resolve(stats.total);
    let bytes_per_page = u64::from(opts.file_size) + u64::from(opts.meta_file_size);

    if target_bytes / bytes_per_page <= chunk_num {
        info!(target: "basin::format", "pool already at capacity, nothing to format");
        return Ok(0);
    }
    let needed = target_bytes - chunk_num * bytes_per_page;
    info!(
        target: "basin::format",
        total = stats.total,
        available = stats.available,
        needed,
        "format pass sizing"
    );
    if stats.available < needed {
        return Err(PoolError::DiskFull {
            needed,
            available: stats.available,
        });
    }
    Ok(needed / bytes_per_page)
}

// ── Public handle ──────────────────────────────────────────────────────

/// A reservoir of pre-allocated fixed-size files.
///
/// The handle owns the background worker threads; shared state lives in
/// an internal `Arc` loaned to the workers, so dropping the handle stops
/// and joins them.
pub struct FilePool {
    core: Arc<PoolCore>,
    format_thread: Mutex<Option<JoinHandle<()>>>,
    clean_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FilePool {
    /// Bring the pool up: validate options, reconcile the on-disk
    /// manifest, scan the pool directory, and start the background
    /// format pass if the reservoir is under its capacity target.
    ///
    /// With `from_pool` disabled this only ensures the directory exists;
    /// files are then created on demand by [`get_file`](Self::get_file).
    pub fn init(fs: Arc<dyn FileSystem>, mut opts: PoolOptions) -> Result<Self> {
        opts.validate()?;

        if !opts.from_pool {
            if !fs.dir_exists(&opts.pool_dir) {
                fs.mkdir_all(&opts.pool_dir)?;
            }
            let lists = FreeLists {
                state: PoolState {
                    chunk_size: opts.file_size,
                    meta_page_size: opts.meta_page_size,
                    block_size: opts.block_size,
                    ..PoolState::default()
                },
                ..FreeLists::default()
            };
            let core = Arc::new(PoolCore {
                clean_throttle: IopsThrottle::new(opts.clean_iops),
                fs,
                opts,
                lists: Mutex::new(lists),
                available: Condvar::new(),
                next_file_num: AtomicU64::new(1),
                format_stat: FormatStat::new(0),
                format_alive: AtomicBool::new(false),
                clean_alive: AtomicBool::new(false),
                format_sleeper: Sleeper::new(),
                clean_sleeper: Sleeper::new(),
            });
            return Ok(Self {
                core,
                format_thread: Mutex::new(None),
                clean_thread: Mutex::new(None),
            });
        }

        reconcile_manifest(fs.as_ref(), &mut opts)?;

        let mut lists = FreeLists {
            state: PoolState {
                chunk_size: opts.file_size,
                meta_page_size: opts.meta_page_size,
                block_size: opts.block_size,
                ..PoolState::default()
            },
            ..FreeLists::default()
        };
        let max = scan_pool_dir(fs.as_ref(), &opts, &mut lists)?;
        let target = prepare_format(fs.as_ref(), &opts, lists.state.chunk_num)?;

        let core = Arc::new(PoolCore {
            clean_throttle: IopsThrottle::new(opts.clean_iops),
            fs,
            opts,
            lists: Mutex::new(lists),
            available: Condvar::new(),
            next_file_num: AtomicU64::new(max + 1),
            format_stat: FormatStat::new(target),
            format_alive: AtomicBool::new(target > 0),
            clean_alive: AtomicBool::new(false),
            format_sleeper: Sleeper::new(),
            clean_sleeper: Sleeper::new(),
        });
        let pool = Self {
            core: Arc::clone(&core),
            format_thread: Mutex::new(None),
            clean_thread: Mutex::new(None),
        };
        if target > 0 {
            info!(target: "basin::format", files = target, "starting format pass");
            let worker = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name("basin-format".to_owned())
                .spawn(move || worker.format_supervisor())?;
            *pool.format_thread.lock() = Some(handle);
        }
        Ok(pool)
    }

    /// Claim a pool file, stamp `meta_page` over its header region, and
    /// rename it to `target` without replacing an existing file.
    ///
    /// `need_clean` asks for an all-zero body; a dirty file may be
    /// promoted inline via a zero-range punch. Transient failures are
    /// retried up to the configured attempt count. An existing target is
    /// reported as [`PoolError::TargetExists`] immediately — the claimed
    /// source goes back to the free lists.
    pub fn get_file(&self, target: &Path, meta_page: &[u8], need_clean: bool) -> Result<()> {
        self.core.get_file(target, meta_page, need_clean)
    }

    /// Return a retired file to the pool under a fresh number. Files of
    /// the wrong size (and everything when the pool is disabled) are
    /// deleted instead.
    pub fn recycle_file(&self, path: &Path) -> Result<()> {
        self.core.recycle_file(path)
    }

    /// Files currently claimable from the reservoir.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.core.size()
    }

    /// Whether the reservoir is at or above its configured low
    /// watermark.
    #[must_use]
    pub fn has_enough(&self) -> bool {
        self.size() >= self.core.opts.chunk_reserved
    }

    /// Point-in-time snapshot of the pool counters.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.core.state()
    }

    /// Progress of the background format pass.
    #[must_use]
    pub fn format_stat(&self) -> &FormatStat {
        &self.core.format_stat
    }

    /// Options after manifest reconciliation.
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.core.opts
    }

    /// Start the clean worker. Idempotent; a no-op unless the options
    /// enable cleaning.
    pub fn start_cleaning(&self) -> Result<()> {
        if !self.core.opts.need_clean {
            return Ok(());
        }
        if self.core.clean_alive.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.clean_sleeper.reset();
        let worker = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("basin-clean".to_owned())
            .spawn(move || worker.clean_worker())?;
        *self.clean_thread.lock() = Some(handle);
        info!(target: "basin::clean", "clean worker started");
        Ok(())
    }

    /// Stop and join the clean worker. Idempotent.
    pub fn stop_cleaning(&self) {
        if self.core.clean_alive.swap(false, Ordering::SeqCst) {
            self.core.clean_sleeper.interrupt();
            if let Some(handle) = self.clean_thread.lock().take() {
                let _ = handle.join();
            }
            info!(target: "basin::clean", "clean worker stopped");
        }
    }

    /// Abandon the rest of the format pass and join its threads.
    /// Idempotent.
    pub fn stop_formatting(&self) {
        if self.core.format_alive.swap(false, Ordering::SeqCst) {
            self.core.format_sleeper.interrupt();
            self.core.wake_waiters();
            if let Some(handle) = self.format_thread.lock().take() {
                let _ = handle.join();
            }
            info!(target: "basin::format", "format pass stopped");
        }
    }

    /// Stop both workers and drop the buffered free lists.
    pub fn shutdown(&self) {
        self.stop_formatting();
        self.stop_cleaning();
        // A completed format pass leaves its supervisor handle behind.
        if let Some(handle) = self.format_thread.lock().take() {
            let _ = handle.join();
        }
        let mut lists = self.core.lists.lock();
        lists.dirty.clear();
        lists.clean.clear();
        lists.state.dirty_left = 0;
        lists.state.clean_left = 0;
        lists.state.preallocated_left = 0;
    }
}

impl Drop for FilePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Test hooks ─────────────────────────────────────────────────────────

/// Hooks for tests; not part of the production surface.
pub mod testing {
    use super::{FilePool, Ordering, PoolError, Result};

    /// Blocks until the background format pass has settled.
    pub trait FormatBarrier {
        /// Wait until every requested chunk has been produced, or the
        /// pass has failed or been stopped; then join the pass.
        fn wait_format_done(&self) -> Result<()>;
    }

    impl FormatBarrier for FilePool {
        fn wait_format_done(&self) -> Result<()> {
            let core = &self.core;
            {
                let mut lists = core.lists.lock();
                while core.formatting_active() {
                    core.available.wait(&mut lists);
                }
            }
            if let Some(handle) = self.format_thread.lock().take() {
                let _ = handle.join();
            }
            if core.format_stat.failed.load(Ordering::SeqCst) {
                return Err(PoolError::FormatFailed);
            }
            Ok(())
        }
    }
}
