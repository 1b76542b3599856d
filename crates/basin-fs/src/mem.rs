//! In-memory filesystem for deterministic pool tests.

use crate::{FileSystem, FsFile, FsStats, OpenFlags};
use basin_error::{PoolError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemState {
    files: HashMap<PathBuf, Vec<u8>>,
    dirs: HashSet<PathBuf>,
    /// Paths whose writes fail with `EIO`, for error-injection tests.
    poisoned: HashSet<PathBuf>,
}

/// In-memory [`FileSystem`] with the same contract as the POSIX one,
/// including no-replace rename semantics and a configurable capacity
/// answer. Eliminates disk latency and lets tests inject write failures.
#[derive(Debug, Clone)]
pub struct MemFileSystem {
    state: Arc<Mutex<MemState>>,
    stats: Arc<Mutex<FsStats>>,
}

impl Default for MemFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            stats: Arc::new(Mutex::new(FsStats {
                total: 64 << 30,
                available: 64 << 30,
            })),
        }
    }

    /// Set the answer [`FileSystem::statfs`] will give.
    pub fn set_stats(&self, total: u64, available: u64) {
        *self.stats.lock() = FsStats { total, available };
    }

    /// Make every write to `path` fail with `EIO`.
    pub fn poison(&self, path: &Path) {
        self.state.lock().poisoned.insert(path.to_path_buf());
    }

    fn not_found(path: &Path) -> PoolError {
        PoolError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found", path.display()),
        ))
    }
}

struct MemFile {
    path: PathBuf,
    state: Arc<Mutex<MemState>>,
}

impl MemFile {
    fn with_bytes<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let Some(bytes) = state.files.get_mut(&self.path) else {
            return Err(MemFileSystem::not_found(&self.path));
        };
        f(bytes)
    }
}

impl FsFile for MemFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.with_bytes(|bytes| {
            let start = usize::try_from(offset).unwrap_or(usize::MAX);
            let end = start.saturating_add(buf.len());
            if end > bytes.len() {
                return Err(PoolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of file",
                )));
            }
            buf.copy_from_slice(&bytes[start..end]);
            Ok(())
        })
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.poisoned.contains(&self.path) {
            return Err(PoolError::Io(io::Error::from_raw_os_error(
                nix::libc::EIO,
            )));
        }
        let Some(bytes) = state.files.get_mut(&self.path) else {
            return Err(MemFileSystem::not_found(&self.path));
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(buf.len());
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        self.with_bytes(|bytes| Ok(bytes.len() as u64))
    }

    fn allocate(&self, len: u64) -> Result<()> {
        self.with_bytes(|bytes| {
            let len = usize::try_from(len).unwrap_or(usize::MAX);
            if bytes.len() < len {
                bytes.resize(len, 0);
            }
            Ok(())
        })
    }

    fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        self.with_bytes(|bytes| {
            let start = usize::try_from(offset).unwrap_or(usize::MAX);
            let end = start.saturating_add(usize::try_from(len).unwrap_or(usize::MAX));
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes[start..end].fill(0);
            Ok(())
        })
    }
}

impl FileSystem for MemFileSystem {
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn FsFile>> {
        let mut state = self.state.lock();
        if !state.files.contains_key(path) {
            if !flags.create {
                return Err(Self::not_found(path));
            }
            state.files.insert(path.to_path_buf(), Vec::new());
        }
        Ok(Box::new(MemFile {
            path: path.to_path_buf(),
            state: Arc::clone(&self.state),
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if self.state.lock().files.remove(path).is_none() {
            return Err(Self::not_found(path));
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.lock();
        let Some(bytes) = state.files.remove(from) else {
            return Err(Self::not_found(from));
        };
        state.files.insert(to.to_path_buf(), bytes);
        Ok(())
    }

    fn rename_noreplace(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if state.files.contains_key(to) || state.dirs.contains(to) {
            return Err(PoolError::TargetExists(to.to_path_buf()));
        }
        let Some(bytes) = state.files.remove(from) else {
            return Err(Self::not_found(from));
        };
        state.files.insert(to.to_path_buf(), bytes);
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        let mut cur = PathBuf::new();
        for part in path.components() {
            cur.push(part);
            state.dirs.insert(cur.clone());
        }
        Ok(())
    }

    fn dir_exists(&self, path: &Path) -> bool {
        self.state.lock().dirs.contains(path)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.state.lock().files.contains_key(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let state = self.state.lock();
        if !state.dirs.contains(dir) {
            return Err(Self::not_found(dir));
        }
        let mut names: Vec<String> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.parent() == Some(dir) && *p != dir)
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn statfs(&self, _path: &Path) -> Result<FsStats> {
        Ok(*self.stats.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_create_for_new_files() {
        let fs = MemFileSystem::new();
        let path = Path::new("/p/1");
        assert!(fs.open(path, OpenFlags::read_write()).is_err());
        fs.open(path, OpenFlags::read_write().with_create()).unwrap();
        assert!(fs.file_exists(path));
    }

    #[test]
    fn write_read_roundtrip_extends_file() {
        let fs = MemFileSystem::new();
        let path = Path::new("/p/1");
        let file = fs
            .open(path, OpenFlags::read_write().with_create())
            .unwrap();
        file.write_all_at(&[7; 16], 8).unwrap();
        assert_eq!(file.len().unwrap(), 24);

        let mut buf = [0_u8; 16];
        file.read_exact_at(&mut buf, 8).unwrap();
        assert_eq!(buf, [7; 16]);

        let mut head = [9_u8; 8];
        file.read_exact_at(&mut head, 0).unwrap();
        assert_eq!(head, [0; 8]);
    }

    #[test]
    fn allocate_and_zero_range() {
        let fs = MemFileSystem::new();
        let path = Path::new("/p/1");
        let file = fs
            .open(path, OpenFlags::read_write().with_create())
            .unwrap();
        file.allocate(1024).unwrap();
        assert_eq!(file.len().unwrap(), 1024);

        file.write_all_at(&[0xFF; 1024], 0).unwrap();
        file.zero_range(0, 1024).unwrap();
        let mut buf = [1_u8; 1024];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0; 1024]);
    }

    #[test]
    fn rename_noreplace_refuses_existing_target() {
        let fs = MemFileSystem::new();
        let a = Path::new("/p/a");
        let b = Path::new("/p/b");
        fs.open(a, OpenFlags::read_write().with_create()).unwrap();
        fs.open(b, OpenFlags::read_write().with_create()).unwrap();

        assert!(matches!(
            fs.rename_noreplace(a, b),
            Err(PoolError::TargetExists(_))
        ));
        assert!(fs.file_exists(a));

        let c = Path::new("/p/c");
        fs.rename_noreplace(a, c).unwrap();
        assert!(!fs.file_exists(a));
        assert!(fs.file_exists(c));
    }

    #[test]
    fn list_is_direct_children_only() {
        let fs = MemFileSystem::new();
        fs.mkdir_all(Path::new("/p/sub")).unwrap();
        fs.open(Path::new("/p/1"), OpenFlags::read_write().with_create())
            .unwrap();
        fs.open(
            Path::new("/p/sub/2"),
            OpenFlags::read_write().with_create(),
        )
        .unwrap();

        let names = fs.list(Path::new("/p")).unwrap();
        assert_eq!(names, ["1", "sub"]);
    }

    #[test]
    fn poisoned_paths_fail_writes() {
        let fs = MemFileSystem::new();
        let path = Path::new("/p/1");
        let file = fs
            .open(path, OpenFlags::read_write().with_create())
            .unwrap();
        fs.poison(path);
        assert!(file.write_all_at(&[1], 0).is_err());
    }

    #[test]
    fn statfs_is_configurable() {
        let fs = MemFileSystem::new();
        fs.set_stats(1000, 400);
        let stats = fs.statfs(Path::new("/anywhere")).unwrap();
        assert_eq!(stats.total, 1000);
        assert_eq!(stats.available, 400);
    }
}
