//! Production filesystem backed by POSIX syscalls.

use crate::{FileSystem, FsFile, FsStats, OpenFlags};
use basin_error::{PoolError, Result};
use nix::errno::Errno;
use nix::fcntl::{fallocate, renameat2, FallocateFlags, RenameFlags};
use nix::libc::off_t;
use nix::sys::statvfs::statvfs;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::trace;

/// `std::fs` plus the Linux-specific calls the pool depends on:
/// `fallocate`, zero-range, no-replace rename, and `statvfs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixFileSystem;

struct PosixFile {
    file: File,
}

fn to_off(n: u64, what: &'static str) -> Result<off_t> {
    off_t::try_from(n).map_err(|_| {
        PoolError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{what} overflows off_t"),
        ))
    })
}

impl FsFile for PosixFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        Ok(self.file.read_exact_at(buf, offset)?)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        Ok(self.file.write_all_at(buf, offset)?)
    }

    fn sync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn allocate(&self, len: u64) -> Result<()> {
        fallocate(
            self.file.as_raw_fd(),
            FallocateFlags::empty(),
            0,
            to_off(len, "allocation length")?,
        )
        .map_err(|errno| PoolError::Io(errno.into()))
    }

    fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        fallocate(
            self.file.as_raw_fd(),
            FallocateFlags::FALLOC_FL_ZERO_RANGE,
            to_off(offset, "zero-range offset")?,
            to_off(len, "zero-range length")?,
        )
        .map_err(|errno| PoolError::Io(errno.into()))
    }
}

impl FileSystem for PosixFileSystem {
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn FsFile>> {
        let mut opts = OpenOptions::new();
        opts.read(flags.read).write(flags.write).create(flags.create);
        if flags.sync {
            opts.custom_flags(nix::libc::O_SYNC);
        }
        let file = opts.open(path)?;
        trace!(target: "basin::fs", path = %path.display(), "open");
        Ok(Box::new(PosixFile { file }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(path)?)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(from, to)?)
    }

    fn rename_noreplace(&self, from: &Path, to: &Path) -> Result<()> {
        renameat2(
            None,
            from,
            None,
            to,
            RenameFlags::RENAME_NOREPLACE,
        )
        .map_err(|errno| match errno {
            Errno::EEXIST => PoolError::TargetExists(to.to_path_buf()),
            other => PoolError::Io(other.into()),
        })
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        Ok(fs::create_dir_all(path)?)
    }

    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().into_string().map_err(|raw| {
                PoolError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("non-UTF-8 file name {raw:?}"),
                ))
            })?;
            names.push(name);
        }
        Ok(names)
    }

    fn statfs(&self, path: &Path) -> Result<FsStats> {
        let stat = statvfs(path).map_err(|errno| PoolError::Io(errno.into()))?;
        let frag = stat.fragment_size();
        Ok(FsStats {
            total: stat.blocks() * frag,
            available: stat.blocks_available() * frag,
        })
    }
}
