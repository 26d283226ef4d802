//! Generic file helpers: read-only memory maps, bounded retry writes and
//! atomic whole-file replacement.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use anyhow::{bail, format_err, Error};
use nix::libc::c_void;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat;
use nix::unistd;

/// How many zero-progress writes we tolerate before giving up.
const WRITE_RETRIES: usize = 10;

/// Read-only memory map over (a prefix of) an open file.
///
/// A zero-length region is represented without an actual mapping so empty
/// files can be handled uniformly. The mapping stays valid after the file
/// is renamed over; callers refresh explicitly when they detect an inode
/// change.
pub struct Map {
    base: *mut c_void,
    len: usize,
}

impl Map {
    pub fn empty() -> Self {
        Map { base: std::ptr::null_mut(), len: 0 }
    }

    pub fn map(file: &File, len: usize) -> Result<Self, Error> {
        if len == 0 {
            return Ok(Self::empty());
        }
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|err| format_err!("mmap failed - {}", err))?;
        Ok(Map { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len) }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let _ = unsafe { munmap(self.base, self.len) };
        }
    }
}

/// Write the whole buffer, retrying short writes a bounded number of times.
pub fn retry_write(file: &File, buf: &[u8]) -> Result<(), Error> {
    let mut file: &File = file;
    let mut done = 0;
    let mut stalls = 0;
    while done < buf.len() {
        match file.write(&buf[done..]) {
            Ok(0) => {
                stalls += 1;
                if stalls > WRITE_RETRIES {
                    bail!("write made no progress after {} bytes", done);
                }
            }
            Ok(n) => {
                done += n;
                stalls = 0;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Positioned variant of [retry_write].
pub fn pwrite_all(file: &File, offset: u64, buf: &[u8]) -> Result<(), Error> {
    let mut seeker: &File = file;
    seeker.seek(SeekFrom::Start(offset))?;
    retry_write(file, buf)
}

pub fn fsync_file(file: &File) -> Result<(), Error> {
    unistd::fsync(file.as_raw_fd()).map_err(|err| format_err!("fsync failed - {}", err))
}

pub fn inode_of(file: &File) -> Result<u64, Error> {
    let st = stat::fstat(file.as_raw_fd()).map_err(|err| format_err!("fstat failed - {}", err))?;
    Ok(st.st_ino)
}

pub fn file_size(file: &File) -> Result<u64, Error> {
    let st = stat::fstat(file.as_raw_fd()).map_err(|err| format_err!("fstat failed - {}", err))?;
    Ok(st.st_size as u64)
}

pub fn unlink_ignore<P: AsRef<Path>>(path: P) {
    let _ = std::fs::remove_file(path.as_ref());
}

/// Replace `path` atomically with `data`.
///
/// Note: we use mkstemp here, because this works with different processes
/// sharing the directory. The data is fsynced before the rename so a crash
/// never exposes a half-written file under the final name.
pub fn file_set_contents<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed - {}", template, err),
    };
    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or_else(|| {
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH
    });

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed - {}", tmp_path, err);
    }

    let file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = retry_write(&file, data).and_then(|_| fsync_file(&file)) {
        let _ = unistd::unlink(tmp_path);
        bail!("writing {:?} failed - {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename to {:?} failed - {}", path, err);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn map_round_trip() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data");
        file_set_contents(&path, b"hello mailbox", None)?;

        let file = File::open(&path)?;
        let len = file_size(&file)? as usize;
        let map = Map::map(&file, len)?;
        assert_eq!(map.as_slice(), b"hello mailbox");

        let empty = Map::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.as_slice(), b"");
        Ok(())
    }

    #[test]
    fn positioned_writes() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        retry_write(&file, b"0123456789")?;
        pwrite_all(&file, 4, b"xy")?;
        assert_eq!(std::fs::read(&path)?, b"0123xy6789");
        Ok(())
    }
}
