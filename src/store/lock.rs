//! File-scoped advisory locks with per-handle reentrancy.
//!
//! The OS lock is taken only on the 0→1 depth transition and dropped on
//! 1→0; in between a handle may re-acquire freely. Guard drop order is
//! what enforces the release ordering of nested locks.

use std::cell::Cell;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use log::error;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::store::StoreError;

/// Bookkeeping for one lock word of a handle.
///
/// The descriptor is a cell because the header writer swaps descriptors
/// while the lock is held (the commit-via-rename path keeps the freshly
/// written file locked and closes the old one).
pub(crate) struct LockState {
    name: &'static str,
    count: Cell<u32>,
    fd: Cell<RawFd>,
}

impl LockState {
    pub(crate) fn new(name: &'static str) -> Rc<LockState> {
        Rc::new(LockState {
            name,
            count: Cell::new(0),
            fd: Cell::new(-1),
        })
    }

    pub(crate) fn depth(&self) -> u32 {
        self.count.get()
    }

    /// Point the lock at a replacement descriptor (which the caller has
    /// already locked).
    pub(crate) fn replace_fd(&self, fd: RawFd) {
        self.fd.set(fd);
    }
}

/// One acquisition of a lock; dropping it releases the OS lock once the
/// depth returns to zero.
pub struct LockGuard {
    state: Rc<LockState>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let depth = self.state.count.get();
        debug_assert!(depth > 0);
        self.state.count.set(depth - 1);
        if depth == 1 {
            if let Err(err) = flock(self.state.fd.get(), FlockArg::Unlock) {
                error!("IOERROR: unlocking {}: {}", self.state.name, err);
            }
        }
    }
}

/// Acquire `state` over `file`. A nonblocking acquisition that would
/// block fails with [StoreError::PopLocked] (only the pop lock is taken
/// nonblocking).
pub(crate) fn acquire(
    state: &Rc<LockState>,
    file: &File,
    blocking: bool,
) -> Result<LockGuard, StoreError> {
    if state.count.get() == 0 {
        let arg = if blocking {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockExclusiveNonblock
        };
        match flock(file.as_raw_fd(), arg) {
            Ok(()) => {}
            // EWOULDBLOCK is EAGAIN on every platform we run on
            Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EACCES))
                if !blocking =>
            {
                return Err(StoreError::PopLocked);
            }
            Err(err) => {
                return Err(StoreError::io(state.name, err));
            }
        }
        state.fd.set(file.as_raw_fd());
    }
    state.count.set(state.count.get() + 1);
    Ok(LockGuard {
        state: Rc::clone(state),
    })
}

/// Take a plain blocking exclusive lock on `file` without any handle
/// bookkeeping (used for freshly created files that no other process can
/// reach yet).
pub(crate) fn lock_blocking(file: &File) -> Result<(), StoreError> {
    flock(file.as_raw_fd(), FlockArg::LockExclusive)
        .map_err(|err| StoreError::io("flock", err))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reentrant_depth() -> Result<(), StoreError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let state = LockState::new("test");
        let outer = acquire(&state, &file, true)?;
        assert_eq!(state.depth(), 1);
        {
            let _inner = acquire(&state, &file, true)?;
            assert_eq!(state.depth(), 2);
        }
        assert_eq!(state.depth(), 1);
        drop(outer);
        assert_eq!(state.depth(), 0);
        Ok(())
    }

    #[test]
    fn nonblocking_conflict_is_pop_locked() -> Result<(), StoreError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        // A second descriptor simulates another process.
        let other = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let state = LockState::new("holder");
        let _held = acquire(&state, &file, true)?;

        let contender = LockState::new("contender");
        match acquire(&contender, &other, false) {
            Err(StoreError::PopLocked) => {}
            other => panic!("expected PopLocked, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }
}
