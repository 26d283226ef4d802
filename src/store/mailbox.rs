//! The mailbox handle: open/close lifecycle, header I/O, index and cache
//! I/O with the generation-number coherence check, the reentrant lock
//! methods, the in-place format upgrade, and create/delete.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use nix::sys::stat;

use super::index_file::{get_u32, put_u32};
use super::lock::{acquire, lock_blocking, LockGuard, LockState};
use crate::store::{
    acl_rights, cache_generation, decode_index_header, decode_index_record, encode_index_header,
    encode_index_record, mailbox_path, IndexHeader, IndexRecord, ListEntry, MailStore,
    MailboxFormat, StoreError, SystemFlags, BIT32_MAX, INDEX_HEADER_SIZE, INDEX_RECORD_SIZE,
    MAILBOX_MINOR_VERSION, MAX_USER_FLAGS, OFFSET_CONTENT_LINES, OFFSET_SYSTEM_FLAGS, OFFSET_UID,
};
use crate::tools::{self, Map};

pub const FNAME_HEADER: &str = "cyrus.header";
pub const FNAME_INDEX: &str = "cyrus.index";
pub const FNAME_CACHE: &str = "cyrus.cache";

/// Magic banner at the start of the header file (no trailing NUL).
pub const MAILBOX_HEADER_MAGIC: &[u8] = b"\xa1\x02\x8b\x0dCyrus mailbox header\n\
\"The best thing about this system was that it had lots of goals.\"\n\
\t--Jim Morris on Andrew\n";

/// How often an opener retries a generation-number mismatch before
/// declaring the mailbox bad.
const GENERATION_RETRIES: u32 = 60;

const UNIQUEID_PRIME: u64 = 2_147_484_043;

pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// The unique identifier of a mailbox: the name hashed to 32 bits and the
/// uidvalidity, both in hex.
pub fn make_uniqueid(name: &str, uidvalidity: u32) -> String {
    let mut hash: u64 = 0;
    for &b in name.as_bytes() {
        hash = (hash * 251 + u64::from(b)) % UNIQUEID_PRIME;
    }
    format!("{:08x}{:08x}", hash, uidvalidity)
}

/// Which of a mailbox's control files exist on disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct ControlFiles {
    pub header: bool,
    pub index: bool,
    pub cache: bool,
}

pub fn stat_control_files(path: &Path) -> ControlFiles {
    ControlFiles {
        header: path.join(FNAME_HEADER).is_file(),
        index: path.join(FNAME_INDEX).is_file(),
        cache: path.join(FNAME_CACHE).is_file(),
    }
}

/// Header and index lock of an open mailbox; dropping releases the index
/// lock first.
pub struct MailboxLock {
    pub index: LockGuard,
    pub header: LockGuard,
}

/// An open mailbox.
///
/// The handle exclusively owns its descriptors and mappings; the ACL is a
/// cached copy of the mailbox-list value and the quota root is resolved
/// against the quota store on use.
pub struct Mailbox<'a> {
    pub(crate) store: &'a MailStore,

    name: String,
    path: PathBuf,
    acl: String,
    my_rights: String,
    uniqueid: Option<String>,
    flag_names: Vec<Option<String>>,

    pub(crate) header_file: Option<File>,
    pub(crate) index_file: Option<File>,
    pub(crate) cache_file: Option<File>,
    pub(crate) header_map: Map,
    pub(crate) index_map: Map,
    pub(crate) cache_map: Map,
    pub(crate) cache_size: u64,

    header_lock: Rc<LockState>,
    index_lock: Rc<LockState>,
    pop_lock: Rc<LockState>,
    seen_lock_depth: u32,

    header_ino: u64,

    /// Decoded snapshot of the index header.
    pub index: IndexHeader,
    pub quota_root: Option<String>,
}

impl MailStore {
    /// Open the header of the mailbox `name` for `user`, resolving the
    /// location through the mailbox list.
    pub fn open_header(&self, name: &str, user: &str) -> Result<Mailbox, StoreError> {
        let entry = self.mboxlist.lookup(name)?;
        self.open_header_path(name, &entry.path, &entry.acl, user)
    }

    /// Open the header of the mailbox at an explicit location.
    ///
    /// The mailbox list stays authoritative for the ACL; the header copy
    /// is only a recovery backup, so the passed value is used as-is.
    pub fn open_header_path(
        &self,
        name: &str,
        path: &Path,
        acl: &str,
        user: &str,
    ) -> Result<Mailbox, StoreError> {
        let header_path = path.join(FNAME_HEADER);
        let header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&header_path)
            .map_err(|err| {
                error!("IOERROR: opening {:?}: {}", header_path, err);
                StoreError::from(err)
            })?;

        let st = stat::fstat(std::os::unix::io::AsRawFd::as_raw_fd(&header_file))
            .unwrap_or_else(|err| panic!("can't fstat header file: {}", err));
        let header_map = Map::map(&header_file, st.st_size as usize)
            .map_err(|err| StoreError::io("mapping header", err))?;

        let mut mailbox = Mailbox {
            store: self,
            name: name.to_string(),
            path: path.to_owned(),
            acl: acl.to_string(),
            my_rights: acl_rights(acl, user),
            uniqueid: None,
            flag_names: vec![None; MAX_USER_FLAGS],
            header_file: Some(header_file),
            index_file: None,
            cache_file: None,
            header_map,
            index_map: Map::empty(),
            cache_map: Map::empty(),
            cache_size: 0,
            header_lock: LockState::new("header"),
            index_lock: LockState::new("index"),
            pop_lock: LockState::new("pop"),
            seen_lock_depth: 0,
            header_ino: st.st_ino,
            index: IndexHeader::default(),
            quota_root: None,
        };

        mailbox.read_header()?;
        Ok(mailbox)
    }

    /// Open `name` with header and index locked and the index read.
    pub fn open_locked(&self, name: &str, user: &str) -> Result<(Mailbox, MailboxLock), StoreError> {
        let mut mailbox = self.open_header(name, user)?;
        let header = mailbox.lock_header()?;
        mailbox.open_index()?;
        let index = mailbox.lock_index()?;
        Ok((mailbox, MailboxLock { index, header }))
    }
}

impl<'a> Mailbox<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acl(&self) -> &str {
        &self.acl
    }

    pub fn my_rights(&self) -> &str {
        &self.my_rights
    }

    pub fn uniqueid(&self) -> &str {
        self.uniqueid.as_deref().unwrap_or("")
    }

    pub fn flag_name(&self, flag: usize) -> Option<&str> {
        self.flag_names.get(flag).and_then(|name| name.as_deref())
    }

    pub(crate) fn flag_names(&self) -> &[Option<String>] {
        &self.flag_names
    }

    pub(crate) fn set_flag_names(&mut self, names: Vec<Option<String>>) {
        debug_assert_eq!(names.len(), MAX_USER_FLAGS);
        self.flag_names = names;
    }

    pub fn lookup_user_flag(&self, name: &str) -> Option<usize> {
        self.flag_names
            .iter()
            .position(|slot| slot.as_deref() == Some(name))
    }

    /// Find or allocate a user-flag slot for `name`. The caller commits
    /// the new table with [write_header](Self::write_header).
    pub fn define_user_flag(&mut self, name: &str) -> Result<usize, StoreError> {
        if let Some(flag) = self.lookup_user_flag(name) {
            return Ok(flag);
        }
        match self.flag_names.iter().position(|slot| slot.is_none()) {
            Some(free) => {
                self.flag_names[free] = Some(name.to_string());
                Ok(free)
            }
            None => Err(StoreError::Internal("user flag table is full".into())),
        }
    }

    pub fn header_path(&self) -> PathBuf {
        self.path.join(FNAME_HEADER)
    }

    pub fn index_path(&self) -> PathBuf {
        self.path.join(FNAME_INDEX)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.path.join(FNAME_CACHE)
    }

    /// Relative file name of the message with UID `uid`.
    pub fn message_fname(&self, uid: u32) -> String {
        debug_assert!(self.index.format != MailboxFormat::Netnews);
        format!("{}.", uid)
    }

    pub fn message_path(&self, uid: u32) -> PathBuf {
        self.path.join(self.message_fname(uid))
    }

    /// The parsed-header cache fields of `record`, out of the mapped
    /// cache file.
    pub fn cache_fields(&self, record: &IndexRecord) -> Result<Vec<&[u8]>, StoreError> {
        super::cache_file::record_fields(self.cache_map.as_slice(), record.cache_offset as usize)
    }

    /// Map the raw octets of the message with UID `uid`.
    pub fn map_message(&self, uid: u32) -> Result<Map, StoreError> {
        let path = self.message_path(uid);
        let file = File::open(&path).map_err(|err| {
            debug!("IOERROR: opening {:?}: {}", path, err);
            StoreError::from(err)
        })?;
        let size = tools::file_size(&file)
            .unwrap_or_else(|err| panic!("can't fstat message file: {}", err));
        Map::map(&file, size as usize).map_err(|err| StoreError::io("mapping message", err))
    }

    /// Parse the mapped header file.
    fn read_header(&mut self) -> Result<(), StoreError> {
        let buf = self.header_map.as_slice();

        if buf.len() < MAILBOX_HEADER_MAGIC.len() || !buf.starts_with(MAILBOX_HEADER_MAGIC) {
            return Err(StoreError::BadFormat);
        }

        let rest = &buf[MAILBOX_HEADER_MAGIC.len()..];
        let eol = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(StoreError::BadFormat)?;
        let line = &rest[..eol];
        let tab = line.iter().position(|&b| b == b'\t');

        let mut old_format = false;
        let (quota_end, uniqueid) = match tab {
            Some(tab) => {
                let id = &line[tab + 1..];
                if id.is_empty() {
                    return Err(StoreError::BadFormat);
                }
                (tab, Some(String::from_utf8_lossy(id).into_owned()))
            }
            None => {
                // legacy single-line form without a unique id
                old_format = true;
                debug!("mailbox '{}' has an old header file", self.name);
                (eol, None)
            }
        };
        let quota_root = if quota_end > 0 {
            Some(String::from_utf8_lossy(&line[..quota_end]).into_owned())
        } else {
            None
        };

        let rest = &rest[eol + 1..];
        let eol = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(StoreError::BadFormat)?;
        let flag_line = String::from_utf8_lossy(&rest[..eol]).into_owned();

        let mut flag_names = vec![None; MAX_USER_FLAGS];
        for (flag, token) in flag_line.split(' ').enumerate() {
            if flag >= MAX_USER_FLAGS {
                break;
            }
            if !token.is_empty() {
                flag_names[flag] = Some(token.to_string());
            }
        }

        self.quota_root = quota_root;
        self.uniqueid = uniqueid;
        self.flag_names = flag_names;

        if old_format {
            // Generate the unique id now; it needs the uidvalidity, so
            // bring the index in first.
            let _header = self.lock_header()?;
            let _ = self.open_index();
            self.uniqueid = Some(make_uniqueid(&self.name, self.index.uidvalidity));
            self.write_header()?;
        }

        Ok(())
    }

    /// Parse just the ACL line out of the mapped header file.
    pub fn read_header_acl(&mut self) -> Result<(), StoreError> {
        let buf = self.header_map.as_slice();

        if buf.len() < MAILBOX_HEADER_MAGIC.len() || !buf.starts_with(MAILBOX_HEADER_MAGIC) {
            return Err(StoreError::BadFormat);
        }

        // skip the quota-root and flag-name lines
        let mut rest = &buf[MAILBOX_HEADER_MAGIC.len()..];
        for _ in 0..2 {
            let eol = rest
                .iter()
                .position(|&b| b == b'\n')
                .ok_or(StoreError::BadFormat)?;
            rest = &rest[eol + 1..];
        }

        let eol = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(StoreError::BadFormat)?;
        self.acl = String::from_utf8_lossy(&rest[..eol]).into_owned();
        Ok(())
    }

    /// Refresh the ACL (and the opener's rights) from the mailbox list.
    pub fn read_acl(&mut self, user: &str) -> Result<(), StoreError> {
        let entry = self.store.mboxlist.lookup(&self.name)?;
        self.acl = entry.acl;
        self.my_rights = acl_rights(&self.acl, user);
        Ok(())
    }

    /// Serialize and atomically replace the header file. Requires the
    /// header lock.
    pub fn write_header(&mut self) -> Result<(), StoreError> {
        assert!(self.header_lock.depth() != 0);

        let mut data = Vec::with_capacity(MAILBOX_HEADER_MAGIC.len() + 256);
        data.extend_from_slice(MAILBOX_HEADER_MAGIC);
        if let Some(root) = &self.quota_root {
            data.extend_from_slice(root.as_bytes());
        }
        data.push(b'\t');
        data.extend_from_slice(self.uniqueid().as_bytes());
        data.push(b'\n');

        // user flags, positions preserved (gaps stay as empty names)
        let last = self
            .flag_names
            .iter()
            .rposition(|slot| slot.is_some());
        if let Some(last) = last {
            for slot in &self.flag_names[..=last] {
                if let Some(name) = slot {
                    data.extend_from_slice(name.as_bytes());
                }
                data.push(b' ');
            }
        }
        data.push(b'\n');
        data.extend_from_slice(self.acl.as_bytes());
        data.push(b'\n');

        let header_path = self.header_path();
        let mut new_path = header_path.clone();
        new_path.set_file_name(format!("{}.NEW", FNAME_HEADER));

        let write_new = || -> Result<File, StoreError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&new_path)?;
            tools::retry_write(&file, &data).map_err(|err| StoreError::io("write", err))?;
            tools::fsync_file(&file).map_err(|err| StoreError::io("fsync", err))?;
            lock_blocking(&file)?;
            std::fs::rename(&new_path, &header_path)?;
            Ok(file)
        };

        let new_file = match write_new() {
            Ok(file) => file,
            Err(err) => {
                error!("IOERROR: writing {:?}: {}", new_path, err);
                tools::unlink_ignore(&new_path);
                return Err(StoreError::Io(format!("writing header: {}", err)));
            }
        };

        // The fresh descriptor carries the lock now; close the old one
        // only after the rename succeeded.
        self.header_lock
            .replace_fd(std::os::unix::io::AsRawFd::as_raw_fd(&new_file));
        self.header_file = Some(new_file);

        let file = self.header_file.as_ref().unwrap();
        let st = stat::fstat(std::os::unix::io::AsRawFd::as_raw_fd(file))
            .unwrap_or_else(|err| panic!("can't fstat header file: {}", err));
        self.header_map = Map::map(file, st.st_size as usize)
            .map_err(|err| StoreError::io("mapping header", err))?;
        self.header_ino = st.st_ino;

        Ok(())
    }

    /// Lock the header. On the first acquisition the path is re-stated
    /// and the file reopened/reread if a writer renamed over it.
    pub fn lock_header(&mut self) -> Result<LockGuard, StoreError> {
        let first = self.header_lock.depth() == 0;
        if first {
            assert!(self.index_lock.depth() == 0, "header lock after index lock");
            assert!(self.seen_lock_depth == 0, "header lock after seen lock");
        }

        let file = self
            .header_file
            .as_ref()
            .ok_or_else(|| StoreError::Internal("mailbox has no header".into()))?;
        let guard = acquire(&self.header_lock, file, true)?;
        if !first {
            return Ok(guard);
        }

        let header_path = self.header_path();
        loop {
            let file = self.header_file.as_ref().unwrap();
            let fd_st = stat::fstat(std::os::unix::io::AsRawFd::as_raw_fd(file))
                .map_err(|err| StoreError::io("fstating header", err))?;
            let path_st = stat::stat(&header_path).map_err(|err| {
                error!("IOERROR: locking header for {}: {}", self.name, err);
                StoreError::io("stating header", err)
            })?;

            if fd_st.st_ino == path_st.st_ino {
                if path_st.st_ino != self.header_ino {
                    self.header_map = Map::map(self.header_file.as_ref().unwrap(), path_st.st_size as usize)
                        .map_err(|err| StoreError::io("mapping header", err))?;
                    self.header_ino = path_st.st_ino;
                    self.read_header()?;
                }
                return Ok(guard);
            }

            // a writer renamed a new header into place; chase it
            let new_file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&header_path)
                .map_err(|err| {
                    error!("IOERROR: reopening header for {}: {}", self.name, err);
                    StoreError::from(err)
                })?;
            lock_blocking(&new_file)?;
            self.header_lock
                .replace_fd(std::os::unix::io::AsRawFd::as_raw_fd(&new_file));
            self.header_file = Some(new_file);
        }
    }

    fn lock_index_inner(&mut self, reread: bool) -> Result<LockGuard, StoreError> {
        let first = self.index_lock.depth() == 0;
        if first {
            assert!(self.seen_lock_depth == 0, "index lock after seen lock");
        }

        let file = self
            .index_file
            .as_ref()
            .ok_or_else(|| StoreError::Internal("mailbox index is not open".into()))?;
        let guard = acquire(&self.index_lock, file, true).map_err(|err| {
            error!("IOERROR: locking index for {}: {}", self.name, err);
            err
        })?;

        if first {
            let index_path = self.index_path();
            loop {
                let file = self.index_file.as_ref().unwrap();
                let fd_st = stat::fstat(std::os::unix::io::AsRawFd::as_raw_fd(file))
                    .map_err(|err| StoreError::io("fstating index", err))?;
                let path_st = stat::stat(&index_path).map_err(|err| {
                    error!("IOERROR: stating index for {}: {}", self.name, err);
                    StoreError::io("stating index", err)
                })?;
                if fd_st.st_ino == path_st.st_ino {
                    break;
                }

                // a compaction renamed new files into place; reopen the
                // pair and lock the new descriptor
                self.open_index_files()?;
                let file = self.index_file.as_ref().unwrap();
                lock_blocking(file)?;
                self.index_lock
                    .replace_fd(std::os::unix::io::AsRawFd::as_raw_fd(file));
            }
        }

        if reread {
            self.read_index_header()?;
        }
        Ok(guard)
    }

    /// Lock the index; blocks until the lock is available and rereads the
    /// index header afterwards.
    pub fn lock_index(&mut self) -> Result<LockGuard, StoreError> {
        self.lock_index_inner(true)
    }

    /// Take the nonblocking POP lock (on the cache file).
    pub fn lock_pop(&mut self) -> Result<LockGuard, StoreError> {
        let file = self
            .cache_file
            .as_ref()
            .ok_or_else(|| StoreError::Internal("mailbox cache is not open".into()))?;
        acquire(&self.pop_lock, file, false).map_err(|err| {
            if !matches!(err, StoreError::PopLocked) {
                error!("IOERROR: locking cache for {}: {}", self.name, err);
            }
            err
        })
    }

    pub(crate) fn header_locked(&self) -> bool {
        self.header_lock.depth() != 0
    }

    pub(crate) fn index_locked(&self) -> bool {
        self.index_lock.depth() != 0
    }

    pub(crate) fn seen_locked(&mut self) {
        self.seen_lock_depth += 1;
    }

    pub(crate) fn seen_unlocked(&mut self) {
        debug_assert!(self.seen_lock_depth > 0);
        self.seen_lock_depth -= 1;
    }

    /// Open (or reopen) the index and cache files and map them, without
    /// the generation check or header decode.
    fn open_index_files(&mut self) -> Result<(), StoreError> {
        let index_path = self.index_path();
        let index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&index_path)
            .map_err(|err| {
                error!("IOERROR: opening {:?}: {}", index_path, err);
                StoreError::from(err)
            })?;
        let index_size = tools::file_size(&index_file)
            .unwrap_or_else(|err| panic!("can't fstat index file: {}", err));
        let index_map = Map::map(&index_file, index_size as usize)
            .map_err(|err| StoreError::io("mapping index", err))?;

        let cache_path = self.cache_path();
        let cache_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&cache_path)
            .map_err(|err| {
                error!("IOERROR: opening {:?}: {}", cache_path, err);
                StoreError::from(err)
            })?;
        let cache_size = tools::file_size(&cache_file)
            .unwrap_or_else(|err| panic!("can't fstat cache file: {}", err));
        let cache_map = Map::map(&cache_file, cache_size as usize)
            .map_err(|err| StoreError::io("mapping cache", err))?;

        // If a lock is held at this depth, carry it over to the
        // replacement descriptor before the old one closes.
        if self.index_lock.depth() > 0 {
            lock_blocking(&index_file)?;
            self.index_lock
                .replace_fd(std::os::unix::io::AsRawFd::as_raw_fd(&index_file));
        }
        if self.pop_lock.depth() > 0 {
            lock_blocking(&cache_file)?;
            self.pop_lock
                .replace_fd(std::os::unix::io::AsRawFd::as_raw_fd(&cache_file));
        }

        self.index_file = Some(index_file);
        self.index_map = index_map;
        self.cache_file = Some(cache_file);
        self.cache_map = cache_map;
        self.cache_size = cache_size;
        Ok(())
    }

    /// Open the index and cache files, waiting out a racing compaction
    /// until the generation numbers agree, then read the index header.
    pub fn open_index(&mut self) -> Result<(), StoreError> {
        let mut tries = 0;
        loop {
            self.open_index_files()?;

            if self.index_map.len() < 4 || self.cache_map.len() < 4 {
                return Err(StoreError::BadFormat);
            }
            let index_gen = get_u32(self.index_map.as_slice(), 0);
            let cache_gen = cache_generation(self.cache_map.as_slice())?;
            if index_gen == cache_gen {
                break;
            }

            self.index_file = None;
            self.index_map = Map::empty();
            self.cache_file = None;
            self.cache_map = Map::empty();

            tries += 1;
            if tries > GENERATION_RETRIES {
                return Err(StoreError::BadFormat);
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }

        self.read_index_header()
    }

    /// Decode the mapped index header into the snapshot, upgrading the
    /// on-disk layout first when it is older than the current one.
    fn read_index_header(&mut self) -> Result<(), StoreError> {
        if self.index_file.is_none() {
            return Err(StoreError::BadFormat);
        }

        // refresh the mapping; the file may have grown
        let file = self.index_file.as_ref().unwrap();
        let size = tools::file_size(file)
            .unwrap_or_else(|err| panic!("can't fstat index file: {}", err));
        self.index_map =
            Map::map(file, size as usize).map_err(|err| StoreError::io("mapping index", err))?;

        let decode = decode_index_header(self.index_map.as_slice())?;
        self.index = decode.header;

        if decode.needs_upgrade || decode.needs_flag_counts {
            // The layout only ever moves forward, so an old layout
            // showing up while we already hold the index lock means the
            // file is damaged, not merely old.
            if self.index_lock.depth() > 0 {
                return Err(StoreError::BadFormat);
            }
            if decode.needs_flag_counts {
                self.calculate_flag_counts()?;
            }
            warn!("upgrading index format of mailbox {}", self.name);
            self.upgrade_index()?;
            // things changed out from under us; reread the whole pair
            return self.open_index();
        }

        Ok(())
    }

    /// Open just the index for repair: no cache, no generation check and
    /// no upgrade. Reconstruct rebuilds the pair from scratch, so all it
    /// needs from the old index is a readable snapshot.
    pub(crate) fn open_index_for_repair(&mut self) -> Result<(), StoreError> {
        let index_path = self.index_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&index_path)
            .map_err(StoreError::from)?;
        let size = tools::file_size(&file)
            .unwrap_or_else(|err| panic!("can't fstat index file: {}", err));
        let map =
            Map::map(&file, size as usize).map_err(|err| StoreError::io("mapping index", err))?;
        let decode = decode_index_header(map.as_slice())?;
        self.index_file = Some(file);
        self.index_map = map;
        self.index = decode.header;
        Ok(())
    }

    /// Read one index record. `msgno` is 1-based in UID order.
    pub fn read_index_record(&self, msgno: u32) -> Result<IndexRecord, StoreError> {
        let offset = self.index.start_offset as u64
            + (msgno as u64 - 1) * self.index.record_size as u64;
        let end = offset + INDEX_RECORD_SIZE as u64;
        if end > self.index_map.len() as u64 {
            error!(
                "IOERROR: index record {} for {} past end of file",
                msgno, self.name
            );
            return Err(StoreError::Io("index record past end of file".into()));
        }
        decode_index_record(&self.index_map.as_slice()[offset as usize..end as usize])
    }

    /// Write one index record in place. Requires the index lock.
    pub fn write_index_record(
        &mut self,
        msgno: u32,
        record: &IndexRecord,
        sync: bool,
    ) -> Result<(), StoreError> {
        assert!(self.index_lock.depth() != 0);

        let mut buf = [0u8; INDEX_RECORD_SIZE];
        encode_index_record(record, &mut buf);

        let offset = self.index.start_offset as u64
            + (msgno as u64 - 1) * self.index.record_size as u64;
        let file = self.index_file.as_ref().unwrap();
        let result = tools::pwrite_all(file, offset, &buf).and_then(|_| {
            if sync {
                tools::fsync_file(file)
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            error!(
                "IOERROR: writing index record {} for {}: {}",
                msgno, self.name, err
            );
            return Err(StoreError::Io("writing index record".into()));
        }
        Ok(())
    }

    /// Rewrite the index header from the snapshot and fsync. Requires the
    /// index lock. Invokes the update notifier.
    pub fn write_index_header(&mut self) -> Result<(), StoreError> {
        assert!(self.index_lock.depth() != 0);

        let buf = encode_index_header(&self.index);
        let len = std::cmp::min(self.index.start_offset as usize, INDEX_HEADER_SIZE);

        let file = self.index_file.as_ref().unwrap();
        let result = tools::pwrite_all(file, 0, &buf[..len]).and_then(|_| tools::fsync_file(file));
        if let Err(err) = result {
            error!("IOERROR: writing index header for {}: {}", self.name, err);
            return Err(StoreError::Io("writing index header".into()));
        }

        self.store.notify(&self.name);
        Ok(())
    }

    /// Recompute the deleted/answered/flagged counters from the records;
    /// used when an old header predating the counters is read.
    fn calculate_flag_counts(&mut self) -> Result<(), StoreError> {
        let _header = self.lock_header()?;
        let _index = self.lock_index_inner(false)?;
        let _pop = self.lock_pop()?;

        let mut answered = 0;
        let mut deleted = 0;
        let mut flagged = 0;

        let buf = self.index_map.as_slice();
        for msgno in 1..=self.index.exists {
            let offset =
                self.index.start_offset as usize + (msgno as usize - 1) * self.index.record_size as usize;
            if offset + self.index.record_size as usize > buf.len() {
                return Err(StoreError::BadFormat);
            }
            let record = &buf[offset..];
            if get_u32(record, OFFSET_UID) == 0 {
                error!(
                    "IOERROR: {} zero index record {}/{}",
                    self.name, msgno, self.index.exists
                );
                return Err(StoreError::Io("zero index record".into()));
            }
            let flags = SystemFlags::from_bits_truncate(get_u32(record, OFFSET_SYSTEM_FLAGS));
            if flags.contains(SystemFlags::ANSWERED) {
                answered += 1;
            }
            if flags.contains(SystemFlags::DELETED) {
                deleted += 1;
            }
            if flags.contains(SystemFlags::FLAGGED) {
                flagged += 1;
            }
        }

        self.index.answered = answered;
        self.index.deleted = deleted;
        self.index.flagged = flagged;
        Ok(())
    }

    /// Rewrite the index in the current layout: widen the header and
    /// append defaults for record fields the old layout lacked. The
    /// generation number is unchanged. Idempotent and restartable; a
    /// crash leaves either the old or the new index in place.
    fn upgrade_index(&mut self) -> Result<(), StoreError> {
        let _header = self.lock_header()?;
        let _index = self.lock_index_inner(false)?;
        let _pop = self.lock_pop()?;

        let old_start = self.index.start_offset as usize;
        let old_record_size = self.index.record_size as usize;

        self.index.minor_version = MAILBOX_MINOR_VERSION;
        self.index.start_offset = INDEX_HEADER_SIZE as u32;
        self.index.record_size = INDEX_RECORD_SIZE as u32;

        let mut data = Vec::with_capacity(
            INDEX_HEADER_SIZE + self.index.exists as usize * INDEX_RECORD_SIZE,
        );
        data.extend_from_slice(&encode_index_header(&self.index));

        let buf = self.index_map.as_slice();
        let mut tail = [0u8; INDEX_RECORD_SIZE];
        if old_record_size < OFFSET_CONTENT_LINES + 4 {
            // a body can be empty, so "unknown" is all-ones, not zero
            put_u32(&mut tail, OFFSET_CONTENT_LINES, BIT32_MAX);
        }

        for msgno in 1..=self.index.exists as usize {
            let offset = old_start + (msgno - 1) * old_record_size;
            if offset + old_record_size > buf.len() {
                return Err(StoreError::BadFormat);
            }
            data.extend_from_slice(&buf[offset..offset + old_record_size]);
            if old_record_size < INDEX_RECORD_SIZE {
                data.extend_from_slice(&tail[old_record_size..]);
            }
        }

        let index_path = self.index_path();
        let mut new_path = index_path.clone();
        new_path.set_file_name(format!("{}.NEW", FNAME_INDEX));

        let commit = || -> Result<(), StoreError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&new_path)?;
            tools::retry_write(&file, &data).map_err(|err| StoreError::io("write", err))?;
            tools::fsync_file(&file).map_err(|err| StoreError::io("fsync", err))?;
            std::fs::rename(&new_path, &index_path)?;
            Ok(())
        };
        if let Err(err) = commit() {
            error!("IOERROR: writing index for {}: {}", self.name, err);
            tools::unlink_ignore(&new_path);
            return Err(StoreError::Io("upgrading index".into()));
        }

        Ok(())
    }
}

impl MailStore {
    /// Create the mailbox `name`, register it in the mailbox list and
    /// seed the seen state for its owner.
    pub fn create_mailbox(
        &self,
        name: &str,
        acl: &str,
        format: MailboxFormat,
    ) -> Result<(), StoreError> {
        let path = mailbox_path(&self.partition, name)?;
        let (_mailbox, _lock) = self.create_mailbox_at(name, &path, acl, None, format)?;
        self.mboxlist.update(
            name,
            &ListEntry {
                path,
                acl: acl.to_string(),
                format,
            },
        )?;
        Ok(())
    }

    /// Lay out an empty mailbox at `path`. The caller owns the
    /// mailbox-list entry. Returns the new handle, still locked.
    pub fn create_mailbox_at(
        &self,
        name: &str,
        path: &Path,
        acl: &str,
        uniqueid: Option<&str>,
        format: MailboxFormat,
    ) -> Result<(Mailbox, MailboxLock), StoreError> {
        std::fs::create_dir_all(path).map_err(|err| {
            error!("IOERROR: creating directory {:?}: {}", path, err);
            StoreError::from(err)
        })?;

        let create = |fname: &str| -> Result<File, StoreError> {
            let file_path = path.join(fname);
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&file_path)
                .map_err(|err| {
                    error!("IOERROR: creating {:?}: {}", file_path, err);
                    StoreError::from(err)
                })
        };

        let header_file = create(FNAME_HEADER)?;
        let index_file = create(FNAME_INDEX)?;
        let cache_file = create(FNAME_CACHE)?;

        let mut index = IndexHeader::default();
        index.format = format;
        index.uidvalidity = now();
        index.pop3_new_uidl = true;

        let uidvalidity = index.uidvalidity;
        let mut mailbox = Mailbox {
            store: self,
            name: name.to_string(),
            path: path.to_owned(),
            acl: acl.to_string(),
            my_rights: String::new(),
            uniqueid: Some(match uniqueid {
                Some(id) => id.to_string(),
                None => make_uniqueid(name, uidvalidity),
            }),
            flag_names: vec![None; MAX_USER_FLAGS],
            header_file: Some(header_file),
            index_file: Some(index_file),
            cache_file: Some(cache_file),
            header_map: Map::empty(),
            index_map: Map::empty(),
            cache_map: Map::empty(),
            cache_size: 0,
            header_lock: LockState::new("header"),
            index_lock: LockState::new("index"),
            pop_lock: LockState::new("pop"),
            seen_lock_depth: 0,
            header_ino: 0,
            index,
            quota_root: self.quota.find_root(name),
        };

        // Note: nobody else can reach the mailbox before the list entry
        // is committed, so taking both locks here cannot block. The
        // files are empty, so the usual reread-on-acquire must not run.
        let header = acquire(&mailbox.header_lock, mailbox.header_file.as_ref().unwrap(), true)?;
        let index_guard = acquire(&mailbox.index_lock, mailbox.index_file.as_ref().unwrap(), true)?;

        mailbox.write_header()?;
        mailbox.write_index_header()?;

        let cache = mailbox.cache_file.as_ref().unwrap();
        let generation = mailbox.index.generation_no;
        if let Err(err) = tools::pwrite_all(cache, 0, &generation.to_be_bytes())
            .and_then(|_| tools::fsync_file(cache))
        {
            error!("IOERROR: writing initial cache for {}: {}", name, err);
            return Err(StoreError::Io("writing initial cache".into()));
        }
        mailbox.cache_size = 4;

        self.seen.create(name, mailbox.uniqueid())?;

        Ok((
            mailbox,
            MailboxLock {
                index: index_guard,
                header,
            },
        ))
    }
}

impl<'a> Mailbox<'a> {
    /// Delete the mailbox's files, release its quota and drop its seen
    /// state. Requires the header lock; the handle is useless afterwards.
    pub fn delete(&mut self, delete_quota_root: bool) -> Result<(), StoreError> {
        if self.header_lock.depth() == 0 {
            return Err(StoreError::Internal("delete without header lock".into()));
        }

        self.store.seen.delete(self.uniqueid()).unwrap_or_else(|err| {
            warn!("unable to delete seen state for {}: {}", self.name, err);
        });

        if let Some(root) = self.quota_root.clone() {
            let mut txn = self.store.quota.begin();
            match txn.read(&root) {
                Ok(mut entry) => {
                    if delete_quota_root {
                        txn.delete(&root)?;
                        txn.commit()?;
                        self.quota_root = None;
                    } else {
                        entry.used =
                            entry.used.saturating_sub(self.index.quota_mailbox_used as u64);
                        if txn.write(&root, &entry).and_then(|_| txn.commit()).is_err() {
                            error!(
                                "LOSTQUOTA: unable to record free of {} bytes in quota {}",
                                self.index.quota_mailbox_used, root
                            );
                        }
                    }
                }
                Err(StoreError::QuotaRootNonexistent) => {}
                Err(err) => {
                    warn!("quota read failed while deleting {}: {}", self.name, err);
                }
            }
        }

        // remove all regular files; never recurse
        if let Ok(entries) = std::fs::read_dir(&self.path) {
            for entry in entries.flatten() {
                let file_type = match entry.file_type() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    continue;
                }
                tools::unlink_ignore(entry.path());
            }
        }

        // remove newly empty directories up to the partition root
        let root = &self.store.partition.root;
        let mut dir = self.path.clone();
        while dir.starts_with(root) && dir != *root {
            if std::fs::remove_dir(&dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_owned(),
                None => break,
            }
        }

        Ok(())
    }
}

impl MailStore {
    /// Delete `name` entirely: files, quota, seen state and the
    /// mailbox-list entry.
    pub fn remove_mailbox(
        &self,
        name: &str,
        user: &str,
        delete_quota_root: bool,
    ) -> Result<(), StoreError> {
        let (mut mailbox, lock) = self.open_locked(name, user)?;
        mailbox.delete(delete_quota_root)?;
        drop(lock);
        drop(mailbox);
        self.mboxlist.remove(name)
    }
}
