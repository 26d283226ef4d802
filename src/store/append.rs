//! Append engine: extend the index with fresh records, the cache with
//! their parsed-header blobs, and account the new bytes against the
//! quota root.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use log::error;
use nix::unistd::ftruncate;

use super::mailbox::now;
use crate::store::{
    encode_index_record, parse_message, IndexRecord, Mailbox, StoreError, SystemFlags,
    INDEX_RECORD_SIZE, MAILBOX_CACHE_MINOR_VERSION, USER_FLAG_WORDS,
};
use crate::tools;

/// One message to append.
pub struct MessageAppend<'m> {
    pub data: &'m [u8],
    /// Arrival time; 0 means "now".
    pub internaldate: u32,
    pub system_flags: SystemFlags,
    pub user_flags: [u32; USER_FLAG_WORDS],
}

impl<'m> MessageAppend<'m> {
    pub fn new(data: &'m [u8]) -> Self {
        MessageAppend {
            data,
            internaldate: 0,
            system_flags: SystemFlags::empty(),
            user_flags: [0; USER_FLAG_WORDS],
        }
    }
}

impl<'a> Mailbox<'a> {
    /// Write `records` into the index starting at the 0-based slot
    /// `start`. Non-positive timestamps are clamped to "now". A failed
    /// write truncates the index back to its previous end. Requires the
    /// index lock; the caller updates and rewrites the header.
    pub fn append_index(
        &mut self,
        records: &mut [IndexRecord],
        start: u32,
        sync: bool,
    ) -> Result<(), StoreError> {
        assert!(self.index_locked());

        if (self.index.record_size as usize) < INDEX_RECORD_SIZE {
            return Err(StoreError::BadFormat);
        }

        let timestamp = now();
        let record_size = self.index.record_size as usize;
        let mut buf = vec![0u8; records.len() * record_size];
        for (i, record) in records.iter_mut().enumerate() {
            if record.internaldate == 0 {
                record.internaldate = timestamp;
            }
            if record.sentdate == 0 {
                record.sentdate = timestamp;
            }
            if record.last_updated == 0 {
                record.last_updated = timestamp;
            }
            encode_index_record(record, &mut buf[i * record_size..]);
        }

        let offset = self.index.start_offset as u64 + start as u64 * record_size as u64;
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
                "IOERROR: appending index records for {}: {}",
                self.name(),
                err
            );
            let _ = ftruncate(file.as_raw_fd(), offset as i64);
            return Err(StoreError::Io("appending index records".into()));
        }
        Ok(())
    }

    /// Append whole messages: write each `<uid>.` file, extend the cache
    /// with the parsed blobs, append the index records, charge the quota
    /// root and commit the index header (which notifies once per batch).
    ///
    /// Returns the UIDs assigned to the new messages.
    pub fn append_messages(&mut self, messages: &[MessageAppend]) -> Result<Vec<u32>, StoreError> {
        let _header = self.lock_header()?;
        let _index = self.lock_index()?;

        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let old_exists = self.index.exists;
        let old_cache_size = self.cache_size;
        let timestamp = now();

        let mut records: Vec<IndexRecord> = Vec::with_capacity(messages.len());
        let mut uids = Vec::with_capacity(messages.len());
        let mut written: Vec<PathBuf> = Vec::new();
        let mut cache_extension: Vec<u8> = Vec::new();
        let mut added_bytes: u64 = 0;

        let mut next_uid = self.index.last_uid;
        for message in messages {
            next_uid += 1;
            let parsed = parse_message(message.data);

            let path = self.message_path(next_uid);
            if let Err(err) = tools::file_set_contents(&path, message.data, None) {
                error!("IOERROR: writing message {:?}: {}", path, err);
                self.append_abort(&written, old_cache_size, old_exists);
                return Err(StoreError::Io("writing message file".into()));
            }
            written.push(path);

            let mut record = IndexRecord::default();
            record.uid = next_uid;
            record.internaldate = message.internaldate;
            record.sentdate = parsed.sentdate;
            record.size = parsed.size;
            record.header_size = parsed.header_size;
            record.content_offset = parsed.content_offset;
            record.content_lines = parsed.content_lines;
            record.cache_offset = (old_cache_size + cache_extension.len() as u64) as u32;
            record.cache_version = MAILBOX_CACHE_MINOR_VERSION;
            record.last_updated = timestamp;
            record.system_flags = message.system_flags;
            record.user_flags = message.user_flags;

            cache_extension.extend_from_slice(&parsed.cache_blob);
            added_bytes += u64::from(parsed.size);
            uids.push(next_uid);
            records.push(record);
        }

        {
            let cache = self.cache_file.as_ref().unwrap();
            let result = tools::pwrite_all(cache, old_cache_size, &cache_extension)
                .and_then(|_| tools::fsync_file(cache));
            if let Err(err) = result {
                error!("IOERROR: extending cache for {}: {}", self.name(), err);
                self.append_abort(&written, old_cache_size, old_exists);
                return Err(StoreError::Io("extending cache".into()));
            }
        }
        self.cache_size = old_cache_size + cache_extension.len() as u64;

        if let Err(err) = self.append_index(&mut records, old_exists, true) {
            self.append_abort(&written, old_cache_size, old_exists);
            return Err(err);
        }

        // the quota root is charged in the same transaction that commits
        // the mailbox change
        if let Some(root) = self.quota_root.clone() {
            let mut txn = self.store.quota.begin();
            match txn.read(&root) {
                Ok(mut entry) => {
                    if let Some(limit) = entry.limit {
                        if entry.used + added_bytes > limit {
                            drop(txn);
                            self.append_abort(&written, old_cache_size, old_exists);
                            return Err(StoreError::QuotaExceeded);
                        }
                    }
                    entry.used += added_bytes;
                    let committed = txn.write(&root, &entry).and_then(|_| txn.commit());
                    if let Err(err) = committed {
                        self.append_abort(&written, old_cache_size, old_exists);
                        return Err(err);
                    }
                }
                Err(StoreError::QuotaRootNonexistent) => {}
                Err(err) => {
                    self.append_abort(&written, old_cache_size, old_exists);
                    return Err(err);
                }
            }
        }

        self.index.exists += messages.len() as u32;
        self.index.last_uid = next_uid;
        self.index.last_appenddate = timestamp;
        self.index.quota_mailbox_used += added_bytes as u32;
        self.write_index_header()?;

        Ok(uids)
    }

    /// Roll the on-disk state back to what it was before a failed append.
    fn append_abort(&mut self, written: &[PathBuf], old_cache_size: u64, old_exists: u32) {
        for path in written {
            tools::unlink_ignore(path);
        }
        if let Some(cache) = self.cache_file.as_ref() {
            let _ = ftruncate(cache.as_raw_fd(), old_cache_size as i64);
        }
        self.cache_size = old_cache_size;
        if let Some(index) = self.index_file.as_ref() {
            let end = self.index.start_offset as u64
                + old_exists as u64 * self.index.record_size as u64;
            let _ = ftruncate(index.as_raw_fd(), end as i64);
        }
    }
}
