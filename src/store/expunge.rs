//! Expunge / compaction engine.
//!
//! Driven by a decide-proc over decoded records; the default predicate
//! expunges everything carrying the DELETED system flag. Compaction
//! always rewrites the cache: both files are rebuilt as `.NEW` with the
//! next generation number, the quota is released transactionally, the
//! index is renamed into place before the cache, and the message files
//! are unlinked last.

use std::fs::OpenOptions;
use std::path::Path;

use log::error;

use super::index_file::{get_u32, put_u32};
use crate::store::{
    cache_file, decode_index_record, IndexRecord, Mailbox, StoreError, SystemFlags,
    FNAME_CACHE, FNAME_INDEX, INDEX_HEADER_SIZE, OFFSET_ANSWERED, OFFSET_CACHE_OFFSET,
    OFFSET_DELETED, OFFSET_EXISTS, OFFSET_FLAGGED, OFFSET_GENERATION_NO, OFFSET_LEAKED_CACHE,
    OFFSET_QUOTA_MAILBOX_USED, OFFSET_START_OFFSET, OFFSET_SYSTEM_FLAGS, OFFSET_UID,
    OFFSET_UIDVALIDITY,
};
use crate::tools::{self, Map};

/// Predicate deciding whether a record is expunged.
pub type DecideProc<'p> = dyn FnMut(&Mailbox, &IndexRecord) -> bool + 'p;

fn write_new(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    tools::retry_write(&file, data).map_err(|err| StoreError::io("write", err))?;
    tools::fsync_file(&file).map_err(|err| StoreError::io("fsync", err))?;
    Ok(())
}

impl<'a> Mailbox<'a> {
    /// Expunge every record `decide` selects (default: DELETED set) and
    /// compact the cache. Returns the UIDs physically removed.
    ///
    /// The handle's mappings still describe the pre-compaction files
    /// afterwards; reopen the index to observe the new state.
    pub fn expunge(
        &mut self,
        mut decide: Option<&mut DecideProc>,
    ) -> Result<Vec<u32>, StoreError> {
        let _header = self.lock_header()?;
        let _index = self.lock_index()?;
        let _pop = self.lock_pop()?;

        // the cache may have grown since the mailbox was opened
        {
            let cache = self.cache_file.as_ref().unwrap();
            let size = tools::file_size(cache)
                .unwrap_or_else(|err| panic!("can't fstat cache file: {}", err));
            self.cache_map =
                Map::map(cache, size as usize).map_err(|err| StoreError::io("mapping cache", err))?;
            self.cache_size = size;
        }

        let new_index_path = self.path().join(format!("{}.NEW", FNAME_INDEX));
        let new_cache_path = self.path().join(format!("{}.NEW", FNAME_CACHE));

        let start = self.index.start_offset as usize;
        let record_size = self.index.record_size as usize;
        let next_generation = self.index.generation_no.wrapping_add(1);

        let mut new_cache: Vec<u8> = Vec::with_capacity(self.cache_map.len());
        new_cache.extend_from_slice(&next_generation.to_be_bytes());

        // the index header is copied verbatim, then patched below
        let mut new_index: Vec<u8> = Vec::with_capacity(self.index_map.len());
        new_index.extend_from_slice(&self.index_map.as_slice()[..start]);
        put_u32(&mut new_index, OFFSET_GENERATION_NO, next_generation);

        // grow a short header on commit, tagging uidvalidity
        if start < INDEX_HEADER_SIZE {
            for n in start..INDEX_HEADER_SIZE {
                new_index.push(if n == OFFSET_UIDVALIDITY + 3 { 1 } else { 0 });
            }
        }

        let mut expunged: Vec<u32> = Vec::new();
        let mut quota_removed: u64 = 0;
        let mut answered_removed: u32 = 0;
        let mut deleted_removed: u32 = 0;
        let mut flagged_removed: u32 = 0;

        let buf = self.index_map.as_slice();
        let cache_buf = self.cache_map.as_slice();
        for msgno in 1..=self.index.exists {
            let offset = start + (msgno as usize - 1) * record_size;
            if offset + record_size > buf.len() {
                error!(
                    "IOERROR: index record {} for {} past end of file",
                    msgno,
                    self.name()
                );
                return Err(StoreError::Io("index record past end of file".into()));
            }
            let record_buf = &buf[offset..offset + record_size];
            if get_u32(record_buf, OFFSET_UID) == 0 {
                error!(
                    "IOERROR: {} zero index record {}/{}",
                    self.name(),
                    msgno,
                    self.index.exists
                );
                return Err(StoreError::Io("zero index record".into()));
            }

            let record = decode_index_record(record_buf)?;
            let kill = match &mut decide {
                Some(proc) => proc(self, &record),
                None => record.system_flags.contains(SystemFlags::DELETED),
            };

            if kill {
                expunged.push(record.uid);
                quota_removed += u64::from(record.size);
                let flags =
                    SystemFlags::from_bits_truncate(get_u32(record_buf, OFFSET_SYSTEM_FLAGS));
                if flags.contains(SystemFlags::ANSWERED) {
                    answered_removed += 1;
                }
                if flags.contains(SystemFlags::DELETED) {
                    deleted_removed += 1;
                }
                if flags.contains(SystemFlags::FLAGGED) {
                    flagged_removed += 1;
                }
            } else {
                // rewrite the cache offset to the running position in the
                // new cache and carry the blob over
                let blob_start = record.cache_offset as usize;
                let blob_len = cache_file::record_len(cache_buf, blob_start)?;

                let record_pos = new_index.len();
                new_index.extend_from_slice(record_buf);
                put_u32(
                    &mut new_index[record_pos..],
                    OFFSET_CACHE_OFFSET,
                    new_cache.len() as u32,
                );
                new_cache.extend_from_slice(&cache_buf[blob_start..blob_start + blob_len]);
            }
        }

        // fix up the counters in the new index header
        let removed = expunged.len() as u32;
        let new_exists = get_u32(&new_index, OFFSET_EXISTS) - removed;
        put_u32(&mut new_index, OFFSET_EXISTS, new_exists);
        put_u32(&mut new_index, OFFSET_LEAKED_CACHE, 0);
        let fix = |buf: &mut Vec<u8>, off: usize, less: u32| {
            let value = get_u32(buf, off).saturating_sub(less);
            put_u32(buf, off, value);
        };
        fix(&mut new_index, OFFSET_ANSWERED, answered_removed);
        fix(&mut new_index, OFFSET_DELETED, deleted_removed);
        fix(&mut new_index, OFFSET_FLAGGED, flagged_removed);
        fix(&mut new_index, OFFSET_QUOTA_MAILBOX_USED, quota_removed as u32);
        if start < INDEX_HEADER_SIZE {
            put_u32(&mut new_index, OFFSET_START_OFFSET, INDEX_HEADER_SIZE as u32);
        }

        if let Err(err) = write_new(&new_index_path, &new_index)
            .and_then(|_| write_new(&new_cache_path, &new_cache))
        {
            error!(
                "IOERROR: writing index/cache for {}: {}",
                self.name(),
                err
            );
            tools::unlink_ignore(&new_index_path);
            tools::unlink_ignore(&new_cache_path);
            return Err(StoreError::Io("writing compacted index/cache".into()));
        }

        // release the freed bytes before the renames
        if let Some(root) = self.quota_root.clone() {
            let mut txn = self.store.quota.begin();
            match txn.read(&root) {
                Ok(mut entry) => {
                    entry.used = entry.used.saturating_sub(quota_removed);
                    if txn.write(&root, &entry).and_then(|_| txn.commit()).is_err() {
                        error!(
                            "LOSTQUOTA: unable to record free of {} bytes in quota {}",
                            quota_removed, root
                        );
                    }
                }
                Err(StoreError::QuotaRootNonexistent) => {}
                Err(err) => {
                    tools::unlink_ignore(&new_index_path);
                    tools::unlink_ignore(&new_cache_path);
                    return Err(err);
                }
            }
        }

        if let Err(err) = std::fs::rename(&new_index_path, self.index_path()) {
            error!(
                "IOERROR: renaming index file for {}: {}",
                self.name(),
                err
            );
            tools::unlink_ignore(&new_index_path);
            tools::unlink_ignore(&new_cache_path);
            return Err(StoreError::Io("renaming index file".into()));
        }

        if let Err(err) = std::fs::rename(&new_cache_path, self.cache_path()) {
            // readers now see mismatched generations until reconstruct;
            // still remove the message files below
            error!(
                "CRITICAL IOERROR: renaming cache file for {}, need to reconstruct: {}",
                self.name(),
                err
            );
        }

        if !expunged.is_empty() {
            self.store.notify(self.name());
        }

        drop(_pop);
        drop(_index);
        drop(_header);

        for uid in &expunged {
            tools::unlink_ignore(self.message_path(*uid));
        }

        Ok(expunged)
    }
}
