//! Whole-mailbox rename-copy, rename-cleanup and incremental sync.

use std::fs::OpenOptions;
use std::path::Path;

use log::error;

use crate::store::{
    mailbox_path, IndexRecord, ListEntry, MailStore, Mailbox, MailboxFormat, MailboxLock,
    QuotaEntry, QuotaTransaction, StoreError,
};
use crate::tools::{self, Map};

/// Copy (or hard link) the file `from` to `to`. Linking is preferred;
/// an existing destination is unlinked and the link retried, and a
/// cross-device link degrades to a full read/write copy.
pub fn copy_file(from: &Path, to: &Path, nolink: bool) -> Result<(), StoreError> {
    if !nolink {
        match std::fs::hard_link(from, to) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Err(err) = std::fs::remove_file(to) {
                    error!("IOERROR: unlinking to recreate {:?}: {}", to, err);
                    return Err(StoreError::from(err));
                }
                if std::fs::hard_link(from, to).is_ok() {
                    return Ok(());
                }
            }
            // EXDEV and friends: fall through to a plain copy
            Err(_) => {}
        }
    }

    let dest = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(to)
        .map_err(|err| {
            error!("IOERROR: creating {:?}: {}", to, err);
            StoreError::from(err)
        })?;
    let src = std::fs::File::open(from).map_err(|err| {
        error!("IOERROR: opening {:?}: {}", from, err);
        StoreError::from(err)
    })?;
    let size = tools::file_size(&src).map_err(|err| {
        error!("IOERROR: fstat on {:?}: {}", from, err);
        StoreError::Io("fstat on copy source".into())
    })?;
    let map = Map::map(&src, size as usize).map_err(|err| StoreError::io("mapping source", err))?;

    if let Err(err) = tools::retry_write(&dest, map.as_slice()).and_then(|_| tools::fsync_file(&dest))
    {
        error!("IOERROR: writing {:?}: {}", to, err);
        return Err(StoreError::Io("copying file".into()));
    }
    Ok(())
}

/// Open a destination-root quota transaction and run the limit check
/// that applies when the destination root differs from the source root.
/// Returns the open transaction and entry so the caller can commit the
/// usage once the data has moved.
fn quota_check_destination<'s>(
    store: &'s MailStore,
    source_root: Option<&str>,
    dest_root: &str,
    moved_bytes: u64,
) -> Result<Option<(Box<dyn QuotaTransaction + 's>, QuotaEntry)>, StoreError> {
    let mut txn = store.quota.begin();
    match txn.read(dest_root) {
        Ok(entry) => {
            if source_root != Some(dest_root) {
                if let Some(limit) = entry.limit {
                    if entry.used + moved_bytes > limit {
                        return Err(StoreError::QuotaExceeded);
                    }
                }
            }
            Ok(Some((txn, entry)))
        }
        Err(StoreError::QuotaRootNonexistent) => Ok(None),
        Err(err) => Err(err),
    }
}

impl MailStore {
    /// Copy the locked mailbox `old` to a new mailbox `newname` rooted at
    /// `newpath`. A move that keeps the logical name (a partition move)
    /// preserves the uidvalidity; a rename gets the fresh one assigned at
    /// create. Returns the destination handle, still locked; the caller
    /// finishes with [rename_cleanup](Self::rename_cleanup).
    pub fn rename_copy<'s>(
        &'s self,
        old: &mut Mailbox,
        newname: &str,
        newpath: &Path,
    ) -> Result<(Mailbox<'s>, MailboxLock), StoreError> {
        assert!(old.header_locked() && old.index_locked());

        let (mut new, new_lock) = self.create_mailbox_at(
            newname,
            newpath,
            old.acl(),
            Some(old.uniqueid()),
            old.index.format,
        )?;

        let fresh_uidvalidity = new.index.uidvalidity;
        let same_name = old.name() == newname;

        new.set_flag_names(old.flag_names().to_vec());
        new.write_header()?;

        let mut quota_txn = match new.quota_root.clone() {
            Some(root) => quota_check_destination(
                self,
                old.quota_root.as_deref(),
                &root,
                u64::from(old.index.quota_mailbox_used),
            )?
            .map(|(txn, entry)| (txn, entry, root)),
            None => None,
        };

        // index and cache go over byte-for-byte
        tools::unlink_ignore(new.index_path());
        copy_file(&old.index_path(), &new.index_path(), false)?;
        tools::unlink_ignore(new.cache_path());
        copy_file(&old.cache_path(), &new.cache_path(), false)?;

        // reread the copied pair, then stamp the destination identity:
        // generation stays the source's (it must match the copied cache),
        // uidvalidity depends on whether the logical name survived
        new.open_index()?;
        new.index.uidvalidity = if same_name {
            old.index.uidvalidity
        } else {
            fresh_uidvalidity
        };
        new.write_index_header()?;

        let mut copy_messages = || -> Result<(), StoreError> {
            for msgno in 1..=old.index.exists {
                let record = old.read_index_record(msgno)?;
                copy_file(
                    &old.message_path(record.uid),
                    &new.message_path(record.uid),
                    false,
                )?;
            }
            Ok(())
        };

        let mut result = copy_messages();
        if result.is_ok() {
            result = self.seen.copy(old.uniqueid(), new.uniqueid());
        }
        if result.is_ok() {
            if let Some((mut txn, mut entry, root)) = quota_txn.take() {
                entry.used += u64::from(old.index.quota_mailbox_used);
                result = txn.write(&root, &entry).and_then(|_| txn.commit());
            }
        }

        if let Err(err) = result {
            // back out any message files already at the destination
            for msgno in 1..=old.index.exists {
                if let Ok(record) = old.read_index_record(msgno) {
                    tools::unlink_ignore(new.message_path(record.uid));
                }
            }
            return Err(err);
        }

        Ok((new, new_lock))
    }

    /// Finish a rename: expunge everything from the source (the INBOX
    /// special case, which must survive as an empty mailbox) or delete it.
    pub fn rename_cleanup(&self, old: &mut Mailbox, is_inbox: bool) -> Result<(), StoreError> {
        let result = if is_inbox {
            let mut expunge_all = |_: &Mailbox, _: &IndexRecord| true;
            old.expunge(Some(&mut expunge_all)).map(|_| ())
        } else {
            old.delete(false)
        };

        if let Err(err) = &result {
            error!(
                "rename failure during cleanup of {}, potential leaked space: {}",
                old.name(),
                err
            );
        }
        result
    }

    /// Rename `oldname` to `newname` within this partition, moving the
    /// mailbox-list entry along.
    pub fn rename_mailbox(
        &self,
        oldname: &str,
        newname: &str,
        user: &str,
        is_inbox: bool,
    ) -> Result<(), StoreError> {
        let newpath = mailbox_path(&self.partition, newname)?;
        self.rename_mailbox_to(oldname, newname, &newpath, user, is_inbox)
    }

    /// Rename `oldname` to `newname` rooted at an explicit `newpath`
    /// (which may live on another partition). With `oldname == newname`
    /// this is a partition move and preserves the mailbox identity.
    pub fn rename_mailbox_to(
        &self,
        oldname: &str,
        newname: &str,
        newpath: &Path,
        user: &str,
        is_inbox: bool,
    ) -> Result<(), StoreError> {
        let (mut old, old_lock) = self.open_locked(oldname, user)?;
        if oldname == newname && old.path() == newpath {
            return Err(StoreError::NotSupported);
        }

        let (new, new_lock) = self.rename_copy(&mut old, newname, newpath)?;
        self.mboxlist.update(
            newname,
            &ListEntry {
                path: newpath.to_owned(),
                acl: new.acl().to_string(),
                format: new.index.format,
            },
        )?;
        drop(new_lock);
        drop(new);

        self.rename_cleanup(&mut old, is_inbox)?;
        drop(old_lock);
        drop(old);

        if oldname != newname && !is_inbox {
            self.mboxlist.remove(oldname)?;
        }
        Ok(())
    }

    /// Catch the slave mailbox `newname` up with `oldname`, exploiting
    /// UID monotonicity: destination UIDs missing from the source were
    /// expunged since the last sync and are deleted; source UIDs past the
    /// destination's end are new arrivals and are copied. Afterwards the
    /// index and cache are carried over and the destination keeps the
    /// source's generation number and uidvalidity.
    pub fn sync_mailbox(
        &self,
        oldname: &str,
        newname: &str,
        user: &str,
        docreate: bool,
    ) -> Result<(), StoreError> {
        let old_entry = self.mboxlist.lookup(oldname)?;
        if old_entry.format == MailboxFormat::Netnews {
            return Err(StoreError::NotSupported);
        }

        let (mut old, _old_lock) = self.open_locked(oldname, user)?;

        let mut new;
        let _new_lock: MailboxLock;
        if docreate {
            let newpath = mailbox_path(&self.partition, newname)?;
            let created = self.create_mailbox_at(
                newname,
                &newpath,
                old.acl(),
                Some(old.uniqueid()),
                old.index.format,
            )?;
            new = created.0;
            _new_lock = created.1;
            self.mboxlist.update(
                newname,
                &ListEntry {
                    path: newpath,
                    acl: old.acl().to_string(),
                    format: old.index.format,
                },
            )?;
        } else {
            let opened = self.open_locked(newname, user)?;
            new = opened.0;
            _new_lock = opened.1;
        }

        new.index.uidvalidity = old.index.uidvalidity;
        new.set_flag_names(old.flag_names().to_vec());
        new.write_header()?;

        let pre_sync_used = u64::from(new.index.quota_mailbox_used);
        let quota_txn = match new.quota_root.clone() {
            Some(root) => quota_check_destination(
                self,
                old.quota_root.as_deref(),
                &root,
                u64::from(old.index.quota_mailbox_used),
            )?
            .map(|(txn, entry)| (txn, entry, root)),
            None => None,
        };

        // walk source and destination UIDs in lockstep
        let mut newmsgno: u32 = 1;
        for oldmsgno in 1..=old.index.exists {
            let old_record = old.read_index_record(oldmsgno)?;
            if newmsgno <= new.index.exists {
                loop {
                    let new_record = new.read_index_record(newmsgno)?;
                    newmsgno += 1;
                    if new_record.uid < old_record.uid {
                        // expunged at the source since the last sync
                        tools::unlink_ignore(new.message_path(new_record.uid));
                    }
                    if new_record.uid >= old_record.uid || newmsgno > new.index.exists {
                        break;
                    }
                }
            }
            // check 'exists' rather than the last UID so an empty
            // destination copies everything
            if newmsgno > new.index.exists {
                copy_file(
                    &old.message_path(old_record.uid),
                    &new.message_path(old_record.uid),
                    false,
                )?;
            }
        }

        self.seen.copy(old.uniqueid(), new.uniqueid())?;

        tools::unlink_ignore(new.index_path());
        copy_file(&old.index_path(), &new.index_path(), false)?;
        tools::unlink_ignore(new.cache_path());
        copy_file(&old.cache_path(), &new.cache_path(), false)?;

        let uidvalidity = old.index.uidvalidity;
        new.open_index()?;
        new.index.uidvalidity = uidvalidity;
        new.write_index_header()?;

        // one quota adjustment for the whole delta
        if let Some((mut txn, mut entry, root)) = quota_txn {
            let now_used = u64::from(old.index.quota_mailbox_used);
            entry.used = (entry.used + now_used).saturating_sub(pre_sync_used);
            if txn.write(&root, &entry).and_then(|_| txn.commit()).is_err() {
                error!(
                    "LOSTQUOTA: unable to record use of {} bytes in quota {}",
                    now_used, root
                );
            }
        }

        Ok(())
    }
}
