//! Rebuild a mailbox's index and cache from its message files.

use std::fs::OpenOptions;
use std::path::Path;
use std::time::UNIX_EPOCH;

use log::{debug, error, warn};
use walkdir::WalkDir;

use super::mailbox::now;
use crate::store::{
    encode_index_header, encode_index_record, is_atom, parse_message, IndexHeader, IndexRecord,
    ListEntry, MailStore, Mailbox, StoreError, SystemFlags, FNAME_CACHE, FNAME_HEADER, FNAME_INDEX,
    INDEX_HEADER_SIZE, INDEX_RECORD_SIZE, MAILBOX_CACHE_MINOR_VERSION, MAILBOX_MINOR_VERSION,
    MAX_USER_FLAGS, USER_FLAG_WORDS,
};
use crate::tools;

/// Fresh UIDs handed out after a rebuild start this far above the
/// highest observed UID, so records lost with the old index can never
/// collide.
const LAST_UID_MARGIN: u32 = 100;

/// System flags a rebuilt record inherits from its old index record.
fn inherited_flags() -> SystemFlags {
    SystemFlags::ANSWERED | SystemFlags::FLAGGED | SystemFlags::DELETED | SystemFlags::DRAFT
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReconstructOptions {
    /// Skip unreadable message files instead of failing the rebuild.
    pub tolerate_errors: bool,
}

/// `<uid>.ams_extra_data` sidecar: an "internaldate system_flags seen"
/// triple left next to a recovered message file.
fn parse_sidecar(data: &str) -> Option<(u32, SystemFlags, bool)> {
    let mut fields = data.split_whitespace();
    let internaldate: u32 = fields.next()?.parse().ok()?;
    let system_flags: u32 = fields.next()?.parse().ok()?;
    let seen: u32 = fields.next()?.parse().ok()?;
    Some((
        internaldate,
        SystemFlags::from_bits_truncate(system_flags),
        seen != 0,
    ))
}

/// UIDs of the `<uid>.` message files in `path`, ascending.
fn scan_message_uids(path: &Path) -> Result<Vec<u32>, StoreError> {
    let mut uids = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        // a UID is never zero and never has a leading zero
        let first = match name.as_bytes().first() {
            Some(b) => *b,
            None => continue,
        };
        if !first.is_ascii_digit() || first == b'0' {
            continue;
        }
        let digits = name.bytes().take_while(|b| b.is_ascii_digit()).count();
        if &name[digits..] != "." {
            continue;
        }
        match name[..digits].parse::<u32>() {
            Ok(uid) => uids.push(uid),
            Err(_) => continue,
        }
    }
    uids.sort_unstable();
    Ok(uids)
}

/// Owner of a `user.<name>[.<sub>]` mailbox, if it has one.
fn mailbox_owner(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("user.")?;
    Some(match rest.find('.') {
        Some(dot) => &rest[..dot],
        None => rest,
    })
}

impl MailStore {
    /// Mark `uid` seen for `user` in `mailbox`.
    fn set_seen_flag(
        &self,
        mailbox: &mut Mailbox,
        user: &str,
        uid: u32,
    ) -> Result<(), StoreError> {
        mailbox.seen_locked();
        let result = (|| {
            let mut data = self.seen.lock_read(mailbox.uniqueid(), user)?;
            if data.uids.is_empty() {
                data.uids = uid.to_string();
            } else {
                data.uids.push(',');
                data.uids.push_str(&uid.to_string());
            }
            if uid > data.last_uid {
                data.last_uid = uid;
            }
            data.last_change = now();
            self.seen.write(mailbox.uniqueid(), user, &data)
        })();
        mailbox.seen_unlocked();
        result
    }

    /// Rebuild the index and cache of `name` from its message files,
    /// restoring every invariant. Optionally appends mailboxes
    /// discovered on disk but missing from the mailbox list to `found`.
    pub fn reconstruct(
        &self,
        name: &str,
        options: &ReconstructOptions,
        mut found: Option<&mut Vec<String>>,
    ) -> Result<(), StoreError> {
        let entry = self.mboxlist.lookup(name)?;

        // no header file means no mailbox shell; create one first
        if !super::mailbox::stat_control_files(&entry.path).header {
            let (shell, shell_lock) =
                self.create_mailbox_at(name, &entry.path, &entry.acl, None, entry.format)?;
            drop(shell_lock);
            drop(shell);
        }

        let mut mailbox = self.open_header_path(name, &entry.path, &entry.acl, "")?;
        let _header = mailbox.lock_header()?;

        // recompute the quota-root assignment
        mailbox.quota_root = self.quota.find_root(name);

        // drop invalid user-flag names: gaps before live names, and
        // names that fail the atom syntax
        let mut valid_user_flags = [0u32; USER_FLAG_WORDS];
        let mut flag_names = mailbox.flag_names().to_vec();
        for flag in 0..MAX_USER_FLAGS {
            let keep = match &flag_names[flag] {
                None => continue,
                Some(name) => (flag == 0 || flag_names[flag - 1].is_some()) && is_atom(name),
            };
            if keep {
                valid_user_flags[flag / 32] |= 1 << (flag & 31);
            } else {
                flag_names[flag] = None;
            }
        }
        mailbox.set_flag_names(flag_names);

        // the header copy of the ACL is the recovery backup; push it
        // back into the mailbox list if they disagree
        mailbox.read_header_acl()?;
        if entry.acl != mailbox.acl() {
            self.mboxlist.update(
                name,
                &ListEntry {
                    path: entry.path.clone(),
                    acl: mailbox.acl().to_string(),
                    format: entry.format,
                },
            )?;
        }

        // old index if readable, synthesized defaults otherwise
        if mailbox.open_index_for_repair().is_err() {
            let mut index = IndexHeader::default();
            index.uidvalidity = now();
            index.pop3_new_uidl = true;
            mailbox.index = index;
        }
        mailbox.index.format = entry.format;
        mailbox.index.pop3_last_login = 0;

        let generation = mailbox.index.generation_no.wrapping_add(1);
        let mut new_index: Vec<u8> = vec![0; INDEX_HEADER_SIZE];
        let mut new_cache: Vec<u8> = Vec::new();
        new_cache.extend_from_slice(&generation.to_be_bytes());

        let uids = scan_message_uids(mailbox.path())?;

        let mut old_msg: u32 = 0;
        let mut old_record: Option<IndexRecord> = None;
        let mut new_exists: u32 = 0;
        let mut new_answered: u32 = 0;
        let mut new_flagged: u32 = 0;
        let mut new_deleted: u32 = 0;
        let mut new_quota: u64 = 0;
        let timestamp = now();

        for &uid in &uids {
            let message_path = mailbox.message_path(uid);
            let data = match std::fs::read(&message_path) {
                Ok(data) => data,
                Err(err) => {
                    if options.tolerate_errors {
                        warn!(
                            "reconstruct: unable to read {:?}, skipping: {}",
                            message_path, err
                        );
                        continue;
                    }
                    error!("IOERROR: reading {:?}: {}", message_path, err);
                    return Err(StoreError::from(err));
                }
            };
            if data.is_empty() {
                warn!("reconstruct: removing zero-length file {:?}", message_path);
                tools::unlink_ignore(&message_path);
                continue;
            }

            // find the matching old record, walking monotonically
            while old_msg < mailbox.index.exists
                && old_record.as_ref().map(|r| r.uid).unwrap_or(0) < uid
            {
                old_msg += 1;
                old_record = mailbox.read_index_record(old_msg).ok();
            }

            let mut record = IndexRecord::default();
            record.uid = uid;
            record.last_updated = timestamp;

            let sidecar_path = mailbox.path().join(format!("{}ams_extra_data", mailbox.message_fname(uid)));
            match &old_record {
                Some(old) if old.uid == uid => {
                    record.internaldate = old.internaldate;
                    record.system_flags = old.system_flags & inherited_flags();
                    for n in 0..USER_FLAG_WORDS {
                        record.user_flags[n] = old.user_flags[n] & valid_user_flags[n];
                    }
                }
                _ => {
                    let mut recovered = false;
                    if let Ok(text) = std::fs::read_to_string(&sidecar_path) {
                        if let Some((internaldate, system_flags, seen)) = parse_sidecar(&text) {
                            record.internaldate = internaldate;
                            record.system_flags = system_flags & inherited_flags();
                            if seen {
                                if let Some(owner) = mailbox_owner(name) {
                                    let owner = owner.to_string();
                                    self.set_seen_flag(&mut mailbox, &owner, uid)?;
                                }
                            }
                            recovered = true;
                        }
                        tools::unlink_ignore(&sidecar_path);
                    }
                    if !recovered {
                        record.internaldate = 0;
                    }
                    // recovered messages get fresh UIDLs so POP clients
                    // fetch them again
                    mailbox.index.pop3_new_uidl = true;
                }
            }

            let parsed = parse_message(&data);
            record.size = parsed.size;
            record.header_size = parsed.header_size;
            record.content_offset = parsed.content_offset;
            record.content_lines = parsed.content_lines;
            record.sentdate = parsed.sentdate;
            record.cache_offset = new_cache.len() as u32;
            record.cache_version = MAILBOX_CACHE_MINOR_VERSION;
            if record.internaldate == 0 {
                // best effort: the Date header, then the file mtime
                record.internaldate = if parsed.sentdate != 0 {
                    parsed.sentdate
                } else {
                    std::fs::metadata(&message_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as u32)
                        .unwrap_or(timestamp)
                };
            }
            new_cache.extend_from_slice(&parsed.cache_blob);

            let mut buf = [0u8; INDEX_RECORD_SIZE];
            encode_index_record(&record, &mut buf);
            new_index.extend_from_slice(&buf);

            new_exists += 1;
            if record.system_flags.contains(SystemFlags::ANSWERED) {
                new_answered += 1;
            }
            if record.system_flags.contains(SystemFlags::FLAGGED) {
                new_flagged += 1;
            }
            if record.system_flags.contains(SystemFlags::DELETED) {
                new_deleted += 1;
            }
            new_quota += u64::from(record.size);
        }

        // final index header
        if let Some(&max_uid) = uids.last() {
            if mailbox.index.last_uid < max_uid {
                mailbox.index.last_uid = max_uid + LAST_UID_MARGIN;
            }
        }
        if mailbox.index.last_appenddate == 0 || mailbox.index.last_appenddate > timestamp {
            mailbox.index.last_appenddate = timestamp;
        }
        if mailbox.index.uidvalidity == 0 || mailbox.index.uidvalidity > timestamp {
            mailbox.index.uidvalidity = timestamp;
        }

        let mut header = mailbox.index.clone();
        header.generation_no = generation;
        header.minor_version = MAILBOX_MINOR_VERSION;
        header.start_offset = INDEX_HEADER_SIZE as u32;
        header.record_size = INDEX_RECORD_SIZE as u32;
        header.exists = new_exists;
        header.quota_mailbox_used = new_quota as u32;
        header.deleted = new_deleted;
        header.answered = new_answered;
        header.flagged = new_flagged;
        header.leaked_cache_records = 0;
        new_index[..INDEX_HEADER_SIZE].copy_from_slice(&encode_index_header(&header));
        mailbox.index = header;

        let new_index_path = mailbox.path().join(format!("{}.NEW", FNAME_INDEX));
        let new_cache_path = mailbox.path().join(format!("{}.NEW", FNAME_CACHE));
        let write_new = |path: &Path, data: &[u8]| -> Result<(), StoreError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            tools::retry_write(&file, data).map_err(|err| StoreError::io("write", err))?;
            tools::fsync_file(&file).map_err(|err| StoreError::io("fsync", err))
        };
        if let Err(err) =
            write_new(&new_index_path, &new_index).and_then(|_| write_new(&new_cache_path, &new_cache))
        {
            error!("IOERROR: writing rebuilt index/cache for {}: {}", name, err);
            tools::unlink_ignore(&new_index_path);
            tools::unlink_ignore(&new_cache_path);
            return Err(err);
        }

        mailbox.write_header()?;

        // both new files carry the same generation prefix by
        // construction, so no cross-file check is needed here
        std::fs::rename(&new_index_path, mailbox.index_path())?;
        std::fs::rename(&new_cache_path, mailbox.cache_path())?;

        self.seen.reconstruct(name, mailbox.uniqueid())?;

        if let Some(found) = found.as_mut() {
            // mailbox directories never have a dot in their name; any
            // such directory with a header file is a candidate
            for dir_entry in WalkDir::new(mailbox.path())
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !dir_entry.file_type().is_dir() {
                    continue;
                }
                let dir_name = match dir_entry.file_name().to_str() {
                    Some(n) => n,
                    None => continue,
                };
                if dir_name.contains('.') {
                    continue;
                }
                if !dir_entry.path().join(FNAME_HEADER).is_file() {
                    continue;
                }

                let candidate = format!("{}.{}", name, dir_name);
                match self.mboxlist.lookup(&candidate) {
                    Ok(_) => continue,
                    Err(StoreError::MailboxNonexistent) => {
                        debug!("discovered {}", candidate);
                        found.push(candidate);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(())
    }
}
