//! Collaborator contracts and the store service object.
//!
//! The storage core sees its surroundings through four narrow traits: the
//! mailbox list (name to path/ACL), the quota database (transactional
//! read-modify-write per root), the per-user seen state, and a best-effort
//! update notifier. [MailStore] bundles a partition layout with one
//! implementation of each; in-memory reference implementations live at
//! the bottom of this module.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::store::{MailboxFormat, PartitionConfig, StoreError};

/// One mailbox-list entry.
#[derive(Clone, Debug)]
pub struct ListEntry {
    pub path: PathBuf,
    pub acl: String,
    pub format: MailboxFormat,
}

/// The mailbox list: the authoritative name to location/ACL mapping.
pub trait MailboxList {
    fn lookup(&self, name: &str) -> Result<ListEntry, StoreError>;
    fn update(&self, name: &str, entry: &ListEntry) -> Result<(), StoreError>;
    fn remove(&self, name: &str) -> Result<(), StoreError>;
    /// Invoke `callback` for every mailbox matching `pattern` (`*`
    /// matches anything, `%` stops at hierarchy separators).
    fn find_all(
        &self,
        pattern: &str,
        callback: &mut dyn FnMut(&str) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

/// Byte usage and limit of one quota root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaEntry {
    pub used: u64,
    /// Limit in bytes; `None` is unlimited.
    pub limit: Option<u64>,
}

/// The quota database. All mutation goes through a transaction.
pub trait QuotaStore {
    /// The closest enclosing quota root of a mailbox name, if any.
    fn find_root(&self, name: &str) -> Option<String>;
    fn begin<'a>(&'a self) -> Box<dyn QuotaTransaction + 'a>;
}

/// One quota transaction; dropping it without [commit](Self::commit)
/// aborts.
pub trait QuotaTransaction {
    fn read(&mut self, root: &str) -> Result<QuotaEntry, StoreError>;
    fn write(&mut self, root: &str, entry: &QuotaEntry) -> Result<(), StoreError>;
    fn delete(&mut self, root: &str) -> Result<(), StoreError>;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Per-user seen state of one mailbox, keyed by the mailbox unique id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeenData {
    pub last_read: u32,
    pub last_uid: u32,
    pub last_change: u32,
    /// UID set in the usual compressed `1:4,7` notation.
    pub uids: String,
}

/// The seen-state database.
pub trait SeenStore {
    fn create(&self, name: &str, uniqueid: &str) -> Result<(), StoreError>;
    fn copy(&self, old_uniqueid: &str, new_uniqueid: &str) -> Result<(), StoreError>;
    fn delete(&self, uniqueid: &str) -> Result<(), StoreError>;
    fn lock_read(&self, uniqueid: &str, user: &str) -> Result<SeenData, StoreError>;
    fn write(&self, uniqueid: &str, user: &str, data: &SeenData) -> Result<(), StoreError>;
    fn reconstruct(&self, name: &str, uniqueid: &str) -> Result<(), StoreError>;
}

/// Invoked after append or expunge commits; failures are ignored.
pub trait UpdateNotifier {
    fn notify(&self, mailbox: &str) -> Result<(), anyhow::Error>;
}

/// A partition plus the collaborators every operation needs.
pub struct MailStore {
    pub(crate) partition: PartitionConfig,
    pub(crate) mboxlist: Box<dyn MailboxList>,
    pub(crate) quota: Box<dyn QuotaStore>,
    pub(crate) seen: Box<dyn SeenStore>,
    pub(crate) notifier: Option<Box<dyn UpdateNotifier>>,
}

impl MailStore {
    pub fn new(
        partition: PartitionConfig,
        mboxlist: Box<dyn MailboxList>,
        quota: Box<dyn QuotaStore>,
        seen: Box<dyn SeenStore>,
    ) -> Self {
        MailStore {
            partition,
            mboxlist,
            quota,
            seen,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn UpdateNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn partition(&self) -> &PartitionConfig {
        &self.partition
    }

    pub fn mailbox_list(&self) -> &dyn MailboxList {
        &*self.mboxlist
    }

    pub fn quota_store(&self) -> &dyn QuotaStore {
        &*self.quota
    }

    pub fn seen_store(&self) -> &dyn SeenStore {
        &*self.seen
    }

    pub(crate) fn notify(&self, mailbox: &str) {
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.notify(mailbox) {
                debug!("update notification for {} failed: {}", mailbox, err);
            }
        }
    }
}

/// Union of the rights granted to `user` (or `anyone`) by a
/// tab-separated `identifier<TAB>rights` ACL string.
pub fn acl_rights(acl: &str, user: &str) -> String {
    let mut rights = String::new();
    let mut parts = acl.split('\t');
    while let (Some(ident), Some(granted)) = (parts.next(), parts.next()) {
        if ident == user || ident == "anyone" {
            for right in granted.chars() {
                if !rights.contains(right) {
                    rights.push(right);
                }
            }
        }
    }
    rights
}

fn pattern_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut expr = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '%' => expr.push_str("[^.]*"),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|err| StoreError::Internal(format!("bad pattern: {}", err)))
}

// Shared ownership of a collaborator is common (the caller usually keeps
// a handle for itself), so the contracts pass through Arc.
impl<T: MailboxList + ?Sized> MailboxList for std::sync::Arc<T> {
    fn lookup(&self, name: &str) -> Result<ListEntry, StoreError> {
        (**self).lookup(name)
    }
    fn update(&self, name: &str, entry: &ListEntry) -> Result<(), StoreError> {
        (**self).update(name, entry)
    }
    fn remove(&self, name: &str) -> Result<(), StoreError> {
        (**self).remove(name)
    }
    fn find_all(
        &self,
        pattern: &str,
        callback: &mut dyn FnMut(&str) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        (**self).find_all(pattern, callback)
    }
}

impl<T: QuotaStore + ?Sized> QuotaStore for std::sync::Arc<T> {
    fn find_root(&self, name: &str) -> Option<String> {
        (**self).find_root(name)
    }
    fn begin<'a>(&'a self) -> Box<dyn QuotaTransaction + 'a> {
        (**self).begin()
    }
}

impl<T: SeenStore + ?Sized> SeenStore for std::sync::Arc<T> {
    fn create(&self, name: &str, uniqueid: &str) -> Result<(), StoreError> {
        (**self).create(name, uniqueid)
    }
    fn copy(&self, old_uniqueid: &str, new_uniqueid: &str) -> Result<(), StoreError> {
        (**self).copy(old_uniqueid, new_uniqueid)
    }
    fn delete(&self, uniqueid: &str) -> Result<(), StoreError> {
        (**self).delete(uniqueid)
    }
    fn lock_read(&self, uniqueid: &str, user: &str) -> Result<SeenData, StoreError> {
        (**self).lock_read(uniqueid, user)
    }
    fn write(&self, uniqueid: &str, user: &str, data: &SeenData) -> Result<(), StoreError> {
        (**self).write(uniqueid, user, data)
    }
    fn reconstruct(&self, name: &str, uniqueid: &str) -> Result<(), StoreError> {
        (**self).reconstruct(name, uniqueid)
    }
}

impl<T: UpdateNotifier + ?Sized> UpdateNotifier for std::sync::Arc<T> {
    fn notify(&self, mailbox: &str) -> Result<(), anyhow::Error> {
        (**self).notify(mailbox)
    }
}

/// In-memory mailbox list.
#[derive(Default)]
pub struct MemMailboxList {
    entries: Mutex<HashMap<String, ListEntry>>,
}

impl MailboxList for MemMailboxList {
    fn lookup(&self, name: &str) -> Result<ListEntry, StoreError> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(StoreError::MailboxNonexistent)
    }

    fn update(&self, name: &str, entry: &ListEntry) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), entry.clone());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(name);
        Ok(())
    }

    fn find_all(
        &self,
        pattern: &str,
        callback: &mut dyn FnMut(&str) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let regex = pattern_to_regex(pattern)?;
        let mut names: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|name| regex.is_match(name))
            .cloned()
            .collect();
        names.sort();
        for name in names {
            callback(&name)?;
        }
        Ok(())
    }
}

/// In-memory quota database.
#[derive(Default)]
pub struct MemQuotaStore {
    roots: Mutex<HashMap<String, QuotaEntry>>,
}

impl MemQuotaStore {
    /// Register `root` with the given limit.
    pub fn define_root(&self, root: &str, limit: Option<u64>) {
        self.roots
            .lock()
            .unwrap()
            .insert(root.to_string(), QuotaEntry { used: 0, limit });
    }

    pub fn entry(&self, root: &str) -> Option<QuotaEntry> {
        self.roots.lock().unwrap().get(root).cloned()
    }
}

struct MemQuotaTxn<'a> {
    store: &'a MemQuotaStore,
    staged: HashMap<String, Option<QuotaEntry>>,
}

impl QuotaStore for MemQuotaStore {
    fn find_root(&self, name: &str) -> Option<String> {
        let roots = self.roots.lock().unwrap();
        let mut best: Option<&String> = None;
        for root in roots.keys() {
            if name == root || name.starts_with(&format!("{}.", root)) {
                match best {
                    Some(current) if current.len() >= root.len() => {}
                    _ => best = Some(root),
                }
            }
        }
        best.cloned()
    }

    fn begin<'a>(&'a self) -> Box<dyn QuotaTransaction + 'a> {
        Box::new(MemQuotaTxn {
            store: self,
            staged: HashMap::new(),
        })
    }
}

impl<'a> QuotaTransaction for MemQuotaTxn<'a> {
    fn read(&mut self, root: &str) -> Result<QuotaEntry, StoreError> {
        if let Some(staged) = self.staged.get(root) {
            return staged.clone().ok_or(StoreError::QuotaRootNonexistent);
        }
        self.store
            .roots
            .lock()
            .unwrap()
            .get(root)
            .cloned()
            .ok_or(StoreError::QuotaRootNonexistent)
    }

    fn write(&mut self, root: &str, entry: &QuotaEntry) -> Result<(), StoreError> {
        self.staged.insert(root.to_string(), Some(entry.clone()));
        Ok(())
    }

    fn delete(&mut self, root: &str) -> Result<(), StoreError> {
        self.staged.insert(root.to_string(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut roots = self.store.roots.lock().unwrap();
        for (root, staged) in self.staged.into_iter() {
            match staged {
                Some(entry) => {
                    roots.insert(root, entry);
                }
                None => {
                    roots.remove(&root);
                }
            }
        }
        Ok(())
    }
}

/// In-memory seen-state database.
#[derive(Default)]
pub struct MemSeenStore {
    known: Mutex<HashMap<String, String>>,
    data: Mutex<HashMap<(String, String), SeenData>>,
}

impl MemSeenStore {
    pub fn get(&self, uniqueid: &str, user: &str) -> Option<SeenData> {
        self.data
            .lock()
            .unwrap()
            .get(&(uniqueid.to_string(), user.to_string()))
            .cloned()
    }

    pub fn is_known(&self, uniqueid: &str) -> bool {
        self.known.lock().unwrap().contains_key(uniqueid)
    }
}

impl SeenStore for MemSeenStore {
    fn create(&self, name: &str, uniqueid: &str) -> Result<(), StoreError> {
        self.known
            .lock()
            .unwrap()
            .insert(uniqueid.to_string(), name.to_string());
        Ok(())
    }

    fn copy(&self, old_uniqueid: &str, new_uniqueid: &str) -> Result<(), StoreError> {
        let name = self
            .known
            .lock()
            .unwrap()
            .get(old_uniqueid)
            .cloned()
            .unwrap_or_default();
        self.known
            .lock()
            .unwrap()
            .insert(new_uniqueid.to_string(), name);

        let mut data = self.data.lock().unwrap();
        let copied: Vec<(String, SeenData)> = data
            .iter()
            .filter(|((id, _), _)| id.as_str() == old_uniqueid)
            .map(|((_, user), seen)| (user.clone(), seen.clone()))
            .collect();
        for (user, seen) in copied {
            data.insert((new_uniqueid.to_string(), user), seen);
        }
        Ok(())
    }

    fn delete(&self, uniqueid: &str) -> Result<(), StoreError> {
        self.known.lock().unwrap().remove(uniqueid);
        self.data
            .lock()
            .unwrap()
            .retain(|(id, _), _| id.as_str() != uniqueid);
        Ok(())
    }

    fn lock_read(&self, uniqueid: &str, user: &str) -> Result<SeenData, StoreError> {
        Ok(self.get(uniqueid, user).unwrap_or_default())
    }

    fn write(&self, uniqueid: &str, user: &str, data: &SeenData) -> Result<(), StoreError> {
        self.data
            .lock()
            .unwrap()
            .insert((uniqueid.to_string(), user.to_string()), data.clone());
        Ok(())
    }

    fn reconstruct(&self, name: &str, uniqueid: &str) -> Result<(), StoreError> {
        self.known
            .lock()
            .unwrap()
            .entry(uniqueid.to_string())
            .or_insert_with(|| name.to_string());
        Ok(())
    }
}

/// Notifier that records every notification; for tests.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<String>>,
}

impl UpdateNotifier for RecordingNotifier {
    fn notify(&self, mailbox: &str) -> Result<(), anyhow::Error> {
        self.events.lock().unwrap().push(mailbox.to_string());
        Ok(())
    }
}

lazy_static! {
    /// IMAP atom syntax for user-flag names.
    pub(crate) static ref ATOM_REGEX: Regex =
        Regex::new(r#"^[^(){%*"\\\x00-\x1f\x7f ]+$"#).unwrap();
}

/// Whether `name` is a valid user-flag name.
pub fn is_atom(name: &str) -> bool {
    ATOM_REGEX.is_match(name)
}
