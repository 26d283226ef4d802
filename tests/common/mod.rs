//! Shared fixtures for the integration tests: a tempdir-rooted partition
//! wired to the in-memory collaborator implementations.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use mailstore::store::{
    IndexHeader, MailStore, MailboxFormat, MemMailboxList, MemQuotaStore, MemSeenStore,
    MessageAppend, PartitionConfig, RecordingNotifier,
};

pub const USER: &str = "bob";
pub const ACL: &str = "bob\tlrswipcda";

pub struct TestStore {
    pub dir: tempfile::TempDir,
    pub store: MailStore,
    pub list: Arc<MemMailboxList>,
    pub quota: Arc<MemQuotaStore>,
    pub seen: Arc<MemSeenStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn test_store() -> TestStore {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let partition = PartitionConfig::new(dir.path().join("spool"));
    let list = Arc::new(MemMailboxList::default());
    let quota = Arc::new(MemQuotaStore::default());
    let seen = Arc::new(MemSeenStore::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let store = MailStore::new(
        partition,
        Box::new(Arc::clone(&list)),
        Box::new(Arc::clone(&quota)),
        Box::new(Arc::clone(&seen)),
    )
    .with_notifier(Box::new(Arc::clone(&notifier)));

    TestStore {
        dir,
        store,
        list,
        quota,
        seen,
        notifier,
    }
}

/// A parseable message of exactly `size` bytes.
pub fn message_of_size(size: usize) -> Vec<u8> {
    let mut data = b"From: alice@example.org\r\nSubject: test\r\n\r\n".to_vec();
    assert!(size >= data.len() + 2, "message size {} too small", size);
    while data.len() < size - 2 {
        data.push(b'x');
    }
    data.extend_from_slice(b"\r\n");
    data
}

/// Append messages of the given sizes and return their UIDs.
pub fn append_sizes(store: &MailStore, name: &str, sizes: &[usize]) -> Vec<u32> {
    let (mut mailbox, lock) = store.open_locked(name, USER).unwrap();
    let datas: Vec<Vec<u8>> = sizes.iter().map(|size| message_of_size(*size)).collect();
    let messages: Vec<MessageAppend> = datas.iter().map(|data| MessageAppend::new(data)).collect();
    let uids = mailbox.append_messages(&messages).unwrap();
    drop(lock);
    uids
}

/// Decoded index header of a freshly opened handle.
pub fn index_snapshot(store: &MailStore, name: &str) -> IndexHeader {
    let mut mailbox = store.open_header(name, USER).unwrap();
    mailbox.open_index().unwrap();
    mailbox.index.clone()
}

/// First four bytes of the file at `path`, big-endian.
pub fn read_generation(path: &Path) -> u32 {
    let data = std::fs::read(path).unwrap();
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&data[..4]);
    u32::from_be_bytes(prefix)
}

pub fn create_with_quota(t: &TestStore, name: &str, limit: Option<u64>) {
    t.quota.define_root(name, limit);
    t.store
        .create_mailbox(name, ACL, MailboxFormat::Normal)
        .unwrap();
}
