//! Mailbox lifecycle: create, append, expunge, locking.

mod common;

use common::*;
use mailstore::store::{
    make_uniqueid, MailboxList, StoreError, SystemFlags, MAILBOX_HEADER_MAGIC,
};

#[test]
fn create_then_append_three_messages() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);

    let uids = append_sizes(&t.store, "user.bob", &[100, 200, 300]);
    assert_eq!(uids, vec![1, 2, 3]);

    let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
    mailbox.open_index().unwrap();

    assert_eq!(mailbox.index.exists, 3);
    assert_eq!(mailbox.index.last_uid, 3);
    assert_eq!(mailbox.index.quota_mailbox_used, 600);

    // one message file per record, named `<uid>.`
    for uid in 1..=3 {
        assert!(mailbox.message_path(uid).is_file());
        let map = mailbox.map_message(uid).unwrap();
        assert!(map.as_slice().starts_with(b"From: alice@example.org"));
    }

    // both files carry generation 0 as their four-byte prefix
    assert_eq!(read_generation(&mailbox.index_path()), 0);
    assert_eq!(read_generation(&mailbox.cache_path()), 0);

    // records are strictly increasing by UID and point at valid blobs
    let sizes = [100u32, 200, 300];
    let mut previous_uid = 0;
    for msgno in 1..=3u32 {
        let record = mailbox.read_index_record(msgno).unwrap();
        assert!(record.uid > previous_uid);
        previous_uid = record.uid;
        assert_eq!(record.size, sizes[msgno as usize - 1]);
        assert_eq!(record.cache_version, 2);

        let fields = mailbox.cache_fields(&record).unwrap();
        assert_eq!(fields[4], b"alice@example.org");
    }

    assert_eq!(t.quota.entry("user.bob").unwrap().used, 600);
    assert!(t
        .notifier
        .events
        .lock()
        .unwrap()
        .contains(&"user.bob".to_string()));
}

fn mark_deleted(store: &mailstore::store::MailStore, name: &str, msgno: u32) {
    let (mut mailbox, lock) = store.open_locked(name, USER).unwrap();
    let mut record = mailbox.read_index_record(msgno).unwrap();
    record.system_flags |= SystemFlags::DELETED;
    mailbox.write_index_record(msgno, &record, true).unwrap();
    mailbox.index.deleted += 1;
    mailbox.write_index_header().unwrap();
    drop(lock);
}

#[test]
fn expunge_removes_deleted_message() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);

    mark_deleted(&t.store, "user.bob", 2);

    let (mut mailbox, lock) = t.store.open_locked("user.bob", USER).unwrap();
    let removed = mailbox.expunge(None).unwrap();
    assert_eq!(removed, vec![2]);
    drop(lock);
    drop(mailbox);

    let snapshot = index_snapshot(&t.store, "user.bob");
    assert_eq!(snapshot.exists, 2);
    assert_eq!(snapshot.quota_mailbox_used, 400);
    assert_eq!(snapshot.deleted, 0);
    assert_eq!(snapshot.leaked_cache_records, 0);
    assert_eq!(snapshot.generation_no, 1);

    let entry = t.list.lookup("user.bob").unwrap();
    assert_eq!(
        read_generation(&entry.path.join("cyrus.index")),
        read_generation(&entry.path.join("cyrus.cache"))
    );
    assert!(!entry.path.join("2.").exists());

    assert_eq!(t.quota.entry("user.bob").unwrap().used, 400);

    // the surviving records kept usable cache blobs
    let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
    mailbox.open_index().unwrap();
    for msgno in 1..=2 {
        let record = mailbox.read_index_record(msgno).unwrap();
        assert_ne!(record.uid, 2);
        mailbox.cache_fields(&record).unwrap();
    }
}

#[test]
fn reader_opened_before_expunge_keeps_old_pair() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);

    // this handle maps the generation-0 pair
    let mut reader = t.store.open_header("user.bob", USER).unwrap();
    reader.open_index().unwrap();

    mark_deleted(&t.store, "user.bob", 2);
    let (mut writer, lock) = t.store.open_locked("user.bob", USER).unwrap();
    writer.expunge(None).unwrap();
    drop(lock);

    // the old mapping stays internally consistent
    assert_eq!(reader.index.exists, 3);
    let record = reader.read_index_record(2).unwrap();
    assert_eq!(record.uid, 2);
    reader.cache_fields(&record).unwrap();

    // a fresh open lands on the new consistent pair
    let snapshot = index_snapshot(&t.store, "user.bob");
    assert_eq!(snapshot.exists, 2);
    assert_eq!(snapshot.generation_no, 1);
}

#[test]
fn pop_lock_blocks_expunge() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100]);

    let mut pop_session = t.store.open_header("user.bob", USER).unwrap();
    pop_session.open_index().unwrap();
    let pop = pop_session.lock_pop().unwrap();

    let (mut other, lock) = t.store.open_locked("user.bob", USER).unwrap();
    match other.expunge(None) {
        Err(StoreError::PopLocked) => {}
        other => panic!("expected PopLocked, got {:?}", other),
    }

    drop(pop);
    other.expunge(None).unwrap();
    drop(lock);
}

#[test]
fn append_over_quota_fails_cleanly() {
    let t = test_store();
    create_with_quota(&t, "user.bob", Some(500));

    let (mut mailbox, lock) = t.store.open_locked("user.bob", USER).unwrap();
    let data = message_of_size(600);
    let messages = vec![mailstore::store::MessageAppend::new(&data)];
    match mailbox.append_messages(&messages) {
        Err(StoreError::QuotaExceeded) => {}
        other => panic!("expected QuotaExceeded, got {:?}", other.map(|_| ())),
    }
    drop(lock);
    drop(mailbox);

    let snapshot = index_snapshot(&t.store, "user.bob");
    assert_eq!(snapshot.exists, 0);
    assert_eq!(snapshot.quota_mailbox_used, 0);
    assert_eq!(t.quota.entry("user.bob").unwrap().used, 0);

    let entry = t.list.lookup("user.bob").unwrap();
    assert!(!entry.path.join("1.").exists());
    // the cache holds nothing but its generation prefix again
    assert_eq!(
        std::fs::metadata(entry.path.join("cyrus.cache")).unwrap().len(),
        4
    );
}

#[test]
fn legacy_header_gains_a_unique_id() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);

    let uidvalidity = index_snapshot(&t.store, "user.bob").uidvalidity;
    let entry = t.list.lookup("user.bob").unwrap();
    let header_path = entry.path.join("cyrus.header");

    // the old single-line form: quota root without the unique-id segment
    let mut legacy = Vec::new();
    legacy.extend_from_slice(MAILBOX_HEADER_MAGIC);
    legacy.extend_from_slice(b"user.bob\n");
    legacy.extend_from_slice(b"\n");
    legacy.extend_from_slice(ACL.as_bytes());
    legacy.extend_from_slice(b"\n");
    std::fs::write(&header_path, &legacy).unwrap();

    let mailbox = t.store.open_header("user.bob", USER).unwrap();
    assert_eq!(mailbox.uniqueid(), make_uniqueid("user.bob", uidvalidity));
    drop(mailbox);

    // the rewritten header carries the tab-separated form now
    let rewritten = std::fs::read(&header_path).unwrap();
    let tail = &rewritten[MAILBOX_HEADER_MAGIC.len()..];
    let expected = format!("user.bob\t{}\n", make_uniqueid("user.bob", uidvalidity));
    assert!(tail.starts_with(expected.as_bytes()));
}

#[test]
fn delete_removes_files_quota_and_seen() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200]);

    let entry = t.list.lookup("user.bob").unwrap();
    let uniqueid = {
        let mailbox = t.store.open_header("user.bob", USER).unwrap();
        mailbox.uniqueid().to_string()
    };
    assert!(t.seen.is_known(&uniqueid));

    t.store.remove_mailbox("user.bob", USER, false).unwrap();

    assert!(!entry.path.exists());
    assert!(matches!(
        t.list.lookup("user.bob"),
        Err(StoreError::MailboxNonexistent)
    ));
    assert_eq!(t.quota.entry("user.bob").unwrap().used, 0);
    assert!(!t.seen.is_known(&uniqueid));
}
