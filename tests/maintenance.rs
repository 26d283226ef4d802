//! Whole-mailbox maintenance: rename, sync, reconstruct, format upgrade.

mod common;

use common::*;
use mailstore::store::{
    mailbox_path, MailboxList, PartitionConfig, ReconstructOptions, StoreError, SystemFlags,
    BIT32_MAX, FNAME_CACHE, FNAME_INDEX,
};

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

fn set_uidvalidity(t: &TestStore, name: &str, uidvalidity: u32) {
    let (mut mailbox, lock) = t.store.open_locked(name, USER).unwrap();
    mailbox.index.uidvalidity = uidvalidity;
    mailbox.write_index_header().unwrap();
    drop(lock);
}

fn mark_deleted(t: &TestStore, name: &str, msgno: u32) {
    let (mut mailbox, lock) = t.store.open_locked(name, USER).unwrap();
    let mut record = mailbox.read_index_record(msgno).unwrap();
    record.system_flags |= SystemFlags::DELETED;
    mailbox.write_index_record(msgno, &record, true).unwrap();
    mailbox.index.deleted += 1;
    mailbox.write_index_header().unwrap();
    drop(lock);
}

#[test]
fn partition_move_preserves_uidvalidity() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);
    set_uidvalidity(&t, "user.bob", 1_000_000);

    let old_path = t.list.lookup("user.bob").unwrap().path;

    let spool2 = t.dir.path().join("spool2");
    let new_path = mailbox_path(&PartitionConfig::new(&spool2), "user.bob").unwrap();
    t.store
        .rename_mailbox_to("user.bob", "user.bob", &new_path, USER, false)
        .unwrap();

    let entry = t.list.lookup("user.bob").unwrap();
    assert_eq!(entry.path, new_path);

    let snapshot = index_snapshot(&t.store, "user.bob");
    assert_eq!(snapshot.uidvalidity, 1_000_000);
    assert_eq!(snapshot.exists, 3);
    assert_eq!(snapshot.quota_mailbox_used, 600);

    for uid in 1..=3u32 {
        assert!(new_path.join(format!("{}.", uid)).is_file());
    }
    assert!(!old_path.exists());

    // an in-root move leaves the root's usage unchanged
    assert_eq!(t.quota.entry("user.bob").unwrap().used, 600);
}

#[test]
fn rename_moves_bytes_between_quota_roots() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    t.quota.define_root("user.carol", Some(1 << 20));
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);
    set_uidvalidity(&t, "user.bob", 1_000_000);

    t.store
        .rename_mailbox("user.bob", "user.carol", USER, false)
        .unwrap();

    assert!(matches!(
        t.list.lookup("user.bob"),
        Err(StoreError::MailboxNonexistent)
    ));

    let snapshot = index_snapshot(&t.store, "user.carol");
    assert_eq!(snapshot.exists, 3);
    assert_ne!(snapshot.uidvalidity, 1_000_000);

    assert_eq!(t.quota.entry("user.carol").unwrap().used, 600);
    assert_eq!(t.quota.entry("user.bob").unwrap().used, 0);
}

#[test]
fn rename_into_full_quota_root_fails() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    t.quota.define_root("user.carol", Some(500));
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);

    match t.store.rename_mailbox("user.bob", "user.carol", USER, false) {
        Err(StoreError::QuotaExceeded) => {}
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }

    // the source is untouched
    let snapshot = index_snapshot(&t.store, "user.bob");
    assert_eq!(snapshot.exists, 3);
    assert_eq!(t.quota.entry("user.bob").unwrap().used, 600);
}

#[test]
fn inbox_rename_leaves_an_empty_source() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200]);

    t.store
        .rename_mailbox("user.bob", "user.bob.archive", USER, true)
        .unwrap();

    // the INBOX survives, drained
    let source = index_snapshot(&t.store, "user.bob");
    assert_eq!(source.exists, 0);
    assert_eq!(source.quota_mailbox_used, 0);

    let archive = index_snapshot(&t.store, "user.bob.archive");
    assert_eq!(archive.exists, 2);
    assert_eq!(t.quota.entry("user.bob").unwrap().used, 300);
}

#[test]
fn sync_catches_the_slave_up() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);

    t.store
        .sync_mailbox("user.bob", "user.backup", USER, true)
        .unwrap();

    let master = index_snapshot(&t.store, "user.bob");
    let slave = index_snapshot(&t.store, "user.backup");
    assert_eq!(slave.exists, 3);
    assert_eq!(slave.uidvalidity, master.uidvalidity);
    assert_eq!(slave.generation_no, master.generation_no);

    // master moves on: expunge UID 2, new arrival UID 4
    mark_deleted(&t, "user.bob", 2);
    {
        let (mut mailbox, lock) = t.store.open_locked("user.bob", USER).unwrap();
        mailbox.expunge(None).unwrap();
        drop(lock);
    }
    append_sizes(&t.store, "user.bob", &[150]);

    t.store
        .sync_mailbox("user.bob", "user.backup", USER, false)
        .unwrap();

    let backup_path = t.list.lookup("user.backup").unwrap().path;
    assert!(!backup_path.join("2.").exists());
    assert!(backup_path.join("4.").is_file());

    let mut slave = t.store.open_header("user.backup", USER).unwrap();
    slave.open_index().unwrap();
    assert_eq!(slave.index.exists, 3);
    let uids: Vec<u32> = (1..=3)
        .map(|msgno| slave.read_index_record(msgno).unwrap().uid)
        .collect();
    assert_eq!(uids, vec![1, 3, 4]);
}

#[test]
fn reconstruct_rebuilds_from_message_files() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);

    let path = t.list.lookup("user.bob").unwrap().path;
    std::fs::remove_file(path.join(FNAME_INDEX)).unwrap();
    std::fs::remove_file(path.join(FNAME_CACHE)).unwrap();

    t.store
        .reconstruct("user.bob", &ReconstructOptions::default(), None)
        .unwrap();

    let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
    mailbox.open_index().unwrap();
    assert_eq!(mailbox.index.exists, 3);
    assert_eq!(mailbox.index.quota_mailbox_used, 600);
    assert!(mailbox.index.last_uid >= 3 + 100);
    assert_eq!(mailbox.index.deleted, 0);
    assert_eq!(mailbox.index.answered, 0);
    assert_eq!(mailbox.index.flagged, 0);

    for msgno in 1..=3u32 {
        let record = mailbox.read_index_record(msgno).unwrap();
        assert_eq!(record.uid, msgno);
        mailbox.cache_fields(&record).unwrap();
    }
}

#[test]
fn reconstruct_recovers_sidecar_and_discovers_mailboxes() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);

    let path = t.list.lookup("user.bob").unwrap().path;
    std::fs::write(path.join("7."), message_of_size(128)).unwrap();
    // "internaldate system_flags seen"
    std::fs::write(path.join("7.ams_extra_data"), "1234567 1 1").unwrap();
    // a zero-length stray gets reclaimed
    std::fs::write(path.join("9."), b"").unwrap();
    // an on-disk mailbox missing from the mailbox list
    std::fs::create_dir_all(path.join("sub")).unwrap();
    std::fs::write(path.join("sub/cyrus.header"), b"stub").unwrap();

    let mut found = Vec::new();
    t.store
        .reconstruct("user.bob", &ReconstructOptions::default(), Some(&mut found))
        .unwrap();
    assert_eq!(found, vec!["user.bob.sub".to_string()]);

    let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
    mailbox.open_index().unwrap();
    assert_eq!(mailbox.index.exists, 1);
    assert_eq!(mailbox.index.answered, 1);
    assert_eq!(mailbox.index.last_uid, 107);

    let record = mailbox.read_index_record(1).unwrap();
    assert_eq!(record.uid, 7);
    assert_eq!(record.internaldate, 1_234_567);
    assert!(record.system_flags.contains(SystemFlags::ANSWERED));

    // the sidecar is consumed, the empty file reclaimed
    assert!(!path.join("7.ams_extra_data").exists());
    assert!(!path.join("9.").exists());

    // the seen bit landed with the mailbox owner
    let seen = t.seen.get(mailbox.uniqueid(), "bob").unwrap();
    assert!(seen.uids.contains('7'));
}

#[test]
fn reconstruct_repairs_a_torn_compaction() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200, 300]);
    mark_deleted(&t, "user.bob", 2);

    let path = t.list.lookup("user.bob").unwrap().path;
    let old_cache = std::fs::read(path.join(FNAME_CACHE)).unwrap();

    {
        let (mut mailbox, lock) = t.store.open_locked("user.bob", USER).unwrap();
        mailbox.expunge(None).unwrap();
        drop(lock);
    }

    // simulate a crash between the two renames: the new index landed,
    // the old cache is still in place
    std::fs::write(path.join(FNAME_CACHE), &old_cache).unwrap();
    assert_ne!(
        read_generation(&path.join(FNAME_INDEX)),
        read_generation(&path.join(FNAME_CACHE))
    );

    t.store
        .reconstruct("user.bob", &ReconstructOptions::default(), None)
        .unwrap();

    let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
    mailbox.open_index().unwrap();
    assert_eq!(mailbox.index.exists, 2);
    assert_eq!(mailbox.index.quota_mailbox_used, 400);
    let uids: Vec<u32> = (1..=2)
        .map(|msgno| mailbox.read_index_record(msgno).unwrap().uid)
        .collect();
    // the live UID set is a subset of the pre-crash live set
    assert_eq!(uids, vec![1, 3]);
    for msgno in 1..=2u32 {
        let record = mailbox.read_index_record(msgno).unwrap();
        mailbox.cache_fields(&record).unwrap();
    }
}

#[test]
fn short_records_upgrade_in_place() {
    let t = test_store();
    create_with_quota(&t, "user.bob", None);
    append_sizes(&t.store, "user.bob", &[100, 200]);

    let before = index_snapshot(&t.store, "user.bob");
    let records: Vec<_> = {
        let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
        mailbox.open_index().unwrap();
        (1..=2)
            .map(|msgno| mailbox.read_index_record(msgno).unwrap())
            .collect()
    };

    // rewrite the index in the minor-version-5 layout: 72-byte header
    // without the reserved quota word, 52-byte records without the
    // content-lines and cache-version fields
    let path = t.list.lookup("user.bob").unwrap().path;
    let full = std::fs::read(path.join(FNAME_INDEX)).unwrap();
    let mut old = vec![0u8; 72];
    old[..32].copy_from_slice(&full[..32]); // generation .. last_uid
    put_u32(&mut old, 8, 5); // minor version
    put_u32(&mut old, 12, 72); // start offset
    put_u32(&mut old, 16, 52); // record size
    old[32..68].copy_from_slice(&full[36..72]); // quota .. leaked, shifted
    for record in &records {
        let offset = before.start_offset as usize
            + (record.uid as usize - 1) * before.record_size as usize;
        old.extend_from_slice(&full[offset..offset + 52]);
    }
    std::fs::write(path.join(FNAME_INDEX), &old).unwrap();

    // opening the mailbox runs the in-place upgrade
    let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
    mailbox.open_index().unwrap();

    assert_eq!(mailbox.index.minor_version, 6);
    assert_eq!(mailbox.index.start_offset, 76);
    assert_eq!(mailbox.index.record_size, 60);
    // the upgrade itself does not change the generation number
    assert_eq!(mailbox.index.generation_no, before.generation_no);
    assert_eq!(mailbox.index.exists, 2);
    assert_eq!(mailbox.index.last_uid, before.last_uid);
    assert_eq!(mailbox.index.quota_mailbox_used, 300);
    assert_eq!(mailbox.index.uidvalidity, before.uidvalidity);

    for (msgno, original) in (1..=2u32).zip(&records) {
        let record = mailbox.read_index_record(msgno).unwrap();
        assert_eq!(record.uid, original.uid);
        assert_eq!(record.size, original.size);
        assert_eq!(record.cache_offset, original.cache_offset);
        // new fields take their documented defaults
        assert_eq!(record.content_lines, BIT32_MAX);
        assert_eq!(record.cache_version, 0);
        mailbox.cache_fields(&record).unwrap();
    }

    // running the upgrade again is a no-op
    let upgraded = std::fs::read(path.join(FNAME_INDEX)).unwrap();
    drop(mailbox);
    let mut mailbox = t.store.open_header("user.bob", USER).unwrap();
    mailbox.open_index().unwrap();
    assert_eq!(std::fs::read(path.join(FNAME_INDEX)).unwrap(), upgraded);
}
