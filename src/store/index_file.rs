//! Binary codec for the index header and the per-message index records.
//!
//! All integers on disk are 32-bit big-endian at fixed offsets. The codec
//! is pure: it reads and writes byte regions and never touches a file.
//! Short (pre-upgrade) headers and records decode with documented
//! defaults so the in-place upgrade can run from a decoded snapshot.

use bitflags::bitflags;

use crate::store::StoreError;

/// Current index layout version.
pub const MAILBOX_MINOR_VERSION: u32 = 6;
/// Current layout version of the parsed-header cache entries.
pub const MAILBOX_CACHE_MINOR_VERSION: u32 = 2;

pub const MAX_USER_FLAGS: usize = 128;
pub const USER_FLAG_WORDS: usize = MAX_USER_FLAGS / 32;

pub const BIT32_MAX: u32 = 0xffff_ffff;

// Offsets of index header fields.
pub const OFFSET_GENERATION_NO: usize = 0;
pub const OFFSET_FORMAT: usize = 4;
pub const OFFSET_MINOR_VERSION: usize = 8;
pub const OFFSET_START_OFFSET: usize = 12;
pub const OFFSET_RECORD_SIZE: usize = 16;
pub const OFFSET_EXISTS: usize = 20;
pub const OFFSET_LAST_APPENDDATE: usize = 24;
pub const OFFSET_LAST_UID: usize = 28;
pub const OFFSET_QUOTA_RESERVED: usize = 32;
pub const OFFSET_QUOTA_MAILBOX_USED: usize = 36;
pub const OFFSET_POP3_LAST_LOGIN: usize = 40;
pub const OFFSET_UIDVALIDITY: usize = 44;
pub const OFFSET_DELETED: usize = 48;
pub const OFFSET_ANSWERED: usize = 52;
pub const OFFSET_FLAGGED: usize = 56;
pub const OFFSET_POP3_NEW_UIDL: usize = 60;
pub const OFFSET_LEAKED_CACHE: usize = 64;
pub const OFFSET_SPARE1: usize = 68;
pub const OFFSET_SPARE2: usize = 72;

// Offsets of index record fields.
pub const OFFSET_UID: usize = 0;
pub const OFFSET_INTERNALDATE: usize = 4;
pub const OFFSET_SENTDATE: usize = 8;
pub const OFFSET_SIZE: usize = 12;
pub const OFFSET_HEADER_SIZE: usize = 16;
pub const OFFSET_CONTENT_OFFSET: usize = 20;
pub const OFFSET_CACHE_OFFSET: usize = 24;
pub const OFFSET_LAST_UPDATED: usize = 28;
pub const OFFSET_SYSTEM_FLAGS: usize = 32;
pub const OFFSET_USER_FLAGS: usize = 36;
pub const OFFSET_CONTENT_LINES: usize = OFFSET_USER_FLAGS + MAX_USER_FLAGS / 8;
pub const OFFSET_CACHE_VERSION: usize = OFFSET_CONTENT_LINES + 4;

pub const INDEX_HEADER_SIZE: usize = OFFSET_SPARE2 + 4;
pub const INDEX_RECORD_SIZE: usize = OFFSET_CACHE_VERSION + 4;

/// Layouts before minor version 6 lack the reserved 64-bit quota word, so
/// every header field after `last_uid` sits four bytes earlier.
const QUOTA_UPGRADE_SHIFT: usize = 4;

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(b)
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxFormat {
    Normal,
    Netnews,
}

impl MailboxFormat {
    pub fn from_disk(value: u32) -> Result<Self, StoreError> {
        match value {
            0 => Ok(MailboxFormat::Normal),
            1 => Ok(MailboxFormat::Netnews),
            _ => Err(StoreError::BadFormat),
        }
    }

    pub fn to_disk(self) -> u32 {
        match self {
            MailboxFormat::Normal => 0,
            MailboxFormat::Netnews => 1,
        }
    }
}

bitflags! {
    /// System flag bits of an index record.
    pub struct SystemFlags: u32 {
        const ANSWERED = 1 << 0;
        const FLAGGED = 1 << 1;
        const DELETED = 1 << 2;
        const DRAFT = 1 << 3;
    }
}

/// Decoded snapshot of the index header.
#[derive(Clone, Debug)]
pub struct IndexHeader {
    pub generation_no: u32,
    pub format: MailboxFormat,
    pub minor_version: u32,
    pub start_offset: u32,
    pub record_size: u32,
    pub exists: u32,
    pub last_appenddate: u32,
    pub last_uid: u32,
    pub quota_mailbox_used: u32,
    pub pop3_last_login: u32,
    pub uidvalidity: u32,
    pub deleted: u32,
    pub answered: u32,
    pub flagged: u32,
    pub pop3_new_uidl: bool,
    pub leaked_cache_records: u32,
}

impl Default for IndexHeader {
    fn default() -> Self {
        IndexHeader {
            generation_no: 0,
            format: MailboxFormat::Normal,
            minor_version: MAILBOX_MINOR_VERSION,
            start_offset: INDEX_HEADER_SIZE as u32,
            record_size: INDEX_RECORD_SIZE as u32,
            exists: 0,
            last_appenddate: 0,
            last_uid: 0,
            quota_mailbox_used: 0,
            pop3_last_login: 0,
            uidvalidity: 0,
            deleted: 0,
            answered: 0,
            flagged: 0,
            pop3_new_uidl: true,
            leaked_cache_records: 0,
        }
    }
}

/// Result of decoding an index header, including what (if anything) the
/// layout is missing relative to the current one.
pub struct HeaderDecode {
    pub header: IndexHeader,
    /// The on-disk layout is older than the current one and must be
    /// rewritten in place before normal operation continues.
    pub needs_upgrade: bool,
    /// The layout predates the per-flag counters; they have to be
    /// recomputed from the records.
    pub needs_flag_counts: bool,
}

/// Decode the index header from the start of the mapped index file.
pub fn decode_index_header(buf: &[u8]) -> Result<HeaderDecode, StoreError> {
    if buf.len() < OFFSET_POP3_LAST_LOGIN {
        return Err(StoreError::BadFormat);
    }

    let start_offset = get_u32(buf, OFFSET_START_OFFSET);
    if (buf.len() as u64) < start_offset as u64 {
        return Err(StoreError::BadFormat);
    }

    let minor_version = get_u32(buf, OFFSET_MINOR_VERSION);
    let shift = if minor_version <= 5 { QUOTA_UPGRADE_SHIFT } else { 0 };

    let mut needs_upgrade = false;
    let mut needs_flag_counts = false;

    // A field is present when the stored header is long enough to hold it
    // at its (possibly shifted) offset.
    let has = |off: usize| start_offset as usize >= off - shift + 4;

    let exists = get_u32(buf, OFFSET_EXISTS);

    let pop3_last_login = if has(OFFSET_POP3_LAST_LOGIN) {
        get_u32(buf, OFFSET_POP3_LAST_LOGIN - shift)
    } else {
        0
    };

    let uidvalidity = if has(OFFSET_UIDVALIDITY) {
        get_u32(buf, OFFSET_UIDVALIDITY - shift)
    } else {
        1
    };

    let (deleted, answered, flagged) = if has(OFFSET_FLAGGED) {
        (
            get_u32(buf, OFFSET_DELETED - shift),
            get_u32(buf, OFFSET_ANSWERED - shift),
            get_u32(buf, OFFSET_FLAGGED - shift),
        )
    } else {
        needs_upgrade = true;
        needs_flag_counts = true;
        (0, 0, 0)
    };

    let pop3_new_uidl = if has(OFFSET_POP3_NEW_UIDL) {
        exists == 0 || get_u32(buf, OFFSET_POP3_NEW_UIDL - shift) != 0
    } else {
        needs_upgrade = true;
        exists == 0
    };

    let leaked_cache_records = if has(OFFSET_LEAKED_CACHE) {
        get_u32(buf, OFFSET_LEAKED_CACHE - shift)
    } else {
        needs_upgrade = true;
        0
    };

    let record_size = get_u32(buf, OFFSET_RECORD_SIZE);
    if (record_size as usize) < INDEX_RECORD_SIZE {
        needs_upgrade = true;
    }
    if minor_version < MAILBOX_MINOR_VERSION {
        needs_upgrade = true;
    }

    let header = IndexHeader {
        generation_no: get_u32(buf, OFFSET_GENERATION_NO),
        format: MailboxFormat::from_disk(get_u32(buf, OFFSET_FORMAT))?,
        minor_version,
        start_offset,
        record_size,
        exists,
        last_appenddate: get_u32(buf, OFFSET_LAST_APPENDDATE),
        last_uid: get_u32(buf, OFFSET_LAST_UID),
        quota_mailbox_used: get_u32(buf, OFFSET_QUOTA_MAILBOX_USED - shift),
        pop3_last_login,
        uidvalidity,
        deleted,
        answered,
        flagged,
        pop3_new_uidl,
        leaked_cache_records,
    };

    Ok(HeaderDecode { header, needs_upgrade, needs_flag_counts })
}

/// Encode `header` in the current layout.
pub fn encode_index_header(header: &IndexHeader) -> [u8; INDEX_HEADER_SIZE] {
    let mut buf = [0u8; INDEX_HEADER_SIZE];
    put_u32(&mut buf, OFFSET_GENERATION_NO, header.generation_no);
    put_u32(&mut buf, OFFSET_FORMAT, header.format.to_disk());
    put_u32(&mut buf, OFFSET_MINOR_VERSION, header.minor_version);
    put_u32(&mut buf, OFFSET_START_OFFSET, header.start_offset);
    put_u32(&mut buf, OFFSET_RECORD_SIZE, header.record_size);
    put_u32(&mut buf, OFFSET_EXISTS, header.exists);
    put_u32(&mut buf, OFFSET_LAST_APPENDDATE, header.last_appenddate);
    put_u32(&mut buf, OFFSET_LAST_UID, header.last_uid);
    put_u32(&mut buf, OFFSET_QUOTA_RESERVED, 0);
    put_u32(&mut buf, OFFSET_QUOTA_MAILBOX_USED, header.quota_mailbox_used);
    put_u32(&mut buf, OFFSET_POP3_LAST_LOGIN, header.pop3_last_login);
    put_u32(&mut buf, OFFSET_UIDVALIDITY, header.uidvalidity);
    put_u32(&mut buf, OFFSET_DELETED, header.deleted);
    put_u32(&mut buf, OFFSET_ANSWERED, header.answered);
    put_u32(&mut buf, OFFSET_FLAGGED, header.flagged);
    put_u32(&mut buf, OFFSET_POP3_NEW_UIDL, header.pop3_new_uidl as u32);
    put_u32(&mut buf, OFFSET_LEAKED_CACHE, header.leaked_cache_records);
    put_u32(&mut buf, OFFSET_SPARE1, 0);
    put_u32(&mut buf, OFFSET_SPARE2, 0);
    buf
}

/// A single message's index record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: u32,
    pub internaldate: u32,
    pub sentdate: u32,
    pub size: u32,
    pub header_size: u32,
    pub content_offset: u32,
    pub cache_offset: u32,
    pub last_updated: u32,
    pub system_flags: SystemFlags,
    pub user_flags: [u32; USER_FLAG_WORDS],
    pub content_lines: u32,
    pub cache_version: u32,
}

impl Default for IndexRecord {
    fn default() -> Self {
        IndexRecord {
            uid: 0,
            internaldate: 0,
            sentdate: 0,
            size: 0,
            header_size: 0,
            content_offset: 0,
            cache_offset: 0,
            last_updated: 0,
            system_flags: SystemFlags::empty(),
            user_flags: [0; USER_FLAG_WORDS],
            content_lines: BIT32_MAX,
            cache_version: 0,
        }
    }
}

impl IndexRecord {
    pub fn user_flag(&self, flag: usize) -> bool {
        self.user_flags[flag / 32] & (1 << (flag & 31)) != 0
    }

    pub fn set_user_flag(&mut self, flag: usize, value: bool) {
        if value {
            self.user_flags[flag / 32] |= 1 << (flag & 31);
        } else {
            self.user_flags[flag / 32] &= !(1 << (flag & 31));
        }
    }
}

/// Decode a record buffer. Records shorter than the current layout get
/// the documented defaults for the missing tail fields.
pub fn decode_index_record(buf: &[u8]) -> Result<IndexRecord, StoreError> {
    if buf.len() < OFFSET_USER_FLAGS + MAX_USER_FLAGS / 8 {
        return Err(StoreError::BadFormat);
    }

    let mut user_flags = [0u32; USER_FLAG_WORDS];
    for (n, word) in user_flags.iter_mut().enumerate() {
        *word = get_u32(buf, OFFSET_USER_FLAGS + 4 * n);
    }

    let content_lines = if buf.len() >= OFFSET_CONTENT_LINES + 4 {
        get_u32(buf, OFFSET_CONTENT_LINES)
    } else {
        BIT32_MAX
    };
    let cache_version = if buf.len() >= OFFSET_CACHE_VERSION + 4 {
        get_u32(buf, OFFSET_CACHE_VERSION)
    } else {
        0
    };

    Ok(IndexRecord {
        uid: get_u32(buf, OFFSET_UID),
        internaldate: get_u32(buf, OFFSET_INTERNALDATE),
        sentdate: get_u32(buf, OFFSET_SENTDATE),
        size: get_u32(buf, OFFSET_SIZE),
        header_size: get_u32(buf, OFFSET_HEADER_SIZE),
        content_offset: get_u32(buf, OFFSET_CONTENT_OFFSET),
        cache_offset: get_u32(buf, OFFSET_CACHE_OFFSET),
        last_updated: get_u32(buf, OFFSET_LAST_UPDATED),
        system_flags: SystemFlags::from_bits_truncate(get_u32(buf, OFFSET_SYSTEM_FLAGS)),
        user_flags,
        content_lines,
        cache_version,
    })
}

/// Encode `record` in the current layout into the start of `buf`.
pub fn encode_index_record(record: &IndexRecord, buf: &mut [u8]) {
    put_u32(buf, OFFSET_UID, record.uid);
    put_u32(buf, OFFSET_INTERNALDATE, record.internaldate);
    put_u32(buf, OFFSET_SENTDATE, record.sentdate);
    put_u32(buf, OFFSET_SIZE, record.size);
    put_u32(buf, OFFSET_HEADER_SIZE, record.header_size);
    put_u32(buf, OFFSET_CONTENT_OFFSET, record.content_offset);
    put_u32(buf, OFFSET_CACHE_OFFSET, record.cache_offset);
    put_u32(buf, OFFSET_LAST_UPDATED, record.last_updated);
    put_u32(buf, OFFSET_SYSTEM_FLAGS, record.system_flags.bits());
    for (n, word) in record.user_flags.iter().enumerate() {
        put_u32(buf, OFFSET_USER_FLAGS + 4 * n, *word);
    }
    put_u32(buf, OFFSET_CONTENT_LINES, record.content_lines);
    put_u32(buf, OFFSET_CACHE_VERSION, record.cache_version);
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_header() -> IndexHeader {
        IndexHeader {
            generation_no: 7,
            format: MailboxFormat::Normal,
            minor_version: MAILBOX_MINOR_VERSION,
            start_offset: INDEX_HEADER_SIZE as u32,
            record_size: INDEX_RECORD_SIZE as u32,
            exists: 3,
            last_appenddate: 1_200_000_000,
            last_uid: 17,
            quota_mailbox_used: 600,
            pop3_last_login: 1_100_000_000,
            uidvalidity: 1_000_000_000,
            deleted: 1,
            answered: 2,
            flagged: 0,
            pop3_new_uidl: true,
            leaked_cache_records: 0,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let buf = encode_index_header(&header);
        let decoded = decode_index_header(&buf).unwrap();
        assert!(!decoded.needs_upgrade);
        assert!(!decoded.needs_flag_counts);
        assert_eq!(encode_index_header(&decoded.header), buf);
    }

    #[test]
    fn record_round_trip() {
        let mut record = IndexRecord::default();
        record.uid = 42;
        record.internaldate = 1_200_000_001;
        record.sentdate = 1_200_000_000;
        record.size = 1234;
        record.header_size = 200;
        record.content_offset = 200;
        record.cache_offset = 4;
        record.last_updated = 1_200_000_002;
        record.system_flags = SystemFlags::ANSWERED | SystemFlags::DELETED;
        record.set_user_flag(0, true);
        record.set_user_flag(127, true);
        record.content_lines = 20;
        record.cache_version = MAILBOX_CACHE_MINOR_VERSION;

        let mut buf = [0u8; INDEX_RECORD_SIZE];
        encode_index_record(&record, &mut buf);
        let decoded = decode_index_record(&buf).unwrap();
        assert_eq!(decoded, record);

        let mut buf2 = [0u8; INDEX_RECORD_SIZE];
        encode_index_record(&decoded, &mut buf2);
        assert_eq!(&buf[..], &buf2[..]);
    }

    #[test]
    fn short_record_gets_defaults() {
        let mut record = IndexRecord::default();
        record.uid = 9;
        record.content_lines = 55;
        record.cache_version = 2;

        let mut buf = [0u8; INDEX_RECORD_SIZE];
        encode_index_record(&record, &mut buf);

        // Records written before the content-lines field existed.
        let decoded = decode_index_record(&buf[..OFFSET_CONTENT_LINES]).unwrap();
        assert_eq!(decoded.uid, 9);
        assert_eq!(decoded.content_lines, BIT32_MAX);
        assert_eq!(decoded.cache_version, 0);
    }

    #[test]
    fn short_header_gets_defaults() {
        // A header from the era before the flag counters: fields end right
        // after uidvalidity, and there is no reserved quota word.
        let header = sample_header();
        let full = encode_index_header(&header);

        let start = OFFSET_UIDVALIDITY; // shifted back by 4, plus the field itself
        let mut buf = vec![0u8; start];
        buf.copy_from_slice(&full[..start]);
        put_u32(&mut buf, OFFSET_MINOR_VERSION, 4);
        put_u32(&mut buf, OFFSET_START_OFFSET, start as u32);
        put_u32(&mut buf, OFFSET_RECORD_SIZE, (INDEX_RECORD_SIZE - 8) as u32);
        // quota and uidvalidity sit 4 bytes earlier without the reserved word
        put_u32(&mut buf, OFFSET_QUOTA_MAILBOX_USED - 4, 600);
        put_u32(&mut buf, OFFSET_POP3_LAST_LOGIN - 4, 0);
        put_u32(&mut buf, OFFSET_UIDVALIDITY - 4, 1_000_000_000);

        let decoded = decode_index_header(&buf).unwrap();
        assert!(decoded.needs_upgrade);
        assert!(decoded.needs_flag_counts);
        assert_eq!(decoded.header.quota_mailbox_used, 600);
        assert_eq!(decoded.header.uidvalidity, 1_000_000_000);
        assert_eq!(decoded.header.deleted, 0);
        assert_eq!(decoded.header.leaked_cache_records, 0);
        // the field is absent and the mailbox is nonempty
        assert!(!decoded.header.pop3_new_uidl);
    }
}
