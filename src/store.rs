//! This module implements the mailbox storage and access layer.
//!
//! # Data formats
//!
//! A mailbox is a directory on a partition. Each message is stored as an
//! immutable file named `<uid>.` (the decimal UID followed by a period)
//! containing the raw message octets. Next to the message files live three
//! control files:
//!
//! * `cyrus.header` — a short text file: a multi-line magic banner, the
//!   quota-root and unique-id line, the user-flag name table, and a backup
//!   copy of the ACL (the mailbox list stays authoritative for the ACL).
//!
//! * `cyrus.index` — a fixed-layout binary file: a header block followed
//!   by one fixed-size record per message, all integers 32-bit big-endian.
//!   The header stores its own size (`start_offset`) and the record size,
//!   which lets older layouts coexist with newer code until an in-place
//!   upgrade widens them.
//!
//! * `cyrus.cache` — a variable-length binary file of per-message parsed
//!   header blobs. Each index record points at its blob via a byte offset.
//!
//! The first four bytes of the cache file mirror the index header's
//! generation number. A reader that maps both files compares the two;
//! a mismatch means a compaction is racing and the open is retried a
//! bounded number of times.
//!
//! # Locking
//!
//! Multiple processes may hold handles to the same mailbox. Three advisory
//! locks serialize them: the **header** lock (mailbox metadata), the
//! **index** lock (record writers) and the nonblocking **pop** lock (taken
//! on the cache file; a POP-style drainer holds it for a whole session).
//! The acquisition order is strict: header before index before seen-state
//! before pop. Each lock is reentrant per handle via a depth counter; the
//! OS lock is taken at depth 0→1 and released at 1→0.
//!
//! The header lock re-stats the path after acquisition and reopens when
//! the inode changed, because header writers commit via rename. The index
//! lock loops the same way. Compaction is the only operation holding all
//! three locks at once.
//!
//! # Compaction
//!
//! Expunge rewrites index and cache as `.NEW` files carrying the next
//! generation number, releases the freed quota transactionally, renames
//! the index and then the cache into place, and finally unlinks the
//! expunged message files. A crash before the first rename leaves the old
//! pair authoritative; a crash between the renames leaves the generation
//! numbers mismatched, which readers report as a bad format and
//! [reconstruct](fn.reconstruct.html) repairs.

mod error;
pub use error::*;

mod hash_path;
pub use hash_path::*;

mod index_file;
pub use index_file::*;

mod cache_file;
pub use cache_file::*;

mod lock;
pub use lock::*;

mod message;
pub use message::*;

mod service;
pub use service::*;

mod mailbox;
pub use mailbox::*;

mod append;
pub use append::*;

mod expunge;
pub use expunge::*;

mod rename;
pub use rename::*;

mod reconstruct;
pub use reconstruct::*;
