//! memlog is the write path of an ordered key-value engine.
//!
//! Every mutation travels batch -> log -> memtable: a [WriteBatch] packages
//! puts and deletes under a single sequence range, the [LogWriter] makes the
//! batch's byte image durable as one block-framed record, and the batch is
//! then replayed into the [MemTable], where each record becomes an immutable
//! arena-resident entry in a lock-free skip list.  The batch serialization is
//! also the WAL record payload, so recovery replays logs through the same
//! handler interface the live write path uses.

extern crate prototk;
#[macro_use]
extern crate prototk_derive;

use std::cmp::Ordering;

use biometrics::Counter;
use tatl::{HeyListen, Stationary};
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

pub mod arena;
pub mod batch;
pub mod coding;
pub mod log;
pub mod memtable;
pub mod skiplist;

pub use arena::Arena;
pub use batch::{apply, Handler, WriteBatch};
pub use log::{LogOptions, LogWriter};
pub use memtable::{LookupKey, MemTable, MemTableIterator};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static KEY_TOO_LARGE: Counter = Counter::new("memlog.error.key_too_large");
static KEY_TOO_LARGE_MONITOR: Stationary =
    Stationary::new("memlog.error.key_too_large", &KEY_TOO_LARGE);

static VALUE_TOO_LARGE: Counter = Counter::new("memlog.error.value_too_large");
static VALUE_TOO_LARGE_MONITOR: Stationary =
    Stationary::new("memlog.error.value_too_large", &VALUE_TOO_LARGE);

/// Register this crate's biometrics.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&KEY_TOO_LARGE);
    collector.register_counter(&VALUE_TOO_LARGE);

    arena::register_biometrics(collector);
    batch::register_biometrics(collector);
    coding::register_biometrics(collector);
    log::register_biometrics(collector);
    memtable::register_biometrics(collector);
}

/// Register this crate's monitors.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&KEY_TOO_LARGE_MONITOR);
    hey_listen.register_stationary(&VALUE_TOO_LARGE_MONITOR);

    batch::register_monitors(hey_listen);
    coding::register_monitors(hey_listen);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The maximum length of a key.  Keys are length-prefixed with a varint32.
pub const MAX_KEY_LEN: usize = u32::MAX as usize;
/// The maximum length of a value.  Values are length-prefixed with a varint32.
pub const MAX_VALUE_LEN: usize = u32::MAX as usize;

/// The largest sequence number that packs alongside a [ValueType] into eight
/// bytes.  Sequence numbers occupy 56 bits.
pub const MAX_SEQUENCE_NUMBER: u64 = (1u64 << 56) - 1;

/// Check that the key is of valid length, or return a descriptive error.
pub fn check_key_len(key: &[u8]) -> Result<(), Error> {
    if key.len() > MAX_KEY_LEN {
        KEY_TOO_LARGE.click();
        let err = Error::KeyTooLarge {
            core: ErrorCore::default(),
            length: key.len(),
            limit: MAX_KEY_LEN,
        };
        Err(err)
    } else {
        Ok(())
    }
}

/// Check that the value is of valid length, or return a descriptive error.
pub fn check_value_len(value: &[u8]) -> Result<(), Error> {
    if value.len() > MAX_VALUE_LEN {
        VALUE_TOO_LARGE.click();
        let err = Error::ValueTooLarge {
            core: ErrorCore::default(),
            length: value.len(),
            limit: MAX_VALUE_LEN,
        };
        Err(err)
    } else {
        Ok(())
    }
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The memlog Error type.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// Success.  Used for Message default.  Should not be constructed otherwise.
    #[prototk(475136, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// Indicates the key length does not fit a varint32 length prefix.
    #[prototk(475137, message)]
    KeyTooLarge {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The length of the key.
        #[prototk(2, uint64)]
        length: usize,
        /// The limit on length of the key.
        #[prototk(3, uint64)]
        limit: usize,
    },
    /// Indicates the value length does not fit a varint32 length prefix.
    #[prototk(475138, message)]
    ValueTooLarge {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The length of the value.
        #[prototk(2, uint64)]
        length: usize,
        /// The limit on length of the value.
        #[prototk(3, uint64)]
        limit: usize,
    },
    /// A decode ran off the end of the provided buffer.
    #[prototk(475139, message)]
    BufferTooShort {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// Number of bytes required to finish the decode.
        #[prototk(2, uint64)]
        required: usize,
        /// Number of bytes available.
        #[prototk(3, uint64)]
        had: usize,
    },
    /// A varint consumed its maximum byte count without terminating.
    #[prototk(475140, message)]
    VarintOverflow {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// Number of bytes consumed.
        #[prototk(2, uint64)]
        bytes: usize,
    },
    /// General corruption was observed.
    #[prototk(475141, message)]
    Corruption {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A description of what was corrupt.
        #[prototk(2, string)]
        context: String,
    },
    /// A system error was encountered.
    #[prototk(475142, message)]
    SystemError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Self {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::SystemError {
            core: ErrorCore::default(),
            what: format!("{what:?}"),
        }
    }
}

iotoz! {Error}

///////////////////////////////////////////// ValueType ////////////////////////////////////////////

/// Distinguishes live values from tombstones, both in batch records and in
/// the low byte of a memtable entry's tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueType {
    /// A deletion.  Shadows every older value of the same user key.
    Deletion = 0x00,
    /// A regular value.
    Value = 0x01,
}

/// The value type used when constructing seek targets.  Because tags order
/// descending at equal user keys, seeking with the largest type at a snapshot
/// sequence lands on the newest entry at or below that snapshot.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

/// Pack `sequence` and `value_type` into an eight-byte tag.
///
/// # Panics
///
/// Will panic if `sequence` exceeds [MAX_SEQUENCE_NUMBER].
pub fn pack_tag(sequence: u64, value_type: ValueType) -> u64 {
    assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Split a tag into its sequence number and type byte.
pub fn unpack_tag(tag: u64) -> (u64, u8) {
    (tag >> 8, (tag & 0xff) as u8)
}

/////////////////////////////////////////// UserComparator /////////////////////////////////////////

/// A total order over user keys.  The memtable's internal ordering and the
/// point-lookup's user-key equality both route through this.
pub trait UserComparator: Send + Sync {
    /// Compare two user keys.
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering;
}

/// Plain lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl UserComparator for BytewiseComparator {
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        lhs.cmp(rhs)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_packing() {
        assert_eq!(0x100, pack_tag(1, ValueType::Deletion));
        assert_eq!(0x101, pack_tag(1, ValueType::Value));
        assert_eq!((42, 0x01), unpack_tag(pack_tag(42, ValueType::Value)));
        assert_eq!((42, 0x00), unpack_tag(pack_tag(42, ValueType::Deletion)));
        assert_eq!(
            (MAX_SEQUENCE_NUMBER, 0x01),
            unpack_tag(pack_tag(MAX_SEQUENCE_NUMBER, ValueType::Value))
        );
    }

    #[test]
    #[should_panic]
    fn tag_rejects_oversized_sequence() {
        pack_tag(MAX_SEQUENCE_NUMBER + 1, ValueType::Value);
    }

    #[test]
    fn bytewise() {
        let cmp = BytewiseComparator;
        assert_eq!(Ordering::Equal, cmp.compare(b"abc", b"abc"));
        assert_eq!(Ordering::Less, cmp.compare(b"abc", b"abd"));
        assert_eq!(Ordering::Less, cmp.compare(b"abc", b"abcd"));
        assert_eq!(Ordering::Greater, cmp.compare(b"b", b"aaaa"));
        assert_eq!(Ordering::Equal, cmp.compare(b"", b""));
    }
}
