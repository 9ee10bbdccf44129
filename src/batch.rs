//! Write batches package a group of put/delete mutations under a single
//! sequence number range.
//!
//! A batch is one growing byte buffer whose image is exactly the WAL record
//! payload: an eight-byte sequence, a four-byte count, and then the records.
//! Both the log writer and the memtable read this one serialization, the
//! former as an opaque payload and the latter through [WriteBatch::iterate].

use biometrics::Counter;
use tatl::{HeyListen, Stationary};
use zerror::Z;
use zerror_core::ErrorCore;

use super::coding::{
    decode_fixed32, decode_fixed64, encode_fixed32, encode_fixed64, get_length_prefixed_slice,
    put_length_prefixed_slice,
};
use super::memtable::MemTable;
use super::{
    check_key_len, check_value_len, Error, UserComparator, ValueType, MAX_SEQUENCE_NUMBER,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PUT: Counter = Counter::new("memlog.batch.put");
static DEL: Counter = Counter::new("memlog.batch.del");
static MERGE: Counter = Counter::new("memlog.batch.merge");
static ITERATE: Counter = Counter::new("memlog.batch.iterate");
static APPLY: Counter = Counter::new("memlog.batch.apply");

static CORRUPTION: Counter = Counter::new("memlog.batch.corruption");
static CORRUPTION_MONITOR: Stationary =
    Stationary::new("memlog.batch.corruption", &CORRUPTION);

/// Register the biometrics for write batches.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&PUT);
    collector.register_counter(&DEL);
    collector.register_counter(&MERGE);
    collector.register_counter(&ITERATE);
    collector.register_counter(&APPLY);
    collector.register_counter(&CORRUPTION);
}

/// Register the monitors for write batches.
pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&CORRUPTION_MONITOR);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

// Eight bytes of sequence followed by four bytes of count.
const HEADER_SIZE: usize = 12;

const TAG_DELETION: u8 = ValueType::Deletion as u8;
const TAG_VALUE: u8 = ValueType::Value as u8;

////////////////////////////////////////////// Handler /////////////////////////////////////////////

/// The sink a batch replays into.  The live write path uses the memtable
/// inserter; recovery and tests provide their own.
pub trait Handler {
    /// A record that sets `key` to `value`.
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// A record that writes a tombstone for `key`.
    fn del(&mut self, key: &[u8]);
}

//////////////////////////////////////////// WriteBatch ////////////////////////////////////////////

/// An ordered collection of put/delete mutations sharing one sequence range
/// and one WAL record.
#[derive(Clone, Debug)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every record and reset the header to sequence zero, count zero.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    /// Append a record that sets `key` to `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        check_key_len(key)?;
        check_value_len(value)?;
        PUT.click();
        self.set_count(self.count() + 1);
        self.rep.push(TAG_VALUE);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
        Ok(())
    }

    /// Append a record that writes a tombstone for `key`.
    pub fn del(&mut self, key: &[u8]) -> Result<(), Error> {
        check_key_len(key)?;
        DEL.click();
        self.set_count(self.count() + 1);
        self.rep.push(TAG_DELETION);
        put_length_prefixed_slice(&mut self.rep, key);
        Ok(())
    }

    /// Append `other`'s records to this batch.  The count becomes the sum of
    /// both counts; this batch's sequence is kept and `other`'s is ignored.
    ///
    /// # Panics
    ///
    /// Will panic if `other` is smaller than a batch header.
    pub fn merge(&mut self, other: &WriteBatch) {
        MERGE.click();
        assert!(other.rep.len() >= HEADER_SIZE);
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    /// The size of the batch's serialization.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// The base sequence number assigned to the first record.
    pub fn sequence(&self) -> u64 {
        decode_fixed64(&self.rep[..8])
    }

    /// Assign the base sequence number.  The engine calls this once per
    /// write, immediately before logging the batch.
    ///
    /// # Panics
    ///
    /// Will panic if `sequence` exceeds [MAX_SEQUENCE_NUMBER].
    pub fn set_sequence(&mut self, sequence: u64) {
        assert!(sequence <= MAX_SEQUENCE_NUMBER);
        encode_fixed64(&mut self.rep[..8], sequence);
    }

    /// The number of records in the batch.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..HEADER_SIZE])
    }

    /// Overwrite the record count in the header.
    pub fn set_count(&mut self, count: u32) {
        encode_fixed32(&mut self.rep[8..HEADER_SIZE], count);
    }

    /// The batch's byte image.  This is what gets handed to the log writer.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Adopt `contents` as the batch's byte image, header included.
    /// Recovery uses this to replay a WAL record payload.
    ///
    /// # Panics
    ///
    /// Will panic if `contents` is smaller than a batch header.
    pub fn set_contents(&mut self, contents: &[u8]) {
        assert!(contents.len() >= HEADER_SIZE);
        self.rep.clear();
        self.rep.extend_from_slice(contents);
    }

    /// Walk the records in insertion order, dispatching each to `handler`.
    ///
    /// The batch is rejected wholesale on corruption: a short header, a
    /// truncated record, an unknown tag, or a record count that disagrees
    /// with the header.
    pub fn iterate<H: Handler>(&self, handler: &mut H) -> Result<(), Error> {
        ITERATE.click();
        if self.rep.len() < HEADER_SIZE {
            CORRUPTION.click();
            let err = Error::Corruption {
                core: ErrorCore::default(),
                context: "batch is smaller than its header".to_string(),
            }
            .with_info("length", self.rep.len());
            return Err(err);
        }
        let mut input = &self.rep[HEADER_SIZE..];
        let mut found: u32 = 0;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            match tag {
                TAG_VALUE => {
                    let (key, rest) = get_length_prefixed_slice(input).map_err(|_| {
                        CORRUPTION.click();
                        Error::Corruption {
                            core: ErrorCore::default(),
                            context: "put record is truncated".to_string(),
                        }
                    })?;
                    let (value, rest) = get_length_prefixed_slice(rest).map_err(|_| {
                        CORRUPTION.click();
                        Error::Corruption {
                            core: ErrorCore::default(),
                            context: "put record is truncated".to_string(),
                        }
                    })?;
                    handler.put(key, value);
                    input = rest;
                }
                TAG_DELETION => {
                    let (key, rest) = get_length_prefixed_slice(input).map_err(|_| {
                        CORRUPTION.click();
                        Error::Corruption {
                            core: ErrorCore::default(),
                            context: "delete record is truncated".to_string(),
                        }
                    })?;
                    handler.del(key);
                    input = rest;
                }
                _ => {
                    CORRUPTION.click();
                    let err = Error::Corruption {
                        core: ErrorCore::default(),
                        context: "unknown record tag".to_string(),
                    }
                    .with_info("tag", tag);
                    return Err(err);
                }
            }
            found += 1;
        }
        if found != self.count() {
            CORRUPTION.click();
            let err = Error::Corruption {
                core: ErrorCore::default(),
                context: "record count disagrees with header".to_string(),
            }
            .with_info("header", self.count())
            .with_info("found", found);
            return Err(err);
        }
        Ok(())
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self {
            rep: vec![0u8; HEADER_SIZE],
        }
    }
}

///////////////////////////////////////// MemTableInserter /////////////////////////////////////////

struct MemTableInserter<'a, C: UserComparator> {
    sequence: u64,
    mem: &'a MemTable<C>,
}

impl<C: UserComparator> Handler for MemTableInserter<'_, C> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn del(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, &[]);
        self.sequence += 1;
    }
}

/// Replay `batch` into `mem`, assigning each record one sequence number
/// starting from the batch's base sequence.
pub fn apply<C: UserComparator>(batch: &WriteBatch, mem: &MemTable<C>) -> Result<(), Error> {
    APPLY.click();
    let mut inserter = MemTableInserter {
        sequence: batch.sequence(),
        mem,
    };
    batch.iterate(&mut inserter)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    }

    impl Handler for RecordingHandler {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.ops.push((key.to_vec(), Some(value.to_vec())));
        }

        fn del(&mut self, key: &[u8]) {
            self.ops.push((key.to_vec(), None));
        }
    }

    #[test]
    fn empty() {
        let batch = WriteBatch::new();
        assert_eq!(12, batch.approximate_size());
        assert_eq!(0, batch.count());
        assert_eq!(0, batch.sequence());
        let mut handler = RecordingHandler::default();
        batch.iterate(&mut handler).unwrap();
        assert!(handler.ops.is_empty());
    }

    #[test]
    fn put_then_del() {
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1").unwrap();
        batch.del(b"k2").unwrap();
        batch.set_sequence(100);
        assert_eq!(2, batch.count());
        assert_eq!(100, batch.sequence());
        let mut handler = RecordingHandler::default();
        batch.iterate(&mut handler).unwrap();
        assert_eq!(
            vec![
                (b"k1".to_vec(), Some(b"v1".to_vec())),
                (b"k2".to_vec(), None),
            ],
            handler.ops
        );
    }

    #[test]
    fn byte_image() {
        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1").unwrap();
        batch.del(b"k2").unwrap();
        batch.set_sequence(100);
        let exp: &[u8] = &[
            100, 0, 0, 0, 0, 0, 0, 0, // sequence: fixed64
            2, 0, 0, 0, // count: fixed32
            1, 2, b'k', b'1', 2, b'v', b'1', // put record
            0, 2, b'k', b'2', // delete record
        ];
        assert_eq!(exp, batch.contents());
    }

    #[test]
    fn clear_resets_the_header() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v").unwrap();
        batch.set_sequence(7);
        batch.clear();
        assert_eq!(12, batch.approximate_size());
        assert_eq!(0, batch.count());
        assert_eq!(0, batch.sequence());
    }

    #[test]
    fn empty_keys_and_values_are_records() {
        let mut batch = WriteBatch::new();
        batch.put(b"", b"").unwrap();
        batch.del(b"").unwrap();
        assert_eq!(2, batch.count());
        let mut handler = RecordingHandler::default();
        batch.iterate(&mut handler).unwrap();
        assert_eq!(
            vec![(vec![], Some(vec![])), (vec![], None)],
            handler.ops
        );
    }

    #[test]
    fn merge() {
        let mut lhs = WriteBatch::new();
        lhs.put(b"a", b"1").unwrap();
        lhs.set_sequence(100);
        let mut rhs = WriteBatch::new();
        rhs.del(b"b").unwrap();
        rhs.put(b"c", b"3").unwrap();
        rhs.set_sequence(999);
        lhs.merge(&rhs);
        assert_eq!(3, lhs.count());
        assert_eq!(100, lhs.sequence());
        let mut handler = RecordingHandler::default();
        lhs.iterate(&mut handler).unwrap();
        assert_eq!(
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), None),
                (b"c".to_vec(), Some(b"3".to_vec())),
            ],
            handler.ops
        );
    }

    #[test]
    fn contents_round_trip() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value").unwrap();
        batch.set_sequence(42);
        let mut copy = WriteBatch::new();
        copy.set_contents(batch.contents());
        assert_eq!(42, copy.sequence());
        assert_eq!(1, copy.count());
        let mut handler = RecordingHandler::default();
        copy.iterate(&mut handler).unwrap();
        assert_eq!(vec![(b"key".to_vec(), Some(b"value".to_vec()))], handler.ops);
    }

    #[test]
    fn truncated_record_is_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value").unwrap();
        let image = batch.contents().to_vec();
        let mut truncated = WriteBatch::new();
        truncated.set_contents(&image[..image.len() - 3]);
        let mut handler = RecordingHandler::default();
        assert!(matches!(
            truncated.iterate(&mut handler),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut batch = WriteBatch::new();
        let mut image = batch.contents().to_vec();
        image.push(7);
        batch.set_contents(&image);
        batch.set_count(1);
        let mut handler = RecordingHandler::default();
        assert!(matches!(
            batch.iterate(&mut handler),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn count_mismatch_is_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v").unwrap();
        batch.set_count(2);
        let mut handler = RecordingHandler::default();
        assert!(matches!(
            batch.iterate(&mut handler),
            Err(Error::Corruption { .. })
        ));
    }
}
