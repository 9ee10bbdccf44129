//! The in-memory sorted table that absorbs every mutation the log accepts.
//!
//! Entries are immutable byte strings in an arena the memtable owns; the
//! skip list holds only their addresses.  An entry is the varint32 length of
//! the internal key, the user key, an eight-byte tag packing (sequence,
//! type), the varint32 length of the value, and the value.  Ordering is
//! ascending by user key and descending by tag at equal user keys, which is
//! what lets a point lookup seek once and inspect a single entry.

use std::cmp::Ordering;
use std::sync::Mutex;

use biometrics::Counter;

use super::arena::Arena;
use super::coding::{decode_fixed64, encode_fixed64, encode_varint32, put_varint32, varint_length};
use super::skiplist::{KeyComparator, SkipList, SkipListIterator};
use super::{
    pack_tag, BytewiseComparator, Error, UserComparator, ValueType, MAX_SEQUENCE_NUMBER,
    VALUE_TYPE_FOR_SEEK,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ADD: Counter = Counter::new("memlog.memtable.add");
static GET: Counter = Counter::new("memlog.memtable.get");
static NEW_ITERATOR: Counter = Counter::new("memlog.memtable.new_iterator");
static SEEK: Counter = Counter::new("memlog.memtable.seek");

/// Register the biometrics for the memtable.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&ADD);
    collector.register_counter(&GET);
    collector.register_counter(&NEW_ITERATOR);
    collector.register_counter(&SEEK);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const TAG_DELETION: u8 = ValueType::Deletion as u8;
const TAG_VALUE: u8 = ValueType::Value as u8;

/////////////////////////////////////////// entry decoding /////////////////////////////////////////

// Decode a varint32 the writer of the entry already validated.  Reads one
// byte at a time so it never touches memory past the terminator.
unsafe fn decode_varint32_raw(mut p: *const u8) -> (u32, *const u8) {
    let mut result: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *p;
        p = p.add(1);
        if byte & 0x80 != 0 {
            result |= ((byte & 0x7f) as u32) << shift;
            shift += 7;
        } else {
            result |= (byte as u32) << shift;
            return (result, p);
        }
    }
}

// The internal key (user key plus tag) of the entry at `entry`.
unsafe fn entry_internal_key<'a>(entry: *const u8) -> &'a [u8] {
    let (len, p) = decode_varint32_raw(entry);
    std::slice::from_raw_parts(p, len as usize)
}

// The value of the entry at `entry`; the length-prefixed slice directly
// after the internal key.
unsafe fn entry_value<'a>(entry: *const u8) -> &'a [u8] {
    let internal_key = entry_internal_key(entry);
    let (len, p) = decode_varint32_raw(internal_key.as_ptr().add(internal_key.len()));
    std::slice::from_raw_parts(p, len as usize)
}

/////////////////////////////////////// InternalKeyComparator //////////////////////////////////////

/// Orders memtable entries: ascending by user key under the injected
/// [UserComparator], then by tag with the larger (newer) tag first.
pub struct InternalKeyComparator<C: UserComparator> {
    user_comparator: C,
}

impl<C: UserComparator> InternalKeyComparator<C> {
    /// Wrap a user comparator.
    pub fn new(user_comparator: C) -> Self {
        Self { user_comparator }
    }

    /// The user comparator underneath.
    pub fn user_comparator(&self) -> &C {
        &self.user_comparator
    }

    fn compare_internal(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        let lhs_user = &lhs[..lhs.len() - 8];
        let rhs_user = &rhs[..rhs.len() - 8];
        match self.user_comparator.compare(lhs_user, rhs_user) {
            Ordering::Equal => {
                let lhs_tag = decode_fixed64(&lhs[lhs.len() - 8..]);
                let rhs_tag = decode_fixed64(&rhs[rhs.len() - 8..]);
                // Descending, so the newest sequence sorts first.
                rhs_tag.cmp(&lhs_tag)
            }
            ord => ord,
        }
    }
}

impl<C: UserComparator> KeyComparator for InternalKeyComparator<C> {
    fn compare(&self, lhs: *const u8, rhs: *const u8) -> Ordering {
        // Entries and seek keys share the length-prefixed encoding.
        let lhs = unsafe { entry_internal_key(lhs) };
        let rhs = unsafe { entry_internal_key(rhs) };
        self.compare_internal(lhs, rhs)
    }
}

///////////////////////////////////////////// LookupKey ////////////////////////////////////////////

/// A point-lookup target: one allocation holding the memtable seek key for
/// a user key at a snapshot sequence.
pub struct LookupKey {
    rep: Vec<u8>,
    key_offset: usize,
}

impl LookupKey {
    /// Build the seek key for `user_key` as of `sequence`.
    ///
    /// # Panics
    ///
    /// Will panic if `sequence` exceeds [MAX_SEQUENCE_NUMBER].
    pub fn new(user_key: &[u8], sequence: u64) -> Self {
        assert!(sequence <= MAX_SEQUENCE_NUMBER);
        let internal_key_len = user_key.len() + 8;
        let mut rep = Vec::with_capacity(5 + internal_key_len);
        put_varint32(&mut rep, internal_key_len as u32);
        let key_offset = rep.len();
        rep.extend_from_slice(user_key);
        let mut tag = [0u8; 8];
        encode_fixed64(&mut tag, pack_tag(sequence, VALUE_TYPE_FOR_SEEK));
        rep.extend_from_slice(&tag);
        Self { rep, key_offset }
    }

    /// The full seek key in memtable entry format.
    pub fn memtable_key(&self) -> &[u8] {
        &self.rep
    }

    /// The internal key: user key plus tag.
    pub fn internal_key(&self) -> &[u8] {
        &self.rep[self.key_offset..]
    }

    /// The user key alone.
    pub fn user_key(&self) -> &[u8] {
        &self.rep[self.key_offset..self.rep.len() - 8]
    }
}

////////////////////////////////////////////// MemTable ////////////////////////////////////////////

/// An ordered in-memory table of internal keys to values, backed by an
/// arena that frees everything at once when the table drops.
///
/// One writer may [MemTable::add] while any number of readers [MemTable::get]
/// and iterate; the engine serializes writers.  Share across threads with an
/// `Arc`, which is also the external reference count that keeps the table
/// alive until its contents reach an SST.
pub struct MemTable<C: UserComparator = BytewiseComparator> {
    arena: Mutex<Arena>,
    table: SkipList<InternalKeyComparator<C>>,
}

impl MemTable<BytewiseComparator> {
    /// Create a memtable ordered by plain byte comparison.
    pub fn new() -> Self {
        Self::with_comparator(BytewiseComparator)
    }
}

impl Default for MemTable<BytewiseComparator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: UserComparator> MemTable<C> {
    /// Create a memtable whose user keys are ordered by `user_comparator`.
    pub fn with_comparator(user_comparator: C) -> Self {
        Self {
            arena: Mutex::new(Arena::new()),
            table: SkipList::new(InternalKeyComparator::new(user_comparator)),
        }
    }

    /// Materialize one mutation.  The entry bytes are written into the arena
    /// and their address is published to the skip list, so readers that
    /// observe the entry observe it whole.
    ///
    /// # Panics
    ///
    /// Will panic if `sequence` exceeds [MAX_SEQUENCE_NUMBER] or if
    /// (`user_key`, `sequence`, `value_type`) duplicates an existing entry.
    pub fn add(&self, sequence: u64, value_type: ValueType, user_key: &[u8], value: &[u8]) {
        ADD.click();
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();
        let entry: *const u8 = {
            let mut arena = self.arena.lock().unwrap();
            let buf = arena.allocate(encoded_len);
            let mut p = encode_varint32(buf, internal_key_len as u32);
            buf[p..p + user_key.len()].copy_from_slice(user_key);
            p += user_key.len();
            encode_fixed64(&mut buf[p..], pack_tag(sequence, value_type));
            p += 8;
            p += encode_varint32(&mut buf[p..], value.len() as u32);
            buf[p..p + value.len()].copy_from_slice(value);
            debug_assert_eq!(encoded_len, p + value.len());
            buf.as_ptr()
        };
        self.table.insert(entry);
    }

    /// Point lookup.  Returns the newest value at or below the lookup key's
    /// snapshot, `None` with `is_tombstone` set if that newest entry is a
    /// deletion, or `None` with it clear if the user key is absent.  A set
    /// tombstone flag suppresses lower levels of the store.
    pub fn get(&self, key: &LookupKey, is_tombstone: &mut bool) -> Option<Vec<u8>> {
        GET.click();
        *is_tombstone = false;
        let mut iter = self.table.iter();
        iter.seek(key.memtable_key().as_ptr());
        if !iter.is_valid() {
            return None;
        }
        let entry = iter.key();
        let internal_key = unsafe { entry_internal_key(entry) };
        let user_key = &internal_key[..internal_key.len() - 8];
        let user_comparator = self.table.comparator().user_comparator();
        if user_comparator.compare(user_key, key.user_key()) != Ordering::Equal {
            return None;
        }
        // The seek already skipped every entry newer than the snapshot, so
        // the tag's sequence needs no re-check; only its type matters.
        let tag = decode_fixed64(&internal_key[internal_key.len() - 8..]);
        match (tag & 0xff) as u8 {
            TAG_VALUE => Some(unsafe { entry_value(entry) }.to_vec()),
            TAG_DELETION => {
                *is_tombstone = true;
                None
            }
            _ => unreachable!("entries are only written by add"),
        }
    }

    /// The arena's memory footprint.  Monotone while the table lives.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.lock().unwrap().memory_usage()
    }

    /// An iterator over the table in internal-key order.
    pub fn iter(&self) -> MemTableIterator<'_, C> {
        NEW_ITERATOR.click();
        MemTableIterator {
            iter: self.table.iter(),
            tmp: Vec::new(),
        }
    }
}

///////////////////////////////////////// MemTableIterator /////////////////////////////////////////

/// An iterator over a memtable.  Tolerates a concurrent writer.
pub struct MemTableIterator<'a, C: UserComparator> {
    iter: SkipListIterator<'a, InternalKeyComparator<C>>,
    tmp: Vec<u8>,
}

impl<C: UserComparator> MemTableIterator<'_, C> {
    /// Returns true if the iterator is positioned at an entry.
    pub fn is_valid(&self) -> bool {
        self.iter.is_valid()
    }

    /// Position at the first entry with internal key >= `internal_key`.
    pub fn seek(&mut self, internal_key: &[u8]) {
        SEEK.click();
        self.tmp.clear();
        put_varint32(&mut self.tmp, internal_key.len() as u32);
        self.tmp.extend_from_slice(internal_key);
        self.iter.seek(self.tmp.as_ptr());
    }

    /// Position before the first entry.  Call next to reach it.
    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    /// Position after the last entry.  Call prev to reach it.
    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Advance to the next entry in internal-key order.
    pub fn next(&mut self) {
        self.iter.next();
    }

    /// Retreat to the previous entry in internal-key order.
    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// The internal key of the current entry.
    ///
    /// # Panics
    ///
    /// Will panic if the iterator is not valid.
    pub fn key(&self) -> &[u8] {
        unsafe { entry_internal_key(self.iter.key()) }
    }

    /// The value of the current entry.
    ///
    /// # Panics
    ///
    /// Will panic if the iterator is not valid.
    pub fn value(&self) -> &[u8] {
        unsafe { entry_value(self.iter.key()) }
    }

    /// Iteration itself cannot fail; the surface exists so composed
    /// iterators can forward a status.
    pub fn status(&self) -> Result<(), Error> {
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////


#[cfg(test)]
mod concurrent {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use guacamole::{FromGuacamole, Guacamole};

    use super::super::unpack_tag;
    use super::*;

    fn reader(mem: Arc<MemTable>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            let mut iter = mem.iter();
            iter.seek_to_first();
            let mut prev: Option<(Vec<u8>, u64)> = None;
            while iter.is_valid() {
                let internal_key = iter.key();
                let user_key = internal_key[..internal_key.len() - 8].to_vec();
                let tag = decode_fixed64(&internal_key[internal_key.len() - 8..]);
                let (sequence, _) = unpack_tag(tag);
                if let Some((prev_key, prev_sequence)) = &prev {
                    assert!(
                        *prev_key < user_key
                            || (*prev_key == user_key && *prev_sequence > sequence)
                    );
                }
                prev = Some((user_key, sequence));
                iter.next();
            }
        }
    }

    fn writer(mem: Arc<MemTable>, seed: u64) {
        let mut guac = Guacamole::new(seed);
        for sequence in 1..=10_000u64 {
            let user_key = u64::from_guacamole(&mut (), &mut guac).to_be_bytes();
            let value = sequence.to_be_bytes();
            mem.add(sequence, ValueType::Value, &user_key, &value);
        }
    }

    fn guacamole(seed: u64) {
        let mem = Arc::new(MemTable::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let mem = Arc::clone(&mem);
            let shutdown = Arc::clone(&shutdown);
            readers.push(std::thread::spawn(move || reader(mem, shutdown)));
        }
        let writer_thread = {
            let mem = Arc::clone(&mem);
            std::thread::spawn(move || writer(mem, seed))
        };
        writer_thread.join().unwrap();
        shutdown.store(true, Ordering::Relaxed);
        for reader in readers.into_iter() {
            reader.join().unwrap();
        }
        // Every write is visible at a snapshot past the last sequence.
        let mut guac = Guacamole::new(seed);
        let mut is_tombstone = false;
        for _ in 1..=10_000u64 {
            let user_key = u64::from_guacamole(&mut (), &mut guac).to_be_bytes();
            let value = mem.get(
                &LookupKey::new(&user_key, MAX_SEQUENCE_NUMBER),
                &mut is_tombstone,
            );
            assert!(value.is_some());
            assert!(!is_tombstone);
        }
    }

    #[test]
    fn guacamole9513271800769470184() {
        guacamole(9513271800769470184)
    }

    #[test]
    fn guacamole14643071894946967273() {
        guacamole(14643071894946967273)
    }
}
