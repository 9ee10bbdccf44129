//! A lock-free skip list over raw entry pointers.
//!
//! The memtable stores entries as arena-resident byte strings and inserts
//! only their addresses here; an injected [KeyComparator] decodes enough of
//! each entry to order them.  One writer may insert while any number of
//! readers traverse: nodes are fully initialized before they are published
//! with a release store, and traversal uses acquire loads, so a reader that
//! observes a node observes the complete entry bytes behind it.

use std::cmp::Ordering;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};

use rand::Rng;

const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/////////////////////////////////////////// KeyComparator //////////////////////////////////////////

/// A total order over the entries two raw pointers address.
pub trait KeyComparator {
    /// Compare the entries at `lhs` and `rhs`.
    fn compare(&self, lhs: *const u8, rhs: *const u8) -> Ordering;
}

/////////////////////////////////////////////// Node ///////////////////////////////////////////////

struct Node {
    key: *const u8,
    pointers: Vec<AtomicPtr<Node>>,
}

impl Node {
    fn alloc(key: *const u8, height: usize) -> *mut Node {
        assert!(height > 0);
        assert!(height <= MAX_HEIGHT);
        let mut pointers = Vec::with_capacity(height);
        for _ in 0..height {
            pointers.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Box::leak(Box::new(Node { key, pointers }))
    }
}

fn key(ptr: *mut Node) -> *const u8 {
    unsafe { (*ptr).key }
}

fn get_next(ptr: *mut Node, level: usize) -> *mut Node {
    unsafe { (&(*ptr).pointers)[level].load(Acquire) }
}

fn set_next(ptr: *mut Node, level: usize, next: *mut Node) {
    unsafe { (&(*ptr).pointers)[level].store(next, Release) }
}

fn cas_next(ptr: *mut Node, level: usize, old_node: *mut Node, new_node: *mut Node) -> bool {
    unsafe {
        (&(*ptr).pointers)[level].compare_exchange(old_node, new_node, SeqCst, SeqCst) == Ok(old_node)
    }
}

///////////////////////////////////////////// SkipList /////////////////////////////////////////////

/// A lock-free skip list whose keys are raw entry pointers ordered by an
/// injected comparator.
pub struct SkipList<C: KeyComparator> {
    head: *mut Node,
    comparator: C,
}

// SAFETY: nodes are only ever appended, they are published with release
// stores and read with acquire loads, and the entry bytes behind each key
// pointer are immutable for the life of whoever owns them (the memtable's
// arena).  The list itself frees only nodes, never entries.
unsafe impl<C: KeyComparator + Send> Send for SkipList<C> {}
unsafe impl<C: KeyComparator + Sync> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    /// Create an empty skip list ordered by `comparator`.
    pub fn new(comparator: C) -> Self {
        // The head is a sentinel; its key is never compared.
        let head = Node::alloc(std::ptr::null(), MAX_HEIGHT);
        Self { head, comparator }
    }

    /// The comparator the list orders by.
    pub fn comparator(&self) -> &C {
        &self.comparator
    }

    /// Insert `key` into the skip list.
    ///
    /// # Panics
    ///
    /// Will panic if an equal key is already present.
    pub fn insert(&self, key_ptr: *const u8) {
        let (existing, mut prev, mut obs) = self.find_greater_or_equal_and_pointers(key_ptr);
        assert!(
            existing.is_null()
                || self.comparator.compare(key(existing), key_ptr) != Ordering::Equal
        );
        let height = Self::random_height();
        let x = Node::alloc(key_ptr, height);
        for idx in 0..height {
            'lockfree_looping: loop {
                set_next(x, idx, obs[idx]);
                if cas_next(prev[idx], idx, obs[idx], x) {
                    break 'lockfree_looping;
                }
                'advancing: loop {
                    let next = get_next(prev[idx], idx);
                    if self.key_is_after_node(key_ptr, next) {
                        prev[idx] = next;
                    } else {
                        obs[idx] = next;
                        break 'advancing;
                    }
                }
            }
        }
    }

    /// True iff the skip list contains an entry equal to `key_ptr`.
    pub fn contains(&self, key_ptr: *const u8) -> bool {
        let x = self.find_greater_or_equal(key_ptr);
        !x.is_null() && self.comparator.compare(key(x), key_ptr) == Ordering::Equal
    }

    /// Return an iterator positioned before the first entry.
    pub fn iter(&self) -> SkipListIterator<'_, C> {
        SkipListIterator {
            list: self,
            node: std::ptr::null_mut(),
        }
    }

    fn random_height() -> usize {
        let mut height = 1usize;
        let mut rng = rand::thread_rng();
        while height < MAX_HEIGHT && rng.gen::<u32>() % BRANCHING == 0 {
            height += 1;
        }
        height
    }

    fn key_is_after_node(&self, key_ptr: *const u8, node: *mut Node) -> bool {
        !node.is_null() && self.comparator.compare(key(node), key_ptr) == Ordering::Less
    }

    fn find_greater_or_equal(&self, key_ptr: *const u8) -> *mut Node {
        let mut x = self.head;
        let mut level = MAX_HEIGHT - 1;
        loop {
            let next = get_next(x, level);
            if self.key_is_after_node(key_ptr, next) {
                x = next;
            } else if level == 0 {
                return next;
            } else {
                level -= 1;
            }
        }
    }

    // NOTE: a 3-tuple to destructure, not a struct; insert consumes it once.
    #[allow(clippy::type_complexity)]
    fn find_greater_or_equal_and_pointers(
        &self,
        key_ptr: *const u8,
    ) -> (*mut Node, Vec<*mut Node>, Vec<*mut Node>) {
        let mut x = self.head;
        let mut level = MAX_HEIGHT - 1;
        let mut prev = vec![std::ptr::null_mut(); MAX_HEIGHT];
        let mut obs = vec![std::ptr::null_mut(); MAX_HEIGHT];
        let found = loop {
            let next = get_next(x, level);
            if self.key_is_after_node(key_ptr, next) {
                x = next;
            } else {
                prev[level] = x;
                obs[level] = next;
                if level == 0 {
                    break next;
                } else {
                    level -= 1;
                }
            }
        };
        (found, prev, obs)
    }

    fn find_less_than(&self, key_ptr: *const u8) -> *mut Node {
        let mut x = self.head;
        let mut level = MAX_HEIGHT - 1;
        loop {
            debug_assert!(
                std::ptr::eq(x, self.head)
                    || self.comparator.compare(key(x), key_ptr) == Ordering::Less
            );
            let next = get_next(x, level);
            if next.is_null() || self.comparator.compare(key(next), key_ptr) != Ordering::Less {
                if level == 0 {
                    return x;
                } else {
                    level -= 1;
                }
            } else {
                x = next;
            }
        }
    }

    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = MAX_HEIGHT - 1;
        loop {
            let next = get_next(x, level);
            if next.is_null() {
                if level == 0 {
                    return x;
                } else {
                    level -= 1;
                }
            } else {
                x = next;
            }
        }
    }
}

impl<C: KeyComparator> Drop for SkipList<C> {
    fn drop(&mut self) {
        let mut ptr = self.head;
        while !ptr.is_null() {
            let to_drop = ptr;
            ptr = unsafe { (&(*ptr).pointers)[0].load(Relaxed) };
            drop(unsafe { Box::from_raw(to_drop) });
        }
    }
}

///////////////////////////////////////// SkipListIterator /////////////////////////////////////////

/// An iterator over a skip list.  Tolerates concurrent inserts.
pub struct SkipListIterator<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<C: KeyComparator> SkipListIterator<'_, C> {
    /// Returns true if the iterator is positioned at an entry.
    pub fn is_valid(&self) -> bool {
        !self.node.is_null() && !std::ptr::eq(self.node, self.list.head)
    }

    /// The entry the iterator is positioned at.
    ///
    /// # Panics
    ///
    /// Will panic if the iterator is not valid.
    pub fn key(&self) -> *const u8 {
        assert!(self.is_valid());
        key(self.node)
    }

    /// Advance to the next greater entry.
    pub fn next(&mut self) {
        if !self.node.is_null() {
            self.node = get_next(self.node, 0);
        }
    }

    /// Retreat to the next smaller entry.
    pub fn prev(&mut self) {
        if self.node.is_null() {
            self.node = self.list.find_last();
        } else if !std::ptr::eq(self.node, self.list.head) {
            self.node = self.list.find_less_than(key(self.node));
        }
    }

    /// Position at the first entry greater than or equal to `key_ptr`.
    pub fn seek(&mut self, key_ptr: *const u8) {
        self.node = self.list.find_greater_or_equal(key_ptr);
    }

    /// Position before the first entry.  Call next to reach it.
    pub fn seek_to_first(&mut self) {
        self.node = get_next(self.list.head, 0);
    }

    /// Position after the last entry.  Call prev to reach it.
    pub fn seek_to_last(&mut self) {
        self.node = std::ptr::null_mut();
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
