//! Priority queue with lazy deletion
//!
//! Uses std::collections::BinaryHeap with a HashMap live-set for O(1)
//! membership. Supports remove() and move_key() via the lazy deletion
//! pattern, plus a reversible traversal direction for negative-speed
//! position queues.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Key for the heap.
/// Uses (rank, tie, id) for deterministic ordering; `rank` is the entry
/// key negated when the queue is reversed, so the heap always pops the
/// next entry in traversal order.
#[derive(Clone, Debug)]
struct Key {
    rank: f64,
    tie: u64,
    id: u64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.rank.to_bits() == other.rank.to_bits() && self.tie == other.tie && self.id == other.id
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so the ordering is reversed for min-heap
// behavior. total_cmp gives deterministic float ordering (-0, NaN, etc.);
// the tie counter gives FIFO order among equal keys.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank.total_cmp(&other.rank) {
            Ordering::Equal => match self.tie.cmp(&other.tie) {
                Ordering::Equal => self.id.cmp(&other.id),
                o => o,
            },
            o => o,
        }
        .reverse()
    }
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    key: f64,
    tie: u64,
}

/// An ordered map from entry id to a numeric key (a time or a logical
/// position), with cheap access to the head entry in traversal order.
///
/// All operations are total over the (possibly empty) queue: removing an
/// absent id is a no-op, and inserting with a non-finite key removes the
/// entry instead ("not scheduled" sentinel). Every mutation returns the
/// new head key — the caller's next wake value — or `f64::INFINITY` when
/// the queue is empty.
pub struct PriorityQueue {
    heap: BinaryHeap<Key>,
    live: HashMap<u64, Entry>,
    reversed: bool,
    next_tie: u64,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            reversed: false,
            next_tie: 0,
        }
    }

    fn rank(&self, key: f64) -> f64 {
        if self.reversed {
            -key
        } else {
            key
        }
    }

    fn push(&mut self, id: u64, key: f64) {
        let tie = self.next_tie;
        self.next_tie += 1;
        self.live.insert(id, Entry { key, tie });
        self.heap.push(Key {
            rank: self.rank(key),
            tie,
            id,
        });
    }

    /// Insert or reposition an entry. A non-finite key removes it instead.
    /// Returns the new head key.
    pub fn insert(&mut self, id: u64, key: f64) -> f64 {
        if !key.is_finite() {
            return self.remove(id);
        }
        self.push(id, key);
        self.time()
    }

    /// Reposition an existing entry (or insert an absent one) if `key` is
    /// finite; remove it otherwise. Returns the new head key.
    pub fn move_key(&mut self, id: u64, key: f64) -> f64 {
        self.insert(id, key)
    }

    /// Remove an entry by id (no-op when absent). Returns the new head key.
    pub fn remove(&mut self, id: u64) -> f64 {
        self.live.remove(&id);
        self.time()
    }

    /// Empty the queue. Returns `f64::INFINITY`.
    pub fn clear(&mut self) -> f64 {
        self.heap.clear();
        self.live.clear();
        f64::INFINITY
    }

    /// Id of the head entry in traversal order, if any.
    pub fn head(&mut self) -> Option<u64> {
        self.clean_top();
        self.heap.peek().map(|k| k.id)
    }

    /// Key of the head entry, or `f64::INFINITY` when empty.
    pub fn time(&mut self) -> f64 {
        self.clean_top();
        match self.heap.peek() {
            Some(k) => self.live[&k.id].key,
            None => f64::INFINITY,
        }
    }

    /// Pop the head entry. Returns (id, key).
    pub fn pop_head(&mut self) -> Option<(u64, f64)> {
        loop {
            let k = self.heap.pop()?;
            match self.live.get(&k.id) {
                Some(e) if e.tie == k.tie => {
                    let e = self.live.remove(&k.id).unwrap();
                    return Some((k.id, e.key));
                }
                _ => continue, // stale entry
            }
        }
    }

    /// Set the traversal direction. Reversed traversal visits the largest
    /// key first (negative-speed position queues). Flipping the flag
    /// rebuilds the heap immediately so ordering is never stale.
    pub fn reverse(&mut self, reversed: bool) {
        if reversed == self.reversed {
            return;
        }
        self.reversed = reversed;
        let entries: Vec<Key> = self
            .live
            .iter()
            .map(|(&id, e)| Key {
                rank: if reversed { -e.key } else { e.key },
                tie: e.tie,
                id,
            })
            .collect();
        self.heap = BinaryHeap::from(entries);
    }

    /// Current traversal direction.
    pub fn reversed(&self) -> bool {
        self.reversed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.live.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Remove stale entries from the top of the heap.
    fn clean_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            let ok = match self.live.get(&k.id) {
                Some(e) => e.tie == k.tie,
                None => false,
            };
            if ok {
                break;
            }
            self.heap.pop();
        }
    }
}
