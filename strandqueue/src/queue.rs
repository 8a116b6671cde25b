//! Ordered sequence queue.
//!
//! `SeqQueue` keeps items keyed by sequence number in a `BTreeMap`, tracking
//! a head (next number to deliver) and a tail (one past the highest number
//! seen). Arrivals that overlap queued items are resolved on insert, so the
//! map never holds two items covering the same number.

use std::collections::BTreeMap;

use crate::seq::{Gap, SeqNo};

/// An element of a [`SeqQueue`]: anything occupying a run of sequence numbers.
pub trait Sequenced {
    /// First sequence number covered.
    fn key(&self) -> SeqNo;

    /// Number of sequence numbers covered. Zero-span items only advance tail.
    fn span(&self) -> u64;

    /// Drop the first `n` numbers; returns the remaining span (0 discards the item).
    fn clip_head(&mut self, n: u64) -> u64;

    /// Drop the last `n` numbers; returns the remaining span (0 discards the item).
    fn clip_tail(&mut self, n: u64) -> u64;

    /// Merge a newer arrival that this item completely covers.
    fn write(&mut self, _newer: &Self) {}

    /// Payload size, for statistics.
    fn bytes(&self) -> usize {
        0
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub in_count: u64,
    pub in_bytes: u64,
    pub out_count: u64,
    pub out_bytes: u64,
}

impl QueueStats {
    fn count_in(&mut self, bytes: usize) {
        self.in_count += 1;
        self.in_bytes += bytes as u64;
    }

    fn count_out(&mut self, bytes: usize) {
        self.out_count += 1;
        self.out_bytes += bytes as u64;
    }
}

/// Items ordered by sequence number, with no two covering the same number.
pub struct SeqQueue<T> {
    /// Next sequence number to deliver.
    head: SeqNo,
    /// One past the highest sequence number seen.
    tail: SeqNo,
    items: BTreeMap<SeqNo, T>,
    /// Total span of queued items.
    length: u64,
    stats: QueueStats,
}

impl<T: Sequenced> SeqQueue<T> {
    pub fn new(head: SeqNo) -> Self {
        Self {
            head,
            tail: head,
            items: BTreeMap::new(),
            length: 0,
            stats: QueueStats::default(),
        }
    }

    pub fn head(&self) -> SeqNo {
        self.head
    }

    /// One past the highest sequence number ever enqueued.
    pub fn tail(&self) -> SeqNo {
        self.tail
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Total span of queued items.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Discard everything and restart at `head`.
    pub fn reset(&mut self, head: SeqNo) {
        self.clear();
        self.head = head;
        self.tail = head;
    }

    /// Give up on everything outstanding: head jumps to tail.
    pub fn skip(&mut self) {
        self.clear();
        self.head = self.tail;
    }

    /// Move head to `key`. Moving backwards resets the queue.
    pub fn set_head(&mut self, key: SeqNo) {
        if key == self.head {
            return;
        }
        if key < self.head {
            self.reset(key);
            return;
        }
        self.clip_below(key);
        self.head = key;
        if key > self.tail {
            self.tail = key;
        }
    }

    /// Account for an item that was delivered without being queued.
    pub fn bypass(&mut self, bytes: usize) {
        self.stats.count_in(bytes);
        self.stats.count_out(bytes);
    }

    /// Return the item straight back if it is the next one due, advancing
    /// head past it; otherwise queue it.
    pub fn rotate(&mut self, item: T) -> Option<T> {
        self.insert(item, true)
    }

    pub fn enqueue(&mut self, item: T) {
        self.insert(item, false);
    }

    /// Put an item back below head, e.g. one replayed from an archive.
    pub fn unshift(&mut self, mut item: T) {
        let key = item.key();
        if key >= self.head {
            return;
        }
        let mut span = item.span();
        let end = key + span;
        if end > self.head {
            span = item.clip_tail(end - self.head);
            if span == 0 {
                return;
            }
        }
        self.items.insert(key, item);
        self.length += span;
        self.head = key;
    }

    /// Pop the head item if it is contiguous with head.
    pub fn dequeue(&mut self) -> Option<T> {
        let entry = self.items.first_entry()?;
        if *entry.key() != self.head {
            return None;
        }
        let item = entry.remove();
        Some(self.released(item))
    }

    pub fn dequeue_before(&mut self, key: SeqNo) -> Option<T> {
        if self.head >= key {
            return None;
        }
        self.dequeue()
    }

    /// Pop the lowest item, skipping any gap before it.
    pub fn shift(&mut self) -> Option<T> {
        let (_, item) = self.items.pop_first()?;
        Some(self.released(item))
    }

    pub fn shift_before(&mut self, key: SeqNo) -> Option<T> {
        if self.head >= key {
            return None;
        }
        let first = *self.items.keys().next()?;
        if first >= key {
            return None;
        }
        self.shift()
    }

    /// Remove the item keyed exactly at `key`.
    pub fn abort(&mut self, key: SeqNo) -> Option<T> {
        let item = self.items.remove(&key)?;
        self.length -= item.span();
        Some(item)
    }

    /// The item covering `key`, if any.
    pub fn find(&self, key: SeqNo) -> Option<&T> {
        let (&k, item) = self.items.range(..=key).next_back()?;
        if k + item.span() > key {
            Some(item)
        } else {
            None
        }
    }

    /// The first run of missing numbers at or after head.
    pub fn gap(&self) -> Gap {
        let mut covered = self.head;
        for (&key, item) in &self.items {
            if key > covered {
                return Gap::new(covered, key);
            }
            let end = key + item.span();
            if end > covered {
                covered = end;
            }
        }
        Gap::new(covered, self.tail)
    }

    fn released(&mut self, item: T) -> T {
        let span = item.span();
        self.length -= span;
        self.head = item.key() + span;
        self.stats.count_out(item.bytes());
        item
    }

    fn clear(&mut self) {
        self.items.clear();
        self.length = 0;
    }

    fn extend_tail(&mut self, end: SeqNo) {
        if end > self.tail {
            self.tail = end;
        }
    }

    /// Clip or drop queued items that start below `key`.
    fn clip_below(&mut self, key: SeqNo) {
        while let Some((k, mut item)) = self.items.pop_first() {
            if k >= key {
                self.items.insert(k, item);
                return;
            }
            let span = item.span();
            self.length -= span;
            if k + span > key {
                let left = item.clip_head(key - k);
                if left > 0 {
                    self.length += left;
                    self.items.insert(item.key(), item);
                }
                return;
            }
        }
    }

    fn insert(&mut self, mut item: T, rotate: bool) -> Option<T> {
        let mut key = item.key();
        let mut span = item.span();
        let end = key + span;

        if end <= self.head {
            return None;
        }
        if key < self.head {
            span = item.clip_head(self.head - key);
            key = end - span;
        }
        if span == 0 {
            self.extend_tail(end);
            return None;
        }

        let bytes = item.bytes();
        if key == self.head {
            // A queued item at head that covers the arrival absorbs it.
            if let Some(queued) = self.items.get_mut(&key) {
                if key + queued.span() >= end {
                    queued.write(&item);
                    self.stats.count_in(bytes);
                    return if rotate { self.dequeue() } else { None };
                }
            }
            self.clip_below(end);
            if rotate {
                self.head = end;
                self.extend_tail(end);
                self.stats.count_in(bytes);
                self.stats.count_out(bytes);
                return Some(item);
            }
            self.items.insert(key, item);
            self.length += span;
            self.extend_tail(end);
            self.stats.count_in(bytes);
            return None;
        }

        self.stats.count_in(bytes);

        // An item already queued at or before `key` that covers the arrival absorbs it.
        let mut trim_prev = None;
        if let Some((&prev_key, prev)) = self.items.range_mut(..=key).next_back() {
            let prev_end = prev_key + prev.span();
            if prev_end >= end {
                prev.write(&item);
                return None;
            }
            if prev_key < key && prev_end > key {
                trim_prev = Some((prev_key, prev_end));
            }
        }
        if let Some((prev_key, prev_end)) = trim_prev {
            self.trim_tail(prev_key, prev_end - key);
        }

        // Queued items the arrival covers are superseded.
        while let Some((&next_key, next)) = self.items.range_mut(key..).next() {
            if next_key >= end {
                break;
            }
            let next_span = next.span();
            if next_key + next_span > end {
                self.trim_head(next_key, end - next_key);
                break;
            }
            self.items.remove(&next_key);
            self.length -= next_span;
        }

        self.items.insert(key, item);
        self.length += span;
        self.extend_tail(end);
        None
    }

    fn trim_tail(&mut self, key: SeqNo, n: u64) {
        let Some(item) = self.items.get_mut(&key) else {
            return;
        };
        let span = item.span();
        let left = item.clip_tail(n);
        self.length -= span - left;
        if left == 0 {
            self.items.remove(&key);
        }
    }

    fn trim_head(&mut self, key: SeqNo, n: u64) {
        let Some(mut item) = self.items.remove(&key) else {
            return;
        };
        let span = item.span();
        let left = item.clip_head(n);
        self.length -= span - left;
        if left > 0 {
            self.items.insert(item.key(), item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A divisible run of sequence numbers, to exercise clipping.
    #[derive(Debug, Clone, PartialEq)]
    struct Run {
        key: u64,
        span: u64,
        tag: u32,
    }

    fn run(key: u64, span: u64, tag: u32) -> Run {
        Run { key, span, tag }
    }

    impl Sequenced for Run {
        fn key(&self) -> SeqNo {
            SeqNo(self.key)
        }

        fn span(&self) -> u64 {
            self.span
        }

        fn clip_head(&mut self, n: u64) -> u64 {
            let n = n.min(self.span);
            self.key += n;
            self.span -= n;
            self.span
        }

        fn clip_tail(&mut self, n: u64) -> u64 {
            self.span -= n.min(self.span);
            self.span
        }

        fn write(&mut self, newer: &Self) {
            self.tag = newer.tag;
        }

        fn bytes(&self) -> usize {
            self.span as usize
        }
    }

    fn keys(q: &SeqQueue<Run>) -> Vec<(u64, u64)> {
        q.iter().map(|r| (r.key, r.span)).collect()
    }

    #[test]
    fn rotate_in_order() {
        let mut q = SeqQueue::new(SeqNo(1));
        assert_eq!(q.rotate(run(1, 1, 0)), Some(run(1, 1, 0)));
        assert_eq!(q.head(), SeqNo(2));
        assert!(q.rotate(run(3, 1, 0)).is_none());
        assert_eq!(q.count(), 1);
        assert_eq!(q.rotate(run(2, 1, 0)), Some(run(2, 1, 0)));
        assert_eq!(q.dequeue(), Some(run(3, 1, 0)));
        assert_eq!(q.head(), SeqNo(4));
        assert!(q.is_empty());
    }

    #[test]
    fn duplicates_below_head_dropped() {
        let mut q = SeqQueue::new(SeqNo(10));
        assert!(q.rotate(run(5, 3, 0)).is_none());
        assert!(q.is_empty());
        assert_eq!(q.stats().in_count, 0);
    }

    #[test]
    fn straddling_head_is_clipped() {
        let mut q = SeqQueue::new(SeqNo(10));
        let item = q.rotate(run(8, 4, 0)).unwrap();
        assert_eq!((item.key, item.span), (10, 2));
        assert_eq!(q.head(), SeqNo(12));
    }

    #[test]
    fn zero_span_only_advances_tail() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(5, 0, 0));
        assert!(q.is_empty());
        assert_eq!(q.tail(), SeqNo(5));
        assert_eq!(q.gap(), Gap::new(SeqNo(1), SeqNo(5)));
    }

    #[test]
    fn covered_arrival_is_written_into_existing() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(5, 4, 1));
        q.enqueue(run(6, 2, 2));
        assert_eq!(keys(&q), vec![(5, 4)]);
        assert_eq!(q.iter().next().unwrap().tag, 2);
        assert_eq!(q.length(), 4);
    }

    #[test]
    fn arrival_supersedes_and_clips_neighbours() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(3, 3, 0)); // [3,6)
        q.enqueue(run(7, 1, 0)); // [7,8)
        q.enqueue(run(9, 3, 0)); // [9,12)
        q.enqueue(run(5, 5, 1)); // [5,10)
        assert_eq!(keys(&q), vec![(3, 2), (5, 5), (10, 2)]);
        assert_eq!(q.length(), 9);
        assert_eq!(q.tail(), SeqNo(12));
    }

    #[test]
    fn head_arrival_clips_queued_overlap() {
        let mut q = SeqQueue::new(SeqNo(14));
        q.enqueue(run(15, 1, 0));
        assert_eq!(q.gap(), Gap::with_len(SeqNo(14), 1));
        q.enqueue(run(14, 3, 1));
        assert_eq!(keys(&q), vec![(14, 3)]);
        assert_eq!(q.gap(), Gap::default());
    }

    #[test]
    fn head_arrival_covered_by_queued_item_is_absorbed() {
        let mut q = SeqQueue::new(SeqNo(2));
        q.enqueue(run(2, 3, 0)); // [2,5)
        q.enqueue(run(2, 1, 1));
        assert_eq!(keys(&q), vec![(2, 3)]);
        assert_eq!(q.iter().next().map(|r| r.tag), Some(1));

        let out = q.rotate(run(2, 2, 2)).unwrap();
        assert_eq!((out.key, out.span, out.tag), (2, 3, 2));
        assert_eq!(q.head(), SeqNo(5));
        assert!(q.is_empty());
    }

    #[test]
    fn gap_reports_first_hole_then_trailing() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(2, 1, 0));
        q.enqueue(run(5, 1, 0));
        assert_eq!(q.gap(), Gap::new(SeqNo(1), SeqNo(2)));
        q.enqueue(run(1, 1, 0));
        assert_eq!(q.gap(), Gap::new(SeqNo(3), SeqNo(5)));
    }

    #[test]
    fn find_returns_covering_item() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(4, 3, 0));
        assert_eq!(q.find(SeqNo(5)).map(|r| r.key), Some(4));
        assert!(q.find(SeqNo(7)).is_none());
        assert!(q.find(SeqNo(3)).is_none());
    }

    #[test]
    fn shift_ignores_gaps_and_abort_removes() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(3, 1, 0));
        q.enqueue(run(4, 1, 0));
        assert!(q.dequeue().is_none());
        assert_eq!(q.abort(SeqNo(4)).map(|r| r.key), Some(4));
        assert!(q.shift_before(SeqNo(3)).is_none());
        assert_eq!(q.shift().map(|r| r.key), Some(3));
        assert_eq!(q.head(), SeqNo(4));
        assert_eq!(q.length(), 0);
    }

    #[test]
    fn set_head_forward_clips_backward_resets() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(2, 4, 0)); // [2,6)
        q.enqueue(run(8, 1, 0));
        q.set_head(SeqNo(4));
        assert_eq!(keys(&q), vec![(4, 2), (8, 1)]);
        q.set_head(SeqNo(2));
        assert!(q.is_empty());
        assert_eq!(q.tail(), SeqNo(2));
    }

    #[test]
    fn unshift_replays_below_head() {
        let mut q = SeqQueue::new(SeqNo(10));
        q.unshift(run(8, 2, 0));
        assert_eq!(q.head(), SeqNo(8));
        assert_eq!(q.dequeue().map(|r| r.key), Some(8));
        assert_eq!(q.head(), SeqNo(10));
        q.unshift(run(12, 1, 0));
        assert!(q.is_empty());
    }

    #[test]
    fn skip_and_stats() {
        let mut q = SeqQueue::new(SeqNo(1));
        q.enqueue(run(3, 2, 0));
        q.bypass(7);
        q.skip();
        assert_eq!(q.head(), SeqNo(5));
        let stats = q.stats();
        assert_eq!(stats.in_count, 2);
        assert_eq!(stats.in_bytes, 9);
        assert_eq!(stats.out_bytes, 7);
    }
}
