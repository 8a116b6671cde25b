//! Delivery guarantees of the receive queue.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use proptest::prelude::*;
use strandqueue::{Gap, Item, RxHandler, RxQueue, RxScheduler, SeqNo};

#[derive(Default)]
struct Log {
    processed: Vec<u64>,
    requests: Vec<(Gap, Gap)>,
    re_requests: Vec<Gap>,
}

struct Recorder(Rc<RefCell<Log>>);

impl RxHandler for Recorder {
    fn process(&mut self, item: Item) {
        self.0.borrow_mut().processed.push(item.seq_no().get());
    }
    fn request(&mut self, prev: Gap, now: Gap) {
        self.0.borrow_mut().requests.push((prev, now));
    }
    fn re_request(&mut self, now: Gap) {
        self.0.borrow_mut().re_requests.push(now);
    }
}

/// Records dequeue scheduling so tests can pump the queue by hand.
#[derive(Default)]
struct Pump {
    pending: RefCell<bool>,
}

impl RxScheduler for Pump {
    fn schedule_dequeue(&self) {
        *self.pending.borrow_mut() = true;
    }
    fn reschedule_dequeue(&self) {
        *self.pending.borrow_mut() = true;
    }
    fn idle_dequeue(&self) {
        *self.pending.borrow_mut() = false;
    }
    fn schedule_re_request(&self) {}
    fn reschedule_re_request(&self) {}
    fn cancel_re_request(&self) {}
}

type Rx = RxQueue<Recorder, Pump>;

fn rx(head: u64) -> (Rx, Rc<RefCell<Log>>) {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut rx = RxQueue::new(Recorder(log.clone()), Pump::default());
    rx.init(SeqNo(head));
    (rx, log)
}

fn push(rx: &mut Rx, seq: u64) {
    rx.enqueue(Item::received(3, SeqNo(seq), Bytes::from(format!("m{seq}"))));
}

/// Run scheduled dequeues until the queue goes idle.
fn pump(rx: &mut Rx) {
    while *rx.scheduler().pending.borrow() {
        rx.dequeue();
    }
}

// ---------------------------------------------------------------------------
// Gap detection
// ---------------------------------------------------------------------------

#[test]
fn single_gap_requested_once() {
    let (mut rx, log) = rx(1);
    for seq in [1, 2, 4, 5] {
        push(&mut rx, seq);
        pump(&mut rx);
    }
    assert_eq!(log.borrow().processed, vec![1, 2]);
    assert_eq!(
        log.borrow().requests,
        vec![(Gap::default(), Gap::new(SeqNo(3), SeqNo(4)))]
    );

    push(&mut rx, 3);
    pump(&mut rx);
    let log = log.borrow();
    assert_eq!(log.processed, vec![1, 2, 3, 4, 5]);
    assert_eq!(log.requests.len(), 1);
    assert!(rx.gap().is_empty());
}

#[test]
fn later_gap_reported_after_first_fills() {
    let (mut rx, log) = rx(1);
    for seq in [2, 5] {
        push(&mut rx, seq);
    }
    push(&mut rx, 1);
    pump(&mut rx);
    let requests = log.borrow().requests.clone();
    assert_eq!(
        requests,
        vec![
            (Gap::default(), Gap::new(SeqNo(1), SeqNo(2))),
            (Gap::default(), Gap::new(SeqNo(3), SeqNo(5))),
        ]
    );
}

#[test]
fn re_request_repeats_open_gap() {
    let (mut rx, log) = rx(10);
    push(&mut rx, 12);
    rx.re_request();
    rx.re_request();
    assert_eq!(
        log.borrow().re_requests,
        vec![Gap::new(SeqNo(10), SeqNo(12)); 2]
    );
    push(&mut rx, 10);
    push(&mut rx, 11);
    pump(&mut rx);
    rx.re_request();
    assert_eq!(log.borrow().re_requests.len(), 2);
}

// ---------------------------------------------------------------------------
// Duplicates and spans
// ---------------------------------------------------------------------------

#[test]
fn duplicates_never_reprocessed() {
    let (mut rx, log) = rx(1);
    for seq in [1, 2, 1, 3, 2, 3, 1] {
        push(&mut rx, seq);
        pump(&mut rx);
    }
    assert_eq!(log.borrow().processed, vec![1, 2, 3]);
}

#[test]
fn buffered_duplicate_kept_once() {
    let (mut rx, log) = rx(1);
    push(&mut rx, 3);
    push(&mut rx, 3);
    assert_eq!(rx.queue().count(), 1);
    push(&mut rx, 1);
    push(&mut rx, 2);
    pump(&mut rx);
    assert_eq!(log.borrow().processed, vec![1, 2, 3]);
}

#[test]
fn gap_fill_item_advances_head() {
    let (mut rx, log) = rx(1);
    push(&mut rx, 5);
    rx.enqueue(Item::gap_fill(SeqNo(1), 4));
    pump(&mut rx);
    assert_eq!(log.borrow().processed, vec![1, 5]);
    assert_eq!(rx.head(), SeqNo(6));
}

#[test]
fn straddling_item_is_rerequested() {
    let (mut rx, log) = rx(5);
    rx.enqueue(Item::received(3, SeqNo(4), Bytes::from_static(b"xx")).with_span(2));
    assert!(log.borrow().processed.is_empty());
    push(&mut rx, 7);
    assert_eq!(
        log.borrow().requests.last().map(|r| r.1),
        Some(Gap::new(SeqNo(5), SeqNo(7)))
    );
}

#[test]
fn straddling_last_arrival_is_requested() {
    let (mut rx, log) = rx(5);
    rx.enqueue(Item::received(3, SeqNo(4), Bytes::from_static(b"xxx")).with_span(3));
    assert!(rx.queue().is_empty());
    assert_eq!(rx.gap(), Gap::new(SeqNo(5), SeqNo(7)));
    assert_eq!(
        log.borrow().requests,
        vec![(Gap::default(), Gap::new(SeqNo(5), SeqNo(7)))]
    );
    rx.re_request();
    assert_eq!(log.borrow().re_requests, vec![Gap::new(SeqNo(5), SeqNo(7))]);
}

#[test]
fn short_duplicate_at_head_keeps_buffered_span() {
    let (mut rx, log) = rx(1);
    rx.enqueue(Item::received(3, SeqNo(2), Bytes::from_static(b"run")).with_span(3));
    push(&mut rx, 1);
    // Arrives while the dequeue of [2, 5) is still pending.
    push(&mut rx, 2);
    pump(&mut rx);
    assert_eq!(log.borrow().processed, vec![1, 2]);
    assert_eq!(rx.head(), SeqNo(5));
    assert!(rx.queue().is_empty());
    assert!(rx.gap().is_empty());
}

#[test]
fn init_accepts_any_starting_point() {
    let start = u64::MAX - 10;
    let (mut rx, log) = rx(start);
    assert_eq!(rx.head(), SeqNo(start));
    push(&mut rx, start);
    assert_eq!(log.borrow().processed, vec![start]);
    assert!(log.borrow().requests.is_empty());

    // Once started, init only moves forward.
    rx.init(SeqNo(start - 5));
    assert_eq!(rx.head(), SeqNo(start + 1));
}

#[test]
fn sequence_wraps_past_max() {
    let start = u64::MAX - 1;
    let (mut rx, log) = rx(start);
    for seq in [start + 1, 0, start, 1] {
        push(&mut rx, seq);
        pump(&mut rx);
    }
    assert_eq!(log.borrow().processed, vec![start, start + 1, 0, 1]);
}

// ---------------------------------------------------------------------------
// Order & completeness
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn any_permutation_delivers_in_order(
        base in 0u64..1_000_000,
        order in Just((0u64..40).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (mut rx, log) = rx(base);
        for offset in &order {
            push(&mut rx, base + offset);
            pump(&mut rx);
        }
        let expected: Vec<u64> = (0..40).map(|i| base + i).collect();
        prop_assert_eq!(&log.borrow().processed, &expected);
        prop_assert!(rx.queue().is_empty());
        prop_assert!(rx.gap().is_empty());
    }

    #[test]
    fn duplicated_arrivals_deliver_once(
        order in Just((1u64..=20).chain(1..=20).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (mut rx, log) = rx(1);
        for seq in &order {
            push(&mut rx, *seq);
            pump(&mut rx);
        }
        prop_assert_eq!(&log.borrow().processed, &(1..=20).collect::<Vec<_>>());
    }
}
