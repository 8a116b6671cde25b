//! Receive-side reordering queue.
//!
//! `RxQueue` accepts items in any order and hands them to its handler in
//! strict sequence order, exactly once. Items arriving ahead of head are
//! buffered; the first missing range is reported once when discovered and
//! then periodically via the re-request timer until it is filled.
//!
//! The queue never blocks or spawns. Deferred work is requested through an
//! [`RxScheduler`], which later calls back into [`RxQueue::dequeue`] or
//! [`RxQueue::re_request`].

use std::fmt;
use std::sync::Arc;

use crate::item::Item;
use crate::queue::SeqQueue;
use crate::seq::{Gap, SeqNo};

/// Application callbacks for the receive path.
pub trait RxHandler {
    /// Deliver the next in-order item.
    fn process(&mut self, item: Item);

    /// A new gap was detected; `prev` is the previously outstanding gap.
    fn request(&mut self, prev: Gap, now: Gap);

    /// The outstanding gap is still open after the re-request interval.
    fn re_request(&mut self, now: Gap);
}

/// Deferred-work hooks. Fire-and-forget; implementations must not call back
/// into the queue synchronously.
pub trait RxScheduler {
    fn schedule_dequeue(&self);
    fn reschedule_dequeue(&self);
    fn idle_dequeue(&self);
    fn schedule_re_request(&self);
    fn reschedule_re_request(&self);
    fn cancel_re_request(&self);
}

impl<T: RxScheduler + ?Sized> RxScheduler for Arc<T> {
    fn schedule_dequeue(&self) {
        (**self).schedule_dequeue()
    }
    fn reschedule_dequeue(&self) {
        (**self).reschedule_dequeue()
    }
    fn idle_dequeue(&self) {
        (**self).idle_dequeue()
    }
    fn schedule_re_request(&self) {
        (**self).schedule_re_request()
    }
    fn reschedule_re_request(&self) {
        (**self).reschedule_re_request()
    }
    fn cancel_re_request(&self) {
        (**self).cancel_re_request()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxFlags(pub u8);

impl RxFlags {
    pub const NONE: Self = Self(0x00);
    /// Buffering everything while a snapshot is recovered.
    pub const QUEUING: Self = Self(0x01);
    /// A dequeue pass is scheduled or running.
    pub const DEQUEUING: Self = Self(0x02);

    pub fn contains(self, flag: RxFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn intersects(self, flag: RxFlags) -> bool {
        (self.0 & flag.0) != 0
    }

    pub fn insert(&mut self, flag: RxFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: RxFlags) {
        self.0 &= !flag.0;
    }
}

impl fmt::Display for RxFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [(Self::QUEUING, "Queuing"), (Self::DEQUEUING, "Dequeuing")];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Reorders received items and delivers them to `H` exactly once, in order.
pub struct RxQueue<H, S> {
    /// Items received ahead of head, keyed by sequence number.
    queue: SeqQueue<Item>,
    /// Outstanding missing range; empty when nothing has been requested.
    gap: Gap,
    flags: RxFlags,
    /// Set by the first `init`, `reset` or arrival.
    started: bool,
    handler: H,
    scheduler: S,
}

impl<H: RxHandler, S: RxScheduler> RxQueue<H, S> {
    pub fn new(handler: H, scheduler: S) -> Self {
        Self {
            queue: SeqQueue::new(SeqNo::default()),
            gap: Gap::default(),
            flags: RxFlags::NONE,
            started: false,
            handler,
            scheduler,
        }
    }

    /// Establish the next expected sequence number. The first call sets head
    /// outright; later calls only move it forward.
    pub fn init(&mut self, seq_no: SeqNo) {
        if !self.started {
            self.started = true;
            self.queue.reset(seq_no);
            return;
        }
        if seq_no > self.queue.head() {
            self.queue.set_head(seq_no);
            self.settle_gap();
        }
    }

    /// Drop all receive state and expect `seq_no` next.
    pub fn reset(&mut self, seq_no: SeqNo) {
        self.scheduler.cancel_re_request();
        self.flags = RxFlags::NONE;
        self.gap = Gap::default();
        self.started = true;
        self.queue.reset(seq_no);
    }

    /// Buffer every arrival until [`stop_queuing`](Self::stop_queuing).
    pub fn start_queuing(&mut self) {
        self.flags.insert(RxFlags::QUEUING);
    }

    /// Resume delivery from `seq_no`, draining anything buffered past it.
    pub fn stop_queuing(&mut self, seq_no: SeqNo) {
        self.flags.remove(RxFlags::QUEUING);
        self.queue.set_head(seq_no);
        self.settle_gap();
        if !self.flags.contains(RxFlags::DEQUEUING) && !self.queue.is_empty() {
            self.flags.insert(RxFlags::DEQUEUING);
            self.scheduler.schedule_dequeue();
        }
    }

    /// Accept a received item.
    pub fn enqueue(&mut self, item: Item) {
        self.started = true;
        if self
            .flags
            .intersects(RxFlags(RxFlags::QUEUING.0 | RxFlags::DEQUEUING.0))
        {
            self.queue.enqueue(item);
            return;
        }
        match self.queue.rotate(item) {
            Some(item) => {
                let more = !self.queue.is_empty();
                if more {
                    self.flags.insert(RxFlags::DEQUEUING);
                }
                self.settle_gap();
                self.handler.process(item);
                if more {
                    self.scheduler.schedule_dequeue();
                }
            }
            None => self.stalled(),
        }
    }

    /// Deliver the next buffered item, if contiguous. Called by the scheduler.
    pub fn dequeue(&mut self) {
        let Some(item) = self.queue.dequeue() else {
            self.flags.remove(RxFlags::DEQUEUING);
            self.stalled();
            self.scheduler.idle_dequeue();
            return;
        };
        let more = !self.queue.is_empty();
        if !more {
            self.flags.remove(RxFlags::DEQUEUING);
        }
        self.settle_gap();
        self.handler.process(item);
        if more {
            self.scheduler.reschedule_dequeue();
        } else {
            self.scheduler.idle_dequeue();
        }
    }

    /// Re-request timer expiry.
    pub fn re_request(&mut self) {
        self.scheduler.cancel_re_request();
        if self.gap.is_empty() {
            return;
        }
        tracing::debug!(gap = %self.gap, "rx gap re-request");
        self.handler.re_request(self.gap);
        self.scheduler.reschedule_re_request();
    }

    pub fn head(&self) -> SeqNo {
        self.queue.head()
    }

    pub fn gap(&self) -> Gap {
        self.gap
    }

    pub fn flags(&self) -> RxFlags {
        self.flags
    }

    pub fn queue(&self) -> &SeqQueue<Item> {
        &self.queue
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    fn stalled(&mut self) {
        // Tail can lead head with nothing queued, e.g. after a straddling
        // item was dropped whole.
        if self.queue.tail() <= self.queue.head() {
            return;
        }
        let gap = self.queue.gap();
        if gap == self.gap {
            return;
        }
        let prev = std::mem::replace(&mut self.gap, gap);
        self.scheduler.cancel_re_request();
        if gap.is_empty() {
            return;
        }
        tracing::debug!(head = %self.queue.head(), %prev, now = %gap, "rx gap detected");
        self.handler.request(prev, gap);
        self.scheduler.schedule_re_request();
    }

    /// Forget the outstanding gap once head has moved past it.
    fn settle_gap(&mut self) {
        if !self.gap.is_empty() && self.queue.head() >= self.gap.end() {
            tracing::trace!(gap = %self.gap, "rx gap filled");
            self.gap = Gap::default();
            self.scheduler.cancel_re_request();
        }
    }
}
