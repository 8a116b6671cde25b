//! Transmit-side sequencing queue.
//!
//! `TxQueue` stamps outgoing items with consecutive sequence numbers, retains
//! them until acknowledged and archived, and drives three cooperative loops
//! through its [`TxScheduler`]:
//!
//! - **send**: hand each new item to the transport once, in order
//! - **resend**: retransmit ranges the peer reported missing
//! - **archive**: release acknowledged items into durable storage
//!
//! Each loop entry point ([`send_next`](TxQueue::send_next),
//! [`resend_next`](TxQueue::resend_next), [`archive_next`](TxQueue::archive_next))
//! does one unit of work and then either reschedules itself or goes idle.
//! A transient transport failure parks the loop with the item retained;
//! [`start`](TxQueue::start) resumes it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::lock_api::RawMutex;

use crate::item::{Item, LinkId, MsgFlags, MsgId};
use crate::lock::DefaultLock;
use crate::pool::{Membership, Readiness, TxPool, TxTarget};
use crate::queue::SeqQueue;
use crate::seq::{Gap, SeqNo};

/// Result of handing a new item to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent; retained until acknowledged.
    Sent,
    /// Delivered and needs no acknowledgment; the queue acks it itself.
    Delivered,
    /// Rejected permanently; the item is aborted.
    Stale,
    /// Transport unavailable; retain the item and retry after `start()`.
    Retry,
}

/// Transport and application callbacks for the transmit path.
pub trait TxHandler {
    /// Hand a new item to the transport. `more` hints that another follows.
    fn transmit(&mut self, item: &Item, more: bool) -> SendOutcome;

    /// Retransmit a previously sent item. `false` is a transient failure.
    fn retransmit(&mut self, item: &Item, more: bool) -> bool;

    /// Tell the peer a range will never be sent (aborted or unavailable).
    fn transmit_gap(&mut self, gap: Gap, more: bool) -> bool;

    /// As `transmit_gap`, on the resend path.
    fn retransmit_gap(&mut self, gap: Gap, more: bool) -> bool;

    /// Bookkeeping after a successful first send.
    fn sent(&mut self, _item: &Item) {}

    /// Persist an acknowledged item. `true` means it is archived now and can
    /// be released; `false` means [`TxQueue::archived`] will be called later.
    fn archive(&mut self, _item: &Item) -> bool {
        true
    }

    /// Fetch an item no longer held in memory, e.g. from the archive.
    fn retrieve(&mut self, _seq_no: SeqNo, _head: SeqNo) -> Option<Item> {
        None
    }

    fn aborted(&mut self, _item: &Item) {}

    /// The item entered the queue.
    fn loaded(&mut self, _item: &Item) {}

    /// The item left the queue.
    fn unloaded(&mut self, _item: &Item) {}
}

/// Deferred-work hooks for the three transmit loops.
pub trait TxScheduler {
    fn schedule_send(&self);
    fn reschedule_send(&self);
    fn idle_send(&self);
    fn schedule_resend(&self);
    fn reschedule_resend(&self);
    fn idle_resend(&self);
    fn schedule_archive(&self);
    fn reschedule_archive(&self);
    fn idle_archive(&self);
}

impl<T: TxScheduler + ?Sized> TxScheduler for Arc<T> {
    fn schedule_send(&self) {
        (**self).schedule_send()
    }
    fn reschedule_send(&self) {
        (**self).reschedule_send()
    }
    fn idle_send(&self) {
        (**self).idle_send()
    }
    fn schedule_resend(&self) {
        (**self).schedule_resend()
    }
    fn reschedule_resend(&self) {
        (**self).reschedule_resend()
    }
    fn idle_resend(&self) {
        (**self).idle_resend()
    }
    fn schedule_archive(&self) {
        (**self).schedule_archive()
    }
    fn reschedule_archive(&self) {
        (**self).reschedule_archive()
    }
    fn idle_archive(&self) {
        (**self).idle_archive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFlags(pub u8);

impl TxFlags {
    pub const NONE: Self = Self(0x00);
    pub const RUNNING: Self = Self(0x01);
    pub const SENDING: Self = Self(0x02);
    pub const SEND_FAILED: Self = Self(0x04);
    pub const ARCHIVING: Self = Self(0x08);
    pub const RESENDING: Self = Self(0x10);
    pub const RESEND_FAILED: Self = Self(0x20);

    const NAMES: [(TxFlags, &'static str); 6] = [
        (Self::RUNNING, "Running"),
        (Self::SENDING, "Sending"),
        (Self::SEND_FAILED, "SendFailed"),
        (Self::ARCHIVING, "Archiving"),
        (Self::RESENDING, "Resending"),
        (Self::RESEND_FAILED, "ResendFailed"),
    ];

    pub fn contains(self, flag: TxFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn insert(&mut self, flag: TxFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: TxFlags) {
        self.0 &= !flag.0;
    }
}

impl fmt::Display for TxFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
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

/// Sequences outgoing items and retains them until acknowledged and archived.
///
/// Keys advance in order: `archive_key <= ackd_key` and `send_key <= seq_no`.
pub struct TxQueue<H, S, R: RawMutex = DefaultLock> {
    /// Stamped on every item as the `MsgId` link id.
    link_id: LinkId,
    /// Next sequence number to assign.
    seq_no: SeqNo,
    /// Retained items: unsent, unacknowledged or awaiting archive.
    queue: SeqQueue<Item>,
    /// Next sequence number to hand to the transport.
    send_key: SeqNo,
    /// Everything below this is acknowledged.
    ackd_key: SeqNo,
    /// Everything below this is archived.
    archive_key: SeqNo,
    /// Pending resend range.
    gap: Gap,
    flags: TxFlags,
    /// Set by the first `init`, `reset` or `send`.
    started: bool,
    /// Readiness, shared with the pools this queue belongs to.
    membership: Arc<Membership<R>>,
    handler: H,
    scheduler: S,
}

impl<H: TxHandler, S: TxScheduler, R: RawMutex> TxQueue<H, S, R> {
    pub fn new(link_id: LinkId, handler: H, scheduler: S) -> Self {
        Self::with_membership(link_id, handler, scheduler, Arc::new(Membership::new()))
    }

    /// A queue whose readiness is tracked by an existing membership.
    pub fn with_membership(
        link_id: LinkId,
        handler: H,
        scheduler: S,
        membership: Arc<Membership<R>>,
    ) -> Self {
        Self {
            link_id,
            seq_no: SeqNo::default(),
            queue: SeqQueue::new(SeqNo::default()),
            send_key: SeqNo::default(),
            ackd_key: SeqNo::default(),
            archive_key: SeqNo::default(),
            gap: Gap::default(),
            flags: TxFlags::NONE,
            started: false,
            membership,
            handler,
            scheduler,
        }
    }

    /// Set the next sequence number to assign. The first call sets it
    /// outright; later calls never move it backwards.
    pub fn init(&mut self, seq_no: SeqNo) {
        let first = !self.started;
        self.started = true;
        if !first && seq_no <= self.seq_no {
            return;
        }
        self.seq_no = seq_no;
        self.release_below(seq_no);
        self.queue.set_head(seq_no);
        for key in [&mut self.send_key, &mut self.ackd_key, &mut self.archive_key] {
            if first || *key < seq_no {
                *key = seq_no;
            }
        }
    }

    /// Discard all retained items and restart numbering at `seq_no`.
    pub fn reset(&mut self, seq_no: SeqNo) {
        while let Some(mut item) = self.queue.shift() {
            self.handler.unloaded(&item);
            item.unload();
        }
        self.started = true;
        self.seq_no = seq_no;
        self.queue.reset(seq_no);
        self.send_key = seq_no;
        self.ackd_key = seq_no;
        self.archive_key = seq_no;
        self.gap = Gap::default();
    }

    pub fn start(&mut self) {
        let mut send = false;
        let mut resend = false;
        let mut archive = false;

        if !self.flags.contains(TxFlags::RUNNING) {
            self.flags.insert(TxFlags::RUNNING);
            if self.send_key < self.queue.tail() && !self.flags.contains(TxFlags::SENDING) {
                self.flags.insert(TxFlags::SENDING);
                send = true;
            }
            if !self.gap.is_empty() && !self.flags.contains(TxFlags::RESENDING) {
                self.flags.insert(TxFlags::RESENDING);
                resend = true;
            }
            if self.archive_key < self.ackd_key && !self.flags.contains(TxFlags::ARCHIVING) {
                self.flags.insert(TxFlags::ARCHIVING);
                archive = true;
            }
        } else {
            if self.flags.contains(TxFlags::SEND_FAILED) {
                self.flags.remove(TxFlags::SEND_FAILED);
                send = true;
            }
            if self.flags.contains(TxFlags::RESEND_FAILED) {
                self.flags.remove(TxFlags::RESEND_FAILED);
                resend = true;
            }
        }

        if send {
            self.scheduler.schedule_send();
        }
        if resend {
            self.scheduler.schedule_resend();
        }
        if archive {
            self.scheduler.schedule_archive();
        }
    }

    /// Start (or restart) sending from `key`, treating everything before it as acknowledged.
    pub fn start_at(&mut self, key: SeqNo) {
        self.flags.remove(TxFlags::SEND_FAILED);
        self.send_key = key;
        if self.ackd_key < key {
            self.ackd_key = key;
        }
        self.gap = Gap::default();
        self.flags.remove(TxFlags::RESENDING);
        self.flags.remove(TxFlags::RESEND_FAILED);
        if self.flags.contains(TxFlags::RUNNING) {
            if self.send_key < self.queue.tail() && !self.flags.contains(TxFlags::SENDING) {
                self.flags.insert(TxFlags::SENDING);
                self.scheduler.schedule_send();
            }
            if self.archive_key < self.ackd_key && !self.flags.contains(TxFlags::ARCHIVING) {
                self.flags.insert(TxFlags::ARCHIVING);
                self.scheduler.schedule_archive();
            }
        } else {
            self.start();
        }
    }

    /// Stop all loops. Retained items stay queued.
    pub fn stop(&mut self) {
        self.flags = TxFlags::NONE;
        self.gap = Gap::default();
        self.scheduler.idle_send();
        self.scheduler.idle_resend();
        self.scheduler.idle_archive();
    }

    /// Sequence, retain and (if running) schedule transmission of `item`.
    pub fn send(&mut self, mut item: Item) {
        let ready = self.membership.readiness();
        if item.flags().contains(MsgFlags::NO_QUEUE) && ready.is_none() {
            tracing::debug!(link_id = self.link_id, "tx not ready, aborting no-queue item");
            self.handler.aborted(&item);
            return;
        }
        if let (Some(Readiness::At(at)), Some(deadline)) = (ready, item.deadline()) {
            if at > deadline {
                tracing::debug!(link_id = self.link_id, "tx ready after deadline, aborting item");
                self.handler.aborted(&item);
                return;
            }
        }

        self.started = true;
        let key = self.seq_no;
        self.seq_no += u64::from(item.span());
        item.load(MsgId::new(self.link_id, key));
        self.handler.loaded(&item);

        if key < self.archive_key {
            tracing::warn!(
                link_id = self.link_id,
                seq_no = %key,
                "tx item behind archive, dropping"
            );
            self.handler.aborted(&item);
            self.handler.unloaded(&item);
            return;
        }
        self.queue.enqueue(item);

        if self.flags.contains(TxFlags::RUNNING)
            && !self.flags.contains(TxFlags::SENDING)
            && self.send_key <= key
        {
            self.flags.insert(TxFlags::SENDING);
            self.scheduler.schedule_send();
        }
    }

    /// Abort a queued item that has not yet been sent.
    pub fn abort(&mut self, seq_no: SeqNo) -> bool {
        if seq_no < self.send_key {
            return false;
        }
        match self.queue.abort(seq_no) {
            Some(item) => {
                self.discard(item);
                true
            }
            None => false,
        }
    }

    /// Abort every unsent item flagged [`MsgFlags::CANCEL_ON_DISCONNECT`].
    pub fn cancel_on_disconnect(&mut self) -> usize {
        let send_key = self.send_key;
        let keys: Vec<SeqNo> = self
            .queue
            .iter()
            .filter(|item| {
                item.seq_no() >= send_key && item.flags().contains(MsgFlags::CANCEL_ON_DISCONNECT)
            })
            .map(Item::seq_no)
            .collect();
        keys.into_iter().filter(|&key| self.abort(key)).count()
    }

    /// Drain every retained item, e.g. to requeue them on another link.
    pub fn unload(&mut self, mut f: impl FnMut(Item)) {
        while let Some(mut item) = self.queue.shift() {
            self.handler.unloaded(&item);
            item.unload();
            f(item);
        }
    }

    /// The peer acknowledged everything before `key`.
    pub fn ackd(&mut self, key: SeqNo) {
        if self.seq_no < key {
            self.seq_no = key;
        }
        if key <= self.ackd_key {
            return;
        }
        self.ackd_key = key;
        if self.send_key < key {
            self.send_key = key;
        }
        if self.flags.contains(TxFlags::RUNNING) && !self.flags.contains(TxFlags::ARCHIVING) {
            self.flags.insert(TxFlags::ARCHIVING);
            self.scheduler.schedule_archive();
        }
    }

    /// Queue a retransmission of `gap`, merged with any pending request.
    pub fn resend(&mut self, gap: Gap) {
        let gap = Gap::new(gap.start(), gap.end().min(self.send_key));
        if gap.is_empty() {
            return;
        }
        let merged = self.gap.union(gap);
        if merged == self.gap {
            return;
        }
        self.gap = merged;
        if self.flags.contains(TxFlags::RUNNING) && !self.flags.contains(TxFlags::RESENDING) {
            self.flags.insert(TxFlags::RESENDING);
            self.scheduler.schedule_resend();
        }
    }

    /// Asynchronous archive completion: release everything before `key`.
    pub fn archived(&mut self, key: SeqNo) {
        self.release_below(key);
    }

    /// Send loop: one item (and any gap before it) per call.
    pub fn send_next(&mut self) {
        if !self.flags.contains(TxFlags::RUNNING) {
            self.flags.remove(TxFlags::SENDING);
            self.scheduler.idle_send();
            return;
        }

        let mut prev_key = self.send_key;
        let mut more = self.send_key < self.queue.tail();
        let mut gap = Gap::default();
        let mut item: Option<Item> = None;

        while more {
            let key = self.send_key;
            let len = match self.queue.find(key) {
                Some(found) => {
                    item = Some(found.clone());
                    found.end() - key
                }
                None => match self.handler.retrieve(key, self.queue.head()) {
                    Some(found) => {
                        let len = found.end().since(key).max(1);
                        item = Some(found);
                        len
                    }
                    None => {
                        let start = if gap.is_empty() { key } else { gap.start() };
                        gap = Gap::with_len(start, gap.len() + 1);
                        1
                    }
                },
            };
            self.send_key += len;
            more = self.send_key < self.queue.tail();
            if item.is_some() {
                break;
            }
        }

        if !more {
            self.flags.remove(TxFlags::SENDING);
        }

        if !gap.is_empty() {
            if !self.handler.transmit_gap(gap, more) {
                self.send_failed(prev_key);
                return;
            }
            prev_key += gap.len();
        }

        if let Some(item) = item {
            match self.handler.transmit(&item, more) {
                SendOutcome::Sent => self.handler.sent(&item),
                SendOutcome::Delivered => {
                    self.handler.sent(&item);
                    self.ackd(item.end());
                }
                SendOutcome::Stale => {
                    tracing::debug!(
                        link_id = self.link_id,
                        seq_no = %item.seq_no(),
                        "tx item stale, aborting"
                    );
                    if let Some(stale) = self.queue.abort(item.seq_no()) {
                        self.discard(stale);
                    }
                }
                SendOutcome::Retry => {
                    self.send_failed(prev_key);
                    return;
                }
            }
        }

        if more {
            self.scheduler.reschedule_send();
        } else {
            self.scheduler.idle_send();
        }
    }

    /// Resend loop: one item (and any gap before it) per call.
    pub fn resend_next(&mut self) {
        if !self.flags.contains(TxFlags::RUNNING) {
            self.flags.remove(TxFlags::RESENDING);
            self.scheduler.idle_resend();
            return;
        }

        let mut prev_gap = self.gap;
        let mut fill = Gap::default();
        let mut item: Option<Item> = None;
        let mut more = false;

        while !self.gap.is_empty() {
            let key = self.gap.start();
            let mut skip = false;
            let len = match self.queue.find(key) {
                Some(found) => {
                    let end = found.end();
                    if found.flags().contains(MsgFlags::NO_RESEND) {
                        skip = true;
                    } else {
                        item = Some(found.clone());
                    }
                    if end <= self.archive_key {
                        self.release_below(end);
                    }
                    end - key
                }
                None => match self.handler.retrieve(key, self.queue.head()) {
                    Some(found) => {
                        let len = found.end().since(key).max(1);
                        if found.flags().contains(MsgFlags::NO_RESEND) {
                            skip = true;
                        } else {
                            item = Some(found);
                        }
                        len
                    }
                    None => {
                        skip = true;
                        1
                    }
                },
            };
            if skip {
                let start = if fill.is_empty() { key } else { fill.start() };
                fill = Gap::with_len(start, fill.len() + len);
            }
            if self.gap.len() <= len {
                self.gap = Gap::default();
                more = false;
            } else {
                self.gap = Gap::with_len(key + len, self.gap.len() - len);
                more = true;
            }
            if item.is_some() {
                break;
            }
        }

        if !more {
            self.flags.remove(TxFlags::RESENDING);
        }

        if !fill.is_empty() {
            if !self.handler.retransmit_gap(fill, more) {
                self.resend_failed(prev_gap);
                return;
            }
            prev_gap = Gap::with_len(fill.end(), prev_gap.len().saturating_sub(fill.len()));
        }

        if let Some(mut item) = item {
            item.flags_mut().insert(MsgFlags::POSSIBLE_DUPLICATE);
            if !self.handler.retransmit(&item, more) {
                self.resend_failed(prev_gap);
                return;
            }
        }

        if more {
            self.scheduler.reschedule_resend();
        } else {
            self.scheduler.idle_resend();
        }
    }

    /// Archive loop: one acknowledged item per call.
    pub fn archive_next(&mut self) {
        if !self.flags.contains(TxFlags::RUNNING) {
            self.flags.remove(TxFlags::ARCHIVING);
            self.scheduler.idle_archive();
            return;
        }

        let mut more = self.archive_key < self.ackd_key;
        let mut item: Option<Item> = None;
        while more {
            let key = self.archive_key;
            let len = match self.queue.find(key) {
                Some(found) => {
                    item = Some(found.clone());
                    found.end() - key
                }
                None => 1,
            };
            self.archive_key += len;
            more = self.archive_key < self.ackd_key;
            if item.is_some() {
                break;
            }
        }

        if !more {
            self.flags.remove(TxFlags::ARCHIVING);
        }

        if let Some(item) = item {
            if self.handler.archive(&item) {
                tracing::trace!(
                    link_id = self.link_id,
                    seq_no = %item.seq_no(),
                    "tx item archived"
                );
                self.archived(item.end());
            }
        }

        if more {
            self.scheduler.reschedule_archive();
        } else {
            self.scheduler.idle_archive();
        }
    }

    pub fn ready(&self) {
        self.membership.ready();
    }

    pub fn ready_at(&self, at: Instant) {
        self.membership.ready_at(at);
    }

    pub fn unready(&self) {
        self.membership.unready();
    }

    pub fn readiness(&self) -> Option<Readiness> {
        self.membership.readiness()
    }

    /// Join `pool` as a member reachable through `target`. Returns `false`
    /// if this queue already belongs to the maximum number of pools.
    pub fn join<PH, PS>(&self, pool: &TxPool<PH, PS, R>, target: Weak<dyn TxTarget>) -> bool
    where
        R: Send + Sync + 'static,
    {
        self.membership.join(pool.route(), target)
    }

    pub fn leave<PH, PS>(&self, pool: &TxPool<PH, PS, R>) {
        self.membership.leave(pool.route());
    }

    pub fn membership(&self) -> &Arc<Membership<R>> {
        &self.membership
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Next sequence number to assign.
    pub fn seq_no(&self) -> SeqNo {
        self.seq_no
    }

    pub fn send_key(&self) -> SeqNo {
        self.send_key
    }

    pub fn ackd_key(&self) -> SeqNo {
        self.ackd_key
    }

    pub fn archive_key(&self) -> SeqNo {
        self.archive_key
    }

    /// Pending resend range.
    pub fn gap(&self) -> Gap {
        self.gap
    }

    pub fn flags(&self) -> TxFlags {
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

    fn discard(&mut self, mut item: Item) {
        self.handler.aborted(&item);
        self.handler.unloaded(&item);
        item.unload();
    }

    fn release_below(&mut self, key: SeqNo) {
        while let Some(mut item) = self.queue.shift_before(key) {
            self.handler.unloaded(&item);
            item.unload();
        }
    }

    fn send_failed(&mut self, prev_key: SeqNo) {
        tracing::debug!(link_id = self.link_id, send_key = %prev_key, "tx send failed, parking");
        self.flags.insert(TxFlags::SENDING);
        self.flags.insert(TxFlags::SEND_FAILED);
        self.send_key = prev_key;
        self.scheduler.idle_send();
    }

    fn resend_failed(&mut self, prev_gap: Gap) {
        tracing::debug!(link_id = self.link_id, gap = %prev_gap, "tx resend failed, parking");
        self.flags.insert(TxFlags::RESENDING);
        self.flags.insert(TxFlags::RESEND_FAILED);
        self.gap = prev_gap;
        self.scheduler.idle_resend();
    }
}
