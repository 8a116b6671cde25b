//! Tokio driver for one sequenced link.
//!
//! A [`Link`] owns a receive queue and a transmit queue and runs them on a
//! single task. Other threads interact with it through a cloneable
//! [`LinkHandle`], which pushes commands onto a lock-free inbox and wakes the
//! driver. Deferred queue work (dequeue, send, resend, archive and the gap
//! re-request timer) is posted back onto the same inbox by [`LinkScheduler`],
//! so the queues are only ever touched by the driver task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{Result, StrandQueueError};
use crate::item::{Item, LinkId};
use crate::pool::{Membership, TxPool, TxTarget};
use crate::rx::{RxHandler, RxQueue, RxScheduler};
use crate::seq::{Gap, SeqNo};
use crate::tx::{TxHandler, TxQueue, TxScheduler};

/// Configuration for a [`Link`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Stamped on every transmitted item. Must be non-zero.
    pub link_id: LinkId,
    /// First sequence number expected from the peer.
    pub rx_seq_no: SeqNo,
    /// First sequence number assigned to outgoing items.
    pub tx_seq_no: SeqNo,
    /// Delay between re-requests of an unfilled gap. Zero disables them.
    pub re_request_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            link_id: 1,
            rx_seq_no: SeqNo(1),
            tx_seq_no: SeqNo(1),
            re_request_interval: Duration::from_secs(1),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.link_id == 0 {
            return Err(StrandQueueError::InvalidConfig(
                "link_id 0 is reserved for unsequenced items".into(),
            ));
        }
        Ok(())
    }
}

/// Deferred work posted by the queues back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Dequeue,
    ReRequest,
    Send,
    Resend,
    Archive,
}

enum Command {
    Received(Item),
    Send(Item),
    Abort(SeqNo),
    Ackd(SeqNo),
    Resend(Gap),
    Archived(SeqNo),
    Start,
    Stop,
    CancelOnDisconnect,
    Run(Task),
    Close,
}

struct Shared {
    link_id: LinkId,
    inbox: SegQueue<Command>,
    notify: Notify,
    closed: AtomicBool,
    dequeuing: AtomicBool,
    sending: AtomicBool,
    resending: AtomicBool,
    archiving: AtomicBool,
    re_request: parking_lot::Mutex<Option<JoinHandle<()>>>,
    re_request_interval: Duration,
    runtime: Handle,
}

impl Shared {
    fn post(&self, command: Command) {
        self.inbox.push(command);
        self.notify.notify_one();
    }
}

impl TxTarget for Shared {
    fn send(&self, item: Item) -> bool {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(
                link_id = self.link_id,
                seq_no = %item.seq_no(),
                "link closed, refusing pooled item"
            );
            return false;
        }
        self.post(Command::Send(item));
        true
    }
}

/// Scheduler that turns queue hooks into driver tasks.
///
/// Each loop has an atomic gate: a `schedule_*` call posts a task only if
/// the loop is idle, `reschedule_*` always posts, and `idle_*` reopens the gate.
#[derive(Clone)]
pub struct LinkScheduler {
    shared: Arc<Shared>,
}

impl LinkScheduler {
    fn run(&self, task: Task) {
        self.shared.post(Command::Run(task));
    }

    fn gated(&self, gate: &AtomicBool, task: Task) {
        if !gate.swap(true, Ordering::AcqRel) {
            self.run(task);
        }
    }

    fn arm_re_request(&self, replace: bool) {
        let interval = self.shared.re_request_interval;
        if interval.is_zero() {
            return;
        }
        let mut timer = self.shared.re_request.lock();
        if !replace && timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        if let Some(old) = timer.take() {
            old.abort();
        }
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        *timer = Some(self.shared.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(shared) = shared.upgrade() {
                shared.post(Command::Run(Task::ReRequest));
            }
        }));
    }
}

impl RxScheduler for LinkScheduler {
    fn schedule_dequeue(&self) {
        self.gated(&self.shared.dequeuing, Task::Dequeue);
    }

    fn reschedule_dequeue(&self) {
        self.run(Task::Dequeue);
    }

    fn idle_dequeue(&self) {
        self.shared.dequeuing.store(false, Ordering::Release);
    }

    fn schedule_re_request(&self) {
        self.arm_re_request(false);
    }

    fn reschedule_re_request(&self) {
        self.arm_re_request(true);
    }

    fn cancel_re_request(&self) {
        if let Some(timer) = self.shared.re_request.lock().take() {
            timer.abort();
        }
    }
}

impl TxScheduler for LinkScheduler {
    fn schedule_send(&self) {
        self.gated(&self.shared.sending, Task::Send);
    }

    fn reschedule_send(&self) {
        self.run(Task::Send);
    }

    fn idle_send(&self) {
        self.shared.sending.store(false, Ordering::Release);
    }

    fn schedule_resend(&self) {
        self.gated(&self.shared.resending, Task::Resend);
    }

    fn reschedule_resend(&self) {
        self.run(Task::Resend);
    }

    fn idle_resend(&self) {
        self.shared.resending.store(false, Ordering::Release);
    }

    fn schedule_archive(&self) {
        self.gated(&self.shared.archiving, Task::Archive);
    }

    fn reschedule_archive(&self) {
        self.run(Task::Archive);
    }

    fn idle_archive(&self) {
        self.shared.archiving.store(false, Ordering::Release);
    }
}

/// A receive and transmit queue pair driven by one tokio task.
pub struct Link<RH, TH> {
    shared: Arc<Shared>,
    rx: RxQueue<RH, LinkScheduler>,
    tx: TxQueue<TH, LinkScheduler>,
}

impl<RH: RxHandler, TH: TxHandler> Link<RH, TH> {
    /// Build a link and its handle. Must be called from within a tokio runtime.
    pub fn new(config: LinkConfig, rx_handler: RH, tx_handler: TH) -> Result<(Self, LinkHandle)> {
        config.validate()?;
        let runtime =
            Handle::try_current().map_err(|_| StrandQueueError::NoRuntime(config.link_id))?;

        let shared = Arc::new(Shared {
            link_id: config.link_id,
            inbox: SegQueue::new(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dequeuing: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            resending: AtomicBool::new(false),
            archiving: AtomicBool::new(false),
            re_request: parking_lot::Mutex::new(None),
            re_request_interval: config.re_request_interval,
            runtime,
        });
        let scheduler = LinkScheduler {
            shared: shared.clone(),
        };

        let mut rx = RxQueue::new(rx_handler, scheduler.clone());
        rx.init(config.rx_seq_no);
        let mut tx = TxQueue::new(config.link_id, tx_handler, scheduler);
        tx.reset(config.tx_seq_no);

        let handle = LinkHandle {
            shared: shared.clone(),
            membership: tx.membership().clone(),
        };
        Ok((Self { shared, rx, tx }, handle))
    }

    /// Drive the link until [`LinkHandle::close`]. Everything queued before
    /// the close, and all work it triggers, is processed before returning.
    pub async fn run(mut self) -> Self {
        let link_id = self.shared.link_id;
        tracing::debug!(link_id, "link driver started");
        loop {
            while let Some(command) = self.shared.inbox.pop() {
                if let Command::Close = command {
                    self.shutdown();
                    tracing::debug!(link_id, "link driver stopped");
                    return self;
                }
                self.dispatch(command);
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.shared.link_id
    }

    pub fn rx(&self) -> &RxQueue<RH, LinkScheduler> {
        &self.rx
    }

    pub fn rx_mut(&mut self) -> &mut RxQueue<RH, LinkScheduler> {
        &mut self.rx
    }

    pub fn tx(&self) -> &TxQueue<TH, LinkScheduler> {
        &self.tx
    }

    pub fn tx_mut(&mut self) -> &mut TxQueue<TH, LinkScheduler> {
        &mut self.tx
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Received(item) => self.rx.enqueue(item),
            Command::Send(item) => self.tx.send(item),
            Command::Abort(seq_no) => {
                self.tx.abort(seq_no);
            }
            Command::Ackd(seq_no) => self.tx.ackd(seq_no),
            Command::Resend(gap) => self.tx.resend(gap),
            Command::Archived(seq_no) => self.tx.archived(seq_no),
            Command::Start => self.tx.start(),
            Command::Stop => self.tx.stop(),
            Command::CancelOnDisconnect => {
                let cancelled = self.tx.cancel_on_disconnect();
                tracing::debug!(
                    link_id = self.shared.link_id,
                    cancelled,
                    "link cancelled unsent items"
                );
            }
            Command::Run(task) => match task {
                Task::Dequeue => self.rx.dequeue(),
                Task::ReRequest => self.rx.re_request(),
                Task::Send => self.tx.send_next(),
                Task::Resend => self.tx.resend_next(),
                Task::Archive => self.tx.archive_next(),
            },
            Command::Close => {}
        }
    }

    fn shutdown(&mut self) {
        while let Some(command) = self.shared.inbox.pop() {
            self.dispatch(command);
        }
        self.tx.stop();
        self.rx.scheduler().cancel_re_request();
    }
}

/// Thread-safe handle to a running [`Link`].
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
    membership: Arc<Membership>,
}

impl LinkHandle {
    pub fn link_id(&self) -> LinkId {
        self.shared.link_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Hand a received item to the receive queue.
    pub fn received(&self, item: Item) -> Result<()> {
        self.command(Command::Received(item))
    }

    pub fn send(&self, item: Item) -> Result<()> {
        self.command(Command::Send(item))
    }

    pub fn abort(&self, seq_no: SeqNo) -> Result<()> {
        self.command(Command::Abort(seq_no))
    }

    pub fn ackd(&self, seq_no: SeqNo) -> Result<()> {
        self.command(Command::Ackd(seq_no))
    }

    pub fn resend(&self, gap: Gap) -> Result<()> {
        self.command(Command::Resend(gap))
    }

    pub fn archived(&self, seq_no: SeqNo) -> Result<()> {
        self.command(Command::Archived(seq_no))
    }

    /// Start, or resume after a transient transport failure.
    pub fn start(&self) -> Result<()> {
        self.command(Command::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.command(Command::Stop)
    }

    pub fn cancel_on_disconnect(&self) -> Result<()> {
        self.command(Command::CancelOnDisconnect)
    }

    /// Stop accepting commands, withdraw from every pool and let the driver
    /// drain and return.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.membership.unready();
            self.membership.leave_all();
            self.shared.post(Command::Close);
        }
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
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

    /// Join `pool`; pooled items arrive as sends on this link. A closed link
    /// never joins.
    pub fn join<PH, PS>(&self, pool: &TxPool<PH, PS>) -> bool {
        if self.is_closed() {
            return false;
        }
        let target: Weak<Shared> = Arc::downgrade(&self.shared);
        self.membership.join(pool.route(), target)
    }

    pub fn leave<PH, PS>(&self, pool: &TxPool<PH, PS>) {
        self.membership.leave(pool.route());
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(StrandQueueError::LinkClosed(self.shared.link_id));
        }
        self.shared.post(command);
        Ok(())
    }
}

impl TxTarget for LinkHandle {
    fn send(&self, item: Item) -> bool {
        TxTarget::send(&*self.shared, item)
    }
}
