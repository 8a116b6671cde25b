//! Readiness tracking and transmit fan-out pools.
//!
//! Every transmitter owns a [`Membership`]: its current [`Readiness`] plus
//! the pools it belongs to. A [`TxPool`] is itself a transmitter with its own
//! sequence space; each item it sends is forwarded to whichever member is
//! ready soonest, and that member sequences the item again on its own link.
//!
//! Pools hold members weakly and members hold their pools strongly, so a
//! pool never keeps a member alive. Locks are only ever taken child before
//! parent: member membership, then pool routing, then pool membership. The
//! routing side never touches a pool's transmit queue.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::lock_api::{Mutex, MutexGuard, RawMutex};

use crate::item::{Item, LinkId};
use crate::lock::DefaultLock;
use crate::seq::{Gap, SeqNo};
use crate::tx::{SendOutcome, TxHandler, TxQueue, TxScheduler};

/// Upper bound on the pools a single transmitter may join.
pub const MAX_POOLS: usize = 8;

/// Process-unique identity of a pool member.
pub type MemberId = u64;

static NEXT_MEMBER: AtomicU64 = AtomicU64::new(1);

/// When a transmitter can accept the next item. `Now` sorts before any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Readiness {
    Now,
    At(Instant),
}

/// Receives readiness changes of a transmitter.
pub trait ReadyListener: Send + Sync {
    fn member_ready(&self, member: MemberId, next: Readiness);
    fn member_unready(&self, member: MemberId);

    /// The member dropped this listener and will send no further updates.
    fn member_left(&self, _member: MemberId) {}
}

/// Anything a pool can forward items to.
pub trait TxTarget: Send + Sync {
    /// Take ownership of `item`. `false` means the target is shutting down
    /// and the item was not accepted.
    fn send(&self, item: Item) -> bool;
}

impl<H, S, R> TxTarget for parking_lot::Mutex<TxQueue<H, S, R>>
where
    H: TxHandler + Send,
    S: TxScheduler + Send,
    R: RawMutex + Send + Sync,
{
    fn send(&self, item: Item) -> bool {
        self.lock().send(item);
        true
    }
}

struct MemberState {
    pools: Vec<Arc<dyn ReadyListener>>,
    offset: usize,
    ready: Option<Readiness>,
}

/// Readiness of one transmitter, shared with the pools it belongs to.
pub struct Membership<R: RawMutex = DefaultLock> {
    id: MemberId,
    state: Mutex<R, MemberState>,
}

impl<R: RawMutex> Membership<R> {
    pub fn new() -> Self {
        Self {
            id: NEXT_MEMBER.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(MemberState {
                pools: Vec::new(),
                offset: 0,
                ready: None,
            }),
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    /// `None` while not ready.
    pub fn readiness(&self) -> Option<Readiness> {
        self.state.lock().ready
    }

    pub fn is_ready(&self) -> bool {
        self.readiness().is_some()
    }

    pub fn ready(&self) {
        self.update(Some(Readiness::Now));
    }

    pub fn ready_at(&self, at: Instant) {
        self.update(Some(Readiness::At(at)));
    }

    pub fn unready(&self) {
        self.update(None);
    }

    pub fn pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Subscribe a listener. Returns `false` once [`MAX_POOLS`] are attached.
    pub fn listen(&self, listener: Arc<dyn ReadyListener>) -> bool {
        let mut state = self.state.lock();
        if state.pools.len() >= MAX_POOLS {
            tracing::debug!(member = self.id, "membership full, ignoring listener");
            return false;
        }
        if let Some(ready) = state.ready {
            listener.member_ready(self.id, ready);
        }
        state.pools.push(listener);
        true
    }

    pub fn unlisten(&self, listener: &Arc<dyn ReadyListener>) {
        let ptr = Arc::as_ptr(listener) as *const u8;
        self.state
            .lock()
            .pools
            .retain(|p| Arc::as_ptr(p) as *const u8 != ptr);
    }

    /// Join a pool's routing as a member reachable through `target`.
    pub fn join(&self, route: &Arc<PoolRoute<R>>, target: Weak<dyn TxTarget>) -> bool
    where
        R: Send + Sync + 'static,
    {
        let ptr = Arc::as_ptr(route) as *const u8;
        let mut state = self.state.lock();
        let joined = state.pools.iter().any(|p| Arc::as_ptr(p) as *const u8 == ptr);
        if !joined && state.pools.len() >= MAX_POOLS {
            tracing::debug!(member = self.id, "membership full, not joining pool");
            return false;
        }
        // Re-attaching restores a slot the pool dropped after a refused send.
        route.attach(self.id, target);
        if let Some(ready) = state.ready {
            route.member_ready(self.id, ready);
        }
        if !joined {
            state.pools.push(route.clone());
        }
        true
    }

    pub fn leave(&self, route: &Arc<PoolRoute<R>>) {
        let ptr = Arc::as_ptr(route) as *const u8;
        let mut state = self.state.lock();
        let before = state.pools.len();
        state.pools.retain(|p| Arc::as_ptr(p) as *const u8 != ptr);
        if state.pools.len() != before {
            route.detach(self.id);
        }
    }

    /// Leave every pool, e.g. when the transmitter shuts down.
    pub fn leave_all(&self) {
        let mut state = self.state.lock();
        let pools = std::mem::take(&mut state.pools);
        state.offset = 0;
        for pool in pools {
            pool.member_left(self.id);
        }
    }

    fn update(&self, next: Option<Readiness>) {
        let mut state = self.state.lock();
        state.ready = next;
        let n = state.pools.len();
        if n == 0 {
            return;
        }
        state.offset = (state.offset + 1) % n;
        for i in 0..n {
            let pool = &state.pools[(state.offset + i) % n];
            match next {
                Some(ready) => pool.member_ready(self.id, ready),
                None => pool.member_unready(self.id),
            }
        }
    }
}

impl<R: RawMutex> Default for Membership<R> {
    fn default() -> Self {
        Self::new()
    }
}

struct Slot {
    id: MemberId,
    target: Weak<dyn TxTarget>,
    key: Option<(Readiness, u64)>,
}

/// Members ordered by readiness; the counter breaks ties in update order.
struct ReadyQueues {
    ready: BTreeMap<(Readiness, u64), MemberId>,
    slots: Vec<Slot>,
    order: u64,
}

impl ReadyQueues {
    fn position(&self, id: MemberId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    fn remove(&mut self, id: MemberId) {
        if let Some(pos) = self.position(id) {
            let slot = self.slots.swap_remove(pos);
            if let Some(key) = slot.key {
                self.ready.remove(&key);
            }
        }
    }
}

/// The routing half of a pool: tracks member readiness and picks the next target.
pub struct PoolRoute<R: RawMutex = DefaultLock> {
    queues: Mutex<R, ReadyQueues>,
    membership: Arc<Membership<R>>,
    scheduler: Arc<dyn TxScheduler + Send + Sync>,
    restart: AtomicBool,
}

impl<R: RawMutex> PoolRoute<R> {
    fn new(membership: Arc<Membership<R>>, scheduler: Arc<dyn TxScheduler + Send + Sync>) -> Self {
        Self {
            queues: Mutex::new(ReadyQueues {
                ready: BTreeMap::new(),
                slots: Vec::new(),
                order: 0,
            }),
            membership,
            scheduler,
            restart: AtomicBool::new(false),
        }
    }

    /// The soonest-ready live member.
    pub fn next(&self) -> Option<Arc<dyn TxTarget>> {
        self.next_entry().map(|(_, target)| target)
    }

    pub fn next_member(&self) -> Option<MemberId> {
        self.next_entry().map(|(id, _)| id)
    }

    pub fn ready_count(&self) -> usize {
        self.queues.lock().ready.len()
    }

    pub fn member_count(&self) -> usize {
        self.queues.lock().slots.len()
    }

    fn next_entry(&self) -> Option<(MemberId, Arc<dyn TxTarget>)> {
        let mut queues = self.queues.lock();
        loop {
            let (_, &id) = queues.ready.iter().next()?;
            let target = queues
                .position(id)
                .and_then(|pos| queues.slots[pos].target.upgrade());
            match target {
                Some(target) => return Some((id, target)),
                None => {
                    tracing::debug!(member = id, "pool member dropped, pruning");
                    queues.remove(id);
                    self.propagate(&queues);
                }
            }
        }
    }

    fn attach(&self, id: MemberId, target: Weak<dyn TxTarget>) {
        let mut queues = self.queues.lock();
        match queues.position(id) {
            Some(pos) => queues.slots[pos].target = target,
            None => queues.slots.push(Slot {
                id,
                target,
                key: None,
            }),
        }
    }

    fn detach(&self, id: MemberId) {
        let mut queues = self.queues.lock();
        let was_ready = queues
            .position(id)
            .is_some_and(|pos| queues.slots[pos].key.is_some());
        queues.remove(id);
        if was_ready {
            self.propagate(&queues);
        }
    }

    fn propagate(&self, queues: &ReadyQueues) {
        match queues.ready.keys().next() {
            Some(&(ready, _)) => self.membership.update(Some(ready)),
            None => self.membership.unready(),
        }
    }
}

impl<R: RawMutex> ReadyListener for PoolRoute<R>
where
    R: Send + Sync,
{
    fn member_ready(&self, member: MemberId, next: Readiness) {
        let mut queues = self.queues.lock();
        let Some(pos) = queues.position(member) else {
            tracing::trace!(member, "readiness from unknown member");
            return;
        };
        let prev = queues.slots[pos].key.take();
        if let Some(key) = prev {
            queues.ready.remove(&key);
        }
        let key = (next, queues.order);
        queues.order = queues.order.wrapping_add(1);
        queues.ready.insert(key, member);
        queues.slots[pos].key = Some(key);
        let first = prev.is_none() && queues.ready.len() == 1;
        self.propagate(&queues);
        drop(queues);

        if first {
            tracing::debug!(member, "pool ready");
            self.restart.store(true, Ordering::Release);
            self.scheduler.schedule_send();
        }
    }

    fn member_unready(&self, member: MemberId) {
        let mut queues = self.queues.lock();
        let Some(pos) = queues.position(member) else {
            return;
        };
        let Some(key) = queues.slots[pos].key.take() else {
            return;
        };
        queues.ready.remove(&key);
        if queues.ready.is_empty() {
            tracing::debug!(member, "pool unready");
        }
        self.propagate(&queues);
    }

    fn member_left(&self, member: MemberId) {
        self.detach(member);
    }
}

/// Application hooks for a pool's own lifecycle events.
pub trait PoolHandler: Send {
    fn aborted(&mut self, _item: &Item) {}
    fn loaded(&mut self, _item: &Item) {}
    fn unloaded(&mut self, _item: &Item) {}
}

impl PoolHandler for () {}

/// The transport side of a pool's queue: forwards to the next ready member.
pub struct Fanout<H, R: RawMutex = DefaultLock> {
    route: Arc<PoolRoute<R>>,
    app: H,
}

impl<H, R: RawMutex> Fanout<H, R> {
    pub fn app(&self) -> &H {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut H {
        &mut self.app
    }
}

impl<H: PoolHandler, R: RawMutex> TxHandler for Fanout<H, R> {
    fn transmit(&mut self, item: &Item, _more: bool) -> SendOutcome {
        // Each refusal detaches a member, so this ends once the ready set is exhausted.
        while let Some((member, target)) = self.route.next_entry() {
            if target.send(item.clone()) {
                return SendOutcome::Delivered;
            }
            tracing::debug!(member, seq_no = %item.seq_no(), "pool member refused item, detaching");
            self.route.detach(member);
        }
        SendOutcome::Retry
    }

    fn retransmit(&mut self, _item: &Item, _more: bool) -> bool {
        true
    }

    fn transmit_gap(&mut self, _gap: Gap, _more: bool) -> bool {
        true
    }

    fn retransmit_gap(&mut self, _gap: Gap, _more: bool) -> bool {
        true
    }

    fn aborted(&mut self, item: &Item) {
        self.app.aborted(item);
    }

    fn loaded(&mut self, item: &Item) {
        self.app.loaded(item);
    }

    fn unloaded(&mut self, item: &Item) {
        self.app.unloaded(item);
    }
}

/// The transmit queue inside a [`TxPool`].
pub type PoolTx<H, S, R> = TxQueue<Fanout<H, R>, Arc<S>, R>;

/// A transmitter that fans items out across its ready members.
pub struct TxPool<H, S, R: RawMutex = DefaultLock> {
    route: Arc<PoolRoute<R>>,
    tx: Mutex<R, PoolTx<H, S, R>>,
}

impl<H, S, R: RawMutex> TxPool<H, S, R> {
    pub fn route(&self) -> &Arc<PoolRoute<R>> {
        &self.route
    }

    /// The pool's own readiness, as seen by pools it belongs to.
    pub fn membership(&self) -> &Arc<Membership<R>> {
        &self.route.membership
    }

    pub fn next(&self) -> Option<Arc<dyn TxTarget>> {
        self.route.next()
    }

    pub fn next_member(&self) -> Option<MemberId> {
        self.route.next_member()
    }

    pub fn ready_count(&self) -> usize {
        self.route.ready_count()
    }
}

impl<H, S, R> TxPool<H, S, R>
where
    H: PoolHandler,
    S: TxScheduler + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    pub fn new(link_id: LinkId, handler: H, scheduler: Arc<S>) -> Self {
        let membership = Arc::new(Membership::new());
        let route = Arc::new(PoolRoute::new(membership.clone(), scheduler.clone()));
        let fanout = Fanout {
            route: route.clone(),
            app: handler,
        };
        Self {
            route,
            tx: Mutex::new(TxQueue::with_membership(link_id, fanout, scheduler, membership)),
        }
    }

    /// Lock the pool's transmit queue.
    pub fn tx(&self) -> MutexGuard<'_, R, PoolTx<H, S, R>> {
        self.tx.lock()
    }

    pub fn send(&self, item: Item) {
        self.tx.lock().send(item);
    }

    pub fn abort(&self, seq_no: SeqNo) -> bool {
        self.tx.lock().abort(seq_no)
    }

    pub fn init(&self, seq_no: SeqNo) {
        self.tx.lock().init(seq_no);
    }

    pub fn reset(&self, seq_no: SeqNo) {
        self.tx.lock().reset(seq_no);
    }

    pub fn start(&self) {
        self.tx.lock().start();
    }

    pub fn stop(&self) {
        self.tx.lock().stop();
    }

    /// Send loop entry point; also resumes after a member became ready.
    pub fn send_next(&self) {
        let mut tx = self.tx.lock();
        if self.route.restart.swap(false, Ordering::AcqRel) {
            tx.start();
        }
        tx.send_next();
    }

    pub fn resend_next(&self) {
        self.tx.lock().resend_next();
    }

    pub fn archive_next(&self) {
        self.tx.lock().archive_next();
    }

    /// Join `parent` as a member. Returns `false` if this pool already
    /// belongs to [`MAX_POOLS`] pools.
    pub fn join<PH, PS>(self: &Arc<Self>, parent: &TxPool<PH, PS, R>) -> bool
    where
        H: 'static,
    {
        let target: Weak<Self> = Arc::downgrade(self);
        self.membership().join(parent.route(), target)
    }

    pub fn leave<PH, PS>(&self, parent: &TxPool<PH, PS, R>) {
        self.membership().leave(parent.route());
    }
}

impl<H, S, R> TxTarget for TxPool<H, S, R>
where
    H: PoolHandler,
    S: TxScheduler + Send + Sync + 'static,
    R: RawMutex + Send + Sync + 'static,
{
    fn send(&self, item: Item) -> bool {
        TxPool::send(self, item);
        true
    }
}
