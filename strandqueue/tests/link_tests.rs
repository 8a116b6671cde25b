//! The tokio link driver end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use strandqueue::{
    Gap, Item, Link, LinkConfig, RxHandler, SendOutcome, SeqNo, StrandQueueError, TxHandler,
    TxPool, TxScheduler,
};

#[derive(Clone, Default)]
struct Inbound {
    processed: Arc<Mutex<Vec<u64>>>,
    requests: Arc<Mutex<Vec<Gap>>>,
    re_requests: Arc<Mutex<Vec<Gap>>>,
}

impl RxHandler for Inbound {
    fn process(&mut self, item: Item) {
        self.processed.lock().push(item.seq_no().get());
    }
    fn request(&mut self, _prev: Gap, now: Gap) {
        self.requests.lock().push(now);
    }
    fn re_request(&mut self, now: Gap) {
        self.re_requests.lock().push(now);
    }
}

#[derive(Clone, Default)]
struct Outbound {
    sent: Arc<Mutex<Vec<u64>>>,
}

impl TxHandler for Outbound {
    fn transmit(&mut self, item: &Item, _more: bool) -> SendOutcome {
        self.sent.lock().push(item.seq_no().get());
        SendOutcome::Sent
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
}

fn received(seq: u64) -> Item {
    Item::received(9, SeqNo(seq), Bytes::from_static(b"in"))
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn link_reorders_inbound() {
    let _ = tracing_subscriber::fmt::try_init();
    let inbound = Inbound::default();
    let (link, handle) =
        Link::new(LinkConfig::default(), inbound.clone(), Outbound::default()).unwrap();
    let driver = tokio::spawn(link.run());

    for seq in [3, 1, 4, 2] {
        handle.received(received(seq)).unwrap();
    }
    handle.close();
    let link = driver.await.unwrap();

    assert_eq!(*inbound.processed.lock(), vec![1, 2, 3, 4]);
    assert_eq!(*inbound.requests.lock(), vec![Gap::new(SeqNo(1), SeqNo(3))]);
    assert_eq!(link.rx().head(), SeqNo(5));
    assert!(link.rx().gap().is_empty());
}

#[tokio::test]
async fn closed_link_rejects_commands() {
    let (link, handle) =
        Link::new(LinkConfig::default(), Inbound::default(), Outbound::default()).unwrap();
    let driver = tokio::spawn(link.run());
    handle.close();
    assert!(handle.is_closed());
    assert!(matches!(
        handle.received(received(1)),
        Err(StrandQueueError::LinkClosed(1))
    ));
    driver.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn re_request_repeats_until_gap_filled() {
    let inbound = Inbound::default();
    let config = LinkConfig {
        re_request_interval: Duration::from_millis(100),
        ..LinkConfig::default()
    };
    let (link, handle) = Link::new(config, inbound.clone(), Outbound::default()).unwrap();
    let driver = tokio::spawn(link.run());

    handle.received(received(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let fired = inbound.re_requests.lock().len();
    assert!(fired >= 1);
    assert_eq!(inbound.re_requests.lock()[0], Gap::new(SeqNo(1), SeqNo(2)));

    handle.received(received(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = inbound.re_requests.lock().len();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(inbound.re_requests.lock().len(), settled);

    handle.close();
    driver.await.unwrap();
    assert_eq!(*inbound.processed.lock(), vec![1, 2]);
}

#[tokio::test]
async fn link_sends_and_archives() {
    let outbound = Outbound::default();
    let (link, handle) =
        Link::new(LinkConfig::default(), Inbound::default(), outbound.clone()).unwrap();
    let driver = tokio::spawn(link.run());

    handle.start().unwrap();
    for _ in 0..3 {
        handle.send(Item::new(Bytes::from_static(b"out"))).unwrap();
    }
    let sent = outbound.sent.clone();
    wait_for(|| sent.lock().len() == 3).await;
    assert_eq!(*outbound.sent.lock(), vec![1, 2, 3]);

    handle.ackd(SeqNo(3)).unwrap();
    handle.close();
    let link = driver.await.unwrap();
    assert_eq!(link.tx().archive_key(), SeqNo(3));
    assert_eq!(link.tx().queue().count(), 1);
}

#[derive(Default)]
struct Kick {
    sends: AtomicUsize,
}

impl TxScheduler for Kick {
    fn schedule_send(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }
    fn reschedule_send(&self) {}
    fn idle_send(&self) {}
    fn schedule_resend(&self) {}
    fn reschedule_resend(&self) {}
    fn idle_resend(&self) {}
    fn schedule_archive(&self) {}
    fn reschedule_archive(&self) {}
    fn idle_archive(&self) {}
}

#[tokio::test]
async fn pooled_items_reach_link() {
    let pool = TxPool::<(), Kick>::new(50, (), Arc::new(Kick::default()));
    pool.reset(SeqNo(1));

    let outbound = Outbound::default();
    let (link, handle) =
        Link::new(LinkConfig::default(), Inbound::default(), outbound.clone()).unwrap();
    let driver = tokio::spawn(link.run());
    handle.start().unwrap();
    assert!(handle.join(&pool));
    handle.ready();

    pool.send(Item::new(Bytes::from_static(b"pooled")));
    pool.send_next();

    let sent = outbound.sent.clone();
    wait_for(|| sent.lock().len() == 1).await;
    assert_eq!(pool.tx().ackd_key(), SeqNo(2));

    handle.close();
    driver.await.unwrap();
}

#[tokio::test]
async fn closed_link_withdraws_from_pool() {
    let pool = TxPool::<(), Kick>::new(51, (), Arc::new(Kick::default()));
    pool.reset(SeqNo(1));

    let outbound = Outbound::default();
    let (link, handle) =
        Link::new(LinkConfig::default(), Inbound::default(), outbound.clone()).unwrap();
    let driver = tokio::spawn(link.run());
    handle.start().unwrap();
    assert!(handle.join(&pool));
    handle.ready();
    assert_eq!(pool.ready_count(), 1);

    handle.close();
    assert_eq!(pool.ready_count(), 0);
    assert_eq!(pool.route().member_count(), 0);
    assert!(!handle.join(&pool));

    // Nothing to hand the item to: the pool keeps it unacknowledged.
    pool.send(Item::new(Bytes::from_static(b"kept")));
    pool.send_next();
    assert_eq!(pool.tx().ackd_key(), SeqNo(1));
    assert_eq!(pool.tx().queue().count(), 1);

    driver.await.unwrap();
    assert!(outbound.sent.lock().is_empty());
}

#[tokio::test]
async fn unload_after_close_returns_retained() {
    let (link, handle) =
        Link::new(LinkConfig::default(), Inbound::default(), Outbound::default()).unwrap();
    let driver = tokio::spawn(link.run());
    handle.send(Item::new(Bytes::from_static(b"a"))).unwrap();
    handle.send(Item::new(Bytes::from_static(b"b"))).unwrap();
    handle.close();

    let mut link = driver.await.unwrap();
    let mut drained = Vec::new();
    link.tx_mut().unload(|item| drained.push(item));
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[1].payload(), &Bytes::from_static(b"b"));
}
