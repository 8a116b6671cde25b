//! StrandQueue -- sequenced message queues for the Strand Protocol stack.
//!
//! Provides the reliability core of a session link:
//! - **Receive queue**: reorders items by sequence number, suppresses
//!   duplicates and reports gaps for retransmission
//! - **Transmit queue**: assigns sequence numbers, retains items until
//!   acknowledged, and drives send/resend/archive loops
//! - **Transmit pools**: fan items out to whichever member transmitter is
//!   ready soonest, nesting arbitrarily
//! - **Link driver**: a tokio task running one receive/transmit pair
//!
//! The queues do no I/O and never block; all deferred work goes through
//! caller-supplied scheduler hooks.

pub mod error;
pub mod item;
pub mod link;
pub mod lock;
pub mod pool;
pub mod queue;
pub mod rx;
pub mod seq;
pub mod tx;

// Re-export key public types at crate root.
pub use error::{Result, StrandQueueError};
pub use item::{Item, LinkId, MsgFlags, MsgId};
pub use link::{Link, LinkConfig, LinkHandle, LinkScheduler, Task};
pub use lock::{DefaultLock, NoLock};
pub use pool::{
    MemberId, Membership, PoolHandler, Readiness, ReadyListener, TxPool, TxTarget, MAX_POOLS,
};
pub use queue::{QueueStats, SeqQueue, Sequenced};
pub use rx::{RxFlags, RxHandler, RxQueue, RxScheduler};
pub use seq::{Gap, SeqNo};
pub use tx::{SendOutcome, TxFlags, TxHandler, TxQueue, TxScheduler};
