use thiserror::Error;

use crate::item::LinkId;

/// Errors produced by the StrandQueue link layer.
///
/// The queue core itself never fails: duplicates, stale items and transient
/// transport failures are reported through handler callbacks instead.
#[derive(Debug, Error)]
pub enum StrandQueueError {
    #[error("link {0} is closed")]
    LinkClosed(LinkId),

    #[error("no tokio runtime is available to drive link {0}")]
    NoRuntime(LinkId),

    #[error("invalid link config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, StrandQueueError>;
