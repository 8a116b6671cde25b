//! Queued messages: identity, flags and the opaque payload handle.

use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::time::Instant;

use bytes::Bytes;

use crate::queue::Sequenced;
use crate::seq::SeqNo;

/// Identifies the link (session) a message was sequenced on.
pub type LinkId = u32;

/// Message identity: the link it belongs to and its position on that link.
///
/// The default identity `(0, 0)` means "not loaded onto any transmit queue".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgId {
    pub link_id: LinkId,
    pub seq_no: SeqNo,
}

impl MsgId {
    pub fn new(link_id: LinkId, seq_no: SeqNo) -> Self {
        Self { link_id, seq_no }
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.link_id, self.seq_no)
    }
}

/// Per-message flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgFlags(pub u8);

impl MsgFlags {
    pub const NONE: Self = Self(0x00);
    /// Session-level message (logon, heartbeat) rather than application data.
    pub const SESSION_LEVEL: Self = Self(0x01);
    /// Abort instead of queuing when the transmitter is not ready.
    pub const NO_QUEUE: Self = Self(0x02);
    /// Never retransmit the payload; a gap fill is sent in its place.
    pub const NO_RESEND: Self = Self(0x04);
    /// Abort if still unsent when the link disconnects.
    pub const CANCEL_ON_DISCONNECT: Self = Self(0x08);
    pub const POSSIBLE_DUPLICATE: Self = Self(0x10);
    pub const POSSIBLE_RESEND: Self = Self(0x20);

    pub fn contains(self, flag: MsgFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn insert(&mut self, flag: MsgFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: MsgFlags) {
        self.0 &= !flag.0;
    }
}

impl BitOr for MsgFlags {
    type Output = MsgFlags;

    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

/// A sequenced message.
///
/// The payload is a `Bytes` handle, so clones share the buffer. An item
/// occupies `span` consecutive sequence numbers starting at its `seq_no`;
/// ordinary messages have a span of one, coalesced messages and gap fills
/// cover more.
#[derive(Debug, Clone)]
pub struct Item {
    payload: Bytes,
    id: MsgId,
    flags: MsgFlags,
    span: u32,
    gap_fill: bool,
    deadline: Option<Instant>,
    addr: Option<SocketAddr>,
}

impl Item {
    /// A new, not yet sequenced message.
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            id: MsgId::default(),
            flags: MsgFlags::NONE,
            span: 1,
            gap_fill: false,
            deadline: None,
            addr: None,
        }
    }

    /// A received message that already carries its identity.
    pub fn received(link_id: LinkId, seq_no: SeqNo, payload: Bytes) -> Self {
        let mut item = Self::new(payload);
        item.id = MsgId::new(link_id, seq_no);
        item
    }

    /// A synthetic, payload-free item standing in for `span` skipped numbers.
    pub fn gap_fill(seq_no: SeqNo, span: u32) -> Self {
        let mut item = Self::new(Bytes::new());
        item.id.seq_no = seq_no;
        item.span = span.max(1);
        item.gap_fill = true;
        item
    }

    pub fn with_flags(mut self, flags: MsgFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_span(mut self, span: u32) -> Self {
        self.span = span.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn id(&self) -> MsgId {
        self.id
    }

    pub fn link_id(&self) -> LinkId {
        self.id.link_id
    }

    pub fn seq_no(&self) -> SeqNo {
        self.id.seq_no
    }

    /// One past the last sequence number this item covers.
    pub fn end(&self) -> SeqNo {
        self.id.seq_no + u64::from(self.span)
    }

    pub fn span(&self) -> u32 {
        self.span
    }

    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut MsgFlags {
        &mut self.flags
    }

    pub fn is_gap_fill(&self) -> bool {
        self.gap_fill
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stamp the identity assigned by a transmit queue.
    pub(crate) fn load(&mut self, id: MsgId) {
        self.id = id;
    }

    /// Clear the identity after the item leaves a transmit queue.
    pub(crate) fn unload(&mut self) {
        self.id = MsgId::default();
    }
}

/// Items are atomic: clipping any part of one discards all of it.
impl Sequenced for Item {
    fn key(&self) -> SeqNo {
        self.id.seq_no
    }

    fn span(&self) -> u64 {
        u64::from(self.span)
    }

    fn clip_head(&mut self, _n: u64) -> u64 {
        0
    }

    fn clip_tail(&mut self, _n: u64) -> u64 {
        0
    }

    fn bytes(&self) -> usize {
        self.payload.len()
    }
}
