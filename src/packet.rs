//! The reference-counted byte blob that outgoing and incoming commands point at.
//!
//! The original design tracks a packet's lifetime with a manual reference count and frees it
//! (via an optional callback) the moment the count drops to zero. In Rust, [`std::rc::Rc`]
//! already *is* that reference count, and its `Drop` impl already *is* the free hook, so a
//! [`Packet`] is simply `Rc<[u8]>` plus the flags it was created with. The `sent` flag from the
//! original design (set once the last outstanding command referencing the packet has been
//! acknowledged or discarded) has no observable effect once `Rc` handles the actual freeing, so
//! it is dropped from this port; see DESIGN.md.

use std::rc::Rc;

/// Flags supplied to [`Packet::new`] describing how a packet should be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PacketFlags {
    /// Deliver with full reliability and in order (`SEND_RELIABLE`/`SEND_FRAGMENT`).
    pub reliable: bool,
    /// Deliver unsequenced: best-effort, order- and duplicate-tolerant (`SEND_UNSEQUENCED`).
    /// Ignored if `reliable` is also set (reliable wins).
    pub unsequenced: bool,
}

impl PacketFlags {
    pub const RELIABLE: PacketFlags = PacketFlags { reliable: true, unsequenced: false };
    pub const UNSEQUENCED: PacketFlags = PacketFlags { reliable: false, unsequenced: true };
    pub const UNRELIABLE: PacketFlags = PacketFlags { reliable: false, unsequenced: false };
}

/// A received or to-be-sent application payload.
///
/// Cloning a `Packet` is cheap (it bumps the `Rc` refcount); the same packet is shared across
/// every fragment command derived from it.
#[derive(Clone, Debug)]
pub struct Packet {
    data: Rc<[u8]>,
    flags: PacketFlags,
}

impl Packet {
    /// Creates a new packet from owned data with the given delivery flags.
    pub fn new(data: Box<[u8]>, flags: PacketFlags) -> Self {
        Self { data: Rc::from(data), flags }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Returns a new `Packet` referencing the given byte range of this packet's data, used when
    /// splitting a packet into fragments. Shares the underlying allocation.
    pub(crate) fn slice(&self, range: std::ops::Range<usize>) -> Box<[u8]> {
        self.data[range].into()
    }
}
