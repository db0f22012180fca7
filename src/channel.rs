//! Per-channel sequencing state: outgoing/incoming sequence counters, the reliable admission
//! window, and the in-order/gap-tolerant dispatch algorithms that release received commands to
//! the peer's dispatched queue.

use std::collections::{HashMap, VecDeque};

use crate::command::{CommandHeader, FragmentHeader};
use crate::packet::{Packet, PacketFlags};
use crate::seq;

/// Number of 16-bit-sequence-space partitions a channel's reliable window tracking divides into.
pub const RELIABLE_WINDOWS: u16 = 16;
/// Sequence numbers per reliable window; `RELIABLE_WINDOWS * RELIABLE_WINDOW_SIZE == 0x10000`.
pub const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
/// At most this many windows' worth of reliable commands may be in flight on one channel.
pub const FREE_RELIABLE_WINDOWS: u16 = 8;

fn window_index(seq: u16) -> u16 {
    seq / RELIABLE_WINDOW_SIZE
}

fn window_distance(window: u16, current: u16) -> u16 {
    (window as i32 - current as i32).rem_euclid(RELIABLE_WINDOWS as i32) as u16
}

/// State for a reliable message still being reassembled from `SEND_FRAGMENT` commands.
struct Reassembly {
    fragment_count: u32,
    fragments_remaining: u32,
    seen: Vec<bool>,
    data: Vec<u8>,
}

impl Reassembly {
    fn new(fragment_count: u32, total_length: u32) -> Self {
        Reassembly {
            fragment_count,
            fragments_remaining: fragment_count,
            seen: vec![false; fragment_count as usize],
            data: vec![0u8; total_length as usize],
        }
    }

    /// Folds one fragment's bytes into the reassembly buffer. Idempotent: a fragment already
    /// seen is silently ignored rather than re-copied. Fails if the fragment's bounds or number
    /// don't fit the message this reassembly was created for.
    fn apply(&mut self, fragment: &FragmentHeader, bytes: &[u8]) -> Result<(), ()> {
        if fragment.fragment_number >= self.fragment_count || fragment.fragment_count != self.fragment_count {
            return Err(());
        }
        let start = fragment.fragment_offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(())?;
        if end > self.data.len() {
            return Err(());
        }
        if !self.seen[fragment.fragment_number as usize] {
            self.data[start..end].copy_from_slice(bytes);
            self.seen[fragment.fragment_number as usize] = true;
            self.fragments_remaining -= 1;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.fragments_remaining == 0
    }

    fn into_packet(self, flags: PacketFlags) -> Packet {
        Packet::new(self.data.into_boxed_slice(), flags)
    }
}

enum ReliablePayload {
    Whole(Packet),
    Fragmented(Reassembly),
}

struct IncomingReliable {
    /// Sequence number of the message's first fragment (or its only command, if unfragmented).
    reliable_seq: u16,
    /// Total reliable sequence numbers this message spans; 1 for an unfragmented message.
    fragment_count: u32,
    payload: ReliablePayload,
}

impl IncomingReliable {
    fn is_ready(&self) -> bool {
        match &self.payload {
            ReliablePayload::Whole(_) => true,
            ReliablePayload::Fragmented(r) => r.is_complete(),
        }
    }

    fn into_packet(self) -> Packet {
        match self.payload {
            ReliablePayload::Whole(p) => p,
            ReliablePayload::Fragmented(r) => r.into_packet(PacketFlags::RELIABLE),
        }
    }
}

enum UnreliablePayload {
    Whole(Packet),
    Fragmented(Reassembly),
}

struct IncomingUnreliable {
    /// The reliable sequence number in effect on the channel when this message was sent; used
    /// to correlate unreliable delivery order against the reliable stream.
    reliable_seq: u16,
    /// Sequence number of the message's first fragment (or its only command).
    unreliable_seq: u16,
    payload: UnreliablePayload,
}

impl IncomingUnreliable {
    fn is_ready(&self) -> bool {
        match &self.payload {
            UnreliablePayload::Whole(_) => true,
            UnreliablePayload::Fragmented(r) => r.is_complete(),
        }
    }

    fn into_packet(self) -> Packet {
        match self.payload {
            UnreliablePayload::Whole(p) => p,
            UnreliablePayload::Fragmented(r) => r.into_packet(PacketFlags::UNRELIABLE),
        }
    }
}

/// One channel's ordering state within a peer.
pub struct Channel {
    pub outgoing_reliable_seq: u16,
    pub outgoing_unreliable_seq: u16,
    pub incoming_reliable_seq: u16,
    pub incoming_unreliable_seq: u16,

    incoming_reliable_commands: VecDeque<IncomingReliable>,
    incoming_unreliable_commands: VecDeque<IncomingUnreliable>,
    reliable_reassembly: HashMap<u16, usize>,
    unreliable_reassembly: HashMap<u16, usize>,

    /// In-flight reliable command counts per window, and a bitmask of which windows are
    /// non-empty — tracks this channel's own sent-but-unacked commands for outgoing admission.
    reliable_window_counts: [u16; RELIABLE_WINDOWS as usize],
    used_windows: u16,
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            outgoing_reliable_seq: 0,
            outgoing_unreliable_seq: 0,
            incoming_reliable_seq: 0,
            incoming_unreliable_seq: 0,
            incoming_reliable_commands: VecDeque::new(),
            incoming_unreliable_commands: VecDeque::new(),
            reliable_reassembly: HashMap::new(),
            unreliable_reassembly: HashMap::new(),
            reliable_window_counts: [0; RELIABLE_WINDOWS as usize],
            used_windows: 0,
        }
    }

    /// Records that a reliable command at `seq` has just been placed on the wire, occupying its
    /// window until acked or requeued after a timeout.
    pub fn mark_reliable_in_flight(&mut self, seq: u16) {
        let w = window_index(seq) as usize;
        self.reliable_window_counts[w] += 1;
        self.used_windows |= 1 << w;
    }

    /// Frees a reliable command's window slot, whether because it was acked or because it timed
    /// out and was requeued for a later send attempt.
    pub fn release_reliable_window(&mut self, seq: u16) {
        let w = window_index(seq) as usize;
        if self.reliable_window_counts[w] > 0 {
            self.reliable_window_counts[w] -= 1;
            if self.reliable_window_counts[w] == 0 {
                self.used_windows &= !(1 << w);
            }
        }
    }

    /// Whether a not-yet-sent reliable command at `seq` may be placed on the wire now, given
    /// this channel's currently in-flight windows.
    pub fn outgoing_window_admits(&self, seq: u16) -> bool {
        let base = if self.used_windows == 0 {
            window_index(self.outgoing_reliable_seq.wrapping_add(1))
        } else {
            self.used_windows.trailing_zeros() as u16
        };
        window_distance(window_index(seq), base) < FREE_RELIABLE_WINDOWS
    }

    /// Whether a reliable message starting at `seq` falls within the admission window relative
    /// to the next sequence number this channel expects.
    fn reliable_admissible(&self, seq: u16) -> bool {
        let current = window_index(self.incoming_reliable_seq.wrapping_add(1));
        window_distance(window_index(seq), current) < FREE_RELIABLE_WINDOWS
    }

    fn reliable_is_stale(&self, seq: u16) -> bool {
        seq::less_than_or_equal(seq, self.incoming_reliable_seq)
    }

    fn find_reliable_index(&self, seq: u16) -> Option<usize> {
        self.incoming_reliable_commands.iter().position(|c| c.reliable_seq == seq)
    }

    /// Inserts an unfragmented `SEND_RELIABLE` command. Returns `false` if the command is a
    /// stale duplicate or falls outside the admission window (both silently dropped).
    pub fn receive_reliable(&mut self, header: &CommandHeader, data: Box<[u8]>) -> bool {
        let seq = header.reliable_seq;
        if self.reliable_is_stale(seq) || self.find_reliable_index(seq).is_some() {
            return false;
        }
        if !self.reliable_admissible(seq) {
            return false;
        }

        let entry = IncomingReliable {
            reliable_seq: seq,
            fragment_count: 1,
            payload: ReliablePayload::Whole(Packet::new(data, PacketFlags::RELIABLE)),
        };
        self.insert_reliable_sorted(entry);
        true
    }

    /// Folds one fragment of a `SEND_FRAGMENT` message into its reassembly, creating the
    /// reassembly on first arrival. Returns `false` if the fragment is malformed, stale, or
    /// outside the admission window.
    pub fn receive_fragment(&mut self, fragment: &FragmentHeader, data: &[u8]) -> bool {
        let start = fragment.start_seq;

        if let Some(&idx) = self.reliable_reassembly.get(&start) {
            if let Some(entry) = self.incoming_reliable_commands.get_mut(idx) {
                if let ReliablePayload::Fragmented(r) = &mut entry.payload {
                    return r.apply(fragment, data).is_ok();
                }
            }
            return false;
        }

        if self.reliable_is_stale(start) || self.find_reliable_index(start).is_some() {
            return false;
        }
        if fragment.fragment_count == 0 || !self.reliable_admissible(start) {
            return false;
        }

        let mut reassembly = Reassembly::new(fragment.fragment_count, fragment.total_length);
        if reassembly.apply(fragment, data).is_err() {
            return false;
        }

        let entry = IncomingReliable {
            reliable_seq: start,
            fragment_count: fragment.fragment_count,
            payload: ReliablePayload::Fragmented(reassembly),
        };
        self.insert_reliable_sorted(entry);
        true
    }

    fn insert_reliable_sorted(&mut self, entry: IncomingReliable) {
        let pos = self
            .incoming_reliable_commands
            .iter()
            .rposition(|c| seq::less_than_or_equal(c.reliable_seq, entry.reliable_seq))
            .map_or(0, |i| i + 1);
        self.incoming_reliable_commands.insert(pos, entry);
        self.rebuild_reassembly_index();
    }

    fn rebuild_reassembly_index(&mut self) {
        self.reliable_reassembly.clear();
        for (i, c) in self.incoming_reliable_commands.iter().enumerate() {
            if matches!(c.payload, ReliablePayload::Fragmented(_)) {
                self.reliable_reassembly.insert(c.reliable_seq, i);
            }
        }
    }

    /// Releases every reliable message now in order, advancing `incoming_reliable_seq` and
    /// resetting `incoming_unreliable_seq` each time. Returns the released payloads in order.
    pub fn dispatch_reliable(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        loop {
            let ready = match self.incoming_reliable_commands.front() {
                Some(c) if c.reliable_seq == self.incoming_reliable_seq.wrapping_add(1) => c.is_ready(),
                _ => false,
            };
            if !ready {
                break;
            }
            let entry = self.incoming_reliable_commands.pop_front().unwrap();
            self.incoming_reliable_seq = entry.reliable_seq.wrapping_add((entry.fragment_count - 1) as u16);
            self.incoming_unreliable_seq = 0;
            out.push(entry.into_packet());
        }
        if !out.is_empty() {
            self.rebuild_reassembly_index();
        }
        out
    }

    fn find_unreliable_index(&self, seq: u16) -> Option<usize> {
        self.incoming_unreliable_commands.iter().position(|c| c.unreliable_seq == seq)
    }

    /// Inserts an unfragmented `SEND_UNRELIABLE` command.
    pub fn receive_unreliable(&mut self, header_reliable_seq: u16, unreliable_seq: u16, data: Box<[u8]>) -> bool {
        if seq::less_than(header_reliable_seq, self.incoming_reliable_seq) {
            return false;
        }
        if header_reliable_seq == self.incoming_reliable_seq
            && seq::less_than(unreliable_seq, self.incoming_unreliable_seq)
        {
            return false;
        }
        if self.find_unreliable_index(unreliable_seq).is_some() {
            return false;
        }

        let entry = IncomingUnreliable {
            reliable_seq: header_reliable_seq,
            unreliable_seq,
            payload: UnreliablePayload::Whole(Packet::new(data, PacketFlags::UNRELIABLE)),
        };
        self.insert_unreliable_sorted(entry);
        true
    }

    /// Folds one fragment of a `SEND_UNRELIABLE_FRAGMENT` message into its reassembly.
    pub fn receive_unreliable_fragment(
        &mut self,
        header_reliable_seq: u16,
        fragment: &FragmentHeader,
        data: &[u8],
    ) -> bool {
        let start = fragment.start_seq;

        if let Some(&idx) = self.unreliable_reassembly.get(&start) {
            if let Some(entry) = self.incoming_unreliable_commands.get_mut(idx) {
                if let UnreliablePayload::Fragmented(r) = &mut entry.payload {
                    return r.apply(fragment, data).is_ok();
                }
            }
            return false;
        }

        if seq::less_than(header_reliable_seq, self.incoming_reliable_seq) {
            return false;
        }
        if fragment.fragment_count == 0 || self.find_unreliable_index(start).is_some() {
            return false;
        }

        let mut reassembly = Reassembly::new(fragment.fragment_count, fragment.total_length);
        if reassembly.apply(fragment, data).is_err() {
            return false;
        }

        let entry = IncomingUnreliable {
            reliable_seq: header_reliable_seq,
            unreliable_seq: start,
            payload: UnreliablePayload::Fragmented(reassembly),
        };
        self.insert_unreliable_sorted(entry);
        true
    }

    fn insert_unreliable_sorted(&mut self, entry: IncomingUnreliable) {
        let pos = self
            .incoming_unreliable_commands
            .iter()
            .rposition(|c| {
                c.reliable_seq == entry.reliable_seq && seq::less_than_or_equal(c.unreliable_seq, entry.unreliable_seq)
                    || seq::less_than(c.reliable_seq, entry.reliable_seq)
            })
            .map_or(0, |i| i + 1);
        self.incoming_unreliable_commands.insert(pos, entry);
        self.rebuild_unreliable_index();
    }

    fn rebuild_unreliable_index(&mut self) {
        self.unreliable_reassembly.clear();
        for (i, c) in self.incoming_unreliable_commands.iter().enumerate() {
            if matches!(c.payload, UnreliablePayload::Fragmented(_)) {
                self.unreliable_reassembly.insert(c.unreliable_seq, i);
            }
        }
    }

    /// Releases unreliable messages matching the channel's current reliable position, in
    /// unreliable-sequence order. Stale entries (behind the current reliable position) are
    /// dropped; entries ahead of it stop the walk; an incomplete fragmented entry at the front
    /// blocks further release until it completes or goes stale.
    pub fn dispatch_unreliable(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();
        loop {
            let action = match self.incoming_unreliable_commands.front() {
                None => break,
                Some(c) if seq::less_than(c.reliable_seq, self.incoming_reliable_seq) => 0,
                Some(c) if c.reliable_seq == self.incoming_reliable_seq => {
                    if c.is_ready() {
                        1
                    } else {
                        break;
                    }
                }
                Some(_) => break,
            };

            let entry = self.incoming_unreliable_commands.pop_front().unwrap();
            if action == 1 {
                self.incoming_unreliable_seq = entry.unreliable_seq.wrapping_add(1);
                out.push(entry.into_packet());
            }
        }
        if !out.is_empty() || self.incoming_unreliable_commands.is_empty() {
            self.rebuild_unreliable_index();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u16) -> CommandHeader {
        CommandHeader { channel_id: 0, reliable_seq: seq, ack_required: true, unsequenced: false }
    }

    #[test]
    fn in_order_reliable_dispatch() {
        let mut ch = Channel::new();
        ch.receive_reliable(&header(1), vec![1].into_boxed_slice());
        ch.receive_reliable(&header(2), vec![2].into_boxed_slice());
        let released = ch.dispatch_reliable();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].data(), &[1]);
        assert_eq!(released[1].data(), &[2]);
        assert_eq!(ch.incoming_reliable_seq, 2);
    }

    #[test]
    fn out_of_order_reliable_holds_until_gap_fills() {
        let mut ch = Channel::new();
        ch.receive_reliable(&header(2), vec![2].into_boxed_slice());
        assert!(ch.dispatch_reliable().is_empty());
        ch.receive_reliable(&header(1), vec![1].into_boxed_slice());
        let released = ch.dispatch_reliable();
        assert_eq!(released.len(), 2);
    }

    #[test]
    fn duplicate_reliable_rejected() {
        let mut ch = Channel::new();
        assert!(ch.receive_reliable(&header(1), vec![1].into_boxed_slice()));
        assert!(!ch.receive_reliable(&header(1), vec![9].into_boxed_slice()));
        ch.dispatch_reliable();
        assert!(!ch.receive_reliable(&header(1), vec![9].into_boxed_slice()));
    }

    #[test]
    fn fragment_reassembly_releases_once_complete() {
        let mut ch = Channel::new();
        let frag = |n: u32| FragmentHeader {
            start_seq: 1,
            fragment_count: 2,
            fragment_number: n,
            total_length: 4,
            fragment_offset: n * 2,
        };
        assert!(ch.receive_fragment(&frag(0), &[1, 2]));
        assert!(ch.dispatch_reliable().is_empty());
        assert!(ch.receive_fragment(&frag(1), &[3, 4]));
        let released = ch.dispatch_reliable();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].data(), &[1, 2, 3, 4]);
        assert_eq!(ch.incoming_reliable_seq, 2);
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let mut ch = Channel::new();
        let frag0 = FragmentHeader { start_seq: 1, fragment_count: 2, fragment_number: 0, total_length: 4, fragment_offset: 0 };
        let frag1 = FragmentHeader { start_seq: 1, fragment_count: 2, fragment_number: 1, total_length: 4, fragment_offset: 2 };
        assert!(ch.receive_fragment(&frag0, &[1, 2]));
        assert!(ch.receive_fragment(&frag0, &[9, 9]));
        assert!(ch.receive_fragment(&frag1, &[3, 4]));
        let released = ch.dispatch_reliable();
        assert_eq!(released[0].data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn unreliable_gap_tolerant_dispatch() {
        let mut ch = Channel::new();
        ch.receive_unreliable(0, 0, vec![0].into_boxed_slice());
        ch.receive_unreliable(0, 2, vec![2].into_boxed_slice());
        let released = ch.dispatch_unreliable();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].data(), &[0]);
        assert_eq!(released[1].data(), &[2]);
    }

    #[test]
    fn unreliable_stale_epoch_dropped() {
        let mut ch = Channel::new();
        ch.receive_unreliable(0, 5, vec![5].into_boxed_slice());
        ch.receive_reliable(&header(1), vec![1].into_boxed_slice());
        ch.dispatch_reliable();
        assert_eq!(ch.incoming_reliable_seq, 1);
        // The unreliable command tagged to reliable epoch 0 is now stale.
        assert!(ch.dispatch_unreliable().is_empty());
    }

    #[test]
    fn reliable_admission_window_rejects_far_future() {
        let ch = Channel::new();
        assert!(ch.reliable_admissible(1));
        assert!(!ch.reliable_admissible(FREE_RELIABLE_WINDOWS * RELIABLE_WINDOW_SIZE + 1));
    }
}
