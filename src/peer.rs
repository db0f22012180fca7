//! Per-peer protocol state: the connection state machine, the five outgoing/sent/ack command
//! queues, per-channel dispatch, RTT/throttle/loss tracking, and the unsequenced dedup window.

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::channel::Channel;
use crate::clock::Millis;
use crate::command::{Command, CommandData, CommandHeader, ConnectParams, FragmentHeader};
use crate::packet::{Packet, PacketFlags};
use crate::reliability::{LossEstimator, PacketThrottle, RttEstimator};

/// Maximum number of fragments a single message may be split into.
pub const MAX_FRAGMENT_COUNT: u32 = 1_048_576;

/// Channel id reserved for control commands (CONNECT, VERIFY_CONNECT, DISCONNECT, PING,
/// BANDWIDTH_LIMIT, THROTTLE_CONFIGURE) that aren't addressed to an application channel. Valid
/// per the `channelCount ∈ [1, 255]`, this value always falls outside the allocated range.
pub const CONTROL_CHANNEL: u8 = 0xFF;

/// Width, in bits, of the unsequenced duplicate-detection window (64 sub-windows of 1024 bits).
const UNSEQ_WINDOW_BITS: u32 = 64 * 1024;
/// Number of 1024-bit sub-windows the unsequenced window tolerates before it must be rotated.
const UNSEQ_FREE_WINDOWS: u32 = 32;

pub const DEFAULT_PING_INTERVAL: u32 = 500;
pub const DEFAULT_TIMEOUT_MIN: u32 = 5_000;
pub const DEFAULT_TIMEOUT_MAX: u32 = 30_000;
pub const DEFAULT_TIMEOUT_LIMIT: u32 = 32;

/// The peer connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AckConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AckDisconnect,
    Zombie,
}

impl PeerState {
    pub fn is_terminal_or_free(&self) -> bool {
        matches!(self, PeerState::Disconnected)
    }
}

/// One queued or in-flight wire command, owned by a peer's outgoing/sent lists.
pub struct OutgoingCommand {
    pub command: Command,
    pub packet: Option<Packet>,
    /// Bytes this command contributes to `reliable_data_in_transit` while sent-but-unacked.
    pub fragment_length: u32,
    pub send_attempts: u32,
    pub sent_time: Millis,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
}

impl OutgoingCommand {
    fn channel_id(&self) -> u8 {
        self.command.header.channel_id
    }

    fn reliable_seq(&self) -> u16 {
        self.command.header.reliable_seq
    }
}

/// A pending acknowledgement awaiting serialization.
pub struct AckRecord {
    pub channel_id: u8,
    pub reliable_seq: u16,
    pub sent_time_low: u16,
}

/// A fully reassembled, in-order message ready for `peer_recv`.
pub struct DispatchedMessage {
    pub channel_id: u8,
    pub packet: Packet,
}

/// Reasons an application-level send can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NotConnected,
    InvalidChannel,
    PacketTooLarge,
}

/// Tracks which unsequenced group numbers have already been delivered, within a rolling window.
struct UnseqWindow {
    bits: Box<[u64]>,
    last_clear_group: u16,
}

impl UnseqWindow {
    fn new() -> Self {
        UnseqWindow { bits: vec![0u64; (UNSEQ_WINDOW_BITS / 64) as usize].into_boxed_slice(), last_clear_group: 0 }
    }

    /// Returns `true` if `group` had not already been seen (and should be delivered), marking
    /// it seen. Rotates (zeroes) the whole window once the group number has advanced far enough
    /// that stale bits could otherwise collide with a future wraparound.
    fn check_and_set(&mut self, group: u16) -> bool {
        let advanced = group.wrapping_sub(self.last_clear_group) as u32;
        if advanced >= UNSEQ_FREE_WINDOWS * 1024 {
            for word in self.bits.iter_mut() {
                *word = 0;
            }
            self.last_clear_group = group;
        }

        let index = group as usize;
        let word = index / 64;
        let bit = 1u64 << (index % 64);
        let seen = self.bits[word] & bit != 0;
        self.bits[word] |= bit;
        !seen
    }
}

/// One remote endpoint's session state inside a [`Host`](crate::host::Host).
pub struct Peer {
    pub state: PeerState,
    pub address: SocketAddr,

    /// The id this host uses to address the peer in outgoing datagrams (the peer's own slot
    /// index on the *remote* host, learned during the handshake).
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub connect_id: u32,

    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub outgoing_data_total: u32,
    pub reliable_data_in_transit: u32,

    pub event_data: u32,
    pub user_data: Option<Box<dyn Any>>,

    channels: Vec<Channel>,
    outgoing_unseq_group: u16,
    unseq_window: UnseqWindow,
    control_reliable_seq: u16,
    /// Reliable seq of our outstanding `CONNECT`, while `Connecting`; cancelled once the matching
    /// `VERIFY_CONNECT` arrives, since that reply itself is proof of delivery.
    pub(crate) connect_command_seq: Option<u16>,

    outgoing_reliable_commands: VecDeque<OutgoingCommand>,
    outgoing_unreliable_commands: VecDeque<OutgoingCommand>,
    sent_reliable_commands: VecDeque<OutgoingCommand>,
    acks: VecDeque<AckRecord>,
    dispatched: VecDeque<DispatchedMessage>,
    pub needs_dispatch: bool,

    pub total_waiting_data: usize,

    pub rtt: RttEstimator,
    pub throttle: PacketThrottle,
    pub loss: LossEstimator,
    pub throttle_epoch: Millis,
    pub loss_epoch: Millis,

    pub last_receive_time: Millis,
    pub earliest_timeout: Option<Millis>,
    pub timeout_min: u32,
    pub timeout_max: u32,
    pub timeout_limit: u32,
    pub next_ping_time: Millis,
    pub ping_interval: u32,
}

impl Peer {
    pub fn new(address: SocketAddr, channel_count: u32, now: Millis) -> Self {
        Peer {
            state: PeerState::Disconnected,
            address,
            outgoing_peer_id: 0,
            incoming_session_id: 0,
            outgoing_session_id: 0,
            connect_id: 0,
            mtu: crate::DEFAULT_MTU,
            window_size: crate::MIN_WINDOW_SIZE,
            channel_count,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            outgoing_data_total: 0,
            reliable_data_in_transit: 0,
            event_data: 0,
            user_data: None,
            channels: (0..channel_count).map(|_| Channel::new()).collect(),
            outgoing_unseq_group: 0,
            unseq_window: UnseqWindow::new(),
            control_reliable_seq: 0,
            connect_command_seq: None,
            outgoing_reliable_commands: VecDeque::new(),
            outgoing_unreliable_commands: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            acks: VecDeque::new(),
            dispatched: VecDeque::new(),
            needs_dispatch: false,
            total_waiting_data: 0,
            rtt: RttEstimator::new(),
            throttle: PacketThrottle::new(),
            loss: LossEstimator::new(),
            throttle_epoch: now,
            loss_epoch: now,
            last_receive_time: now,
            earliest_timeout: None,
            timeout_min: DEFAULT_TIMEOUT_MIN,
            timeout_max: DEFAULT_TIMEOUT_MAX,
            timeout_limit: DEFAULT_TIMEOUT_LIMIT,
            next_ping_time: now + DEFAULT_PING_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// Resets this slot to a fresh `Disconnected` state, clearing every per-session counter.
    /// The slot's position in the host's peer array is unaffected — only its *contents* reset.
    pub fn reset(&mut self, now: Millis) {
        *self = Peer::new(self.address, 0, now);
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, PeerState::Connected | PeerState::DisconnectLater)
    }

    fn channel_mut(&mut self, channel_id: u8) -> Option<&mut Channel> {
        self.channels.get_mut(channel_id as usize)
    }

    // ---- Application-facing send path -------------------------------------------------

    /// Queues a packet for delivery on `channel_id`, splitting it into fragments if it exceeds
    /// the per-datagram payload budget (`mtu - header_size - command overhead`).
    ///
    /// `header_size` is the protocol datagram header only (see `DatagramHeader`); the budget
    /// additionally reserves [`crate::command::MAX_FRAGMENT_COMMAND_OVERHEAD`] so that whichever
    /// opcode this ends up as (whole or fragmented), its serialized wire size never exceeds what
    /// `drain_for_send` will admit into one carrier packet — the same chunk size the reference
    /// implementation derives from its fragment header size, used for both the "does this need
    /// to fragment" test and the per-fragment chunk length.
    pub fn send(&mut self, channel_id: u8, packet: Packet, header_size: u32, max_packet_size: u32) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        if channel_id as u32 >= self.channel_count {
            return Err(SendError::InvalidChannel);
        }
        if packet.len() as u32 > max_packet_size {
            return Err(SendError::PacketTooLarge);
        }

        let flags = packet.flags();
        let command_overhead = crate::command::MAX_FRAGMENT_COMMAND_OVERHEAD as u32;
        let payload_budget = self.mtu.saturating_sub(header_size).saturating_sub(command_overhead) as usize;

        if flags.unsequenced && !flags.reliable {
            if packet.len() > payload_budget {
                return Err(SendError::PacketTooLarge);
            }
            return Ok(self.queue_unsequenced(channel_id, packet));
        }

        let channel_unreliable_exhausted = self.channels[channel_id as usize].outgoing_unreliable_seq == 0xFFFF;
        let reliable = flags.reliable || channel_unreliable_exhausted;

        if packet.len() <= payload_budget {
            if reliable {
                self.queue_reliable_whole(channel_id, packet);
            } else {
                self.queue_unreliable_whole(channel_id, packet);
            }
            return Ok(());
        }

        let fragment_count = (packet.len() + payload_budget - 1) / payload_budget;
        if fragment_count as u32 > MAX_FRAGMENT_COUNT {
            return Err(SendError::PacketTooLarge);
        }

        if reliable {
            self.queue_reliable_fragments(channel_id, packet, payload_budget, fragment_count as u32);
        } else {
            self.queue_unreliable_fragments(channel_id, packet, payload_budget, fragment_count as u32);
        }
        Ok(())
    }

    fn queue_reliable_whole(&mut self, channel_id: u8, packet: Packet) {
        let seq = {
            let ch = &mut self.channels[channel_id as usize];
            ch.outgoing_reliable_seq = ch.outgoing_reliable_seq.wrapping_add(1);
            ch.outgoing_unreliable_seq = 0;
            ch.outgoing_reliable_seq
        };
        let len = packet.len() as u32;
        let header = CommandHeader { channel_id, reliable_seq: seq, ack_required: true, unsequenced: false };
        let data = CommandData::SendReliable { data: packet.data().into() };
        self.outgoing_reliable_commands.push_back(OutgoingCommand {
            command: Command { header, data },
            packet: Some(packet),
            fragment_length: len,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
        });
    }

    fn queue_reliable_fragments(&mut self, channel_id: u8, packet: Packet, chunk: usize, fragment_count: u32) {
        let start_seq = {
            let ch = &mut self.channels[channel_id as usize];
            ch.outgoing_reliable_seq = ch.outgoing_reliable_seq.wrapping_add(1);
            ch.outgoing_reliable_seq
        };
        let total_length = packet.len() as u32;

        for i in 0..fragment_count {
            let offset = i as usize * chunk;
            let end = (offset + chunk).min(packet.len());
            let seq = if i == 0 {
                start_seq
            } else {
                let ch = &mut self.channels[channel_id as usize];
                ch.outgoing_reliable_seq = ch.outgoing_reliable_seq.wrapping_add(1);
                ch.outgoing_reliable_seq
            };
            let fragment = FragmentHeader {
                start_seq,
                fragment_count,
                fragment_number: i,
                total_length,
                fragment_offset: offset as u32,
            };
            let header = CommandHeader { channel_id, reliable_seq: seq, ack_required: true, unsequenced: false };
            let data = CommandData::SendFragment { fragment, data: packet.slice(offset..end) };
            self.outgoing_reliable_commands.push_back(OutgoingCommand {
                command: Command { header, data },
                packet: Some(packet.clone()),
                fragment_length: (end - offset) as u32,
                send_attempts: 0,
                sent_time: 0,
                round_trip_timeout: 0,
                round_trip_timeout_limit: 0,
            });
        }
        self.channels[channel_id as usize].outgoing_unreliable_seq = 0;
    }

    fn queue_unreliable_whole(&mut self, channel_id: u8, packet: Packet) {
        let (reliable_tag, unreliable_seq) = {
            let ch = &mut self.channels[channel_id as usize];
            let useq = ch.outgoing_unreliable_seq;
            ch.outgoing_unreliable_seq = ch.outgoing_unreliable_seq.wrapping_add(1);
            (ch.outgoing_reliable_seq, useq)
        };
        let len = packet.len() as u32;
        let header = CommandHeader { channel_id, reliable_seq: reliable_tag, ack_required: false, unsequenced: false };
        let data = CommandData::SendUnreliable { unreliable_seq, data: packet.data().into() };
        self.outgoing_unreliable_commands.push_back(OutgoingCommand {
            command: Command { header, data },
            packet: Some(packet),
            fragment_length: len,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
        });
    }

    fn queue_unreliable_fragments(&mut self, channel_id: u8, packet: Packet, chunk: usize, fragment_count: u32) {
        let (reliable_tag, start_seq) = {
            let ch = &mut self.channels[channel_id as usize];
            let useq = ch.outgoing_unreliable_seq;
            ch.outgoing_unreliable_seq = ch.outgoing_unreliable_seq.wrapping_add(1);
            (ch.outgoing_reliable_seq, useq)
        };
        let total_length = packet.len() as u32;

        for i in 0..fragment_count {
            let offset = i as usize * chunk;
            let end = (offset + chunk).min(packet.len());
            let fragment = FragmentHeader {
                start_seq,
                fragment_count,
                fragment_number: i,
                total_length,
                fragment_offset: offset as u32,
            };
            let header = CommandHeader { channel_id, reliable_seq: reliable_tag, ack_required: false, unsequenced: false };
            let data = CommandData::SendUnreliableFragment { unreliable_seq: start_seq, fragment, data: packet.slice(offset..end) };
            self.outgoing_unreliable_commands.push_back(OutgoingCommand {
                command: Command { header, data },
                packet: Some(packet.clone()),
                fragment_length: (end - offset) as u32,
                send_attempts: 0,
                sent_time: 0,
                round_trip_timeout: 0,
                round_trip_timeout_limit: 0,
            });
        }
    }

    fn queue_unsequenced(&mut self, channel_id: u8, packet: Packet) {
        let group = self.outgoing_unseq_group;
        self.outgoing_unseq_group = self.outgoing_unseq_group.wrapping_add(1);
        let len = packet.len() as u32;
        let header = CommandHeader { channel_id, reliable_seq: 0, ack_required: false, unsequenced: true };
        let data = CommandData::SendUnsequenced { unseq_group: group, data: packet.data().into() };
        self.outgoing_unreliable_commands.push_back(OutgoingCommand {
            command: Command { header, data },
            packet: Some(packet),
            fragment_length: len,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
        });
    }

    // ---- Control-plane commands (CONNECT, VERIFY_CONNECT, DISCONNECT, PING, ...) -------------

    /// Queues a control command that requires acknowledgement and retransmission (CONNECT,
    /// VERIFY_CONNECT, DISCONNECT), returning the sequence number it was assigned so the caller
    /// can later cancel it (see [`Peer::cancel_control`]).
    pub fn queue_control_reliable(&mut self, data: CommandData) -> u16 {
        self.control_reliable_seq = self.control_reliable_seq.wrapping_add(1);
        let seq = self.control_reliable_seq;
        let header = CommandHeader { channel_id: CONTROL_CHANNEL, reliable_seq: seq, ack_required: true, unsequenced: false };
        self.outgoing_reliable_commands.push_back(OutgoingCommand {
            command: Command { header, data },
            packet: None,
            fragment_length: 0,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
        });
        seq
    }

    /// Queues a fire-and-forget control command (PING, BANDWIDTH_LIMIT, THROTTLE_CONFIGURE).
    pub fn queue_control_unreliable(&mut self, data: CommandData) {
        let header = CommandHeader { channel_id: CONTROL_CHANNEL, reliable_seq: 0, ack_required: false, unsequenced: false };
        self.outgoing_unreliable_commands.push_back(OutgoingCommand {
            command: Command { header, data },
            packet: None,
            fragment_length: 0,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
        });
    }

    /// Removes a previously queued-or-sent control command (e.g. the CONNECT a VERIFY_CONNECT
    /// answers, which supersedes the need for a separate ACKNOWLEDGE).
    pub fn cancel_control(&mut self, seq: u16) {
        self.outgoing_reliable_commands.retain(|c| !(c.channel_id() == CONTROL_CHANNEL && c.reliable_seq() == seq));
        self.sent_reliable_commands.retain(|c| !(c.channel_id() == CONTROL_CHANNEL && c.reliable_seq() == seq));
    }

    // ---- Service-loop drain -----------------------------------------------------

    /// Pulls acks and outgoing reliable/unreliable commands into a carrier packet's worth of
    /// wire commands, respecting the reliable admission window and the caller's MTU/command
    /// budget. Commands deferred by the window stay in place for the next call. Returns the
    /// commands to serialize, in order (acks first).
    pub fn drain_for_send(&mut self, now: Millis, max_commands: usize, budget_bytes: usize) -> Vec<Command> {
        let mut out = Vec::new();
        let mut used_bytes = 0usize;

        while let Some(ack) = self.acks.front() {
            if out.len() >= max_commands {
                break;
            }
            let cmd = Command {
                header: CommandHeader { channel_id: ack.channel_id, reliable_seq: ack.reliable_seq, ack_required: false, unsequenced: false },
                data: CommandData::Acknowledge { received_reliable_seq: ack.reliable_seq, received_sent_time: ack.sent_time_low },
            };
            let size = cmd.wire_size();
            if used_bytes + size > budget_bytes {
                break;
            }
            used_bytes += size;
            out.push(cmd);
            self.acks.pop_front();
        }

        // Reliable commands: admitted only if their channel's outgoing window allows it. We
        // scan front-to-back, re-queuing skipped commands so later, still-blocked commands keep
        // their relative order for the next drain.
        let mut deferred = VecDeque::new();
        while let Some(oc) = self.outgoing_reliable_commands.pop_front() {
            if out.len() >= max_commands {
                deferred.push_back(oc);
                continue;
            }
            let is_control = oc.channel_id() == CONTROL_CHANNEL;
            let admitted = is_control
                || (self.channels[oc.channel_id() as usize].outgoing_window_admits(oc.reliable_seq())
                    && self.reliable_data_in_transit + oc.fragment_length <= self.window_size);
            let size = oc.command.wire_size();
            if !admitted || used_bytes + size > budget_bytes {
                deferred.push_back(oc);
                continue;
            }

            used_bytes += size;
            if !is_control {
                self.channels[oc.channel_id() as usize].mark_reliable_in_flight(oc.reliable_seq());
                self.reliable_data_in_transit += oc.fragment_length;
            }
            self.loss.record_sent();
            self.outgoing_data_total += size as u32;

            let mut sent = oc;
            sent.sent_time = now;
            if sent.send_attempts == 0 {
                // First send attempt: derive the initial timeout from the live RTT estimate.
                // A requeued retransmission keeps the doubled timeout set by
                // `service_retransmits` instead of resetting it.
                sent.round_trip_timeout = self.rtt.round_trip_timeout();
                sent.round_trip_timeout_limit = sent.round_trip_timeout * self.timeout_limit;
            }
            sent.send_attempts += 1;
            out.push(sent.command.clone_for_wire());
            self.sent_reliable_commands.push_back(sent);
        }
        while let Some(oc) = deferred.pop_front() {
            self.outgoing_reliable_commands.push_back(oc);
        }

        while let Some(oc) = self.outgoing_unreliable_commands.pop_front() {
            if out.len() >= max_commands {
                // Unreliable traffic is best-effort: drop rather than hold the carrier packet.
                continue;
            }
            // The loss-reactive throttle only gates application traffic; control commands
            // (PING, BANDWIDTH_LIMIT, THROTTLE_CONFIGURE) always go out.
            if oc.channel_id() != CONTROL_CHANNEL && !self.throttle.admits(rand::random::<u32>()) {
                continue;
            }
            let size = oc.command.wire_size();
            if used_bytes + size > budget_bytes {
                continue;
            }
            used_bytes += size;
            self.outgoing_data_total += size as u32;
            out.push(oc.command.clone_for_wire());
        }

        out
    }

    /// Whether this peer still has reliable/unreliable/sent-reliable work pending (used to
    /// decide when `DisconnectLater` may advance to `Disconnecting`,).
    pub fn outgoing_queues_empty(&self) -> bool {
        self.outgoing_reliable_commands.is_empty()
            && self.outgoing_unreliable_commands.is_empty()
            && self.sent_reliable_commands.is_empty()
    }

    // ---- Acknowledgement + retransmit --------------------------------------------------

    pub fn queue_ack(&mut self, header: &CommandHeader, sent_time_low: u16) {
        self.acks.push_back(AckRecord { channel_id: header.channel_id, reliable_seq: header.reliable_seq, sent_time_low });
    }

    /// Whether every acknowledgement queued so far has already been drained into a carrier
    /// packet (used to tell when an `AckDisconnect` peer's lone outbound ack has gone out).
    pub fn acks_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Processes an ACKNOWLEDGE command: finds the matching sent-reliable command, removes it,
    /// samples RTT from its echoed send time, and updates the throttle.
    pub fn handle_acknowledge(&mut self, channel_id: u8, received_reliable_seq: u16, now: Millis) -> bool {
        let pos = self
            .sent_reliable_commands
            .iter()
            .position(|c| c.channel_id() == channel_id && c.reliable_seq() == received_reliable_seq);

        let Some(pos) = pos else { return false };
        let acked = self.sent_reliable_commands.remove(pos).unwrap();

        if channel_id != CONTROL_CHANNEL {
            self.channels[channel_id as usize].release_reliable_window(received_reliable_seq);
            self.reliable_data_in_transit = self.reliable_data_in_transit.saturating_sub(acked.fragment_length);
        }

        let sample_rtt = now.wrapping_sub(acked.sent_time);
        self.rtt.sample(sample_rtt);
        self.throttle.on_sample(sample_rtt, &self.rtt);

        true
    }

    /// Rolls the RTT/throttle interval and the (independent) loss interval forward if their
    /// respective periods have elapsed, per the periodic decay each tracker runs on.
    pub fn roll_estimator_intervals(&mut self, now: Millis) {
        if !crate::clock::less_than(now, self.throttle_epoch + self.throttle.interval) {
            self.rtt.roll_interval();
            self.throttle_epoch = now;
        }
        if !crate::clock::less_than(now, self.loss_epoch + crate::reliability::PACKET_LOSS_INTERVAL) {
            self.loss.roll_interval();
            self.loss_epoch = now;
        }
    }

    /// Walks sent-reliable commands whose retransmit deadline has passed, either requeueing them
    /// for another send attempt (doubling their timeout) or reporting the peer as timed out.
    pub fn service_retransmits(&mut self, now: Millis) -> bool {
        let mut i = 0;
        while i < self.sent_reliable_commands.len() {
            let deadline = self.sent_reliable_commands[i].sent_time + self.sent_reliable_commands[i].round_trip_timeout;
            if !crate::clock::less_than(now, deadline) {
                let earliest = *self.earliest_timeout.get_or_insert(now);
                let elapsed = now.wrapping_sub(earliest);
                let limited = self.sent_reliable_commands[i].round_trip_timeout >= self.sent_reliable_commands[i].round_trip_timeout_limit;

                if elapsed >= self.timeout_max || (limited && elapsed >= self.timeout_min) {
                    return true;
                }

                let mut oc = self.sent_reliable_commands.remove(i).unwrap();
                if oc.channel_id() != CONTROL_CHANNEL {
                    self.channels[oc.channel_id() as usize].release_reliable_window(oc.reliable_seq());
                    self.reliable_data_in_transit = self.reliable_data_in_transit.saturating_sub(oc.fragment_length);
                }
                self.loss.record_lost();
                oc.round_trip_timeout *= 2;
                self.outgoing_reliable_commands.push_front(oc);
            } else {
                i += 1;
            }
        }
        false
    }

    // ---- Incoming command handlers -----------------------------------------------------

    pub fn handle_ping(&self) {
        // No-op beyond having already updated `last_receive_time`; a PING exists purely to keep
        // the connection alive.
    }

    pub fn handle_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
    }

    pub fn handle_throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.throttle.interval = interval;
        self.throttle.acceleration = acceleration;
        self.throttle.deceleration = deceleration;
    }

    pub fn receive_reliable(&mut self, header: &CommandHeader, data: Box<[u8]>) {
        if let Some(ch) = self.channel_mut(header.channel_id) {
            ch.receive_reliable(header, data);
            self.drain_channel_dispatch(header.channel_id);
        }
    }

    pub fn receive_fragment(&mut self, header: &CommandHeader, fragment: &FragmentHeader, data: &[u8]) {
        if let Some(ch) = self.channel_mut(header.channel_id) {
            ch.receive_fragment(fragment, data);
            self.drain_channel_dispatch(header.channel_id);
        }
    }

    pub fn receive_unreliable(&mut self, header: &CommandHeader, unreliable_seq: u16, data: Box<[u8]>) {
        if let Some(ch) = self.channel_mut(header.channel_id) {
            ch.receive_unreliable(header.reliable_seq, unreliable_seq, data);
            self.drain_channel_dispatch(header.channel_id);
        }
    }

    pub fn receive_unreliable_fragment(&mut self, header: &CommandHeader, fragment: &FragmentHeader, data: &[u8]) {
        if let Some(ch) = self.channel_mut(header.channel_id) {
            ch.receive_unreliable_fragment(header.reliable_seq, fragment, data);
            self.drain_channel_dispatch(header.channel_id);
        }
    }

    pub fn receive_unsequenced(&mut self, channel_id: u8, unseq_group: u16, data: Box<[u8]>) {
        if self.unseq_window.check_and_set(unseq_group) {
            self.dispatched.push_back(DispatchedMessage {
                channel_id,
                packet: Packet::new(data, PacketFlags::UNSEQUENCED),
            });
            self.needs_dispatch = true;
        }
    }

    fn drain_channel_dispatch(&mut self, channel_id: u8) {
        let Some(ch) = self.channel_mut(channel_id) else { return };
        let mut released = ch.dispatch_reliable();
        released.extend(ch.dispatch_unreliable());
        if !released.is_empty() {
            self.needs_dispatch = true;
        }
        for packet in released {
            self.dispatched.push_back(DispatchedMessage { channel_id, packet });
        }
        // A reliable advance resets unreliable ordering; re-attempt in case commands already
        // queued on the channel are now releasable.
        if let Some(ch) = self.channel_mut(channel_id) {
            let more = ch.dispatch_unreliable();
            if !more.is_empty() {
                self.needs_dispatch = true;
            }
            for packet in more {
                self.dispatched.push_back(DispatchedMessage { channel_id, packet });
            }
        }
    }

    /// Pops the next application-visible message, if any (`peer_recv`).
    pub fn recv(&mut self) -> Option<(u8, Packet)> {
        self.dispatched.pop_front().map(|m| (m.channel_id, m.packet))
    }

    pub fn has_dispatched(&self) -> bool {
        !self.dispatched.is_empty()
    }

    // ---- Handshake parameter negotiation ------------------------

    pub fn negotiated_connect_params(&self, my_slot_id: u16) -> ConnectParams {
        ConnectParams {
            outgoing_peer_id: my_slot_id,
            incoming_session_id: self.incoming_session_id,
            outgoing_session_id: self.outgoing_session_id,
            mtu: self.mtu,
            window_size: self.window_size,
            channel_count: self.channel_count,
            incoming_bandwidth: self.incoming_bandwidth,
            outgoing_bandwidth: self.outgoing_bandwidth,
            packet_throttle_interval: self.throttle.interval,
            packet_throttle_acceleration: self.throttle.acceleration,
            packet_throttle_deceleration: self.throttle.deceleration,
            connect_id: self.connect_id,
            data: self.event_data,
        }
    }
}

impl Command {
    /// Clones a command for transmission, leaving the original (kept for retransmission
    /// bookkeeping) untouched.
    fn clone_for_wire(&self) -> Command {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12345)
    }

    fn connected_peer() -> Peer {
        let mut p = Peer::new(addr(), 2, 0);
        p.state = PeerState::Connected;
        p.window_size = 1 << 20;
        p
    }

    #[test]
    fn send_reliable_queues_one_command() {
        let mut p = connected_peer();
        let packet = Packet::new(vec![1, 2, 3].into_boxed_slice(), PacketFlags::RELIABLE);
        p.send(0, packet, 4, 1 << 20).unwrap();
        assert_eq!(p.outgoing_reliable_commands.len(), 1);
    }

    #[test]
    fn send_rejects_when_not_connected() {
        let mut p = Peer::new(addr(), 2, 0);
        let packet = Packet::new(vec![1].into_boxed_slice(), PacketFlags::RELIABLE);
        assert_eq!(p.send(0, packet, 4, 1 << 20), Err(SendError::NotConnected));
    }

    #[test]
    fn send_rejects_invalid_channel() {
        let mut p = connected_peer();
        let packet = Packet::new(vec![1].into_boxed_slice(), PacketFlags::RELIABLE);
        assert_eq!(p.send(9, packet, 4, 1 << 20), Err(SendError::InvalidChannel));
    }

    #[test]
    fn large_reliable_packet_fragments() {
        let mut p = connected_peer();
        // Comfortably past the per-datagram payload budget (mtu - header - fragment overhead)
        // at the default 1400-byte MTU, so this must split into multiple SEND_FRAGMENT commands.
        let data = vec![7u8; 2000].into_boxed_slice();
        let packet = Packet::new(data, PacketFlags::RELIABLE);
        p.send(0, packet, 4, 1 << 20).unwrap();
        assert!(p.outgoing_reliable_commands.len() > 1);
    }

    #[test]
    fn drain_respects_command_budget() {
        let mut p = connected_peer();
        for _ in 0..5 {
            let packet = Packet::new(vec![1].into_boxed_slice(), PacketFlags::RELIABLE);
            p.send(0, packet, 4, 1 << 20).unwrap();
        }
        let drained = p.drain_for_send(0, 3, 1 << 20);
        assert_eq!(drained.len(), 3);
        assert_eq!(p.outgoing_reliable_commands.len(), 2);
    }

    #[test]
    fn ack_releases_sent_command() {
        let mut p = connected_peer();
        let packet = Packet::new(vec![1].into_boxed_slice(), PacketFlags::RELIABLE);
        p.send(0, packet, 4, 1 << 20).unwrap();
        p.drain_for_send(0, 32, 1 << 20);
        assert_eq!(p.sent_reliable_commands.len(), 1);
        assert!(p.handle_acknowledge(0, 1, 100));
        assert!(p.sent_reliable_commands.is_empty());
    }

    #[test]
    fn unsequenced_dedup() {
        let mut p = connected_peer();
        p.receive_unsequenced(0, 5, vec![1].into_boxed_slice());
        p.receive_unsequenced(0, 5, vec![1].into_boxed_slice());
        assert!(p.recv().is_some());
        assert!(p.recv().is_none());
    }
}
