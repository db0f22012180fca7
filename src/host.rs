//! The orchestrator: a fixed-size table of [`Peer`] slots driven by one [`Socket`] and a single
//! [`Host::service`] call per iteration.
//!
//! A carrier datagram is a 2-byte (or 4-byte, with a piggybacked sent-time) protocol header
//! followed by a run of wire commands (see [`crate::command`]). The header's 12-bit peer id field
//! is the index the *recipient* uses to find its own `Peer` slot for the sender — each side learns
//! the other's slot index during the CONNECT/VERIFY_CONNECT handshake and addresses it from then
//! on (see `negotiated_connect_params`). Before that id is known, `UNASSIGNED_PEER_ID` is used and
//! the recipient must fall back to matching on `(address, connect_id)`.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;

use crate::clock::{Clock, Millis};
use crate::command::{Command, CommandData, CommandHeader, ConnectParams};
use crate::error::ConnectError;
use crate::packet::Packet;
use crate::peer::{Peer, PeerState, SendError, CONTROL_CHANNEL};
use crate::socket::{Socket, UdpTransport};

/// Sentinel peer id meaning "look at the embedded CONNECT command, not the table". The
/// 12-bit wire field tops out at `MAX_PEER_ID`, which is therefore always free for this purpose.
const UNASSIGNED_PEER_ID: u16 = crate::MAX_PEER_ID;

const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
const HEADER_PEER_ID_MASK: u16 = 0x0FFF;

/// Identifies one peer slot. Stable for the lifetime of a connection; reused (with a fresh
/// generation of protocol state, not a fresh index) once that connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub usize);

/// A single notable thing that happened during a [`Host::service`] call.
#[derive(Debug)]
pub enum Event {
    Connect { peer: PeerId, data: u32 },
    Disconnect { peer: PeerId, data: u32 },
    Receive { peer: PeerId, channel: u8, packet: Packet },
}

/// Construction-time parameters for a [`Host`], mirroring the builder the rest of the ambient
/// stack uses for anything with more than two or three knobs.
#[derive(Debug, Clone)]
pub struct HostConfig {
    peer_count: usize,
    channel_limit: u32,
    incoming_bandwidth: u32,
    outgoing_bandwidth: u32,
    mtu: u32,
    max_packet_size: u32,
    max_waiting_data: usize,
    duplicate_peer_limit: u32,
}

impl HostConfig {
    /// Starts a config for a host with room for `peer_count` simultaneous connections, unlimited
    /// bandwidth, and every other knob at its protocol default.
    pub fn new(peer_count: usize) -> Self {
        HostConfig {
            peer_count,
            channel_limit: 255,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: crate::DEFAULT_MTU,
            max_packet_size: crate::MAX_PACKET_SIZE,
            max_waiting_data: crate::MAX_WAITING_DATA,
            duplicate_peer_limit: crate::MAX_PEER_ID as u32,
        }
    }

    /// Caps how many simultaneous connections from the same source IP (distinguished by connect
    /// id) this host will accept. Defaults to effectively unlimited.
    pub fn duplicate_peer_limit(mut self, limit: u32) -> Self {
        self.duplicate_peer_limit = limit;
        self
    }

    pub fn channel_limit(mut self, limit: u32) -> Self {
        self.channel_limit = limit;
        self
    }

    pub fn incoming_bandwidth(mut self, bytes_per_sec: u32) -> Self {
        self.incoming_bandwidth = bytes_per_sec;
        self
    }

    pub fn outgoing_bandwidth(mut self, bytes_per_sec: u32) -> Self {
        self.outgoing_bandwidth = bytes_per_sec;
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu.clamp(crate::MIN_MTU, crate::MAX_MTU);
        self
    }

    pub fn max_packet_size(mut self, max: u32) -> Self {
        self.max_packet_size = max;
        self
    }

    pub fn max_waiting_data(mut self, max: usize) -> Self {
        self.max_waiting_data = max;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.peer_count > 0
            && self.channel_limit >= 1
            && self.channel_limit <= 255
            && self.mtu >= crate::MIN_MTU
            && self.mtu <= crate::MAX_MTU
    }
}

/// Outer protocol header: who this datagram is for, and (optionally) when it was sent.
struct DatagramHeader {
    peer_id: u16,
    session_id: u8,
    compressed: bool,
    sent_time: Option<u16>,
}

impl DatagramHeader {
    fn write(&self, out: &mut Vec<u8>) {
        let mut h = self.peer_id & HEADER_PEER_ID_MASK;
        h |= (self.session_id as u16 & 0x3) << 12;
        if self.compressed {
            h |= HEADER_FLAG_COMPRESSED;
        }
        if self.sent_time.is_some() {
            h |= HEADER_FLAG_SENT_TIME;
        }
        out.push((h >> 8) as u8);
        out.push(h as u8);
        if let Some(t) = self.sent_time {
            out.push((t >> 8) as u8);
            out.push(t as u8);
        }
    }

    fn read(data: &[u8]) -> Option<(DatagramHeader, usize)> {
        if data.len() < 2 {
            return None;
        }
        let h = ((data[0] as u16) << 8) | (data[1] as u16);
        let has_time = h & HEADER_FLAG_SENT_TIME != 0;
        let (sent_time, consumed) = if has_time {
            if data.len() < 4 {
                return None;
            }
            (Some(((data[2] as u16) << 8) | (data[3] as u16)), 4)
        } else {
            (None, 2)
        };
        Some((
            DatagramHeader {
                peer_id: h & HEADER_PEER_ID_MASK,
                session_id: ((h >> 12) & 0x3) as u8,
                compressed: h & HEADER_FLAG_COMPRESSED != 0,
                sent_time,
            },
            consumed,
        ))
    }

    /// Largest size a header for this host could take, for MTU budgeting.
    const MAX_SIZE: usize = 4;
}

/// A paired compress/decompress hook, installed with [`Host::set_compressor`]. Neither side of
/// the pair is specified by the protocol beyond "reversible"; callers own the algorithm.
pub struct Compressor {
    pub compress: Box<dyn Fn(&[u8]) -> Vec<u8>>,
    pub decompress: Box<dyn Fn(&[u8]) -> Option<Vec<u8>>>,
}

/// A fixed-size table of [`Peer`] slots, serviced through one [`Socket`].
///
/// `S` defaults to [`UdpTransport`]; substitute an in-memory [`Socket`] impl in tests to simulate
/// latency or loss without binding two real sockets (see `tests/`).
pub struct Host<S: Socket = UdpTransport> {
    socket: S,
    clock: Clock,
    peers: Vec<Peer>,
    config: HostConfig,
    dispatch_queue: VecDeque<usize>,
    rng: rand::rngs::ThreadRng,

    compressor: Option<Compressor>,
    checksum: Option<Box<dyn Fn(&[u8]) -> u32>>,
    intercept: Option<Box<dyn FnMut(SocketAddr, &[u8]) -> bool>>,

    recalculate_bandwidth_limits: bool,
    bandwidth_throttle_epoch: Millis,

    duplicate_peers_seen: usize,
    scratch: Vec<u8>,
}

impl Host<UdpTransport> {
    /// Binds a UDP socket at `addr` and wraps it in a `Host`.
    pub fn bind(addr: SocketAddr, config: HostConfig) -> io::Result<Self> {
        let socket = UdpTransport::bind(addr)?;
        Ok(Host::new(socket, config))
    }
}

impl<S: Socket> Host<S> {
    pub fn new(socket: S, config: HostConfig) -> Self {
        assert!(config.is_valid(), "invalid HostConfig");
        let clock = Clock::new();
        let now = clock.now_ms();
        let addr_placeholder = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Host {
            socket,
            clock,
            peers: (0..config.peer_count).map(|_| Peer::new(addr_placeholder, 0, now)).collect(),
            config,
            dispatch_queue: VecDeque::new(),
            rng: rand::thread_rng(),
            compressor: None,
            checksum: None,
            intercept: None,
            recalculate_bandwidth_limits: false,
            bandwidth_throttle_epoch: now,
            duplicate_peers_seen: 0,
            scratch: Vec::with_capacity(4096),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_compressor(&mut self, compressor: Compressor) {
        self.compressor = Some(compressor);
    }

    pub fn set_checksum(&mut self, checksum: Box<dyn Fn(&[u8]) -> u32>) {
        self.checksum = Some(checksum);
    }

    /// Installs a hook run on every inbound datagram before normal protocol processing; returning
    /// `true` tells the host the datagram was fully handled and should not be parsed further.
    pub fn set_intercept(&mut self, intercept: Box<dyn FnMut(SocketAddr, &[u8]) -> bool>) {
        self.intercept = Some(intercept);
    }

    pub fn bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.config.incoming_bandwidth = incoming_bandwidth;
        self.config.outgoing_bandwidth = outgoing_bandwidth;
        self.recalculate_bandwidth_limits = true;
    }

    pub fn channel_limit(&mut self, limit: u32) {
        self.config.channel_limit = limit.clamp(1, 255);
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.iter().filter(|p| p.is_connected()).count()
    }

    pub fn bandwidth_limited_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.is_connected() && (p.incoming_bandwidth != 0 || p.outgoing_bandwidth != 0))
            .count()
    }

    pub fn duplicate_peers(&self) -> usize {
        self.duplicate_peers_seen
    }

    pub fn peer_state(&self, id: PeerId) -> Option<PeerState> {
        self.peers.get(id.0).map(|p| p.state)
    }

    pub fn peer_address(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.get(id.0).map(|p| p.address)
    }

    /// Attaches an opaque, application-owned value to a peer slot; carried across the
    /// connection's lifetime and cleared when the slot resets.
    pub fn set_peer_user_data(&mut self, id: PeerId, data: Box<dyn std::any::Any>) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            peer.user_data = Some(data);
        }
    }

    pub fn peer_user_data(&self, id: PeerId) -> Option<&(dyn std::any::Any)> {
        self.peers.get(id.0).and_then(|p| p.user_data.as_deref())
    }

    // ---- Application-facing connection lifecycle -----------------------------------------

    /// Begins connecting to `address` on `channel_count` channels, queuing a CONNECT handshake.
    /// Returns the slot the connection will occupy; `Event::Connect` fires once VERIFY_CONNECT
    /// comes back.
    pub fn connect(&mut self, address: SocketAddr, channel_count: u32, data: u32) -> Result<PeerId, ConnectError> {
        if channel_count == 0 || channel_count > self.config.channel_limit {
            return Err(ConnectError::InvalidChannelCount);
        }
        let slot = self
            .peers
            .iter()
            .position(|p| p.state.is_terminal_or_free())
            .ok_or(ConnectError::NoAvailableSlots)?;

        let now = self.clock.now_ms();
        let connect_id = self.rng.gen();
        let mut peer = Peer::new(address, channel_count, now);
        peer.state = PeerState::Connecting;
        peer.connect_id = connect_id;
        peer.event_data = data;
        peer.incoming_bandwidth = self.config.incoming_bandwidth;
        peer.outgoing_bandwidth = self.config.outgoing_bandwidth;
        peer.mtu = self.config.mtu;

        let params = peer.negotiated_connect_params(slot as u16);
        self.peers[slot] = peer;
        let seq = self.peers[slot].queue_control_reliable(CommandData::Connect(params));
        self.peers[slot].connect_command_seq = Some(seq);

        Ok(PeerId(slot))
    }

    pub fn peer_send(&mut self, id: PeerId, channel: u8, packet: Packet) -> Result<(), SendError> {
        let peer = self.peers.get_mut(id.0).ok_or(SendError::NotConnected)?;
        peer.send(channel, packet, DatagramHeader::MAX_SIZE as u32, self.config.max_packet_size)
    }

    pub fn peer_recv(&mut self, id: PeerId) -> Option<(u8, Packet)> {
        self.peers.get_mut(id.0).and_then(|p| p.recv())
    }

    pub fn peer_ping(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            if peer.is_connected() {
                peer.queue_control_reliable(CommandData::Ping);
            }
        }
    }

    pub fn peer_ping_interval(&mut self, id: PeerId, interval_ms: u32) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            peer.ping_interval = interval_ms;
        }
    }

    pub fn peer_timeout(&mut self, id: PeerId, min: u32, max: u32, limit: u32) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            peer.timeout_min = min;
            peer.timeout_max = max;
            peer.timeout_limit = limit;
        }
    }

    pub fn peer_throttle_configure(&mut self, id: PeerId, interval: u32, acceleration: u32, deceleration: u32) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            peer.throttle.interval = interval;
            peer.throttle.acceleration = acceleration;
            peer.throttle.deceleration = deceleration;
            peer.queue_control_unreliable(CommandData::ThrottleConfigure { interval, acceleration, deceleration });
        }
    }

    /// Disconnects once every already-queued reliable send has been acknowledged.
    pub fn peer_disconnect_later(&mut self, id: PeerId, data: u32) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            if peer.is_connected() {
                peer.event_data = data;
                peer.state = PeerState::DisconnectLater;
            }
        }
    }

    /// Disconnects gracefully: queues a reliable DISCONNECT and waits for the peer to ack it.
    pub fn peer_disconnect(&mut self, id: PeerId, data: u32) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            if peer.state != PeerState::Disconnected && peer.state != PeerState::Zombie {
                peer.queue_control_reliable(CommandData::Disconnect { data });
                peer.state = PeerState::Disconnecting;
            }
        }
    }

    /// Drops the connection immediately, without notifying the peer.
    pub fn peer_disconnect_now(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(id.0) {
            let now = self.clock.now_ms();
            peer.reset(now);
        }
    }

    pub fn peer_reset(&mut self, id: PeerId) {
        self.peer_disconnect_now(id);
    }

    pub fn broadcast(&mut self, channel: u8, packet: Packet) {
        let header_size = DatagramHeader::MAX_SIZE as u32;
        let max_size = self.config.max_packet_size;
        for peer in self.peers.iter_mut().filter(|p| p.is_connected()) {
            let _ = peer.send(channel, packet.clone(), header_size, max_size);
        }
    }

    // ---- The service loop ----------------------------------------------------------------

    /// Runs one iteration of the service loop: flushes outgoing traffic, drains and processes
    /// whatever is already waiting on the socket, and returns the first `Event` produced. If
    /// nothing is ready and `timeout` is `Some`, blocks on the socket for at most that long before
    /// giving up and returning `Ok(None)`.
    pub fn service(&mut self, timeout: Option<Duration>) -> io::Result<Option<Event>> {
        if let Some(event) = self.dispatch_ready_event() {
            return Ok(Some(event));
        }

        self.flush()?;

        if let Some(event) = self.next_zombie_event() {
            return Ok(Some(event));
        }
        if let Some(event) = self.receive_available()? {
            return Ok(Some(event));
        }
        if let Some(event) = self.dispatch_ready_event() {
            return Ok(Some(event));
        }

        if let Some(timeout) = timeout {
            // The socket is nonblocking (see `UdpTransport::bind`), so a bounded wait is done
            // by polling rather than by a blocking `recv_from`: `set_read_timeout` has no effect
            // on a socket already in nonblocking mode.
            let deadline = std::time::Instant::now() + timeout;
            loop {
                if let Some(event) = self.receive_available()? {
                    return Ok(Some(event));
                }
                let now = std::time::Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(Duration::from_millis(5)));
            }
        }

        Ok(self.dispatch_ready_event())
    }

    /// Sends everything queued without receiving or blocking. Useful right before dropping a
    /// `Host` to make sure a just-queued DISCONNECT actually leaves the socket.
    pub fn flush(&mut self) -> io::Result<()> {
        let now = self.clock.now_ms();
        self.maybe_recalculate_bandwidth(now);
        self.service_pings_and_timeouts(now);
        self.send_outgoing(now)?;
        Ok(())
    }

    fn dispatch_ready_event(&mut self) -> Option<Event> {
        while let Some(&idx) = self.dispatch_queue.front() {
            let Some(peer) = self.peers.get_mut(idx) else {
                self.dispatch_queue.pop_front();
                continue;
            };
            if let Some((channel, packet)) = peer.recv() {
                if !peer.has_dispatched() {
                    self.dispatch_queue.pop_front();
                }
                return Some(Event::Receive { peer: PeerId(idx), channel, packet });
            }
            self.dispatch_queue.pop_front();
        }
        None
    }

    fn service_pings_and_timeouts(&mut self, now: Millis) {
        for idx in 0..self.peers.len() {
            let peer = &mut self.peers[idx];
            if peer.state.is_terminal_or_free() {
                continue;
            }
            peer.roll_estimator_intervals(now);
            if peer.is_connected() && !crate::clock::less_than(now, peer.next_ping_time) {
                // Acknowledge-required, so an otherwise-silent connection still accumulates a
                // sent_reliable_commands entry for service_retransmits to age out on timeout.
                peer.queue_control_reliable(CommandData::Ping);
                peer.next_ping_time = now + peer.ping_interval;
            }
            if peer.service_retransmits(now) {
                peer.state = PeerState::Zombie;
                continue;
            }
            if peer.state == PeerState::DisconnectLater && peer.outgoing_queues_empty() {
                peer.queue_control_reliable(CommandData::Disconnect { data: peer.event_data });
                peer.state = PeerState::Disconnecting;
            }
        }
    }

    fn maybe_recalculate_bandwidth(&mut self, now: Millis) {
        if !self.recalculate_bandwidth_limits {
            return;
        }
        if crate::clock::less_than(now, self.bandwidth_throttle_epoch + crate::BANDWIDTH_THROTTLE_INTERVAL) {
            return;
        }
        self.bandwidth_throttle_epoch = now;

        let connected: Vec<usize> = (0..self.peers.len()).filter(|&i| self.peers[i].is_connected()).collect();
        if connected.is_empty() {
            self.recalculate_bandwidth_limits = false;
            return;
        }

        // Apportion this host's outgoing cap across connected peers in proportion to how much
        // each has queued, falling back to an even split once nobody has anything outstanding.
        let total_outgoing: u64 = connected.iter().map(|&i| self.peers[i].outgoing_data_total as u64).sum();
        for &i in &connected {
            let share = if self.config.outgoing_bandwidth == 0 {
                0
            } else if total_outgoing == 0 {
                self.config.outgoing_bandwidth / connected.len() as u32
            } else {
                ((self.config.outgoing_bandwidth as u64 * self.peers[i].outgoing_data_total as u64) / total_outgoing) as u32
            };
            let incoming = self.config.incoming_bandwidth;
            self.peers[i].queue_control_unreliable(CommandData::BandwidthLimit {
                incoming_bandwidth: incoming,
                outgoing_bandwidth: share,
            });
        }
        for &i in &connected {
            self.peers[i].outgoing_data_total = 0;
        }
        self.recalculate_bandwidth_limits = false;
    }

    fn send_outgoing(&mut self, now: Millis) -> io::Result<()> {
        for idx in 0..self.peers.len() {
            if self.peers[idx].state.is_terminal_or_free() {
                continue;
            }
            let address = self.peers[idx].address;
            let budget = (self.peers[idx].mtu as usize).saturating_sub(DatagramHeader::MAX_SIZE);
            let commands = self.peers[idx].drain_for_send(now, crate::MAX_PACKET_COMMANDS, budget);

            if self.peers[idx].state == PeerState::AckDisconnect && self.peers[idx].acks_empty() {
                // The single outbound ack an AckDisconnect peer owes has just been drained into
                // `commands` below; once it's on the wire this slot is dead.
                self.peers[idx].state = PeerState::Zombie;
            }

            if commands.is_empty() {
                continue;
            }

            let sent_time_low = (now & 0xFFFF) as u16;
            // Until VERIFY_CONNECT tells us the remote's slot id, address it with the sentinel
            // so it falls back to matching on `(address, connect_id)`.
            let peer_id = if self.peers[idx].state == PeerState::Connecting {
                UNASSIGNED_PEER_ID
            } else {
                self.peers[idx].outgoing_peer_id
            };
            let header = DatagramHeader {
                peer_id,
                session_id: self.peers[idx].outgoing_session_id,
                compressed: self.compressor.is_some(),
                sent_time: Some(sent_time_low),
            };

            self.scratch.clear();
            header.write(&mut self.scratch);
            let body_start = self.scratch.len();
            for cmd in &commands {
                cmd.write(&mut self.scratch);
            }

            if let Some(compressor) = &self.compressor {
                let compressed_body = (compressor.compress)(&self.scratch[body_start..]);
                self.scratch.truncate(body_start);
                self.scratch.extend_from_slice(&compressed_body);
            }

            if let Some(checksum) = &self.checksum {
                let value = checksum(&self.scratch);
                self.scratch.push((value >> 24) as u8);
                self.scratch.push((value >> 16) as u8);
                self.scratch.push((value >> 8) as u8);
                self.scratch.push(value as u8);
            }

            self.socket.send_to(&self.scratch, address)?;
        }
        Ok(())
    }

    fn receive_available(&mut self) -> io::Result<Option<Event>> {
        let mut buf = vec![0u8; crate::MAX_MTU as usize + 64];
        for _ in 0..crate::MAX_DATAGRAMS_PER_SERVICE {
            let Some((n, from)) = self.socket.recv_from(&mut buf)? else {
                return Ok(None);
            };

            if let Some(intercept) = &mut self.intercept {
                if intercept(from, &buf[..n]) {
                    continue;
                }
            }

            if let Some(event) = self.handle_datagram(from, &buf[..n]) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn handle_datagram(&mut self, from: SocketAddr, data: &[u8]) -> Option<Event> {
        let mut body = data;
        let verified;
        if let Some(checksum) = &self.checksum {
            if body.len() < 4 {
                return None;
            }
            let split = body.len() - 4;
            let (payload, trailer) = body.split_at(split);
            let expected = ((trailer[0] as u32) << 24) | ((trailer[1] as u32) << 16) | ((trailer[2] as u32) << 8) | trailer[3] as u32;
            if checksum(payload) != expected {
                return None;
            }
            verified = payload.to_vec();
            body = &verified;
        }

        let (header, consumed) = DatagramHeader::read(body)?;
        let mut tail = &body[consumed..];

        let decompressed;
        if header.compressed {
            let decompressor = self.compressor.as_ref()?;
            decompressed = (decompressor.decompress)(tail)?;
            tail = &decompressed;
        }

        let now = self.clock.now_ms();

        if header.peer_id == UNASSIGNED_PEER_ID {
            return self.handle_unassigned_datagram(from, header.session_id, tail, now);
        }

        let idx = header.peer_id as usize;
        if idx >= self.peers.len() || self.peers[idx].address != from || self.peers[idx].state.is_terminal_or_free() {
            return None;
        }
        self.peers[idx].last_receive_time = now;

        let mut commands = tail;
        while !commands.is_empty() {
            let Some((cmd, used)) = Command::read(commands) else { break };
            commands = &commands[used..];
            if let Some(event) = self.handle_command(idx, &cmd, now) {
                return Some(event);
            }
        }
        None
    }

    /// A datagram addressed with the "no slot known yet" sentinel: only CONNECT (a brand new
    /// peer) or a retransmitted CONNECT/VERIFY_CONNECT for a handshake already in flight can
    /// legally arrive this way.
    fn handle_unassigned_datagram(&mut self, from: SocketAddr, session_id: u8, tail: &[u8], now: Millis) -> Option<Event> {
        let (cmd, _) = Command::read(tail)?;
        match cmd.data {
            CommandData::Connect(params) => self.handle_connect(from, session_id, params, now),
            CommandData::VerifyConnect(params) => {
                let idx = self.peers.iter().position(|p| p.address == from && p.connect_id == params.connect_id)?;
                self.handle_verify_connect(idx, params, now)
            }
            _ => None,
        }
    }

    fn handle_connect(&mut self, from: SocketAddr, incoming_session_id: u8, params: ConnectParams, now: Millis) -> Option<Event> {
        if params.channel_count == 0 || params.channel_count > 255 {
            return None;
        }

        if let Some(existing) = self.peers.iter().position(|p| p.address == from && p.connect_id == params.connect_id) {
            // Retransmitted CONNECT for a handshake already underway; the VERIFY_CONNECT already
            // queued will reach them on the next send.
            let _ = existing;
            return None;
        }

        let same_host_peers = self.peers.iter().filter(|p| p.address.ip() == from.ip() && p.is_connected()).count() as u32;
        if same_host_peers >= self.config.duplicate_peer_limit {
            return None;
        }

        let slot = self.peers.iter().position(|p| p.state.is_terminal_or_free());
        let Some(slot) = slot else { return None };

        if same_host_peers > 0 {
            self.duplicate_peers_seen += 1;
        }

        let channel_count = params.channel_count.clamp(1, self.config.channel_limit);
        let mtu = params.mtu.clamp(crate::MIN_MTU, crate::MAX_MTU).min(self.config.mtu);
        let window_size = negotiate_window_size(self.config.outgoing_bandwidth, params.incoming_bandwidth);

        let mut peer = Peer::new(from, channel_count, now);
        peer.state = PeerState::AckConnect;
        peer.connect_id = params.connect_id;
        peer.event_data = params.data;
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_session_id = incoming_session_id;
        peer.outgoing_session_id = params.outgoing_session_id.wrapping_add(1) & 0x3;
        peer.mtu = mtu;
        peer.window_size = window_size;
        peer.incoming_bandwidth = self.config.incoming_bandwidth;
        peer.outgoing_bandwidth = params.incoming_bandwidth;
        peer.throttle.interval = params.packet_throttle_interval;
        peer.throttle.acceleration = params.packet_throttle_acceleration;
        peer.throttle.deceleration = params.packet_throttle_deceleration;

        let reply = peer.negotiated_connect_params(slot as u16);
        self.peers[slot] = peer;
        self.peers[slot].queue_control_reliable(CommandData::VerifyConnect(reply));
        self.peers[slot].state = PeerState::AckConnect;

        None
    }

    fn handle_verify_connect(&mut self, idx: usize, params: ConnectParams, now: Millis) -> Option<Event> {
        let peer = &mut self.peers[idx];
        if peer.state != PeerState::Connecting {
            return None;
        }

        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.outgoing_session_id = params.outgoing_session_id;
        peer.channel_count = peer.channel_count.min(params.channel_count);
        peer.mtu = peer.mtu.min(params.mtu);
        peer.window_size = negotiate_window_size(peer.outgoing_bandwidth, params.incoming_bandwidth);
        peer.outgoing_bandwidth = params.incoming_bandwidth;
        peer.throttle.interval = params.packet_throttle_interval;
        peer.throttle.acceleration = params.packet_throttle_acceleration;
        peer.throttle.deceleration = params.packet_throttle_deceleration;
        if let Some(seq) = peer.connect_command_seq.take() {
            peer.cancel_control(seq);
        }
        peer.state = PeerState::Connected;
        peer.last_receive_time = now;

        let data = peer.event_data;
        self.dispatch_queue.push_back(idx);
        Some(Event::Connect { peer: PeerId(idx), data })
    }

    fn handle_command(&mut self, idx: usize, cmd: &Command, now: Millis) -> Option<Event> {
        let header = &cmd.header;
        if header.ack_required {
            let sent_time_low = (now & 0xFFFF) as u16;
            self.peers[idx].queue_ack(header, sent_time_low);
        }

        match &cmd.data {
            CommandData::None => None,
            CommandData::Acknowledge { received_reliable_seq, .. } => {
                let acked = self.peers[idx].handle_acknowledge(header.channel_id, *received_reliable_seq, now);
                if acked && header.channel_id == CONTROL_CHANNEL && self.peers[idx].state == PeerState::AckConnect {
                    // The ack just consumed is for our VERIFY_CONNECT: the handshake is complete
                    // on this (the accepting) side.
                    self.peers[idx].state = PeerState::Connected;
                    self.peers[idx].last_receive_time = now;
                    let data = self.peers[idx].event_data;
                    self.dispatch_queue.push_back(idx);
                    return Some(Event::Connect { peer: PeerId(idx), data });
                }
                self.maybe_advance_disconnecting(idx)
            }
            CommandData::Connect(_) => None,
            CommandData::VerifyConnect(params) => self.handle_verify_connect(idx, *params, now),
            CommandData::Disconnect { data } => {
                let peer = &mut self.peers[idx];
                if peer.state != PeerState::Disconnected {
                    peer.event_data = *data;
                    // If this command required an ack, one was already queued above; let it
                    // drain out on the next send before killing the slot (`AckDisconnect`),
                    // otherwise the sender never learns its DISCONNECT landed and just spins
                    // retransmitting it until its own idle timeout gives up.
                    if peer.is_connected() && header.ack_required {
                        peer.state = PeerState::AckDisconnect;
                    } else {
                        peer.state = PeerState::Zombie;
                    }
                }
                None
            }
            CommandData::Ping => {
                self.peers[idx].handle_ping();
                None
            }
            CommandData::SendReliable { data } => {
                self.peers[idx].receive_reliable(header, data.clone());
                self.note_dispatch(idx);
                None
            }
            CommandData::SendUnreliable { unreliable_seq, data } => {
                self.peers[idx].receive_unreliable(header, *unreliable_seq, data.clone());
                self.note_dispatch(idx);
                None
            }
            CommandData::SendFragment { fragment, data } => {
                self.peers[idx].receive_fragment(header, fragment, data);
                self.note_dispatch(idx);
                None
            }
            CommandData::SendUnreliableFragment { fragment, data, .. } => {
                self.peers[idx].receive_unreliable_fragment(header, fragment, data);
                self.note_dispatch(idx);
                None
            }
            CommandData::SendUnsequenced { unseq_group, data } => {
                self.peers[idx].receive_unsequenced(header.channel_id, *unseq_group, data.clone());
                self.note_dispatch(idx);
                None
            }
            CommandData::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                self.peers[idx].handle_bandwidth_limit(*incoming_bandwidth, *outgoing_bandwidth);
                None
            }
            CommandData::ThrottleConfigure { interval, acceleration, deceleration } => {
                self.peers[idx].handle_throttle_configure(*interval, *acceleration, *deceleration);
                None
            }
        }
    }

    fn note_dispatch(&mut self, idx: usize) {
        if self.peers[idx].needs_dispatch {
            self.peers[idx].needs_dispatch = false;
            if !self.dispatch_queue.contains(&idx) {
                self.dispatch_queue.push_back(idx);
            }
        }
    }

    /// A slot that timed out locally sits in `Zombie` ("slot dead, event pending") until the
    /// next `service()` call surfaces its Disconnect event and frees it back to `Disconnected`.
    fn next_zombie_event(&mut self) -> Option<Event> {
        for idx in 0..self.peers.len() {
            if self.peers[idx].state == PeerState::Zombie {
                let data = self.peers[idx].event_data;
                let now = self.clock.now_ms();
                self.peers[idx].reset(now);
                self.dispatch_queue.retain(|&i| i != idx);
                return Some(Event::Disconnect { peer: PeerId(idx), data });
            }
        }
        None
    }

    fn maybe_advance_disconnecting(&mut self, idx: usize) -> Option<Event> {
        let peer = &mut self.peers[idx];
        if peer.state == PeerState::Disconnecting && peer.outgoing_queues_empty() {
            let data = peer.event_data;
            let now = self.clock.now_ms();
            peer.reset(now);
            self.dispatch_queue.retain(|&i| i != idx);
            return Some(Event::Disconnect { peer: PeerId(idx), data });
        }
        None
    }
}

/// Derives a negotiated window size from the pair's bandwidth caps, clamped to the
/// protocol's legal window-size range.
fn negotiate_window_size(outgoing_bandwidth: u32, peer_incoming_bandwidth: u32) -> u32 {
    let cap = match (outgoing_bandwidth, peer_incoming_bandwidth) {
        (0, 0) => return crate::MIN_WINDOW_SIZE,
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    };
    let scaled = (cap as u64 * crate::MIN_WINDOW_SIZE as u64 / crate::WINDOW_SIZE_SCALE as u64) as u32;
    scaled.clamp(crate::MIN_WINDOW_SIZE, crate::MAX_WINDOW_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketFlags;
    use std::cell::RefCell;
    use std::collections::VecDeque as Queue;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A socket whose recv queue is a direct handle to a shared queue the *other* socket pushes
    /// into, so two of these can stand in for a real loopback UDP pair in tests.
    struct DirectSocket {
        local: SocketAddr,
        recv_queue: std::rc::Rc<RefCell<Queue<(Vec<u8>, SocketAddr)>>>,
        send_queue: std::rc::Rc<RefCell<Queue<(Vec<u8>, SocketAddr)>>>,
    }

    impl Socket for DirectSocket {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }
        fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
            self.send_queue.borrow_mut().push_back((buf.to_vec(), self.local));
            Ok(buf.len())
        }
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
            match self.recv_queue.borrow_mut().pop_front() {
                Some((data, from)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(Some((data.len(), from)))
                }
                None => Ok(None),
            }
        }
        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    fn direct_pair() -> (DirectSocket, DirectSocket) {
        let a_to_b = std::rc::Rc::new(RefCell::new(Queue::new()));
        let b_to_a = std::rc::Rc::new(RefCell::new(Queue::new()));
        let a = DirectSocket { local: addr(1), recv_queue: b_to_a.clone(), send_queue: a_to_b.clone() };
        let b = DirectSocket { local: addr(2), recv_queue: a_to_b, send_queue: b_to_a };
        (a, b)
    }

    fn pump(hosts: &mut [&mut Host<DirectSocket>], rounds: usize) -> Vec<Event> {
        let mut events = Vec::new();
        for _ in 0..rounds {
            for host in hosts.iter_mut() {
                while let Some(event) = host.service(None).unwrap() {
                    events.push(event);
                }
            }
        }
        events
    }

    #[test]
    fn handshake_completes_both_sides() {
        let (sock_a, sock_b) = direct_pair();
        let mut a = Host::new(sock_a, HostConfig::new(4));
        let mut b = Host::new(sock_b, HostConfig::new(4));

        let peer_on_a = a.connect(addr(2), 2, 7).unwrap();
        let events = pump(&mut [&mut a, &mut b], 6);

        assert!(events.iter().any(|e| matches!(e, Event::Connect { data: 7, .. })));
        assert_eq!(a.peer_state(peer_on_a), Some(PeerState::Connected));
        assert!(b.connected_peers() >= 1);
    }

    #[test]
    fn reliable_message_round_trips_after_handshake() {
        let (sock_a, sock_b) = direct_pair();
        let mut a = Host::new(sock_a, HostConfig::new(4));
        let mut b = Host::new(sock_b, HostConfig::new(4));

        let peer_on_a = a.connect(addr(2), 2, 0).unwrap();
        pump(&mut [&mut a, &mut b], 6);

        let packet = Packet::new(b"hello".to_vec().into_boxed_slice(), PacketFlags::RELIABLE);
        a.peer_send(peer_on_a, 0, packet).unwrap();
        let events = pump(&mut [&mut a, &mut b], 6);

        let received = events.iter().find_map(|e| match e {
            Event::Receive { channel, packet, .. } => Some((*channel, packet.data().to_vec())),
            _ => None,
        });
        assert_eq!(received, Some((0, b"hello".to_vec())));
    }

    #[test]
    fn disconnect_reaches_peer() {
        let (sock_a, sock_b) = direct_pair();
        let mut a = Host::new(sock_a, HostConfig::new(4));
        let mut b = Host::new(sock_b, HostConfig::new(4));

        let peer_on_a = a.connect(addr(2), 1, 0).unwrap();
        pump(&mut [&mut a, &mut b], 6);

        a.peer_disconnect(peer_on_a, 99);
        let events = pump(&mut [&mut a, &mut b], 6);

        assert!(events.iter().any(|e| matches!(e, Event::Disconnect { data: 99, .. })));
    }

    #[test]
    fn window_size_negotiation_clamps_to_legal_range() {
        assert_eq!(negotiate_window_size(0, 0), crate::MIN_WINDOW_SIZE);
        assert!(negotiate_window_size(u32::MAX, u32::MAX) <= crate::MAX_WINDOW_SIZE);
        assert!(negotiate_window_size(1, 1) >= crate::MIN_WINDOW_SIZE);
    }

    #[test]
    fn duplicate_peer_limit_rejects_past_cap() {
        let (sock_a, sock_b) = direct_pair();
        let mut a = Host::new(sock_a, HostConfig::new(4));
        let mut b = Host::new(sock_b, HostConfig::new(4).duplicate_peer_limit(1));

        let first = a.connect(addr(2), 1, 1).unwrap();
        pump(&mut [&mut a, &mut b], 6);
        assert_eq!(a.peer_state(first), Some(PeerState::Connected));
        assert_eq!(b.connected_peers(), 1);

        // A second CONNECT from the same source IP while one peer is already connected must be
        // silently dropped once the cap (1) is reached: no slot allocated, no VERIFY_CONNECT.
        let second = a.connect(addr(2), 1, 2).unwrap();
        let events = pump(&mut [&mut a, &mut b], 6);

        assert!(!events.iter().any(|e| matches!(e, Event::Connect { data: 2, .. })));
        assert_eq!(b.connected_peers(), 1);
        let _ = second;
    }

    #[test]
    fn zombie_slot_surfaces_disconnect_and_frees_slot() {
        let (sock_a, sock_b) = direct_pair();
        let mut a = Host::new(sock_a, HostConfig::new(4));
        let mut b = Host::new(sock_b, HostConfig::new(4));

        let peer_on_a = a.connect(addr(2), 1, 0).unwrap();
        pump(&mut [&mut a, &mut b], 6);
        assert_eq!(a.peer_state(peer_on_a), Some(PeerState::Connected));

        a.peer_timeout(peer_on_a, 1, 4, 2);
        a.peer_ping(peer_on_a);

        // Stop servicing `b` entirely so `a` never receives another ack and eventually gives up.
        // round_trip_timeout starts near the 500ms default RTT and doubles each missed cycle, so
        // give this a few seconds of generous margin.
        let mut saw_disconnect = false;
        for _ in 0..600 {
            if let Some(Event::Disconnect { .. }) = a.service(None).unwrap() {
                saw_disconnect = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(saw_disconnect, "idle peer never surfaced a Disconnect after giving up");
        assert_eq!(a.peer_state(peer_on_a), Some(PeerState::Disconnected));
    }
}
