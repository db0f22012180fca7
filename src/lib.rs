//! A reliable, ordered, multi-channel message transport over UDP.
//!
//! A [`Host`] owns a fixed-size table of [`Peer`](peer::Peer) slots and a UDP socket (or any
//! [`Socket`](socket::Socket) implementation). Application code drives everything through a
//! single [`Host::service`] call per iteration: it drains outgoing traffic into carrier packets,
//! receives and parses inbound datagrams, runs the per-channel dispatch algorithm, and returns
//! at most one [`Event`] per call. Delivery on a channel is one of three disciplines chosen per
//! packet: reliable and ordered, unreliable but sequenced, or unreliable and unsequenced.
//!
//! The wire protocol is exchange-compatible with the ENet protocol family: 16-bit peer
//! addressing, big-endian fixed-layout commands, a CONNECT/VERIFY_CONNECT handshake, and an
//! RTT-driven packet throttle in place of congestion control.

mod channel;
mod clock;
mod command;
mod error;
mod host;
mod packet;
mod peer;
mod reliability;
mod seq;
pub mod socket;

pub use error::{ConnectError, SendError};
pub use host::{Event, Host, HostConfig};
pub use packet::{Packet, PacketFlags};
pub use peer::{Peer, PeerState};
pub use socket::{Socket, UdpTransport};

/// Default MTU assumed for a newly created peer, before the handshake negotiates otherwise.
pub const DEFAULT_MTU: u32 = 1400;
/// Smallest MTU the handshake will negotiate down to.
pub const MIN_MTU: u32 = 576;
/// Largest MTU the handshake will negotiate up to.
pub const MAX_MTU: u32 = 4096;

/// Largest single packet payload `Host::peer_send`/`Host::broadcast` will accept.
pub const MAX_PACKET_SIZE: u32 = 32 * 1024 * 1024;
/// Largest total size of inbound packets a single peer may have buffered awaiting dispatch.
pub const MAX_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Largest number of commands batched into one carrier packet.
pub const MAX_PACKET_COMMANDS: usize = 32;
/// Largest number of scratch buffers (1 header + 2 per command) one carrier packet assembles.
pub const BUFFER_MAX: usize = 1 + 2 * MAX_PACKET_COMMANDS;

/// Largest peer id the 12-bit peer-id wire field can carry.
pub const MAX_PEER_ID: u16 = 0xFFF;

pub const MIN_WINDOW_SIZE: u32 = 4096;
pub const MAX_WINDOW_SIZE: u32 = 65536;
/// Divisor used when deriving a negotiated peer window size from bandwidth caps during CONNECT.
pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;

/// Interval, in ms, at which `Host` recalculates per-peer bandwidth apportionment.
pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1_000;

/// Datagrams received per `Host::service` call before yielding back to the caller.
pub const MAX_DATAGRAMS_PER_SERVICE: usize = 256;
