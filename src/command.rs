//! The wire commands, their packed headers, and the opcode-indexed size table.
//!
//! Every UDP datagram is a protocol header (see [`crate::host`]) followed by a sequence of
//! commands. Each command begins with a 4-byte header (`{command byte, channel id, reliable
//! sequence number}`) followed by an opcode-specific tail. [`Command::write`] and
//! [`Command::read`] are exact inverses, field for field, big-endian, byte-packed — no reliance
//! on native struct layout.

const FLAG_ACK: u8 = 0x80;
const FLAG_UNSEQUENCED: u8 = 0x40;
const OPCODE_MASK: u8 = 0x0F;

/// The wire opcodes, packed into the low 4 bits of the command byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    None = 0,
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    SendUnsequenced = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
    SendUnreliableFragment = 12,
}

impl Opcode {
    fn from_u8(v: u8) -> Option<Opcode> {
        Some(match v {
            0 => Opcode::None,
            1 => Opcode::Acknowledge,
            2 => Opcode::Connect,
            3 => Opcode::VerifyConnect,
            4 => Opcode::Disconnect,
            5 => Opcode::Ping,
            6 => Opcode::SendReliable,
            7 => Opcode::SendUnreliable,
            8 => Opcode::SendFragment,
            9 => Opcode::SendUnsequenced,
            10 => Opcode::BandwidthLimit,
            11 => Opcode::ThrottleConfigure,
            12 => Opcode::SendUnreliableFragment,
            _ => return None,
        })
    }
}

/// The `{command byte, channel id, reliable sequence number}` header common to every command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHeader {
    pub channel_id: u8,
    pub reliable_seq: u16,
    pub ack_required: bool,
    pub unsequenced: bool,
}

/// Connection parameters carried by both `CONNECT` and `VERIFY_CONNECT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
    pub data: u32,
}

pub const CONNECT_PARAMS_SIZE: usize = 2 + 1 + 1 + 4 * 10;

/// The fixed-size fragment header shared by `SEND_FRAGMENT` and `SEND_UNRELIABLE_FRAGMENT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub start_seq: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

pub const FRAGMENT_HEADER_SIZE: usize = 2 + 4 * 4;

/// Worst-case per-command wire overhead (4-byte command header + fragment header + 2-byte
/// length field) a `SEND_FRAGMENT`/`SEND_UNRELIABLE_FRAGMENT` command costs beyond its payload.
/// Used to size the chunk a packet is split into so that a single fragment's serialized wire
/// size can never exceed the MTU budget `drain_for_send` enforces — matching how the reference
/// implementation derives its own `fragmentLength` from `sizeof(ENetProtocolSendFragment)`.
pub const MAX_FRAGMENT_COMMAND_OVERHEAD: usize = 4 + FRAGMENT_HEADER_SIZE + 2;

/// The opcode-specific tail of a command.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandData {
    None,
    Acknowledge { received_reliable_seq: u16, received_sent_time: u16 },
    Connect(ConnectParams),
    VerifyConnect(ConnectParams),
    Disconnect { data: u32 },
    Ping,
    SendReliable { data: Box<[u8]> },
    SendUnreliable { unreliable_seq: u16, data: Box<[u8]> },
    SendFragment { fragment: FragmentHeader, data: Box<[u8]> },
    SendUnreliableFragment { unreliable_seq: u16, fragment: FragmentHeader, data: Box<[u8]> },
    SendUnsequenced { unseq_group: u16, data: Box<[u8]> },
    BandwidthLimit { incoming_bandwidth: u32, outgoing_bandwidth: u32 },
    ThrottleConfigure { interval: u32, acceleration: u32, deceleration: u32 },
}

impl CommandData {
    fn opcode(&self) -> Opcode {
        match self {
            CommandData::None => Opcode::None,
            CommandData::Acknowledge { .. } => Opcode::Acknowledge,
            CommandData::Connect(_) => Opcode::Connect,
            CommandData::VerifyConnect(_) => Opcode::VerifyConnect,
            CommandData::Disconnect { .. } => Opcode::Disconnect,
            CommandData::Ping => Opcode::Ping,
            CommandData::SendReliable { .. } => Opcode::SendReliable,
            CommandData::SendUnreliable { .. } => Opcode::SendUnreliable,
            CommandData::SendFragment { .. } => Opcode::SendFragment,
            CommandData::SendUnreliableFragment { .. } => Opcode::SendUnreliableFragment,
            CommandData::SendUnsequenced { .. } => Opcode::SendUnsequenced,
            CommandData::BandwidthLimit { .. } => Opcode::BandwidthLimit,
            CommandData::ThrottleConfigure { .. } => Opcode::ThrottleConfigure,
        }
    }

    /// The size, in bytes, this command's tail will occupy on the wire (excluding the 4-byte
    /// header). Used both to validate inbound parsing and to account outbound bytes against the
    /// MTU while packing a carrier packet.
    pub fn wire_size(&self) -> usize {
        match self {
            CommandData::None => 0,
            CommandData::Acknowledge { .. } => 4,
            CommandData::Connect(_) | CommandData::VerifyConnect(_) => CONNECT_PARAMS_SIZE,
            CommandData::Disconnect { .. } => 4,
            CommandData::Ping => 0,
            CommandData::SendReliable { data } => 2 + data.len(),
            CommandData::SendUnreliable { data, .. } => 2 + 2 + data.len(),
            CommandData::SendFragment { data, .. } => FRAGMENT_HEADER_SIZE + 2 + data.len(),
            CommandData::SendUnreliableFragment { data, .. } => 2 + FRAGMENT_HEADER_SIZE + 2 + data.len(),
            CommandData::SendUnsequenced { data, .. } => 2 + 2 + data.len(),
            CommandData::BandwidthLimit { .. } => 8,
            CommandData::ThrottleConfigure { .. } => 12,
        }
    }
}

/// A fully parsed (or about-to-be-serialized) wire command.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub header: CommandHeader,
    pub data: CommandData,
}

impl Command {
    pub fn wire_size(&self) -> usize {
        4 + self.data.wire_size()
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let opcode = self.data.opcode();
        let mut command_byte = opcode as u8 & OPCODE_MASK;
        if self.header.ack_required {
            command_byte |= FLAG_ACK;
        }
        if self.header.unsequenced {
            command_byte |= FLAG_UNSEQUENCED;
        }

        out.push(command_byte);
        out.push(self.header.channel_id);
        write_u16(out, self.header.reliable_seq);

        match &self.data {
            CommandData::None | CommandData::Ping => {}
            CommandData::Acknowledge { received_reliable_seq, received_sent_time } => {
                write_u16(out, *received_reliable_seq);
                write_u16(out, *received_sent_time);
            }
            CommandData::Connect(params) | CommandData::VerifyConnect(params) => {
                write_connect_params(out, params);
            }
            CommandData::Disconnect { data } => write_u32(out, *data),
            CommandData::SendReliable { data } => {
                write_u16(out, data.len() as u16);
                out.extend_from_slice(data);
            }
            CommandData::SendUnreliable { unreliable_seq, data } => {
                write_u16(out, *unreliable_seq);
                write_u16(out, data.len() as u16);
                out.extend_from_slice(data);
            }
            CommandData::SendFragment { fragment, data } => {
                write_fragment_header(out, fragment);
                write_u16(out, data.len() as u16);
                out.extend_from_slice(data);
            }
            CommandData::SendUnreliableFragment { unreliable_seq, fragment, data } => {
                write_u16(out, *unreliable_seq);
                write_fragment_header(out, fragment);
                write_u16(out, data.len() as u16);
                out.extend_from_slice(data);
            }
            CommandData::SendUnsequenced { unseq_group, data } => {
                write_u16(out, *unseq_group);
                write_u16(out, data.len() as u16);
                out.extend_from_slice(data);
            }
            CommandData::BandwidthLimit { incoming_bandwidth, outgoing_bandwidth } => {
                write_u32(out, *incoming_bandwidth);
                write_u32(out, *outgoing_bandwidth);
            }
            CommandData::ThrottleConfigure { interval, acceleration, deceleration } => {
                write_u32(out, *interval);
                write_u32(out, *acceleration);
                write_u32(out, *deceleration);
            }
        }
    }

    /// Parses one command from the front of `data`, returning the command and the number of
    /// bytes consumed. Returns `None` on any malformed, truncated, or unknown-opcode input; the
    /// caller discards the whole datagram in that case (see `host::Host::handle_datagram`).
    pub fn read(data: &[u8]) -> Option<(Command, usize)> {
        if data.len() < 4 {
            return None;
        }

        let command_byte = data[0];
        let opcode = Opcode::from_u8(command_byte & OPCODE_MASK)?;
        let header = CommandHeader {
            channel_id: data[1],
            reliable_seq: read_u16(&data[2..4]),
            ack_required: command_byte & FLAG_ACK != 0,
            unsequenced: command_byte & FLAG_UNSEQUENCED != 0,
        };

        let tail = &data[4..];

        let (cmd_data, tail_size) = match opcode {
            Opcode::None => (CommandData::None, 0),
            Opcode::Ping => (CommandData::Ping, 0),
            Opcode::Acknowledge => {
                if tail.len() < 4 {
                    return None;
                }
                (
                    CommandData::Acknowledge {
                        received_reliable_seq: read_u16(&tail[0..2]),
                        received_sent_time: read_u16(&tail[2..4]),
                    },
                    4,
                )
            }
            Opcode::Connect => {
                let params = read_connect_params(tail)?;
                (CommandData::Connect(params), CONNECT_PARAMS_SIZE)
            }
            Opcode::VerifyConnect => {
                let params = read_connect_params(tail)?;
                (CommandData::VerifyConnect(params), CONNECT_PARAMS_SIZE)
            }
            Opcode::Disconnect => {
                if tail.len() < 4 {
                    return None;
                }
                (CommandData::Disconnect { data: read_u32(&tail[0..4]) }, 4)
            }
            Opcode::SendReliable => {
                if tail.len() < 2 {
                    return None;
                }
                let len = read_u16(&tail[0..2]) as usize;
                if tail.len() < 2 + len {
                    return None;
                }
                (CommandData::SendReliable { data: tail[2..2 + len].into() }, 2 + len)
            }
            Opcode::SendUnreliable => {
                if tail.len() < 4 {
                    return None;
                }
                let unreliable_seq = read_u16(&tail[0..2]);
                let len = read_u16(&tail[2..4]) as usize;
                if tail.len() < 4 + len {
                    return None;
                }
                (
                    CommandData::SendUnreliable { unreliable_seq, data: tail[4..4 + len].into() },
                    4 + len,
                )
            }
            Opcode::SendFragment => {
                if tail.len() < FRAGMENT_HEADER_SIZE + 2 {
                    return None;
                }
                let fragment = read_fragment_header(tail);
                let len = read_u16(&tail[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + 2]) as usize;
                let body_start = FRAGMENT_HEADER_SIZE + 2;
                if tail.len() < body_start + len {
                    return None;
                }
                (
                    CommandData::SendFragment { fragment, data: tail[body_start..body_start + len].into() },
                    body_start + len,
                )
            }
            Opcode::SendUnreliableFragment => {
                if tail.len() < 2 + FRAGMENT_HEADER_SIZE + 2 {
                    return None;
                }
                let unreliable_seq = read_u16(&tail[0..2]);
                let fragment = read_fragment_header(&tail[2..]);
                let len_off = 2 + FRAGMENT_HEADER_SIZE;
                let len = read_u16(&tail[len_off..len_off + 2]) as usize;
                let body_start = len_off + 2;
                if tail.len() < body_start + len {
                    return None;
                }
                (
                    CommandData::SendUnreliableFragment {
                        unreliable_seq,
                        fragment,
                        data: tail[body_start..body_start + len].into(),
                    },
                    body_start + len,
                )
            }
            Opcode::SendUnsequenced => {
                if tail.len() < 4 {
                    return None;
                }
                let unseq_group = read_u16(&tail[0..2]);
                let len = read_u16(&tail[2..4]) as usize;
                if tail.len() < 4 + len {
                    return None;
                }
                (
                    CommandData::SendUnsequenced { unseq_group, data: tail[4..4 + len].into() },
                    4 + len,
                )
            }
            Opcode::BandwidthLimit => {
                if tail.len() < 8 {
                    return None;
                }
                (
                    CommandData::BandwidthLimit {
                        incoming_bandwidth: read_u32(&tail[0..4]),
                        outgoing_bandwidth: read_u32(&tail[4..8]),
                    },
                    8,
                )
            }
            Opcode::ThrottleConfigure => {
                if tail.len() < 12 {
                    return None;
                }
                (
                    CommandData::ThrottleConfigure {
                        interval: read_u32(&tail[0..4]),
                        acceleration: read_u32(&tail[4..8]),
                        deceleration: read_u32(&tail[8..12]),
                    },
                    12,
                )
            }
        };

        Some((Command { header, data: cmd_data }, 4 + tail_size))
    }
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.push((v >> 8) as u8);
    out.push(v as u8);
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.push((v >> 24) as u8);
    out.push((v >> 16) as u8);
    out.push((v >> 8) as u8);
    out.push(v as u8);
}

fn read_u16(b: &[u8]) -> u16 {
    ((b[0] as u16) << 8) | (b[1] as u16)
}

fn read_u32(b: &[u8]) -> u32 {
    ((b[0] as u32) << 24) | ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | (b[3] as u32)
}

fn write_connect_params(out: &mut Vec<u8>, p: &ConnectParams) {
    write_u16(out, p.outgoing_peer_id);
    out.push(p.incoming_session_id);
    out.push(p.outgoing_session_id);
    write_u32(out, p.mtu);
    write_u32(out, p.window_size);
    write_u32(out, p.channel_count);
    write_u32(out, p.incoming_bandwidth);
    write_u32(out, p.outgoing_bandwidth);
    write_u32(out, p.packet_throttle_interval);
    write_u32(out, p.packet_throttle_acceleration);
    write_u32(out, p.packet_throttle_deceleration);
    write_u32(out, p.connect_id);
    write_u32(out, p.data);
}

fn read_connect_params(tail: &[u8]) -> Option<ConnectParams> {
    if tail.len() < CONNECT_PARAMS_SIZE {
        return None;
    }

    Some(ConnectParams {
        outgoing_peer_id: read_u16(&tail[0..2]),
        incoming_session_id: tail[2],
        outgoing_session_id: tail[3],
        mtu: read_u32(&tail[4..8]),
        window_size: read_u32(&tail[8..12]),
        channel_count: read_u32(&tail[12..16]),
        incoming_bandwidth: read_u32(&tail[16..20]),
        outgoing_bandwidth: read_u32(&tail[20..24]),
        packet_throttle_interval: read_u32(&tail[24..28]),
        packet_throttle_acceleration: read_u32(&tail[28..32]),
        packet_throttle_deceleration: read_u32(&tail[32..36]),
        connect_id: read_u32(&tail[36..40]),
        data: read_u32(&tail[40..44]),
    })
}

fn write_fragment_header(out: &mut Vec<u8>, f: &FragmentHeader) {
    write_u16(out, f.start_seq);
    write_u32(out, f.fragment_count);
    write_u32(out, f.fragment_number);
    write_u32(out, f.total_length);
    write_u32(out, f.fragment_offset);
}

fn read_fragment_header(tail: &[u8]) -> FragmentHeader {
    FragmentHeader {
        start_seq: read_u16(&tail[0..2]),
        fragment_count: read_u32(&tail[2..6]),
        fragment_number: read_u32(&tail[6..10]),
        total_length: read_u32(&tail[10..14]),
        fragment_offset: read_u32(&tail[14..18]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: Command) {
        let mut bytes = Vec::new();
        cmd.write(&mut bytes);
        assert_eq!(bytes.len(), cmd.wire_size());

        let (parsed, consumed) = Command::read(&bytes).expect("parse failed");
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, cmd);
    }

    fn header(ack: bool, unseq: bool) -> CommandHeader {
        CommandHeader { channel_id: 3, reliable_seq: 0xBEEF, ack_required: ack, unsequenced: unseq }
    }

    #[test]
    fn ping_roundtrip() {
        roundtrip(Command { header: header(false, false), data: CommandData::Ping });
    }

    #[test]
    fn acknowledge_roundtrip() {
        roundtrip(Command {
            header: header(false, false),
            data: CommandData::Acknowledge { received_reliable_seq: 42, received_sent_time: 4321 },
        });
    }

    #[test]
    fn connect_roundtrip() {
        let params = ConnectParams {
            outgoing_peer_id: 7,
            incoming_session_id: 1,
            outgoing_session_id: 2,
            mtu: 1400,
            window_size: 65536,
            channel_count: 4,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id: 0xDEADBEEF,
            data: 0,
        };
        roundtrip(Command { header: header(true, false), data: CommandData::Connect(params) });
        roundtrip(Command { header: header(true, false), data: CommandData::VerifyConnect(params) });
    }

    #[test]
    fn send_reliable_roundtrip() {
        roundtrip(Command {
            header: header(true, false),
            data: CommandData::SendReliable { data: vec![1, 2, 3, 4].into_boxed_slice() },
        });
    }

    #[test]
    fn send_fragment_roundtrip() {
        roundtrip(Command {
            header: header(true, false),
            data: CommandData::SendFragment {
                fragment: FragmentHeader {
                    start_seq: 10,
                    fragment_count: 3,
                    fragment_number: 1,
                    total_length: 3000,
                    fragment_offset: 1000,
                },
                data: vec![0u8; 1000].into_boxed_slice(),
            },
        });
    }

    #[test]
    fn send_unsequenced_roundtrip() {
        roundtrip(Command {
            header: header(false, true),
            data: CommandData::SendUnsequenced { unseq_group: 99, data: vec![9, 9].into_boxed_slice() },
        });
    }

    #[test]
    fn truncated_fails() {
        let cmd = Command {
            header: header(true, false),
            data: CommandData::SendReliable { data: vec![1, 2, 3].into_boxed_slice() },
        };
        let mut bytes = Vec::new();
        cmd.write(&mut bytes);

        for i in 0..bytes.len() {
            assert_eq!(Command::read(&bytes[..i]), None);
        }
    }

    #[test]
    fn unknown_opcode_fails() {
        let bytes = [0x0Fu8, 0, 0, 0];
        assert_eq!(Command::read(&bytes), None);
    }
}
