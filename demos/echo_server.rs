use std::time::Duration;

use packetflow::{Event, Host, HostConfig, Packet, PacketFlags};

fn main() {
    // Bind locally on port 8888, with room for 8 concurrent connections and 2 channels each.
    let address = "127.0.0.1:8888".parse().unwrap();
    let config = HostConfig::new(8).channel_limit(2);
    let mut host = Host::bind(address, config).unwrap();

    loop {
        // Process inbound UDP frames and surface at most one event
        if let Some(event) = host.service(None).unwrap() {
            match event {
                Event::Connect { peer, .. } => {
                    println!("[{:?}] connected", host.peer_address(peer));
                }
                Event::Disconnect { peer, .. } => {
                    println!("[{:?}] disconnected", host.peer_address(peer));
                }
                Event::Receive { peer, packet, .. } => {
                    let packet_data_utf8 = std::str::from_utf8(packet.data()).unwrap();
                    let reversed_string: String = packet_data_utf8.chars().rev().collect();

                    println!("[{:?}] received \"{}\"", host.peer_address(peer), packet_data_utf8);

                    // Echo the packet reliably on channel 0
                    host.peer_send(peer, 0, Packet::new(packet.data().into(), PacketFlags::RELIABLE)).unwrap();
                    // Echo the reverse of the packet unreliably on channel 1
                    let reversed = reversed_string.into_bytes().into_boxed_slice();
                    host.peer_send(peer, 1, Packet::new(reversed, PacketFlags::UNRELIABLE)).unwrap();
                }
            }
        }

        // Flush outbound datagrams
        host.flush().unwrap();

        std::thread::sleep(Duration::from_millis(30));
    }
}
