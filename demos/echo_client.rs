use std::time::Duration;

use packetflow::{Event, Host, HostConfig, Packet, PacketFlags};

fn main() {
    let config = HostConfig::new(1);
    let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();

    // Initiate the connection to the server
    let address = "127.0.0.1:8888".parse().unwrap();
    let peer = host.connect(address, 1, 0).expect("no free peer slots");

    let mut send_counter = 0;
    let mut message_counter = 0;

    loop {
        // Process inbound UDP frames and surface at most one event
        if let Some(event) = host.service(None).unwrap() {
            match event {
                Event::Connect { .. } => {
                    println!("connected to server");
                }
                Event::Disconnect { .. } => {
                    println!("disconnected from server");
                    break;
                }
                Event::Receive { packet, .. } => {
                    let packet_data_utf8 = std::str::from_utf8(packet.data()).unwrap();
                    println!("received \"{}\"", packet_data_utf8);
                }
            }
        }

        // Periodically send incrementing hello worlds on channel 0
        send_counter += 1;
        if send_counter == 10 {
            let packet_data: Box<[u8]> = format!("Hello world {}!", message_counter).into_bytes().into_boxed_slice();

            host.peer_send(peer, 0, Packet::new(packet_data, PacketFlags::UNRELIABLE)).unwrap();

            send_counter = 0;
            message_counter += 1;
        }

        // Flush outbound datagrams
        host.flush().unwrap();

        std::thread::sleep(Duration::from_millis(30));
    }
}
