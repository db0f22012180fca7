use std::net::SocketAddr;
use std::time::Duration;

use packetflow::{Event, Host, HostConfig, Packet, PacketFlags};

const NUM_CHANNELS: u32 = 4;

fn server_thread(addr: SocketAddr) -> Vec<md5::Digest> {
    let config = HostConfig::new(4).channel_limit(NUM_CHANNELS);
    let mut host = Host::bind(addr, config).unwrap();

    let mut all_data: Vec<Vec<u8>> = vec![Vec::new(); NUM_CHANNELS as usize];
    let mut disconnected = false;

    while !disconnected {
        match host.service(Some(Duration::from_millis(200))).unwrap() {
            Some(Event::Connect { .. }) => {}
            Some(Event::Receive { channel, packet, .. }) => {
                all_data[channel as usize].extend_from_slice(packet.data());
            }
            Some(Event::Disconnect { .. }) => {
                disconnected = true;
            }
            None => {}
        }
    }

    all_data.into_iter().map(md5::compute).collect()
}

fn client_thread(addr: SocketAddr) -> Vec<md5::Digest> {
    let config = HostConfig::new(1).channel_limit(NUM_CHANNELS);
    let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
    let peer = host.connect(addr, NUM_CHANNELS, 0).unwrap();

    let num_steps: usize = 100;
    let packets_per_step: usize = 10;
    let packet_size: usize = 400;

    let mut all_data: Vec<Vec<u8>> = vec![Vec::new(); NUM_CHANNELS as usize];
    let mut connected = false;
    let mut sent_counter: usize = 0;

    for _ in 0..num_steps {
        match host.service(Some(Duration::from_millis(5))).unwrap() {
            Some(Event::Connect { .. }) => connected = true,
            _ => {}
        }

        if connected {
            for _ in 0..packets_per_step {
                let channel = (sent_counter % NUM_CHANNELS as usize) as u8;
                sent_counter += 1;
                let data: Box<[u8]> = (0..packet_size).map(|b| b as u8).collect();
                all_data[channel as usize].extend_from_slice(&data);
                host.peer_send(peer, channel, Packet::new(data, PacketFlags::RELIABLE)).unwrap();
            }
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    host.peer_disconnect(peer, 0);

    loop {
        match host.service(Some(Duration::from_millis(200))).unwrap() {
            Some(Event::Disconnect { .. }) => break,
            _ => {}
        }
    }

    all_data.into_iter().map(md5::compute).collect()
}

#[test]
fn reliable_transfer_round_trips_in_order() {
    let server_addr: SocketAddr = "127.0.0.1:28881".parse().unwrap();

    let server = std::thread::spawn(move || server_thread(server_addr));
    std::thread::sleep(Duration::from_millis(100));
    let client = std::thread::spawn(move || client_thread(server_addr));

    let client_digests = client.join().unwrap();
    let server_digests = server.join().unwrap();

    assert_eq!(client_digests, server_digests);
}
