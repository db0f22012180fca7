use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use packetflow::{Event, Host, HostConfig};

const STEP: Duration = Duration::from_millis(50);
const DURATION: Duration = Duration::from_secs(3);

#[test]
fn client_initiated_graceful_disconnect_reaches_server() {
    let addr: SocketAddr = "127.0.0.1:28891".parse().unwrap();

    let server = thread::spawn(move || {
        let config = HostConfig::new(2);
        let mut host = Host::bind(addr, config).unwrap();

        let mut connect_seen = false;
        let mut disconnect_seen = false;
        let end = std::time::Instant::now() + DURATION;

        while std::time::Instant::now() < end && !disconnect_seen {
            if let Some(event) = host.service(Some(STEP)).unwrap() {
                match event {
                    Event::Connect { .. } => {
                        assert!(!connect_seen);
                        connect_seen = true;
                    }
                    Event::Disconnect { .. } => {
                        assert!(connect_seen);
                        disconnect_seen = true;
                    }
                    other => panic!("unexpected event: {:?}", other),
                }
            }
        }

        assert!(connect_seen, "server never saw a connect");
        assert!(disconnect_seen, "server never saw a disconnect");
    });

    thread::sleep(STEP);

    let client = thread::spawn(move || {
        let config = HostConfig::new(1);
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
        let peer = host.connect(addr, 1, 0).unwrap();

        let end = std::time::Instant::now() + DURATION;
        let mut connected = false;

        while std::time::Instant::now() < end {
            if let Some(Event::Connect { .. }) = host.service(Some(STEP)).unwrap() {
                connected = true;
                break;
            }
        }

        assert!(connected, "client never connected");
        host.peer_disconnect(peer, 0);

        let end = std::time::Instant::now() + DURATION;
        while std::time::Instant::now() < end {
            host.service(Some(STEP)).unwrap();
        }
    });

    client.join().unwrap();
    server.join().unwrap();
}

#[test]
fn disconnect_carries_trailing_reliable_data() {
    let addr: SocketAddr = "127.0.0.1:28892".parse().unwrap();

    let server = thread::spawn(move || {
        let config = HostConfig::new(2);
        let mut host = Host::bind(addr, config).unwrap();

        let mut received = None;
        let mut disconnect_seen = false;
        let end = std::time::Instant::now() + DURATION;

        while std::time::Instant::now() < end && !disconnect_seen {
            if let Some(event) = host.service(Some(STEP)).unwrap() {
                match event {
                    Event::Connect { .. } => {}
                    Event::Receive { packet, .. } => {
                        received = Some(packet.data().to_vec());
                    }
                    Event::Disconnect { .. } => {
                        disconnect_seen = true;
                    }
                }
            }
        }

        assert_eq!(received, Some(vec![0, 1, 2, 3]));
        assert!(disconnect_seen);
    });

    thread::sleep(STEP);

    let client = thread::spawn(move || {
        let config = HostConfig::new(1);
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
        let peer = host.connect(addr, 1, 0).unwrap();

        let end = std::time::Instant::now() + DURATION;
        let mut connected = false;

        while std::time::Instant::now() < end {
            if let Some(Event::Connect { .. }) = host.service(Some(STEP)).unwrap() {
                connected = true;
                break;
            }
        }

        assert!(connected);

        host.peer_send(
            peer,
            0,
            packetflow::Packet::new(vec![0, 1, 2, 3].into_boxed_slice(), packetflow::PacketFlags::RELIABLE),
        )
        .unwrap();
        host.peer_disconnect(peer, 0);

        let end = std::time::Instant::now() + DURATION;
        while std::time::Instant::now() < end {
            host.service(Some(STEP)).unwrap();
        }
    });

    client.join().unwrap();
    server.join().unwrap();
}
