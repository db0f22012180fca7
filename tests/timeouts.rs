use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use packetflow::{Event, Host, HostConfig};

const STEP: Duration = Duration::from_millis(100);

/// A client connecting to an address with nothing listening never completes the handshake;
/// the retransmit/timeout machinery must still eventually surface a Disconnect so the slot
/// isn't held forever.
#[test]
fn connect_to_nothing_times_out() {
    let unreachable: SocketAddr = "127.0.0.1:28999".parse().unwrap();

    let config = HostConfig::new(1);
    let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
    let peer = host.connect(unreachable, 1, 0).unwrap();
    host.peer_timeout(peer, 50, 200, 4);

    let end = std::time::Instant::now() + Duration::from_secs(10);
    let mut disconnect_seen = false;

    while std::time::Instant::now() < end && !disconnect_seen {
        if let Some(Event::Disconnect { .. }) = host.service(Some(STEP)).unwrap() {
            disconnect_seen = true;
        }
    }

    assert!(disconnect_seen, "handshake attempt never timed out");
    assert_eq!(host.peer_state(peer), Some(packetflow::PeerState::Disconnected));
}

/// Once connected, a peer that goes silent (its remote process vanishes without sending
/// DISCONNECT) must still time out and free its slot.
#[test]
fn active_peer_times_out_after_remote_vanishes() {
    let addr: SocketAddr = "127.0.0.1:28998".parse().unwrap();

    let server = thread::spawn(move || {
        let config = HostConfig::new(2);
        let mut host = Host::bind(addr, config).unwrap();

        let mut peer = None;
        let end = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < end {
            if let Some(Event::Connect { peer: p, .. }) = host.service(Some(STEP)).unwrap() {
                peer = Some(p);
                break;
            }
        }
        let peer = peer.expect("server never saw a connect");
        host.peer_timeout(peer, 50, 200, 4);

        // Drop the socket (the peer on this side simply stops responding) without ever
        // sending DISCONNECT, simulating a crashed remote.
        drop(host);
    });

    thread::sleep(STEP);

    let client = thread::spawn(move || {
        let config = HostConfig::new(1);
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
        let peer = host.connect(addr, 1, 0).unwrap();
        host.peer_timeout(peer, 50, 200, 4);

        let end = std::time::Instant::now() + Duration::from_secs(10);
        let mut connected = false;
        let mut disconnect_seen = false;

        while std::time::Instant::now() < end && !disconnect_seen {
            match host.service(Some(STEP)).unwrap() {
                Some(Event::Connect { .. }) => connected = true,
                Some(Event::Disconnect { .. }) => disconnect_seen = true,
                _ => {}
            }
        }

        assert!(connected, "client never connected");
        assert!(disconnect_seen, "client never timed out after the server vanished");
    });

    server.join().unwrap();
    client.join().unwrap();
}
