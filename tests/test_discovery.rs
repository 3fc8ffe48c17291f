
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;

use instant::Duration;
use lockstep::{
    Connected, Discovery, DiscoveryConfig, LockstepError, SessionBuilder, PROTOCOL_MAGIC,
};
use serial_test::serial;
use stubs::StateStub;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loopback_config(broadcast_port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        broadcast_addr: Ipv4Addr::LOCALHOST,
        broadcast_port,
        base_port: broadcast_port + 1,
        port_range: 8,
        rebroadcast_interval: Some(Duration::from_millis(10)),
    }
}

/// A hand-driven peer that speaks the discovery protocol through a plain socket.
struct RawPeer {
    socket: UdpSocket,
    broadcast: SocketAddr,
}

impl RawPeer {
    fn new(broadcast_port: u16) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.set_nonblocking(true).unwrap();
        Self {
            socket,
            broadcast: SocketAddr::from((Ipv4Addr::LOCALHOST, broadcast_port)),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn send_code(&self, code: u32, target: SocketAddr) {
        let mut bytes = code.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0xdead_beef_u32.to_le_bytes());
        self.socket.send_to(&bytes, target).unwrap();
    }

    fn announce(&self) {
        self.send_code(42, self.broadcast);
    }

    /// Every discovery code received so far, with its sender.
    fn received(&self) -> Vec<(u32, SocketAddr)> {
        let mut buffer = [0; 64];
        let mut codes = Vec::new();
        while let Ok((len, src)) = self.socket.recv_from(&mut buffer) {
            assert_eq!(len, 8);
            codes.push((
                u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]),
                src,
            ));
        }
        codes
    }
}

/// Polls for a while and collects what the raw peer got meanwhile. `discovery` must not connect.
fn poll_for(discovery: &mut Discovery, peer: &RawPeer, rounds: usize) -> Vec<(u32, SocketAddr)> {
    let mut codes = Vec::new();
    for _ in 0..rounds {
        assert!(discovery.poll().unwrap().is_none());
        thread::sleep(Duration::from_millis(2));
        codes.extend(peer.received());
    }
    codes
}

fn poll_until_connected(discovery: &mut Discovery) -> Connected {
    for _ in 0..1_000 {
        if let Some(connected) = discovery.poll().unwrap() {
            return connected;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("discovery did not connect");
}

fn poll_pair(a: &mut Discovery, b: &mut Discovery) -> (Connected, Connected) {
    let mut found_a = None;
    let mut found_b = None;
    for _ in 0..5_000 {
        if found_a.is_none() {
            found_a = a.poll().unwrap();
        }
        if found_b.is_none() {
            found_b = b.poll().unwrap();
        }
        if found_a.is_some() && found_b.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    (
        found_a.expect("first peer did not connect"),
        found_b.expect("second peer did not connect"),
    )
}

#[test]
#[serial]
fn test_discover_on_loopback() {
    init_logger();
    let mut a = Discovery::begin(loopback_config(47_900)).unwrap();
    let mut b = Discovery::begin(loopback_config(47_900)).unwrap();

    let (conn_a, conn_b) = poll_pair(&mut a, &mut b);

    assert_eq!(conn_a.peer_addr(), conn_b.local_addr());
    assert_eq!(conn_b.peer_addr(), conn_a.local_addr());
    assert_eq!(conn_a.player() + conn_b.player(), 1);
    // both bound the first free ports of the range
    assert_eq!(conn_a.local_addr().port(), 47_901);
    assert_eq!(conn_b.local_addr().port(), 47_902);
    assert_eq!(conn_a.player(), 0);

    assert!(matches!(a.poll(), Err(LockstepError::DiscoveryComplete)));
}

#[test]
#[serial]
fn test_discovered_peers_run_a_session() {
    init_logger();
    let mut a = Discovery::begin(loopback_config(47_920)).unwrap();
    let mut b = Discovery::begin(loopback_config(47_920)).unwrap();
    let (conn_a, conn_b) = poll_pair(&mut a, &mut b);

    let builder = SessionBuilder::new().with_delay(2).unwrap();
    let player_a = conn_a.player();
    let player_b = conn_b.player();
    let peer_a = conn_a.peer_addr();
    let socket_a = conn_a.into_socket().unwrap();
    assert_eq!(socket_a.peer_addr().unwrap(), peer_a);
    let mut sess_a = builder.clone().start_session(socket_a, player_a).unwrap();
    let mut sess_b = builder
        .start_session(conn_b.into_socket().unwrap(), player_b)
        .unwrap();

    let mut stub_a = StateStub::new();
    let mut stub_b = StateStub::new();
    sess_a.add().push(&[7]);
    sess_b.add().push(&[9]);
    for _ in 0..5_000 {
        if sess_a.step() >= 20 && sess_b.step() >= 20 {
            break;
        }
        sess_a.update(|player, bytes| stub_a.apply(player, bytes));
        sess_b.update(|player, bytes| stub_b.apply(player, bytes));
        thread::sleep(Duration::from_micros(200));
    }

    assert!(sess_a.step() >= 20 && sess_b.step() >= 20);
    // both messages of step 0, in player order
    let expected = if player_a == 0 {
        vec![(0, vec![7]), (1, vec![9])]
    } else {
        vec![(0, vec![9]), (1, vec![7])]
    };
    assert_eq!(stub_a.log, expected);
    assert_eq!(stub_b.log, expected);
}

#[test]
#[serial]
fn test_wait_from_two_threads() {
    init_logger();
    let a = Discovery::begin(loopback_config(47_940)).unwrap();
    let b = Discovery::begin(loopback_config(47_940)).unwrap();

    let handle = thread::spawn(move || b.wait(Some(Duration::from_secs(5))));
    let conn_a = a.wait(Some(Duration::from_secs(5))).unwrap();
    let conn_b = handle.join().unwrap().unwrap();

    assert_eq!(conn_a.player() + conn_b.player(), 1);
    assert_eq!(conn_a.peer_addr(), conn_b.local_addr());
}

#[test]
#[serial]
fn test_wait_times_out_alone() {
    init_logger();
    let a = Discovery::begin(loopback_config(47_960)).unwrap();
    assert!(matches!(
        a.wait(Some(Duration::from_millis(50))),
        Err(LockstepError::DiscoveryTimeout)
    ));
}

#[test]
#[serial]
fn test_no_local_port() {
    let mut config = loopback_config(47_980);
    config.port_range = 2;
    let _taken1 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 47_981)).unwrap();
    let _taken2 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 47_982)).unwrap();

    match Discovery::begin(config) {
        Err(LockstepError::NoLocalPort { first, last }) => {
            assert_eq!(first, 47_981);
            assert_eq!(last, 47_982);
        }
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
}

#[test]
#[serial]
fn test_unconfirmed_reply_is_repeated() {
    init_logger();
    let mut a = Discovery::begin(loopback_config(48_000)).unwrap();
    let peer = RawPeer::new(48_000);

    // a single announcement, and the answers to it never make it back
    peer.announce();
    let replies = poll_for(&mut a, &peer, 50);
    assert!(replies.len() >= 2, "only {} replies", replies.len());
    assert!(replies.iter().all(|&(code, _)| code == 43));
    let a_addr = replies[0].1;
    assert!(replies.iter().all(|&(_, src)| src == a_addr));

    peer.send_code(44, a_addr);
    let connected = poll_until_connected(&mut a);
    assert_eq!(connected.peer_addr(), peer.addr());
    assert_eq!(connected.local_addr(), a_addr);
}

#[test]
#[serial]
fn test_repeated_announcement_is_answered_again() {
    init_logger();
    let mut config = loopback_config(48_020);
    config.rebroadcast_interval = None;
    let mut a = Discovery::begin(config).unwrap();
    let peer = RawPeer::new(48_020);

    peer.announce();
    assert_eq!(poll_for(&mut a, &peer, 10).len(), 1);
    peer.announce();
    let replies = poll_for(&mut a, &peer, 10);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, 43);
}

#[test]
#[serial]
fn test_lockstep_packet_stands_in_for_lost_confirm() {
    init_logger();
    let mut a = Discovery::begin(loopback_config(48_040)).unwrap();
    let peer = RawPeer::new(48_040);

    peer.announce();
    let replies = poll_for(&mut a, &peer, 10);
    let a_addr = replies[0].1;

    // the peer already runs its session and sends the header of step 0
    let mut header = PROTOCOL_MAGIC.to_le_bytes().to_vec();
    header.extend_from_slice(&[0; 8]);
    peer.socket.send_to(&header, a_addr).unwrap();

    let connected = poll_until_connected(&mut a);
    assert_eq!(connected.peer_addr(), peer.addr());
}

#[test]
#[serial]
fn test_garbage_on_broadcast_port_is_ignored() {
    init_logger();
    let mut config = loopback_config(48_060);
    config.rebroadcast_interval = None;
    let mut a = Discovery::begin(config).unwrap();
    let peer = RawPeer::new(48_060);

    peer.socket.send_to(&[1, 2, 3], peer.broadcast).unwrap();
    peer.socket.send_to(&[0xff; 32], peer.broadcast).unwrap();
    peer.send_code(99, peer.broadcast);
    peer.send_code(44, peer.broadcast);
    assert!(poll_for(&mut a, &peer, 10).is_empty());

    // still announcing, so a proper announcement is answered
    peer.announce();
    let replies = poll_for(&mut a, &peer, 10);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, 43);
}

#[test]
#[serial]
fn test_rebroadcast_recovers_lost_announcement() {
    init_logger();
    // nobody listens yet when b announces for the first time
    let blocker = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 48_080)).unwrap();
    let mut b = Discovery::begin(loopback_config(48_080)).unwrap();
    drop(blocker);
    let mut a = Discovery::begin(loopback_config(48_080)).unwrap();

    let (conn_a, conn_b) = poll_pair(&mut a, &mut b);
    assert_eq!(conn_a.peer_addr(), conn_b.local_addr());
    assert_eq!(conn_a.player() + conn_b.player(), 1);
}
