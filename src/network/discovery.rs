use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use instant::{Duration, Instant};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::network::messages::{
    DiscoveryPacket, PacketHeader, DISCOVERY_ANNOUNCE, DISCOVERY_CONFIRM, DISCOVERY_REPLY,
};
use crate::{LockstepError, PlayerId, UdpNonBlockingSocket};

/// Port every peer listens on for announcements.
pub const DEFAULT_BROADCAST_PORT: u16 = 47_800;
/// First port tried for the socket that later carries the session.
pub const DEFAULT_BASE_PORT: u16 = 47_801;
/// Number of consecutive ports tried, starting at the base port.
pub const DEFAULT_PORT_RANGE: u16 = 32;
/// Announcements and unconfirmed answers are repeated this often.
pub const DEFAULT_REBROADCAST_INTERVAL: Duration = Duration::from_millis(250);

const POLL_INTERVAL: Duration = Duration::from_millis(1);
// large enough for a discovery packet and a lockstep header
const RECV_BUFFER_SIZE: usize = 64;

/// Where and how to look for the other peer. Both peers need the same broadcast port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Destination of announcements. Use a loopback address to pair two processes on one machine.
    pub broadcast_addr: Ipv4Addr,
    pub broadcast_port: u16,
    pub base_port: u16,
    pub port_range: u16,
    /// Announcements, and answers not yet confirmed, are repeated this often. `None` sends each only once.
    pub rebroadcast_interval: Option<Duration>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: Ipv4Addr::BROADCAST,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            base_port: DEFAULT_BASE_PORT,
            port_range: DEFAULT_PORT_RANGE,
            rebroadcast_interval: Some(DEFAULT_REBROADCAST_INTERVAL),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DiscoveryState {
    Announcing,
    AwaitingConfirm { peer: SocketAddr },
    Done,
}

/// Player assignment both peers agree on without exchanging anything: the lower address is player 0.
pub fn player_from_endpoints(local: SocketAddr, remote: SocketAddr) -> PlayerId {
    if local < remote {
        0
    } else {
        1
    }
}

/// The result of a finished handshake: a socket connected to the peer and this side's player id.
#[derive(Debug)]
pub struct Connected {
    socket: UdpSocket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    player: PlayerId,
}

impl Connected {
    pub fn player(&self) -> PlayerId {
        self.player
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Hands the connected socket over, ready to be passed to [`SessionBuilder::start_session()`].
    ///
    /// [`SessionBuilder::start_session()`]: crate::SessionBuilder#method.start_session
    pub fn into_socket(self) -> Result<UdpNonBlockingSocket, LockstepError> {
        Ok(UdpNonBlockingSocket::from_connected(self.socket)?)
    }
}

/// Finds the other peer on the local network.
///
/// Every peer binds a provisional socket and broadcasts an announcement (code `42`) from it. A peer listening on
/// the broadcast port answers an announcement with `43` from its own provisional socket. Receiving `43` means the
/// sender is our peer: we connect to it and confirm with `44`. Receiving that `44` completes the answering side.
///
/// Only one process per machine can own the broadcast port. A second one on the same machine skips listening
/// and relies on the first one answering its announcement.
///
/// Drive it with [`poll()`] from your own loop, or block with [`wait()`].
///
/// [`poll()`]: Self#method.poll
/// [`wait()`]: Self#method.wait
#[derive(Debug)]
pub struct Discovery {
    config: DiscoveryConfig,
    listener: Option<UdpSocket>,
    // taken once the handshake completes
    socket: Option<UdpSocket>,
    nonce: u32,
    state: DiscoveryState,
    last_sent: Instant,
}

impl Discovery {
    /// Binds the discovery sockets and sends the first announcement.
    ///
    /// # Errors
    /// - Returns `InvalidRequest` if the port range is empty.
    /// - Returns `NoLocalPort` if every port in the range is taken.
    /// - Returns `Io` if a socket could not be set up for any other reason.
    pub fn begin(config: DiscoveryConfig) -> Result<Self, LockstepError> {
        if config.port_range == 0 {
            return Err(LockstepError::InvalidRequest {
                info: "The discovery port range must contain at least one port.".to_owned(),
            });
        }

        let listener = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.broadcast_port)) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                Some(listener)
            }
            Err(ref err) if err.kind() == ErrorKind::AddrInUse => {
                info!(
                    "broadcast port {} is taken, waiting for the other peer to answer",
                    config.broadcast_port
                );
                None
            }
            Err(err) => return Err(err.into()),
        };

        let socket = bind_provisional(&config)?;
        socket.set_broadcast(true)?;
        info!("discovering peers from {}", socket.local_addr()?);

        let mut discovery = Self {
            config,
            listener,
            socket: Some(socket),
            nonce: rand::random(),
            state: DiscoveryState::Announcing,
            last_sent: Instant::now(),
        };
        discovery.announce();
        Ok(discovery)
    }

    /// Handles all pending discovery datagrams. Returns the connection once the handshake is done.
    ///
    /// # Errors
    /// - Returns `DiscoveryComplete` if the connection has already been returned.
    /// - Returns `Io` if a socket failed.
    pub fn poll(&mut self) -> Result<Option<Connected>, LockstepError> {
        if self.state == DiscoveryState::Done {
            return Err(LockstepError::DiscoveryComplete);
        }

        if let Some(interval) = self.config.rebroadcast_interval {
            if self.last_sent.elapsed() >= interval {
                match self.state {
                    DiscoveryState::Announcing => self.announce(),
                    // the peer may not have heard our answer
                    DiscoveryState::AwaitingConfirm { peer } => self.reply(peer),
                    DiscoveryState::Done => (),
                }
            }
        }

        self.poll_listener()?;
        self.poll_socket()
    }

    /// Polls until a peer is found or `timeout` runs out.
    ///
    /// # Errors
    /// - Returns `DiscoveryTimeout` if `timeout` elapses first.
    /// - Any error of [`poll()`].
    ///
    /// [`poll()`]: Self#method.poll
    pub fn wait(mut self, timeout: Option<Duration>) -> Result<Connected, LockstepError> {
        let start = Instant::now();
        loop {
            if let Some(connected) = self.poll()? {
                return Ok(connected);
            }
            if timeout.map_or(false, |timeout| start.elapsed() >= timeout) {
                return Err(LockstepError::DiscoveryTimeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn announce(&mut self) {
        let target = SocketAddr::from((self.config.broadcast_addr, self.config.broadcast_port));
        if let Some(socket) = &self.socket {
            trace!("announcing to {}", target);
            send_packet(socket, DISCOVERY_ANNOUNCE, self.nonce, Some(target));
        }
        self.last_sent = Instant::now();
    }

    fn poll_listener(&mut self) -> Result<(), LockstepError> {
        let mut buffer = [0; RECV_BUFFER_SIZE];
        loop {
            let listener = match &self.listener {
                Some(listener) => listener,
                None => return Ok(()),
            };
            let (len, src) = match receive_from(listener, &mut buffer)? {
                Some(received) => received,
                None => return Ok(()),
            };

            let packet = match DiscoveryPacket::decode(&buffer[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    debug!("ignoring datagram from {} on the broadcast port: {}", src, err);
                    continue;
                }
            };
            if packet.nonce == self.nonce {
                // our own announcement
                continue;
            }

            match (self.state, packet.code) {
                (DiscoveryState::Announcing, DISCOVERY_ANNOUNCE) => {
                    info!("found peer at {}, answering", src);
                    self.reply(src);
                    self.state = DiscoveryState::AwaitingConfirm { peer: src };
                }
                // our answer got lost
                (DiscoveryState::AwaitingConfirm { peer }, DISCOVERY_ANNOUNCE) if peer == src => {
                    self.reply(src)
                }
                (state, code) => debug!(
                    "ignoring discovery code {} from {} while {:?}",
                    code, src, state
                ),
            }
        }
    }

    fn poll_socket(&mut self) -> Result<Option<Connected>, LockstepError> {
        let mut buffer = [0; RECV_BUFFER_SIZE];
        loop {
            let socket = self
                .socket
                .as_ref()
                .ok_or(LockstepError::DiscoveryComplete)?;
            let (len, src) = match receive_from(socket, &mut buffer)? {
                Some(received) => received,
                None => return Ok(None),
            };
            let datagram = &buffer[..len];

            let packet = match DiscoveryPacket::decode(datagram) {
                Ok(packet) => packet,
                Err(err) => {
                    // the peer already runs its session, so our confirmation was lost on the way
                    if self.state == (DiscoveryState::AwaitingConfirm { peer: src })
                        && PacketHeader::decode(datagram).is_ok()
                    {
                        debug!("{} started sending steps, taking that as confirmation", src);
                        return self.finish(src).map(Some);
                    }
                    debug!("ignoring datagram from {}: {}", src, err);
                    continue;
                }
            };

            match (self.state, packet.code) {
                (
                    DiscoveryState::Announcing | DiscoveryState::AwaitingConfirm { .. },
                    DISCOVERY_REPLY,
                ) => {
                    info!("peer at {} answered", src);
                    let connected = self.finish(src)?;
                    send_packet(&connected.socket, DISCOVERY_CONFIRM, self.nonce, None);
                    return Ok(Some(connected));
                }
                (DiscoveryState::AwaitingConfirm { peer }, DISCOVERY_CONFIRM) if peer == src => {
                    info!("peer at {} confirmed", src);
                    return self.finish(src).map(Some);
                }
                (state, code) => debug!(
                    "ignoring discovery code {} from {} while {:?}",
                    code, src, state
                ),
            }
        }
    }

    fn reply(&mut self, peer: SocketAddr) {
        if let Some(socket) = &self.socket {
            trace!("answering {}", peer);
            send_packet(socket, DISCOVERY_REPLY, self.nonce, Some(peer));
        }
        self.last_sent = Instant::now();
    }

    fn finish(&mut self, peer: SocketAddr) -> Result<Connected, LockstepError> {
        let socket = self
            .socket
            .take()
            .ok_or(LockstepError::DiscoveryComplete)?;
        self.state = DiscoveryState::Done;
        // frees the broadcast port for the next discovery on this machine
        self.listener = None;

        socket.connect(peer)?;
        let local_addr = socket.local_addr()?;
        let player = player_from_endpoints(local_addr, peer);
        info!(
            "connected {} to {}, playing as player {}",
            local_addr, peer, player
        );

        Ok(Connected {
            socket,
            local_addr,
            peer_addr: peer,
            player,
        })
    }
}

fn bind_provisional(config: &DiscoveryConfig) -> Result<UdpSocket, LockstepError> {
    let first = config.base_port;
    let last = first.saturating_add(config.port_range - 1);
    for port in first..=last {
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(socket) => {
                socket.set_nonblocking(true)?;
                return Ok(socket);
            }
            Err(ref err) if err.kind() == ErrorKind::AddrInUse => {
                trace!("port {} is taken", port);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(LockstepError::NoLocalPort { first, last })
}

/// Sends to `target`, or to the connected peer if there is none. Failures only cost a lost datagram.
fn send_packet(socket: &UdpSocket, code: u32, nonce: u32, target: Option<SocketAddr>) {
    let bytes = match (DiscoveryPacket { code, nonce }).encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("could not encode discovery code {}: {}", code, err);
            return;
        }
    };
    let sent = match target {
        Some(target) => socket.send_to(&bytes, target),
        None => socket.send(&bytes),
    };
    if let Err(err) = sent {
        warn!("could not send discovery code {}: {}", code, err);
    }
}

fn receive_from(
    socket: &UdpSocket,
    buffer: &mut [u8],
) -> Result<Option<(usize, SocketAddr)>, LockstepError> {
    loop {
        match socket.recv_from(buffer) {
            Ok(received) => return Ok(Some(received)),
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(ref err)
                if err.kind() == ErrorKind::ConnectionReset
                    || err.kind() == ErrorKind::ConnectionRefused =>
            {
                continue
            }
            Err(err) => return Err(err.into()),
        }
    }
}

// #########
// # TESTS #
// #########
