//! # lockstep
//! Deterministic lockstep synchronization of a two-player simulation over UDP, written in 100% safe Rust.
//!
//! Both peers exchange one packet per simulation step. A packet is only applied `delay` steps after it was sent,
//! and only once the packets of both peers for that step have arrived, so both simulations consume exactly the
//! same messages on exactly the same step. Lost packets are detected through a sliding acknowledgment window
//! and retransmitted selectively.
//!
//! Peers find each other on the local network through a small UDP broadcast handshake (see [`Discovery`]),
//! or you can hand any [`NonBlockingSocket`] connected to the other peer to a [`SessionBuilder`].
//!
//! Instead of registering callback objects, you poll the session once per tick with [`LockstepSession::update()`]
//! and a closure that receives the messages of each released step.

#![forbid(unsafe_code)] // let us try

pub use error::LockstepError;
pub use network::discovery::{
    player_from_endpoints, Connected, Discovery, DiscoveryConfig, DEFAULT_BASE_PORT,
    DEFAULT_BROADCAST_PORT, DEFAULT_PORT_RANGE, DEFAULT_REBROADCAST_INTERVAL,
};
pub use network::messages::{
    read_message, SendBuffer, HEADER_SIZE, MAX_DATAGRAM_SIZE, PROTOCOL_MAGIC,
};
pub use network::network_stats::NetworkStats;
pub use network::non_blocking_socket::{NonBlockingSocket, UdpNonBlockingSocket};
pub use sessions::builder::SessionBuilder;
pub use sessions::lockstep_session::LockstepSession;
pub use sync_window::SyncPhase;

pub(crate) mod error;
pub(crate) mod sync_window;
pub(crate) mod sessions {
    pub(crate) mod builder;
    pub(crate) mod lockstep_session;
}
pub(crate) mod network {
    pub(crate) mod discovery;
    pub(crate) mod messages;
    pub(crate) mod network_stats;
    pub(crate) mod non_blocking_socket;
}

// #############
// # CONSTANTS #
// #############

/// The delay has to be smaller than this, so that both `2 * delay` bit windows fit into the 32 bit ack field.
pub const MAX_DELAY: u32 = 16;
/// The number of steps between sending a message and applying it, unless configured otherwise.
pub const DEFAULT_DELAY: u32 = 8;

/// Identifies one simulation step. Counters wrap around after `u32::MAX`.
pub type Step = u32;
/// Either `0` or `1`. The peer with the lower socket address is player 0.
pub type PlayerId = u32;
