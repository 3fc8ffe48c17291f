mod udp_socket;

pub use udp_socket::UdpNonBlockingSocket;

/// This `NonBlockingSocket` trait is the only way a [`LockstepSession`] talks to its peer.
/// Implement it if you want to run the protocol over your own transport, or over an in-memory channel in tests.
/// Datagrams should be delivered in an UDP-like fashion: unordered, unreliable, but never corrupted or merged.
/// The session has its own protocol on top of this to make sure every step is eventually received by both peers.
///
/// The socket is already bound to exactly one remote peer, so there are no addresses involved.
///
/// [`LockstepSession`]: crate::LockstepSession
pub trait NonBlockingSocket: Send + Sync {
    /// Sends a single datagram to the peer. Failures are not reported; the protocol treats them like packet loss.
    fn send(&mut self, datagram: &[u8]);

    /// This method should return all datagrams received since the last time this method was called.
    fn receive_all_messages(&mut self) -> Vec<Vec<u8>>;
}
