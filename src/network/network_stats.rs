/// The `NetworkStats` struct contains statistics about the current session.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct NetworkStats {
    /// Datagrams handed to the socket, including retransmissions.
    pub packets_sent: usize,
    /// Bytes handed to the socket, including retransmissions.
    pub bytes_sent: usize,
    /// Datagrams accepted into the receive window.
    pub packets_received: usize,
    /// Bytes of all datagrams read from the socket, accepted or not.
    pub bytes_received: usize,
    /// How many of the sent datagrams were retransmissions.
    pub packets_retransmitted: usize,
    /// Datagrams dropped because they were malformed, foreign, out of the window or duplicates.
    pub packets_rejected: usize,
    /// Number of sent packets the remote has not acknowledged yet.
    /// A rough indication of the connection quality: it grows with the round-trip time and during packet loss.
    pub unacked_packets: u32,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}
