use thiserror::Error;

/// This enum contains all error messages this library can return. Most API functions will generally return a `Result<(), LockstepError>`.
#[derive(Debug, Error)]
pub enum LockstepError {
    /// You made an invalid request, usually by using wrong parameters for function calls.
    #[error("Invalid Request: {info}")]
    InvalidRequest { info: String },
    /// None of the ports scanned for the provisional discovery socket could be bound.
    #[error("No local port between {first} and {last} could be bound for discovery.")]
    NoLocalPort { first: u16, last: u16 },
    /// A datagram was too short to contain the expected header.
    #[error("Malformed packet of {len} bytes, expected at least {expected}.")]
    MalformedPacket { len: usize, expected: usize },
    /// A datagram did not carry the protocol magic.
    #[error("Packet carries magic {found:#010x}, which does not belong to this protocol.")]
    BadMagic { found: u32 },
    /// No peer answered before the discovery timeout ran out.
    #[error("No peer was discovered before the timeout.")]
    DiscoveryTimeout,
    /// The discovery handshake has already handed out its connected socket.
    #[error("Discovery has already completed.")]
    DiscoveryComplete,
    /// A problem occured with the underlying UDP socket.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    /// A header or message could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
