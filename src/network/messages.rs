use std::io::{self, Write};

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{LockstepError, Step};

/// Every lockstep datagram starts with this value.
pub const PROTOCOL_MAGIC: u32 = 0x4c4b_5354;
/// Size of the fixed packet header: magic, step and ack bitset, four bytes each.
pub const HEADER_SIZE: usize = 12;
/// Upper bound for a single UDP datagram payload.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub(crate) const DISCOVERY_ANNOUNCE: u32 = 42;
pub(crate) const DISCOVERY_REPLY: u32 = 43;
pub(crate) const DISCOVERY_CONFIRM: u32 = 44;
pub(crate) const DISCOVERY_PACKET_SIZE: usize = 8;

// fixed-width little endian, so encoded sizes do not depend on the values
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PacketHeader {
    pub magic: u32,
    pub step: Step,
    /// The sender's `recv` bitset at the time the packet was created.
    pub ack: u32,
}

impl PacketHeader {
    pub(crate) fn new(step: Step, ack: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            step,
            ack,
        }
    }

    /// Reads the header at the start of `bytes`. Fails on short input or a foreign magic value.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, LockstepError> {
        let header = bytes
            .get(..HEADER_SIZE)
            .ok_or(LockstepError::MalformedPacket {
                len: bytes.len(),
                expected: HEADER_SIZE,
            })?;
        let field = |at: usize| {
            u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
        };

        let magic = field(0);
        if magic != PROTOCOL_MAGIC {
            return Err(LockstepError::BadMagic { found: magic });
        }

        Ok(Self {
            magic,
            step: field(4),
            ack: field(8),
        })
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.ack.to_le_bytes());
    }
}

/// Returns the application messages of a datagram, i.e. everything after the header.
pub(crate) fn payload(datagram: &[u8]) -> &[u8] {
    datagram.get(HEADER_SIZE..).unwrap_or_default()
}

/// The outgoing packet for the step that has not been sent yet. Get it through [`LockstepSession::add()`]
/// and append as many messages as you like before the next advancing [`LockstepSession::update()`].
///
/// Messages are not framed by this library. Whatever you push is handed to the remote handler as one
/// contiguous byte span, so each message has to be self-delimiting (e.g. a type tag followed by a
/// known length). [`push_message()`] and [`read_message()`] do that for you with any serde type.
///
/// There is no limit on the number or size of messages. A packet that does not fit into a single
/// UDP datagram cannot be sent and will be logged as an error.
///
/// [`LockstepSession::add()`]: crate::LockstepSession#method.add
/// [`LockstepSession::update()`]: crate::LockstepSession#method.update
/// [`push_message()`]: SendBuffer#method.push_message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBuffer {
    bytes: Vec<u8>,
}

impl SendBuffer {
    pub(crate) fn new(header: PacketHeader) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        header.write_to(&mut bytes);
        Self { bytes }
    }

    /// Appends raw message bytes.
    pub fn push(&mut self, message: &[u8]) {
        self.bytes.extend_from_slice(message);
    }

    /// Appends `message` in the fixed-width bincode encoding. Enum variants are prefixed with a four byte tag.
    ///
    /// # Errors
    /// - Returns `Serialization` if the message cannot be encoded.
    pub fn push_message<T: Serialize>(&mut self, message: &T) -> Result<(), LockstepError> {
        wire_options().serialize_into(&mut self.bytes, message)?;
        Ok(())
    }

    /// The messages queued so far, without the header.
    pub fn payload(&self) -> &[u8] {
        payload(&self.bytes)
    }

    /// Number of message bytes queued so far.
    pub fn len(&self) -> usize {
        self.bytes.len() - HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn as_datagram(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn into_datagram(self) -> Vec<u8> {
        self.bytes
    }
}

impl Write for SendBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decodes one message written by [`SendBuffer::push_message()`] from the start of `payload`.
/// Returns the message and the number of bytes it occupied, which is exactly what a message handler has to report back.
///
/// # Example
///
/// ```
/// # use lockstep::{read_message, LockstepError};
/// # fn handle(bytes: &[u8]) -> Result<usize, LockstepError> {
/// let (velocity, consumed): ((i16, i16), usize) = read_message(bytes)?;
/// # let _ = velocity;
/// # Ok(consumed)
/// # }
/// ```
///
/// # Errors
/// - Returns `Serialization` if the bytes do not start with a valid `T`.
pub fn read_message<T: DeserializeOwned>(payload: &[u8]) -> Result<(T, usize), LockstepError> {
    let mut reader = payload;
    let message = wire_options().deserialize_from(&mut reader)?;
    Ok((message, payload.len() - reader.len()))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DiscoveryPacket {
    pub code: u32,
    /// Random per process, lets a peer recognize its own broadcast.
    pub nonce: u32,
}

impl DiscoveryPacket {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, LockstepError> {
        Ok(wire_options().serialize(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, LockstepError> {
        if bytes.len() != DISCOVERY_PACKET_SIZE {
            return Err(LockstepError::MalformedPacket {
                len: bytes.len(),
                expected: DISCOVERY_PACKET_SIZE,
            });
        }
        Ok(wire_options().deserialize(bytes)?)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = Vec::new();
        PacketHeader::new(0x0102_0304, 0b1011).write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..4], &PROTOCOL_MAGIC.to_le_bytes());
        assert_eq!(&buf[4..8], &[4, 3, 2, 1]);
        assert_eq!(&buf[8..12], &[0b1011, 0, 0, 0]);
    }

    #[test]
    fn test_decode_header_with_payload() {
        let mut send = SendBuffer::new(PacketHeader::new(17, 3));
        send.push(b"build");
        let datagram = send.into_datagram();

        let header = PacketHeader::decode(&datagram).unwrap();
        assert_eq!(header, PacketHeader::new(17, 3));
        assert_eq!(payload(&datagram), b"build");
    }

    #[test]
    fn test_decode_short_packet() {
        let bytes = [0u8; HEADER_SIZE - 1];
        match PacketHeader::decode(&bytes) {
            Err(LockstepError::MalformedPacket { len, expected }) => {
                assert_eq!(len, HEADER_SIZE - 1);
                assert_eq!(expected, HEADER_SIZE);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut bytes = Vec::new();
        PacketHeader::new(1, 0).write_to(&mut bytes);
        bytes[0] ^= 0xff;
        assert!(matches!(
            PacketHeader::decode(&bytes),
            Err(LockstepError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_send_buffer_starts_empty() {
        let mut send = SendBuffer::new(PacketHeader::new(0, 0));
        assert!(send.is_empty());
        assert_eq!(send.as_datagram().len(), HEADER_SIZE);
        send.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(send.len(), 3);
        assert_eq!(send.payload(), &[1, 2, 3]);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Command {
        Build { x: u16, y: u16 },
        Velocity(i8, i8),
    }

    #[test]
    fn test_read_messages_back_to_back() {
        let mut send = SendBuffer::new(PacketHeader::new(0, 0));
        send.push_message(&Command::Build { x: 3, y: 4 }).unwrap();
        send.push_message(&Command::Velocity(-1, 1)).unwrap();

        let mut rest = send.payload();
        let (first, consumed): (Command, usize) = read_message(rest).unwrap();
        // four byte variant tag plus two u16
        assert_eq!(consumed, 8);
        assert_eq!(first, Command::Build { x: 3, y: 4 });
        rest = &rest[consumed..];

        let (second, consumed): (Command, usize) = read_message(rest).unwrap();
        assert_eq!(second, Command::Velocity(-1, 1));
        assert_eq!(consumed, rest.len());
    }

    #[test]
    fn test_read_truncated_message() {
        let mut send = SendBuffer::new(PacketHeader::new(0, 0));
        send.push_message(&Command::Build { x: 3, y: 4 }).unwrap();
        let truncated = &send.payload()[..5];
        assert!(read_message::<Command>(truncated).is_err());
    }

    #[test]
    fn test_discovery_packet_size() {
        let packet = DiscoveryPacket {
            code: DISCOVERY_ANNOUNCE,
            nonce: 7,
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), DISCOVERY_PACKET_SIZE);
        assert_eq!(&bytes[0..4], &42u32.to_le_bytes());
        assert_eq!(DiscoveryPacket::decode(&bytes).unwrap(), packet);
        assert!(DiscoveryPacket::decode(&bytes[..4]).is_err());
    }
}
