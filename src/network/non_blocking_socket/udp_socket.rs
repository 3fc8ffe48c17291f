use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
};

use log::{debug, error};

use super::NonBlockingSocket;
use crate::network::messages::MAX_DATAGRAM_SIZE;

const RECV_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE;

/// A non-blocking UDP socket connected to a single peer, as produced by the LAN discovery.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpNonBlockingSocket {
    /// Wraps a socket that has already been `connect()`ed to the peer and sets it to non-blocking mode.
    pub fn from_connected(socket: UdpSocket) -> Result<Self, std::io::Error> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buffer: vec![0; RECV_BUFFER_SIZE],
        })
    }

    /// The address this side sends from, as the peer sees it.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// The address of the peer the socket is connected to.
    pub fn peer_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.peer_addr()
    }
}

impl NonBlockingSocket for UdpNonBlockingSocket {
    fn send(&mut self, datagram: &[u8]) {
        match self.socket.send(datagram) {
            Ok(_) => (),
            // the peer is not listening (yet), this is just another lost packet
            Err(ref err) if err.kind() == ErrorKind::ConnectionRefused => {
                debug!("peer refused {} byte datagram", datagram.len())
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                debug!("send buffer full, dropping {} byte datagram", datagram.len())
            }
            Err(err) => error!(
                "{:?}: {} while sending {} bytes on {:?}",
                err.kind(),
                err,
                datagram.len(),
                &self.socket
            ),
        }
    }

    fn receive_all_messages(&mut self) -> Vec<Vec<u8>> {
        let mut received_messages = Vec::new();
        loop {
            match self.socket.recv(&mut self.buffer) {
                Ok(number_of_bytes) => {
                    received_messages.push(self.buffer[..number_of_bytes].to_vec());
                }
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // datagram socket sometimes get this error as a result of calling the send method
                Err(ref err)
                    if err.kind() == ErrorKind::ConnectionReset
                        || err.kind() == ErrorKind::ConnectionRefused =>
                {
                    continue
                }
                // anything else is reported and ends this round of receiving
                Err(err) => {
                    error!("{:?}: {} on {:?}", err.kind(), err, &self.socket);
                    return received_messages;
                }
            }
        }
    }
}
