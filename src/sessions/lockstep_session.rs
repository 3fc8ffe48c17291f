use instant::{Duration, Instant};
use log::{debug, error, trace, warn};

use crate::network::messages::{payload, PacketHeader, SendBuffer, MAX_DATAGRAM_SIZE};
use crate::network::network_stats::NetworkStats;
use crate::sync_window::{Rejection, SyncPhase, SyncWindow};
use crate::{NonBlockingSocket, PlayerId, Step};

/// A `LockstepSession` keeps two peers in lockstep. Each call to [`update()`] sends the messages you queued with
/// [`add()`] as the packet for the current step and advances to the next step, as long as the window allows it.
/// The packets of both peers are handed back to you exactly `delay` steps after they were sent, in the same order on
/// both peers, so both simulations apply identical inputs on identical steps.
///
/// Create one through a [`SessionBuilder`].
///
/// [`update()`]: Self#method.update
/// [`add()`]: Self#method.add
/// [`SessionBuilder`]: crate::SessionBuilder
pub struct LockstepSession<S>
where
    S: NonBlockingSocket,
{
    socket: S,
    player: PlayerId,
    window: SyncWindow,
    stall_timeout: Duration,

    // raw datagrams, indexed by step modulo the window width
    sent: Vec<Vec<u8>>,
    recvd: Vec<Vec<u8>>,
    sending: SendBuffer,

    // retransmission
    waiting_since: Option<Instant>,
    retransmit_cursor: Option<Step>,

    stats: NetworkStats,
}

impl<S: NonBlockingSocket> LockstepSession<S> {
    pub(crate) fn new(socket: S, player: PlayerId, delay: u32, stall_timeout: Duration) -> Self {
        let window = SyncWindow::new(delay);
        let width = window.width() as usize;
        let sending = SendBuffer::new(PacketHeader::new(window.step(), window.recv_bits()));

        Self {
            socket,
            player,
            window,
            stall_timeout,
            sent: vec![Vec::new(); width],
            recvd: vec![Vec::new(); width],
            sending,
            waiting_since: None,
            retransmit_cursor: None,
            stats: NetworkStats::new(),
        }
    }

    /// Returns the buffer collecting messages for the current step. Everything added before the next advancing
    /// [`update()`] is sent with the current step and delivered to both peers `delay` steps later.
    ///
    /// [`update()`]: Self#method.update
    pub fn add(&mut self) -> &mut SendBuffer {
        &mut self.sending
    }

    /// Polls the socket, retransmits lost packets and tries to advance to the next step.
    ///
    /// If the step advances, `handler` receives the messages of the step that is now exactly `delay` steps old:
    /// first those of player 0, then those of player 1. It is handed the unread rest of a packet and has to return
    /// how many bytes the message at its start occupied, and is called again until the packet is consumed.
    /// Returning `0` or more than the remaining length drops the rest of that packet.
    ///
    /// Returns `true` if the step advanced. A remote peer that stops responding shows up as `update()`
    /// returning `false` indefinitely.
    pub fn update<F>(&mut self, mut handler: F) -> bool
    where
        F: FnMut(PlayerId, &[u8]) -> usize,
    {
        self.receive_all();

        if self.window.phase() == SyncPhase::Steady {
            self.retransmit();
        }

        if !self.window.can_advance() {
            trace!(
                "step {} waits for the remote packet of step {}",
                self.window.step(),
                self.window.step().wrapping_sub(self.delay())
            );
            return false;
        }

        self.advance(&mut handler);
        true
    }

    /// The step whose messages are currently being collected.
    pub fn step(&self) -> Step {
        self.window.step()
    }

    pub fn player(&self) -> PlayerId {
        self.player
    }

    pub fn remote_player(&self) -> PlayerId {
        1 - self.player
    }

    pub fn delay(&self) -> u32 {
        self.window.width() / 2
    }

    pub fn phase(&self) -> SyncPhase {
        self.window.phase()
    }

    pub fn network_stats(&self) -> NetworkStats {
        NetworkStats {
            unacked_packets: self.window.unacked().count_ones(),
            ..self.stats
        }
    }

    /*
     *  RECEIVING
     */

    fn receive_all(&mut self) {
        for datagram in self.socket.receive_all_messages() {
            self.stats.bytes_received += datagram.len();

            let header = match PacketHeader::decode(&datagram) {
                Ok(header) => header,
                Err(err) => {
                    debug!("dropping datagram: {}", err);
                    self.stats.packets_rejected += 1;
                    continue;
                }
            };

            if let Err(rejection) = self.window.accept(header.step, header.ack) {
                self.stats.packets_rejected += 1;
                match rejection {
                    Rejection::OutOfWindow { offset } => debug!(
                        "dropping packet for step {}, {} steps away from step {}",
                        header.step,
                        offset,
                        self.window.step()
                    ),
                    Rejection::Duplicate { offset } => trace!(
                        "dropping duplicate packet for step {} (offset {})",
                        header.step,
                        offset
                    ),
                    Rejection::InvalidAck { offset, ack } => warn!(
                        "dropping packet for step {} (offset {}): ack field {:#b} covers steps we have not sent",
                        header.step, offset, ack
                    ),
                }
                continue;
            }

            self.stats.packets_received += 1;
            let slot = self.window.slot(header.step);
            self.recvd[slot] = datagram;
        }
    }

    /*
     *  SENDING
     */

    fn retransmit(&mut self) {
        if self.window.unacked() == 0 {
            return;
        }

        let waiting_since = *self.waiting_since.get_or_insert_with(Instant::now);
        let target = if waiting_since.elapsed() >= self.stall_timeout {
            // stalled: cycle through everything the remote has not acknowledged
            let next = self.window.next_unacked_after(self.retransmit_cursor);
            self.retransmit_cursor = next;
            next
        } else {
            self.window.first_gap()
        };

        if let Some(step) = target {
            let datagram = &self.sent[self.window.slot(step)];
            trace!("resending packet for step {}", step);
            self.socket.send(datagram);
            self.stats.packets_sent += 1;
            self.stats.packets_retransmitted += 1;
            self.stats.bytes_sent += datagram.len();
        }
    }

    fn advance<F>(&mut self, handler: &mut F)
    where
        F: FnMut(PlayerId, &[u8]) -> usize,
    {
        let step = self.window.step();

        let datagram = self.sending.as_datagram();
        if datagram.len() > MAX_DATAGRAM_SIZE {
            error!(
                "packet for step {} has {} bytes and does not fit into a datagram",
                step,
                datagram.len()
            );
        }
        self.socket.send(datagram);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += datagram.len();

        let released = self.window.released_step();
        self.window.advance();
        self.waiting_since = None;

        let next = SendBuffer::new(PacketHeader::new(
            self.window.step(),
            self.window.recv_bits(),
        ));
        let slot = self.window.slot(step);
        self.sent[slot] = std::mem::replace(&mut self.sending, next).into_datagram();

        if let Some(released) = released {
            self.deliver(released, handler);
        }
    }

    fn deliver<F>(&self, step: Step, handler: &mut F)
    where
        F: FnMut(PlayerId, &[u8]) -> usize,
    {
        let slot = self.window.slot(step);
        let local = &self.sent[slot];
        let remote = &self.recvd[slot];
        debug_assert_eq!(PacketHeader::decode(local).map(|h| h.step).ok(), Some(step));
        debug_assert_eq!(PacketHeader::decode(remote).map(|h| h.step).ok(), Some(step));

        // ascending player order, so both peers see the same sequence
        let (first, second) = if self.player == 0 {
            (local, remote)
        } else {
            (remote, local)
        };
        dispatch(0, payload(first), handler);
        dispatch(1, payload(second), handler);
    }
}

fn dispatch<F>(player: PlayerId, mut messages: &[u8], handler: &mut F)
where
    F: FnMut(PlayerId, &[u8]) -> usize,
{
    while !messages.is_empty() {
        let consumed = handler(player, messages);
        if consumed == 0 || consumed > messages.len() {
            warn!(
                "handler consumed {} of {} bytes from player {}, dropping the rest",
                consumed,
                messages.len(),
                player
            );
            return;
        }
        messages = &messages[consumed..];
    }
}

// #########
// # TESTS #
// #########
