use instant::Duration;

use crate::{
    Discovery, DiscoveryConfig, LockstepError, LockstepSession, NonBlockingSocket, PlayerId,
    UdpNonBlockingSocket, DEFAULT_DELAY, MAX_DELAY,
};

// How long unacknowledged packets may linger before the session resends all of them in turn
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_millis(5);

/// Configures and starts a [`LockstepSession`].
///
/// Both peers have to use the same delay, otherwise they release different steps and drift apart.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    delay: u32,
    /// Time a packet may stay unacknowledged before the session stops waiting for gaps and resends everything.
    stall_timeout: Duration,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Change the number of steps between sending a message and applying it. Larger delays hide more latency
    /// and loss at the cost of responsiveness.
    ///
    /// # Errors
    /// - Returns `InvalidRequest` if `delay` is not a power of two or not smaller than [`MAX_DELAY`].
    pub fn with_delay(mut self, delay: u32) -> Result<Self, LockstepError> {
        if !delay.is_power_of_two() || delay >= MAX_DELAY {
            return Err(LockstepError::InvalidRequest {
                info: format!(
                    "The delay has to be a power of two smaller than {}, got {}.",
                    MAX_DELAY, delay
                ),
            });
        }
        self.delay = delay;
        Ok(self)
    }

    /// Sets how long the session keeps resending only the first gap before it cycles through all
    /// unacknowledged packets. `Duration::ZERO` always cycles.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Starts a session on a socket that only exchanges datagrams with the remote peer.
    ///
    /// # Errors
    /// - Returns `InvalidRequest` if `player` is neither `0` nor `1`.
    pub fn start_session<S: NonBlockingSocket>(
        self,
        socket: S,
        player: PlayerId,
    ) -> Result<LockstepSession<S>, LockstepError> {
        if player > 1 {
            return Err(LockstepError::InvalidRequest {
                info: format!("A session has players 0 and 1, got {}.", player),
            });
        }
        Ok(LockstepSession::new(
            socket,
            player,
            self.delay,
            self.stall_timeout,
        ))
    }

    /// Finds a peer on the local network and starts a session with it. Blocks until the handshake finishes
    /// or `timeout` runs out. With `None`, it waits forever.
    ///
    /// # Errors
    /// - Returns `DiscoveryTimeout` if no peer answered in time.
    /// - Returns `NoLocalPort` or `Io` if the discovery sockets could not be set up.
    pub fn start_lan_session(
        self,
        config: DiscoveryConfig,
        timeout: Option<Duration>,
    ) -> Result<LockstepSession<UdpNonBlockingSocket>, LockstepError> {
        let connected = Discovery::begin(config)?.wait(timeout)?;
        let player = connected.player();
        self.start_session(connected.into_socket()?, player)
    }
}

// #########
// # TESTS #
// #########
