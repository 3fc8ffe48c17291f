use crate::{Step, MAX_DELAY};

/// The two phases of a session. You can query the current phase via [`LockstepSession::phase()`].
///
/// [`LockstepSession::phase()`]: crate::LockstepSession#method.phase
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    /// Fewer than `delay` steps have been sent. There is no history to release or retransmit yet, so every step advances.
    Priming,
    /// The window is populated. Advancing needs the remote packet that is exactly `delay` steps old.
    Steady,
}

/// Why a received packet did not make it into the window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Too old to matter or further ahead than a correct peer can be.
    OutOfWindow { offset: i32 },
    /// This step has been received before.
    Duplicate { offset: i32 },
    /// The packet acknowledges steps we have not sent yet.
    InvalidAck { offset: i32, ack: u32 },
}

#[inline]
fn low_mask(bits: u32) -> u32 {
    if bits >= u32::BITS {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Step counter and acknowledgment bookkeeping of one peer, free of any I/O.
///
/// Both bitsets are `2 * delay` bits wide:
/// - bit `delay + offset` of `recv` is set if the remote packet for `step + offset` arrived, `offset` in `[-delay, delay)`
/// - bit `i` of `ack` is set if the remote is known to hold our packet for `step - 2 * delay + i`
///
/// A peer can lag `delay` steps behind and still miss `delay` of our older packets,
/// so `2 * delay` is both the ack range and the number of packets kept for retransmission.
#[derive(Debug, Clone)]
pub(crate) struct SyncWindow {
    delay: u32,
    step: Step,
    init_count: u32,
    recv: u32,
    ack: u32,
}

impl SyncWindow {
    pub(crate) fn new(delay: u32) -> Self {
        assert!(delay.is_power_of_two() && delay < MAX_DELAY);
        Self {
            delay,
            step: 0,
            init_count: 0,
            recv: 0,
            ack: 0,
        }
    }

    pub(crate) fn step(&self) -> Step {
        self.step
    }

    pub(crate) fn width(&self) -> u32 {
        2 * self.delay
    }

    pub(crate) fn recv_bits(&self) -> u32 {
        self.recv
    }

    #[cfg(test)]
    pub(crate) fn ack_bits(&self) -> u32 {
        self.ack
    }

    pub(crate) fn phase(&self) -> SyncPhase {
        if self.init_count < self.delay {
            SyncPhase::Priming
        } else {
            SyncPhase::Steady
        }
    }

    /// Signed distance of `other` from the current step. The counters wrap, so this is taken modulo 2^32.
    pub(crate) fn offset_of(&self, other: Step) -> i32 {
        other.wrapping_sub(self.step) as i32
    }

    /// Ring buffer index for `step`. The width is a power of two, so this stays consistent when the counter wraps.
    pub(crate) fn slot(&self, step: Step) -> usize {
        (step % self.width()) as usize
    }

    /// Registers a received packet for `step` carrying the sender's `recv` bitset.
    /// On rejection the window is left untouched.
    pub(crate) fn accept(&mut self, step: Step, remote_recv: u32) -> Result<(), Rejection> {
        let delay = self.delay as i32;
        let offset = self.offset_of(step);
        if offset < -delay || offset >= delay {
            return Err(Rejection::OutOfWindow { offset });
        }

        let bit = (delay + offset) as u32;
        if self.recv & (1 << bit) != 0 {
            return Err(Rejection::Duplicate { offset });
        }

        // their bit `delay + o` is our step `step + o`, i.e. our ack bit `delay + o + shift`
        let shift = (offset + delay) as u32;
        let remapped = u64::from(remote_recv) << shift;
        if remapped >> self.width() != 0 {
            return Err(Rejection::InvalidAck {
                offset,
                ack: remote_recv,
            });
        }
        // a steady peer at `step` has released, and thus holds, all of our packets up to `step - delay`
        let implied = low_mask(shift + 1);

        self.recv |= 1 << bit;
        self.ack |= (remapped as u32 | implied) & low_mask(self.width());
        Ok(())
    }

    /// Whether the gate lets the current step advance.
    pub(crate) fn can_advance(&self) -> bool {
        match self.phase() {
            SyncPhase::Priming => true,
            SyncPhase::Steady => self.recv & 1 != 0,
        }
    }

    /// The step whose messages the next advance hands to the application.
    pub(crate) fn released_step(&self) -> Option<Step> {
        match self.phase() {
            SyncPhase::Priming => None,
            SyncPhase::Steady => Some(self.step.wrapping_sub(self.delay)),
        }
    }

    pub(crate) fn advance(&mut self) {
        self.step = self.step.wrapping_add(1);
        self.init_count = (self.init_count + 1).min(self.width());
        self.recv >>= 1;
        self.ack >>= 1;
    }

    fn sent_mask(&self) -> u32 {
        low_mask(self.width()) & !low_mask(self.width() - self.init_count)
    }

    fn step_of_bit(&self, bit: u32) -> Step {
        self.step.wrapping_sub(self.width()).wrapping_add(bit)
    }

    fn bit_of_step(&self, step: Step) -> Option<u32> {
        let bit = self.offset_of(step) + self.width() as i32;
        if (0..self.width() as i32).contains(&bit) {
            Some(bit as u32)
        } else {
            None
        }
    }

    /// Sent packets the remote has not acknowledged, as ack bits.
    pub(crate) fn unacked(&self) -> u32 {
        self.sent_mask() & !self.ack
    }

    /// The oldest unacknowledged packet that is followed by an acknowledged one.
    pub(crate) fn first_gap(&self) -> Option<Step> {
        let acked = self.ack & self.sent_mask();
        if acked == 0 {
            return None;
        }
        let newest_acked = u32::BITS - 1 - acked.leading_zeros();
        let holes = self.unacked() & low_mask(newest_acked);
        if holes == 0 {
            None
        } else {
            Some(self.step_of_bit(holes.trailing_zeros()))
        }
    }

    /// The next unacknowledged packet after `cursor`, wrapping around to the oldest one.
    pub(crate) fn next_unacked_after(&self, cursor: Option<Step>) -> Option<Step> {
        let unacked = self.unacked();
        if unacked == 0 {
            return None;
        }
        let later = cursor
            .and_then(|step| self.bit_of_step(step))
            .map_or(0, |bit| unacked & !low_mask(bit + 1));
        let candidates = if later != 0 { later } else { unacked };
        Some(self.step_of_bit(candidates.trailing_zeros()))
    }
}

// #########
// # TESTS #
// #########
