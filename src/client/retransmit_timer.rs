use std::time::Duration;

use tokio::time::Instant;

/// Tracks when the last send happened, when a retransmission becomes due, and how many
///  retransmissions happened in a row without progress.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    timeout: Duration,
    max_retransmissions: Option<u32>,
    last_send: Option<Instant>,
    retransmissions: u32,
}

impl RetransmitTimer {
    pub fn new(timeout: Duration, max_retransmissions: Option<u32>) -> RetransmitTimer {
        RetransmitTimer {
            timeout,
            max_retransmissions,
            last_send: None,
            retransmissions: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// starts a new timeout period
    pub fn arm(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    /// `timeout - (now - last_send)`, saturating at zero. A timer that was never armed has
    ///  nothing to wait for.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_send {
            Some(last_send) => self.timeout.saturating_sub(now.saturating_duration_since(last_send)),
            None => Duration::ZERO,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.last_send.is_some() && self.remaining(now).is_zero()
    }

    /// Records that a retransmission is due. Returns the number of consecutive retransmissions
    ///  including this one, or an `Err` with that number if it exceeds the configured maximum.
    pub fn on_retransmission(&mut self) -> Result<u32, u32> {
        self.retransmissions = self.retransmissions.saturating_add(1);
        self.last_send = None;
        match self.max_retransmissions {
            Some(max) if self.retransmissions > max => Err(self.retransmissions),
            _ => Ok(self.retransmissions),
        }
    }

    /// called when a reply made progress: the retransmission budget starts over
    pub fn on_progress(&mut self) {
        self.retransmissions = 0;
    }
}
