use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::ledger::DeliveryLedger;
use crate::client::retransmit_timer::RetransmitTimer;
use crate::client::{DeliveryFailed, DeliveryState, DeliveryStateMachine};
use crate::wire::session_message::{OperationData, SessionMessage};

/// Client side of the session protocol: every value is sent as one operation of a session, and
///  the server acknowledges each operation until it has all of them, replying with the session's
///  sum from then on.
///
/// Operations are sent in rounds like [crate::client::burst::BurstClient] requests: each round
///  sends the operations that were not acknowledged yet, and the client finishes as soon as the
///  result arrives.
///
/// If all operations were acknowledged but no result arrived, the server lost the session (it
///  was evicted, or the server restarted). The next round then sends all operations again.
pub struct LongSumClient {
    session_id: u64,
    values: Vec<i64>,
    acknowledged: DeliveryLedger,
    cursor: u64,
    state: DeliveryState,
    timer: RetransmitTimer,
    progress_in_round: bool,
    total: Option<i64>,
}

impl LongSumClient {
    pub fn new(session_id: u64, values: Vec<i64>, timeout: Duration, max_retransmissions: Option<u32>) -> LongSumClient {
        // an empty session has nothing for the server to add up
        let (state, total) = if values.is_empty() {
            (DeliveryState::Finished, Some(0))
        }
        else {
            (DeliveryState::Sending, None)
        };

        LongSumClient {
            session_id,
            acknowledged: DeliveryLedger::new(values.len()),
            values,
            cursor: 0,
            state,
            timer: RetransmitTimer::new(timeout, max_retransmissions),
            progress_in_round: false,
            total,
        }
    }

    pub fn with_random_session_id(values: Vec<i64>, timeout: Duration, max_retransmissions: Option<u32>) -> LongSumClient {
        Self::new(rand::random(), values, timeout, max_retransmissions)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn num_operations(&self) -> u64 {
        self.values.len() as u64
    }

    pub fn acknowledged(&self) -> &DeliveryLedger {
        &self.acknowledged
    }

    /// the session's sum, available once the client finished
    pub fn total(&self) -> Option<i64> {
        self.total
    }

    fn on_ack(&mut self, op_index: u64) {
        if self.acknowledged.mark(op_index) {
            trace!("session {}: operation {} acknowledged", self.session_id, op_index);
            self.progress_in_round = true;
        }
        else {
            debug!("session {}: duplicate or unknown acknowledgment for operation {} - dropping", self.session_id, op_index);
        }
    }
}

impl DeliveryStateMachine for LongSumClient {
    fn state(&self) -> DeliveryState {
        self.state
    }

    fn next_datagram(&mut self, now: Instant, buf: &mut BytesMut) -> bool {
        if self.state != DeliveryState::Sending {
            return false;
        }

        match self.acknowledged.next_pending_from(self.cursor) {
            Some(op_index) => {
                SessionMessage::Operation(OperationData {
                    session_id: self.session_id,
                    op_index,
                    op_count: self.num_operations(),
                    value: self.values[op_index as usize],
                }).ser(buf);
                trace!("session {}: sending operation {}", self.session_id, op_index);
                self.cursor = op_index + 1;
                true
            }
            None => {
                self.cursor = 0;
                self.state = DeliveryState::Receiving;
                self.timer.arm(now);
                false
            }
        }
    }

    fn on_datagram(&mut self, buf: &[u8]) {
        if self.state == DeliveryState::Finished {
            debug!("received a datagram after the session finished - ignoring");
            return;
        }

        let msg = match SessionMessage::try_deser(buf) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping malformed reply: {}", e);
                return;
            }
        };

        if msg.session_id() != self.session_id {
            debug!("received reply for session {} while in session {} - dropping", msg.session_id(), self.session_id);
            return;
        }

        match msg {
            SessionMessage::Ack(data) => self.on_ack(data.op_index),
            SessionMessage::Result(data) => {
                debug!("session {}: result is {}", self.session_id, data.total);
                self.total = Some(data.total);
                self.state = DeliveryState::Finished;
            }
            SessionMessage::Operation(_) => {
                warn!("received an operation from the server - dropping");
            }
        }
    }

    fn on_tick(&mut self, now: Instant) -> Result<(), DeliveryFailed> {
        if self.state != DeliveryState::Receiving || !self.timer.is_expired(now) {
            return Ok(());
        }

        if self.progress_in_round {
            self.timer.on_progress();
            self.progress_in_round = false;
        }

        match self.timer.on_retransmission() {
            Ok(n) => {
                if self.acknowledged.is_complete() {
                    warn!("session {}: all operations acknowledged but no result after {:?} - resending all of them (#{})", self.session_id, self.timer.timeout(), n);
                    self.acknowledged = DeliveryLedger::new(self.values.len());
                }
                else {
                    warn!("session {}: no result after {:?}, {} operations unacknowledged - resending those (#{})", self.session_id, self.timer.timeout(), self.acknowledged.num_pending(), n);
                }
                self.state = DeliveryState::Sending;
                Ok(())
            }
            Err(n) => {
                warn!("session {}: no result after {} retransmissions without progress - giving up", self.session_id, n - 1);
                Err(DeliveryFailed {
                    pending_ids: self.acknowledged.pending().collect(),
                    retransmissions: n - 1,
                })
            }
        }
    }

    fn next_wait(&self, now: Instant) -> Duration {
        match self.state {
            DeliveryState::Receiving => self.timer.remaining(now),
            DeliveryState::Sending | DeliveryState::Finished => Duration::ZERO,
        }
    }
}
