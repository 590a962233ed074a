use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::ledger::DeliveryLedger;
use crate::client::retransmit_timer::RetransmitTimer;
use crate::client::{DeliveryFailed, DeliveryState, DeliveryStateMachine};
use crate::wire::id_tagged::IdTaggedMessage;

/// All requests are in flight at the same time. The client sends every unconfirmed request in a
///  'round', and then collects replies in whatever order they arrive, accepting each id the first
///  time its reply is seen. When the timeout elapses before all replies arrived, the next round
///  sends only the requests that are still unconfirmed.
pub struct BurstClient {
    requests: Vec<Bytes>,
    responses: Vec<Option<Bytes>>,
    ledger: DeliveryLedger,
    /// the next id to consider in the current sending round
    cursor: u64,
    state: DeliveryState,
    timer: RetransmitTimer,
    progress_in_round: bool,
}

impl BurstClient {
    pub fn new(requests: Vec<Bytes>, timeout: Duration, max_retransmissions: Option<u32>) -> BurstClient {
        let state = if requests.is_empty() {
            DeliveryState::Finished
        }
        else {
            DeliveryState::Sending
        };

        BurstClient {
            responses: vec![None; requests.len()],
            ledger: DeliveryLedger::new(requests.len()),
            requests,
            cursor: 0,
            state,
            timer: RetransmitTimer::new(timeout, max_retransmissions),
            progress_in_round: false,
        }
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    pub fn response(&self, id: u64) -> Option<&Bytes> {
        self.responses.get(id as usize)
            .and_then(|r| r.as_ref())
    }

    /// The replies in request order. This is complete only after the client finished - ids
    ///  without a reply are skipped.
    pub fn into_responses(self) -> Vec<Bytes> {
        self.responses.into_iter()
            .flatten()
            .collect()
    }

    fn end_round(&mut self, now: Instant) {
        trace!("round complete, {} of {} requests pending", self.ledger.num_pending(), self.ledger.len());
        self.cursor = 0;
        self.state = DeliveryState::Receiving;
        self.timer.arm(now);
    }
}

impl DeliveryStateMachine for BurstClient {
    fn state(&self) -> DeliveryState {
        self.state
    }

    fn next_datagram(&mut self, now: Instant, buf: &mut BytesMut) -> bool {
        if self.state != DeliveryState::Sending {
            return false;
        }

        match self.ledger.next_pending_from(self.cursor) {
            Some(id) => {
                IdTaggedMessage::ser_parts(id, &self.requests[id as usize], buf);
                trace!("sending request {}", id);
                self.cursor = id + 1;
                true
            }
            None => {
                self.end_round(now);
                false
            }
        }
    }

    fn on_datagram(&mut self, buf: &[u8]) {
        if self.state == DeliveryState::Finished {
            debug!("received a datagram after all replies arrived - ignoring");
            return;
        }

        let response = match IdTaggedMessage::try_deser(buf) {
            Ok(response) => response,
            Err(e) => {
                debug!("dropping malformed reply: {}", e);
                return;
            }
        };

        if !self.ledger.mark(response.id) {
            debug!("received duplicate or unknown reply {} - dropping", response.id);
            return;
        }

        trace!("received reply {}", response.id);
        self.responses[response.id as usize] = Some(response.payload);
        self.progress_in_round = true;

        if self.ledger.is_complete() {
            debug!("all {} replies received", self.ledger.len());
            self.state = DeliveryState::Finished;
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
                warn!("{} of {} replies missing after {:?} - resending those (#{})", self.ledger.num_pending(), self.ledger.len(), self.timer.timeout(), n);
                self.state = DeliveryState::Sending;
                Ok(())
            }
            Err(n) => {
                warn!("{} replies missing after {} retransmissions without progress - giving up", self.ledger.num_pending(), n - 1);
                Err(DeliveryFailed {
                    pending_ids: self.ledger.pending().collect(),
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
