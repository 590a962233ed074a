use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::retransmit_timer::RetransmitTimer;
use crate::client::{DeliveryFailed, DeliveryState, DeliveryStateMachine};
use crate::wire::id_tagged::IdTaggedMessage;

/// Strict request / reply lockstep: the request with id `n+1` is sent only after the reply for id
///  `n` arrived, so replies complete in request order. A reply for any other id is stale (or a
///  duplicate) and is dropped. If the reply does not arrive within the timeout, the same request
///  is sent again.
pub struct OneByOneClient {
    requests: Vec<Bytes>,
    responses: Vec<Bytes>,
    current_id: u64,
    state: DeliveryState,
    timer: RetransmitTimer,
}

impl OneByOneClient {
    pub fn new(requests: Vec<Bytes>, timeout: Duration, max_retransmissions: Option<u32>) -> OneByOneClient {
        let state = if requests.is_empty() {
            DeliveryState::Finished
        }
        else {
            DeliveryState::Sending
        };

        OneByOneClient {
            responses: Vec::with_capacity(requests.len()),
            requests,
            current_id: 0,
            state,
            timer: RetransmitTimer::new(timeout, max_retransmissions),
        }
    }

    /// the id of the request that is currently in flight
    pub fn current_id(&self) -> u64 {
        self.current_id
    }

    /// the replies received so far, in request order
    pub fn responses(&self) -> &[Bytes] {
        &self.responses
    }

    pub fn into_responses(self) -> Vec<Bytes> {
        self.responses
    }

    fn num_requests(&self) -> u64 {
        self.requests.len() as u64
    }
}

impl DeliveryStateMachine for OneByOneClient {
    fn state(&self) -> DeliveryState {
        self.state
    }

    fn next_datagram(&mut self, now: Instant, buf: &mut BytesMut) -> bool {
        if self.state != DeliveryState::Sending {
            return false;
        }

        let request = &self.requests[self.current_id as usize];
        IdTaggedMessage::ser_parts(self.current_id, request, buf);
        trace!("sending request {}", self.current_id);

        self.state = DeliveryState::Receiving;
        self.timer.arm(now);
        true
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

        if response.id != self.current_id {
            debug!("received reply {} while waiting for {} - dropping", response.id, self.current_id);
            return;
        }

        trace!("received reply {}", response.id);
        self.responses.push(response.payload);
        self.current_id += 1;
        self.timer.on_progress();

        self.state = if self.current_id == self.num_requests() {
            debug!("all {} replies received", self.num_requests());
            DeliveryState::Finished
        }
        else {
            DeliveryState::Sending
        };
    }

    fn on_tick(&mut self, now: Instant) -> Result<(), DeliveryFailed> {
        if self.state != DeliveryState::Receiving || !self.timer.is_expired(now) {
            return Ok(());
        }

        match self.timer.on_retransmission() {
            Ok(n) => {
                warn!("no reply for request {} within {:?} - retransmitting (#{})", self.current_id, self.timer.timeout(), n);
                self.state = DeliveryState::Sending;
                Ok(())
            }
            Err(n) => {
                warn!("no reply for request {} after {} retransmissions - giving up", self.current_id, n - 1);
                Err(DeliveryFailed {
                    pending_ids: (self.current_id..self.num_requests()).collect(),
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
