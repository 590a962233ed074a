//! The client side: state machines that turn a sequence of requests into reliably delivered
//!  replies, and a [driver::ClientDriver] that runs them on a non-blocking socket.
//!
//! The state machines do no I/O themselves. They are fed readiness, datagrams and the current time
//!  by the driver, which makes their behavior deterministic under test.

pub mod burst;
pub mod driver;
pub mod ledger;
pub mod long_sum;
pub mod one_by_one;
pub mod retransmit_timer;

use std::fmt::{Display, Formatter};
use std::time::Duration;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::Interest;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::burst::BurstClient;
use crate::client::driver::ClientDriver;
use crate::client::long_sum::LongSumClient;
use crate::client::one_by_one::OneByOneClient;
use crate::config::{ClientConfig, Discipline};
use crate::wire::id_tagged::IdTaggedMessage;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryState {
    /// datagrams are due to be sent, the socket is registered for writing
    Sending,
    /// waiting for replies (or for the retransmission deadline), the socket is registered for reading
    Receiving,
    /// terminal: all replies were received
    Finished,
}

/// A client protocol, driven by socket readiness and a clock.
pub trait DeliveryStateMachine {
    fn state(&self) -> DeliveryState;

    fn is_finished(&self) -> bool {
        self.state() == DeliveryState::Finished
    }

    /// the readiness the driver should wait for in the current state
    fn interest(&self) -> Interest {
        match self.state() {
            DeliveryState::Sending => Interest::WRITABLE,
            DeliveryState::Receiving | DeliveryState::Finished => Interest::READABLE,
        }
    }

    /// Called while the socket is writable. Writes the next datagram to send into the (empty)
    ///  buffer and returns `true`, or returns `false` if there is nothing (more) to send in the
    ///  current state.
    fn next_datagram(&mut self, now: Instant, buf: &mut BytesMut) -> bool;

    /// Called for every datagram received from the server. Malformed, duplicate and stale
    ///  datagrams are dropped.
    fn on_datagram(&mut self, buf: &[u8]);

    /// Called before every wait: moves back to [DeliveryState::Sending] if the retransmission
    ///  deadline has passed, or fails if that would exceed the configured retransmission budget.
    fn on_tick(&mut self, now: Instant) -> Result<(), DeliveryFailed>;

    /// how long the driver may wait for readiness before [DeliveryStateMachine::on_tick] needs
    ///  to be called again
    fn next_wait(&self, now: Instant) -> Duration;
}


/// The client gave up because the configured maximum number of retransmissions passed without
///  any reply making progress. This is returned (wrapped in `anyhow::Error`) only if a maximum
///  is configured - callers can get at the details with `downcast_ref`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeliveryFailed {
    /// the ids of requests (or operations) that were never confirmed
    pub pending_ids: Vec<u64>,
    pub retransmissions: u32,
}

impl Display for DeliveryFailed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed after {} retransmissions, {} requests unconfirmed", self.retransmissions, self.pending_ids.len())?;
        if let Some(first) = self.pending_ids.first() {
            write!(f, " (first: {})", first)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeliveryFailed {}


fn log_retry_policy(config: &ClientConfig) {
    match config.max_retransmissions {
        None => info!("retransmitting without limit every {:?} until all replies arrive", config.retransmit_timeout),
        Some(max) => info!("retransmitting every {:?}, giving up after {} retransmissions without progress", config.retransmit_timeout, max),
    }
}

/// Sends all requests as id-tagged datagrams (the request's id being its index) and returns the
///  replies' payloads in request order, using the configured [Discipline].
pub async fn exchange(config: &ClientConfig, requests: Vec<Bytes>) -> anyhow::Result<Vec<Bytes>> {
    config.validate()?;
    for (id, request) in requests.iter().enumerate() {
        if IdTaggedMessage::serialized_len(request.len()) > config.max_datagram_size {
            bail!("request {} does not fit into a datagram of {} bytes", id, config.max_datagram_size);
        }
    }
    log_retry_policy(config);

    let mut driver = ClientDriver::bind(config).await?;
    info!("sending {} requests to {:?} ({:?})", requests.len(), config.server_addr, config.discipline);

    match config.discipline {
        Discipline::OneByOne => {
            let mut client = OneByOneClient::new(requests, config.retransmit_timeout, config.max_retransmissions);
            driver.run(&mut client).await?;
            Ok(client.into_responses())
        }
        Discipline::Burst => {
            let mut client = BurstClient::new(requests, config.retransmit_timeout, config.max_retransmissions);
            driver.run(&mut client).await?;
            Ok(client.into_responses())
        }
    }
}

/// Has the server sum up `values` in a new session with a random id, and returns the sum
pub async fn long_sum(config: &ClientConfig, values: Vec<i64>) -> anyhow::Result<i64> {
    config.validate()?;
    log_retry_policy(config);

    let mut client = LongSumClient::with_random_session_id(values, config.retransmit_timeout, config.max_retransmissions);
    info!("summing {} values in session {} on {:?}", client.num_operations(), client.session_id(), config.server_addr);

    let mut driver = ClientDriver::bind(config).await?;
    driver.run(&mut client).await?;

    match client.total() {
        Some(total) => Ok(total),
        None => {
            warn!("session {} finished without a result", client.session_id());
            bail!("session {} finished without a result", client.session_id())
        }
    }
}
