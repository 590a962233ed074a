//! The server side: a [server_driver::DatagramServer] listening on any number of ports, and the
//!  services it dispatches datagrams to.

pub mod id_upper_case;
pub mod server_driver;
pub mod session_aggregator;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;

/// Application logic behind a [server_driver::DatagramServer]. A service is called for each
///  received datagram and may return a single reply, which is sent back to the datagram's source
///  through the socket it arrived on.
///
/// Services must be idempotent with regard to duplicate datagrams: clients retransmit requests
///  whose replies were lost, so the same request can arrive any number of times.
#[cfg_attr(test, automock)]
pub trait DatagramService: Send + 'static {
    fn on_datagram(&mut self, from: SocketAddr, buf: &[u8], now: Instant) -> Option<Bytes>;

    /// called periodically if [DatagramService::tick_interval] returns an interval
    fn on_tick(&mut self, _now: Instant) {}

    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}
