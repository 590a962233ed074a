//! Reliable request / reply exchanges on top of UDP, which may lose, duplicate and reorder
//!  datagrams.
//!
//! Clients tag every request with an id and retransmit requests until their replies arrive,
//!  either strictly one at a time or in bursts of all outstanding requests. Servers are
//!  idempotent with regard to retransmitted requests, and the session protocol lets a client
//!  have the server aggregate any number of values reliably.

pub mod client;
pub mod config;
pub mod multiplexer;
pub mod server;
pub mod test_util;
pub mod util;
pub mod wire;
