//! The two datagram formats. Datagram boundaries are message boundaries, so neither format
//!  carries a length prefix, and all integers are big-endian.

pub mod id_tagged;
pub mod session_message;
