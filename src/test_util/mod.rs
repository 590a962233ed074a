//! Utilities for testing clients and servers under adverse network conditions. They are part of
//!  the crate's regular code so applications can use them in their own tests.

pub mod lossy_relay;
