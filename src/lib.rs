//! PulseWire - length-prefixed binary messaging with heartbeat supervision
//!
//! Clients and servers exchange framed messages over TCP. Each connection is
//! watched by reader/writer idle timers: idle writers send heartbeats and idle
//! readers are disconnected.

pub mod config;
pub mod network;
pub mod protocol;
