//! # nowallet-network — server link over TCP.
//!
//! Speaks the newline-delimited JSON-RPC protocol of Electrum-style
//! lightweight servers. The main entry point is [`ElectrumClient::connect`],
//! which spawns a background connection task and returns a handle
//! implementing [`nowallet_core::traits::ServerLink`].

pub mod client;
pub mod config;
pub mod protocol;

pub use client::ElectrumClient;
pub use config::{ClientConfig, server_address};
pub use protocol::Incoming;
