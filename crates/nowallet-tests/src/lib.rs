//! Integration test suite for nowallet.
//!
//! Drives the wallet engine against an in-memory server: gap-limit
//! discovery, notification-driven sync and the full spend cycle.

pub mod helpers;
