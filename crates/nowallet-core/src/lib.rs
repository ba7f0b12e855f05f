//! # nowallet-core
//! Shared types and the server-link contract for the nowallet engine.
//!
//! - [`constants`] — protocol method names and wallet policy constants
//! - [`types`] — wire records and wallet-side UTXO types
//! - [`error`] — `LinkError`
//! - [`traits`] — the async [`ServerLink`](traits::ServerLink) boundary

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;

pub use error::LinkError;
pub use traits::ServerLink;
pub use types::{
    AddressNotification, Chain, HistoryItem, Owner, ServerBalance, UnspentItem, Utxo,
};
