//! # nowallet-wallet — brainwallet sync and transaction engine.
//!
//! Derives a BIP-44 key tree from a stretched salt/passphrase seed,
//! discovers used addresses with the gap-limit algorithm, keeps the ledger
//! current from server notifications, and builds, signs and broadcasts
//! spends.
//!
//! # Modules
//!
//! - [`error`] — `WalletError` enum
//! - [`config`] — `WalletConfig`, `SeedParams`
//! - [`keys`] — `Seed`, `KeyTree`, `KeyHandle`
//! - [`ledger`] — `LedgerState` and its index tables
//! - [`activity`] — fetching the activity of one address
//! - [`discovery`] — gap-limit `AddressDiscoverer`
//! - [`live_sync`] — notification-driven `LiveSync`
//! - [`coin_selection`] — greedy in-order selection
//! - [`ordering`] — canonical input/output ordering
//! - [`fees`] — `FeeRate` and size estimate
//! - [`signer`] — `TxSigner` and the P2PKH signer
//! - [`builder`] — `TxBuilder`
//! - [`wallet`] — high-level wallet composition

pub mod activity;
pub mod builder;
pub mod coin_selection;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fees;
pub mod keys;
pub mod ledger;
pub mod live_sync;
pub mod ordering;
pub mod signer;
pub mod wallet;

// Re-exports for convenient access
pub use builder::{PendingTransaction, SpendReceipt, TxBuilder};
pub use coin_selection::{CoinSelection, CoinSelector};
pub use config::{SeedParams, WalletConfig};
pub use discovery::{AddressDiscoverer, ChainScan, DiscoveryReport};
pub use error::WalletError;
pub use fees::FeeRate;
pub use keys::{KeyHandle, KeyTree, Seed};
pub use ledger::{AddressActivity, FoldOutcome, IndexTable, LedgerState, WalletTx};
pub use live_sync::{LiveSync, WalletEvent};
pub use signer::{P2pkhSigner, SigningInput, TxSigner};
pub use wallet::{Wallet, WalletSummary};
