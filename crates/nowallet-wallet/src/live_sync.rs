//! Incremental ledger updates driven by address subscriptions.
//!
//! [`LiveSync::run`] subscribes every address recorded in either index
//! table and then folds notifications one at a time. A refresh that fails is
//! logged and skipped; the task only ends when the notification stream
//! closes or the future is dropped.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use nowallet_core::error::LinkError;
use nowallet_core::traits::ServerLink;
use nowallet_core::types::{AddressNotification, Chain};

use crate::activity::lookup_activity;
use crate::error::WalletError;
use crate::keys::KeyTree;
use crate::ledger::LedgerState;

/// Activity signalled to presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// A notified address was refreshed and had new transactions or UTXOs.
    Activity {
        address: String,
        chain: Chain,
        index: u32,
        new_txs: usize,
        balance: u64,
    },
    /// A locally built transaction was accepted by the server.
    Spent { txid: Txid, fee: u64, balance: u64 },
}

/// Address → derivation position, derived on demand.
#[derive(Default)]
struct AddressBook {
    positions: HashMap<String, (Chain, u32)>,
    derived: [u32; 2],
}

impl AddressBook {
    /// Derive addresses of `chain` up to (excluding) `limit`.
    fn extend(&mut self, keys: &KeyTree, chain: Chain, limit: u32) -> Result<(), WalletError> {
        let slot = chain.branch() as usize;
        for index in self.derived[slot]..limit {
            self.positions.insert(keys.address(chain, index)?, (chain, index));
        }
        self.derived[slot] = self.derived[slot].max(limit);
        Ok(())
    }

    fn get(&self, address: &str) -> Option<(Chain, u32)> {
        self.positions.get(address).copied()
    }
}

/// The long-lived subscription consumer.
pub struct LiveSync {
    keys: Arc<KeyTree>,
    link: Arc<dyn ServerLink>,
    ledger: Arc<Mutex<LedgerState>>,
    events: broadcast::Sender<WalletEvent>,
    gap_limit: u32,
    refresh_timeout: Duration,
    book: AddressBook,
    /// Number of leading indices of each chain already subscribed.
    subscribed: [u32; 2],
}

impl LiveSync {
    pub fn new(
        keys: Arc<KeyTree>,
        link: Arc<dyn ServerLink>,
        ledger: Arc<Mutex<LedgerState>>,
        events: broadcast::Sender<WalletEvent>,
        gap_limit: u32,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            keys,
            link,
            ledger,
            events,
            gap_limit,
            refresh_timeout,
            book: AddressBook::default(),
            subscribed: [0, 0],
        }
    }

    /// Subscribe all known addresses and process notifications forever.
    ///
    /// Returns only with an error: `Link(Closed)` once the server stream
    /// ends, or the error of the initial subscriptions.
    pub async fn run(mut self) -> Result<Infallible, WalletError> {
        let mut notifications = self.link.notifications().ok_or_else(|| {
            WalletError::Link(LinkError::Protocol("notification stream already taken".into()))
        })?;

        for chain in Chain::ALL {
            self.subscribe_known(chain).await?;
        }
        info!(
            spend = self.subscribed[0],
            change = self.subscribed[1],
            "subscribed to wallet addresses"
        );

        loop {
            let Some(note) = notifications.recv().await else {
                info!("notification stream closed");
                return Err(WalletError::Link(LinkError::Closed));
            };
            if let Err(e) = self.refresh(&note).await {
                warn!(address = %note.address, error = %e, "skipping failed refresh");
            }
        }
    }

    /// Subscribe the addresses of `chain`'s table not yet subscribed.
    async fn subscribe_known(&mut self, chain: Chain) -> Result<(), WalletError> {
        let slot = chain.branch() as usize;
        let known = self.ledger.lock().table(chain).len() as u32;
        for index in self.subscribed[slot]..known {
            let address = self.keys.address(chain, index)?;
            self.link.subscribe_address(&address).await?;
            self.subscribed[slot] = index + 1;
        }
        Ok(())
    }

    /// Refetch one notified address and fold it.
    async fn refresh(&mut self, note: &AddressNotification) -> Result<(), WalletError> {
        let Some((chain, index)) = self.locate(&note.address)? else {
            warn!(address = %note.address, "notification for unknown address");
            return Ok(());
        };
        let key = self.keys.key(chain, index)?;

        let activity = tokio::time::timeout(
            self.refresh_timeout,
            lookup_activity(self.link.as_ref(), &key),
        )
        .await
        .map_err(|_| LinkError::Timeout)??;

        let Some(activity) = activity else {
            debug!(address = %note.address, "notified address has no history");
            return Ok(());
        };

        let (outcome, balance) = {
            let mut ledger = self.ledger.lock();
            let outcome = ledger.apply_used(activity);
            (outcome, ledger.balance())
        };
        info!(
            address = %note.address,
            %chain,
            index,
            new_txs = outcome.new_txs,
            new_utxos = outcome.new_utxos,
            delta = outcome.balance_delta,
            "address activity"
        );

        // No receivers is fine.
        let _ = self.events.send(WalletEvent::Activity {
            address: note.address.clone(),
            chain,
            index,
            new_txs: outcome.new_txs,
            balance,
        });

        self.subscribe_known(chain).await
    }

    /// Find the position of a wallet address, deriving up to
    /// `table_len + gap_limit` on both chains.
    fn locate(&mut self, address: &str) -> Result<Option<(Chain, u32)>, WalletError> {
        if let Some(position) = self.book.get(address) {
            return Ok(Some(position));
        }
        let limits = {
            let ledger = self.ledger.lock();
            Chain::ALL.map(|chain| ledger.table(chain).len() as u32 + self.gap_limit)
        };
        for chain in Chain::ALL {
            self.book.extend(&self.keys, chain, limits[chain.branch() as usize])?;
        }
        Ok(self.book.get(address))
    }
}
