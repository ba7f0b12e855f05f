//! Wallet composition: key tree, server link, ledger, discovery, live sync
//! and spending.
//!
//! The [`Wallet`] owns the ledger behind a single mutex shared with the
//! discoverer, the live-sync task and the transaction builder. No component
//! holds the lock across an await, so each ledger mutation completes without
//! an intervening suspension point.

use std::fmt;
use std::sync::Arc;

use bitcoin::{Amount, Denomination, Txid};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use nowallet_core::constants::ticker;
use nowallet_core::traits::ServerLink;
use nowallet_core::types::{Chain, Utxo};

use crate::builder::{PendingTransaction, SpendReceipt, TxBuilder};
use crate::config::WalletConfig;
use crate::discovery::{AddressDiscoverer, DiscoveryReport};
use crate::error::WalletError;
use crate::keys::{KeyTree, Seed};
use crate::ledger::LedgerState;
use crate::live_sync::{LiveSync, WalletEvent};
use crate::signer::{P2pkhSigner, TxSigner};

/// Capacity of the activity event channel.
const EVENT_CAPACITY: usize = 64;

/// A brainwallet synchronized against one server.
pub struct Wallet {
    keys: Arc<KeyTree>,
    link: Arc<dyn ServerLink>,
    ledger: Arc<Mutex<LedgerState>>,
    signer: Arc<dyn TxSigner>,
    config: WalletConfig,
    events: broadcast::Sender<WalletEvent>,
}

impl Wallet {
    /// Create a wallet with an empty ledger.
    pub fn new(keys: KeyTree, link: Arc<dyn ServerLink>, config: WalletConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            keys: Arc::new(keys),
            link,
            ledger: Arc::new(Mutex::new(LedgerState::new())),
            signer: Arc::new(P2pkhSigner::new()),
            config,
            events,
        }
    }

    /// Derive the key tree for `config.network` and `config.account` from a
    /// seed and create the wallet.
    pub fn from_seed(seed: &Seed, link: Arc<dyn ServerLink>, config: WalletConfig) -> Result<Self, WalletError> {
        let keys = KeyTree::derive(seed, config.network, config.account)?;
        Ok(Self::new(keys, link, config))
    }

    /// Replace the transaction signer.
    pub fn with_signer(mut self, signer: Arc<dyn TxSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// Scan both chains with the gap-limit algorithm.
    pub async fn discover(&self) -> Result<DiscoveryReport, WalletError> {
        AddressDiscoverer::new(
            Arc::clone(&self.keys),
            Arc::clone(&self.link),
            Arc::clone(&self.ledger),
            self.config.gap_limit,
            self.config.request_timeout,
        )
        .discover()
        .await
    }

    /// The live-sync task for this wallet. Spawn or await
    /// [`LiveSync::run`]; dropping it stops the subscription processing.
    pub fn live_sync(&self) -> LiveSync {
        LiveSync::new(
            Arc::clone(&self.keys),
            Arc::clone(&self.link),
            Arc::clone(&self.ledger),
            self.events.clone(),
            self.config.gap_limit,
            self.config.request_timeout,
        )
    }

    fn builder(&self) -> TxBuilder {
        TxBuilder::new(
            Arc::clone(&self.keys),
            Arc::clone(&self.link),
            Arc::clone(&self.ledger),
            Arc::clone(&self.signer),
            &self.config,
        )
    }

    /// Build and sign a spend without broadcasting it.
    pub async fn build_spend(&self, destination: &str, amount: u64) -> Result<PendingTransaction, WalletError> {
        self.builder().build(destination, amount).await
    }

    /// Send `amount` satoshis to `destination`.
    pub async fn spend(&self, destination: &str, amount: u64) -> Result<SpendReceipt, WalletError> {
        let receipt = self.builder().send(destination, amount).await?;
        let _ = self.events.send(WalletEvent::Spent {
            txid: receipt.txid,
            fee: receipt.fee,
            balance: receipt.balance,
        });
        Ok(receipt)
    }

    /// Receive activity events from live sync and spends.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Balance in satoshis.
    pub fn balance(&self) -> u64 {
        self.ledger.lock().balance()
    }

    pub fn utxos(&self) -> Vec<Utxo> {
        self.ledger.lock().utxos().to_vec()
    }

    /// A copy of the current ledger.
    pub fn ledger(&self) -> LedgerState {
        self.ledger.lock().clone()
    }

    pub fn keys(&self) -> &KeyTree {
        &self.keys
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Address of the first unused index of `chain`.
    pub fn next_unused_address(&self, chain: Chain) -> Result<String, WalletError> {
        let index = self.ledger.lock().next_unused(chain);
        self.keys.address(chain, index)
    }

    /// Snapshot for display.
    pub fn summary(&self) -> Result<WalletSummary, WalletError> {
        let (history, utxos, balance, receive_index) = {
            let ledger = self.ledger.lock();
            let history = ledger
                .history()
                .iter()
                .map(|(address, txs)| (address.clone(), txs.iter().map(|t| t.txid).collect()))
                .collect();
            (
                history,
                ledger.utxos().to_vec(),
                ledger.balance(),
                ledger.next_unused(Chain::Spend),
            )
        };
        Ok(WalletSummary {
            xpub: self.keys.xpub().to_string(),
            history,
            utxos,
            balance,
            ticker: ticker(self.config.network),
            receive_address: self.keys.address(Chain::Spend, receive_index)?,
        })
    }
}

/// What the CLI prints after discovery and after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSummary {
    pub xpub: String,
    /// Txids per used address.
    pub history: Vec<(String, Vec<Txid>)>,
    pub utxos: Vec<Utxo>,
    /// Balance in satoshis.
    pub balance: u64,
    pub ticker: &'static str,
    /// The next unused spend address.
    pub receive_address: String,
}

impl fmt::Display for WalletSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "XPUB: {}", self.xpub)?;
        writeln!(f, "History:")?;
        for (address, txids) in &self.history {
            writeln!(f, "  {address}")?;
            for txid in txids {
                writeln!(f, "    {txid}")?;
            }
        }
        writeln!(f, "UTXOs:")?;
        for utxo in &self.utxos {
            writeln!(f, "  {utxo}")?;
        }
        writeln!(
            f,
            "Balance: {} {}",
            Amount::from_sat(self.balance).display_in(Denomination::Bitcoin),
            self.ticker
        )?;
        write!(f, "Receive address: {}", self.receive_address)
    }
}
