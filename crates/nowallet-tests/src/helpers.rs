//! Shared test helpers: an in-memory [`ServerLink`] and wallet fixtures.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use nowallet_core::error::LinkError;
use nowallet_core::traits::ServerLink;
use nowallet_core::types::{AddressNotification, Chain, HistoryItem, ServerBalance, UnspentItem};
use nowallet_wallet::{KeyTree, Seed, SeedParams, Wallet, WalletConfig};

/// Salt and passphrase of the reference wallet.
pub const SALT: &str = "alice@example.com";
pub const PASSPHRASE: &str = "hunter2";

/// How the mock answers `blockchain.transaction.broadcast`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMode {
    /// Return the txid and apply the transaction to the server state.
    Accept,
    /// Answer with a server error object.
    Reject(String),
    /// Fail at the transport level.
    TransportError,
    /// Answer with a string that is not the txid.
    WrongAnswer(String),
    /// Never answer.
    Stall,
}

struct MockState {
    histories: HashMap<String, Vec<HistoryItem>>,
    transactions: HashMap<Txid, Transaction>,
    unspent: HashMap<String, Vec<UnspentItem>>,
    fee_btc_per_kb: f64,
    broadcast_mode: BroadcastMode,
    broadcasts: Vec<Transaction>,
    subscribed: Vec<String>,
    failing: HashSet<String>,
    stalled: HashSet<String>,
    history_calls: Vec<String>,
    next_funding: u32,
}

/// In-memory server holding per-address histories and unspent outputs.
pub struct MockServer {
    network: Network,
    state: Mutex<MockState>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<AddressNotification>>>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<AddressNotification>>>,
}

impl MockServer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            network: Network::Testnet,
            state: Mutex::new(MockState {
                histories: HashMap::new(),
                transactions: HashMap::new(),
                unspent: HashMap::new(),
                fee_btc_per_kb: 0.00001,
                broadcast_mode: BroadcastMode::Accept,
                broadcasts: Vec::new(),
                subscribed: Vec::new(),
                failing: HashSet::new(),
                stalled: HashSet::new(),
                history_calls: Vec::new(),
                next_funding: 0,
            }),
            notify_tx: Mutex::new(Some(tx)),
            notify_rx: Mutex::new(Some(rx)),
        }
    }

    /// Pay `value` satoshis to `address` in a fresh confirmed transaction
    /// whose input spends a fabricated outpoint.
    pub fn fund(&self, address: &str, value: u64, height: i64) -> OutPoint {
        let script = script_for(address);
        let mut state = self.state.lock();
        state.next_funding += 1;
        let mut source = [0xAAu8; 32];
        source[..4].copy_from_slice(&state.next_funding.to_le_bytes());

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array(source),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script,
            }],
        };
        let txid = tx.compute_txid();
        state.transactions.insert(txid, tx);
        state
            .histories
            .entry(address.to_string())
            .or_default()
            .push(HistoryItem { tx_hash: txid, height });
        state.unspent.entry(address.to_string()).or_default().push(UnspentItem {
            tx_hash: txid,
            tx_pos: 0,
            value,
            height,
        });
        OutPoint { txid, vout: 0 }
    }

    pub fn set_fee_rate(&self, btc_per_kb: f64) {
        self.state.lock().fee_btc_per_kb = btc_per_kb;
    }

    pub fn set_broadcast_mode(&self, mode: BroadcastMode) {
        self.state.lock().broadcast_mode = mode;
    }

    /// Make history lookups of `address` fail with a server error.
    pub fn fail_history_for(&self, address: &str) {
        self.state.lock().failing.insert(address.to_string());
    }

    /// Make history lookups of `address` hang forever.
    pub fn stall_history_for(&self, address: &str) {
        self.state.lock().stalled.insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        let mut state = self.state.lock();
        state.failing.remove(address);
        state.stalled.remove(address);
    }

    /// Push a subscription notification for `address`.
    pub fn notify(&self, address: &str) {
        let status = self.status(address);
        if let Some(tx) = self.notify_tx.lock().as_ref() {
            let _ = tx.send(AddressNotification {
                address: address.to_string(),
                status,
            });
        }
    }

    /// End the notification stream.
    pub fn close_notifications(&self) {
        self.notify_tx.lock().take();
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().broadcasts.clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().subscribed.clone()
    }

    /// Addresses whose history was requested, in request order.
    pub fn history_calls(&self) -> Vec<String> {
        self.state.lock().history_calls.clone()
    }

    fn status(&self, address: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .histories
            .get(address)
            .filter(|h| !h.is_empty())
            .map(|h| format!("{:x}", h.len()))
    }

    /// Apply an accepted transaction: spend its inputs and credit its
    /// outputs, updating the histories of every address involved.
    fn apply(&self, state: &mut MockState, tx: &Transaction) {
        let txid = tx.compute_txid();
        state.transactions.insert(txid, tx.clone());

        let mut touched = HashSet::new();
        for input in &tx.input {
            for (address, items) in state.unspent.iter_mut() {
                let before = items.len();
                items.retain(|u| u.outpoint() != input.previous_output);
                if items.len() != before {
                    touched.insert(address.clone());
                }
            }
        }
        for (vout, output) in tx.output.iter().enumerate() {
            if let Ok(address) = Address::from_script(&output.script_pubkey, self.network) {
                let address = address.to_string();
                state.unspent.entry(address.clone()).or_default().push(UnspentItem {
                    tx_hash: txid,
                    tx_pos: vout as u32,
                    value: output.value.to_sat(),
                    height: 0,
                });
                touched.insert(address);
            }
        }
        for address in touched {
            state
                .histories
                .entry(address)
                .or_default()
                .push(HistoryItem { tx_hash: txid, height: 0 });
        }
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerLink for MockServer {
    async fn get_history(&self, address: &str) -> Result<Vec<HistoryItem>, LinkError> {
        let (result, stalled) = {
            let mut state = self.state.lock();
            state.history_calls.push(address.to_string());
            let result = if state.failing.contains(address) {
                Err(LinkError::Rpc {
                    code: -32603,
                    message: format!("history unavailable for {address}"),
                })
            } else {
                Ok(state.histories.get(address).cloned().unwrap_or_default())
            };
            (result, state.stalled.contains(address))
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        result
    }

    async fn get_balance(&self, address: &str) -> Result<ServerBalance, LinkError> {
        let state = self.state.lock();
        let mut balance = ServerBalance::default();
        for item in state.unspent.get(address).into_iter().flatten() {
            if item.height > 0 {
                balance.confirmed += item.value;
            } else {
                balance.unconfirmed += item.value as i64;
            }
        }
        Ok(balance)
    }

    async fn list_unspent(&self, address: &str) -> Result<Vec<UnspentItem>, LinkError> {
        Ok(self.state.lock().unspent.get(address).cloned().unwrap_or_default())
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<String, LinkError> {
        self.state
            .lock()
            .transactions
            .get(txid)
            .map(serialize_hex)
            .ok_or_else(|| LinkError::Rpc {
                code: -5,
                message: format!("no such transaction {txid}"),
            })
    }

    async fn estimate_fee(&self, _target_blocks: u32) -> Result<f64, LinkError> {
        Ok(self.state.lock().fee_btc_per_kb)
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<String, LinkError> {
        let bytes = hex::decode(raw_hex).map_err(|e| LinkError::Protocol(e.to_string()))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| LinkError::Protocol(e.to_string()))?;

        if self.state.lock().broadcast_mode == BroadcastMode::Stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        match state.broadcast_mode.clone() {
            BroadcastMode::Accept => {
                state.broadcasts.push(tx.clone());
                self.apply(&mut state, &tx);
                Ok(tx.compute_txid().to_string())
            }
            BroadcastMode::Reject(message) => Err(LinkError::Rpc { code: 1, message }),
            BroadcastMode::TransportError => Err(LinkError::Io("connection reset".into())),
            BroadcastMode::WrongAnswer(answer) => Ok(answer),
            BroadcastMode::Stall => unreachable!("stalled broadcasts never reach the answer"),
        }
    }

    async fn subscribe_address(&self, address: &str) -> Result<Option<String>, LinkError> {
        self.state.lock().subscribed.push(address.to_string());
        Ok(self.status(address))
    }

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<AddressNotification>> {
        self.notify_rx.lock().take()
    }
}

/// Locking script of a testnet address string.
pub fn script_for(address: &str) -> ScriptBuf {
    Address::from_str(address)
        .expect("valid address")
        .assume_checked()
        .script_pubkey()
}

/// Cheap seed-stretching parameters for tests.
pub fn light_params() -> SeedParams {
    SeedParams {
        scrypt_log_n: 4,
        scrypt_r: 8,
        scrypt_p: 1,
        pbkdf2_rounds: 16,
    }
}

pub fn test_config() -> WalletConfig {
    WalletConfig {
        request_timeout: Duration::from_secs(5),
        seed_params: light_params(),
        ..WalletConfig::testnet()
    }
}

/// Key tree of the reference wallet.
pub fn reference_keys() -> KeyTree {
    let seed = Seed::derive(SALT, PASSPHRASE, &light_params()).expect("seed derivation");
    KeyTree::derive(&seed, Network::Testnet, 0).expect("key tree")
}

/// The reference wallet connected to `server`.
pub fn reference_wallet(server: &Arc<MockServer>) -> Wallet {
    reference_wallet_with(server, test_config())
}

/// The reference wallet connected to `server` with a custom config.
pub fn reference_wallet_with(server: &Arc<MockServer>, config: WalletConfig) -> Wallet {
    let link: Arc<dyn ServerLink> = server.clone();
    Wallet::new(reference_keys(), link, config)
}

/// Test config whose link requests give up after `request_timeout`.
pub fn impatient_config(request_timeout: Duration) -> WalletConfig {
    WalletConfig {
        request_timeout,
        ..test_config()
    }
}

/// Address of the reference wallet at `(chain, index)`.
pub fn wallet_address(chain: Chain, index: u32) -> String {
    reference_keys().address(chain, index).expect("address")
}

/// A testnet address that does not belong to the reference wallet.
pub fn foreign_address() -> String {
    let keys = KeyTree::derive(&Seed::from_parts([42u8; 32], [43u8; 32]), Network::Testnet, 0)
        .expect("key tree");
    keys.address(Chain::Spend, 0).expect("address")
}
