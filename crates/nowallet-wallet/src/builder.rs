//! Transaction construction: coin selection, canonical layout, fee,
//! signing and broadcast.
//!
//! 1. Select UTXOs in storage order until the amount is covered
//! 2. Lay out the destination output and a change output to the next unused
//!    change address, sorted canonically
//! 3. Size the fee from the server's estimate and take it out of the change
//! 4. Sign every input with its owning key
//! 5. Broadcast, then fold the spend into the ledger
//!
//! Nothing touches the ledger until the server has accepted the broadcast.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nowallet_core::error::LinkError;
use nowallet_core::traits::ServerLink;
use nowallet_core::types::{Chain, Utxo};

use crate::coin_selection::CoinSelector;
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::fees::{FeeRate, estimated_size};
use crate::keys::KeyTree;
use crate::ledger::{LedgerState, SpendRecord, WalletTx};
use crate::ordering::sort_canonical;
use crate::signer::{SigningInput, TxSigner};

/// A signed transaction that has not been broadcast yet.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    /// The signed transaction.
    pub tx: Transaction,
    /// The UTXOs it spends.
    pub inputs: Vec<Utxo>,
    pub destination: String,
    /// Amount paid to the destination in satoshis.
    pub amount: u64,
    /// The change output, absent when the change netted to zero.
    pub change: Option<Utxo>,
    /// Fee in satoshis.
    pub fee: u64,
    pub fee_rate: FeeRate,
}

impl PendingTransaction {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    /// Serialized transaction in hex, as broadcast.
    pub fn raw_hex(&self) -> String {
        serialize_hex(&self.tx)
    }
}

/// Result of a broadcast spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendReceipt {
    pub txid: Txid,
    pub amount: u64,
    pub fee: u64,
    /// Value returned to the change address.
    pub change: u64,
    /// Ledger balance after the spend.
    pub balance: u64,
}

/// Builds, signs and broadcasts spends from a ledger.
pub struct TxBuilder {
    keys: Arc<KeyTree>,
    link: Arc<dyn ServerLink>,
    ledger: Arc<Mutex<LedgerState>>,
    signer: Arc<dyn TxSigner>,
    network: Network,
    fee_target_blocks: u32,
    fallback_fee_rate: FeeRate,
    request_timeout: Duration,
}

impl TxBuilder {
    pub fn new(
        keys: Arc<KeyTree>,
        link: Arc<dyn ServerLink>,
        ledger: Arc<Mutex<LedgerState>>,
        signer: Arc<dyn TxSigner>,
        config: &WalletConfig,
    ) -> Self {
        Self {
            keys,
            link,
            ledger,
            signer,
            network: config.network,
            fee_target_blocks: config.fee_target_blocks,
            fallback_fee_rate: config.fallback_fee_rate,
            request_timeout: config.request_timeout,
        }
    }

    /// Build and broadcast a spend of `amount` satoshis to `destination`.
    pub async fn send(&self, destination: &str, amount: u64) -> Result<SpendReceipt, WalletError> {
        let pending = self.build(destination, amount).await?;
        self.broadcast(pending).await
    }

    /// Build and sign a spend without broadcasting it. The ledger is only
    /// read.
    pub async fn build(&self, destination: &str, amount: u64) -> Result<PendingTransaction, WalletError> {
        let destination = destination.trim();
        let address = Address::from_str(destination)
            .map_err(|e| WalletError::InvalidAddress(format!("{destination}: {e}")))?
            .require_network(self.network)
            .map_err(|e| WalletError::InvalidAddress(format!("{destination}: {e}")))?;
        if amount == 0 {
            return Err(WalletError::InvalidAmount("amount must be non-zero".into()));
        }

        let (utxos, change_index) = {
            let ledger = self.ledger.lock();
            (ledger.utxos().to_vec(), ledger.next_unused(Chain::Change))
        };
        let selection = CoinSelector::select(&utxos, amount)?;

        let change_key = self.keys.key(Chain::Change, change_index)?;
        let change_script = change_key.script_pubkey();

        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: selection
                .selected
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![
                TxOut {
                    value: Amount::from_sat(amount),
                    script_pubkey: address.script_pubkey(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: change_script.clone(),
                },
            ],
        };
        sort_canonical(&mut tx);

        let fee_rate = self.fee_rate().await?;
        let fee = fee_rate.fee_for_size(estimated_size(&tx));
        let available = selection.total - amount;
        let change_value = available
            .checked_sub(fee)
            .ok_or(WalletError::InsufficientFundsForFee { fee, available })?;

        // The change placeholder is the only zero-value output.
        if let Some(pos) = tx
            .output
            .iter()
            .position(|out| out.value == Amount::ZERO && out.script_pubkey == change_script)
        {
            if change_value == 0 {
                tx.output.remove(pos);
            } else {
                tx.output[pos].value = Amount::from_sat(change_value);
            }
        }
        sort_canonical(&mut tx);

        let signing = tx
            .input
            .iter()
            .enumerate()
            .map(|(index, txin)| {
                let utxo = selection
                    .selected
                    .iter()
                    .find(|u| u.outpoint == txin.previous_output)
                    .ok_or_else(|| {
                        WalletError::SigningFailed(format!("no owner for input {}", txin.previous_output))
                    })?;
                let key = self.keys.key(utxo.owner.chain, utxo.owner.index)?;
                Ok(SigningInput {
                    index,
                    script_pubkey: utxo.script_pubkey.clone(),
                    wif: key.wif(),
                })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;
        let signed = self.signer.sign(tx, &signing)?;

        let change = if change_value == 0 {
            None
        } else {
            let txid = signed.compute_txid();
            signed
                .output
                .iter()
                .position(|out| {
                    out.script_pubkey == change_script && out.value == Amount::from_sat(change_value)
                })
                .map(|vout| Utxo {
                    outpoint: OutPoint { txid, vout: vout as u32 },
                    owner: change_key.owner(),
                    value: change_value,
                    script_pubkey: change_script.clone(),
                    height: 0,
                })
        };

        debug!(
            inputs = signed.input.len(),
            outputs = signed.output.len(),
            fee,
            %fee_rate,
            change = change_value,
            "built transaction"
        );

        Ok(PendingTransaction {
            tx: signed,
            inputs: selection.selected,
            destination: destination.to_string(),
            amount,
            change,
            fee,
            fee_rate,
        })
    }

    /// Submit a pending transaction and, once the server accepts it, fold it
    /// into the ledger.
    ///
    /// A server error or an answer other than the transaction's own txid is
    /// [`WalletError::BroadcastRejected`]; transport failures are returned as
    /// [`WalletError::Link`]. Neither changes the ledger.
    pub async fn broadcast(&self, pending: PendingTransaction) -> Result<SpendReceipt, WalletError> {
        let txid = pending.txid();
        let raw = pending.raw_hex();

        let answer = match tokio::time::timeout(self.request_timeout, self.link.broadcast(&raw)).await {
            Err(_) => return Err(LinkError::Timeout.into()),
            Ok(Err(e)) if e.is_server_rejection() => {
                return Err(WalletError::BroadcastRejected(e.to_string()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(answer)) => answer,
        };
        if answer.trim() != txid.to_string() {
            return Err(WalletError::BroadcastRejected(answer));
        }

        let change_value = pending.change.as_ref().map_or(0, |c| c.value);
        let record = SpendRecord {
            tx: WalletTx {
                txid,
                height: 0,
                tx: pending.tx.clone(),
            },
            consumed: pending.inputs.iter().map(|u| u.outpoint).collect(),
            change: pending.change.clone(),
            destination: pending.destination.clone(),
        };
        let balance = {
            let mut ledger = self.ledger.lock();
            ledger.apply_spend(record);
            ledger.balance()
        };
        info!(%txid, amount = pending.amount, fee = pending.fee, balance, "transaction broadcast");

        if let Some(change) = &pending.change {
            if let Err(e) = self.link.subscribe_address(&change.owner.address).await {
                warn!(address = %change.owner.address, error = %e, "failed to subscribe change address");
            }
        }

        Ok(SpendReceipt {
            txid,
            amount: pending.amount,
            fee: pending.fee,
            change: change_value,
            balance,
        })
    }

    async fn fee_rate(&self) -> Result<FeeRate, WalletError> {
        let estimate = tokio::time::timeout(
            self.request_timeout,
            self.link.estimate_fee(self.fee_target_blocks),
        )
        .await
        .map_err(|_| LinkError::Timeout)??;

        Ok(match FeeRate::from_btc_per_kb(estimate) {
            Some(rate) => rate,
            None => {
                warn!(estimate, fallback = %self.fallback_fee_rate, "server cannot estimate fee");
                self.fallback_fee_rate
            }
        })
    }
}
