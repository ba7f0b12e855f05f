//! Fetching the activity of one address: the shared source step of
//! discovery and live sync, ahead of [`LedgerState::apply_used`](crate::ledger::LedgerState::apply_used).

use bitcoin::consensus;
use bitcoin::{Transaction, Txid};
use futures::future::try_join_all;
use tracing::{debug, warn};

use nowallet_core::error::LinkError;
use nowallet_core::traits::ServerLink;
use nowallet_core::types::{HistoryItem, Utxo};

use crate::keys::KeyHandle;
use crate::ledger::{AddressActivity, WalletTx};

/// Decode a raw transaction in hex, as returned by `blockchain.transaction.get`.
pub fn decode_transaction(raw_hex: &str) -> Result<Transaction, LinkError> {
    let bytes = hex::decode(raw_hex.trim())
        .map_err(|e| LinkError::Protocol(format!("transaction hex: {e}")))?;
    consensus::deserialize(&bytes).map_err(|e| LinkError::Protocol(format!("transaction decode: {e}")))
}

async fn fetch_transaction(link: &dyn ServerLink, item: &HistoryItem) -> Result<WalletTx, LinkError> {
    let raw = link.get_transaction(&item.tx_hash).await?;
    let tx = decode_transaction(&raw)?;
    let txid: Txid = tx.compute_txid();
    if txid != item.tx_hash {
        return Err(LinkError::Protocol(format!(
            "server returned transaction {txid} for {}",
            item.tx_hash
        )));
    }
    Ok(WalletTx {
        txid,
        height: item.height,
        tx,
    })
}

/// Fetch the full transactions and current UTXOs of a used address.
///
/// Transaction fetches run concurrently. The server's own balance for the
/// address is compared against the fetched UTXOs and a disagreement is
/// logged.
pub async fn fetch_activity(
    link: &dyn ServerLink,
    key: &KeyHandle,
    history: Vec<HistoryItem>,
) -> Result<AddressActivity, LinkError> {
    let owner = key.owner();
    let script_pubkey = key.script_pubkey();

    let txs = try_join_all(history.iter().map(|item| fetch_transaction(link, item))).await?;

    let unspent = link.list_unspent(&owner.address).await?;
    let utxos: Vec<Utxo> = unspent
        .iter()
        .map(|item| Utxo {
            outpoint: item.outpoint(),
            owner: owner.clone(),
            value: item.value,
            script_pubkey: script_pubkey.clone(),
            height: item.height,
        })
        .collect();

    let server_balance = link.get_balance(&owner.address).await?;
    let local: u64 = utxos.iter().map(|u| u.value).sum();
    if server_balance.total() != local {
        warn!(
            address = %owner.address,
            server = server_balance.total(),
            local,
            "server balance disagrees with unspent outputs"
        );
    }

    debug!(
        address = %owner.address,
        chain = %owner.chain,
        index = owner.index,
        txs = txs.len(),
        utxos = utxos.len(),
        "fetched address activity"
    );

    Ok(AddressActivity {
        chain: owner.chain,
        index: owner.index,
        address: owner.address,
        history: txs,
        utxos,
    })
}

/// Look up the history of `key`'s address and, when it has any, fetch its
/// activity. `None` for an address without history.
pub async fn lookup_activity(
    link: &dyn ServerLink,
    key: &KeyHandle,
) -> Result<Option<AddressActivity>, LinkError> {
    let history = link.get_history(&key.address().to_string()).await?;
    if history.is_empty() {
        return Ok(None);
    }
    fetch_activity(link, key, history).await.map(Some)
}
