//! Greedy coin selection in storage order.
//!
//! Walks the UTXO set in the order the ledger stores it and stops as soon as
//! the accumulated value reaches the target. No value optimization.

use nowallet_core::types::Utxo;

use crate::error::WalletError;

/// Result of coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    /// Selected UTXOs in storage order.
    pub selected: Vec<Utxo>,
    /// Total value of the selection in satoshis.
    pub total: u64,
}

pub struct CoinSelector;

impl CoinSelector {
    /// Select a prefix of `utxos` whose value covers `target`.
    pub fn select(utxos: &[Utxo], target: u64) -> Result<CoinSelection, WalletError> {
        if target == 0 {
            return Err(WalletError::InvalidAmount("target must be non-zero".into()));
        }

        let mut selected = Vec::new();
        let mut total: u64 = 0;
        for utxo in utxos {
            selected.push(utxo.clone());
            total = total.saturating_add(utxo.value);
            if total >= target {
                return Ok(CoinSelection { selected, total });
            }
        }

        Err(WalletError::InsufficientFunds {
            have: total,
            need: target,
        })
    }
}
