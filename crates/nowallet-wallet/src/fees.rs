//! Fee policy: rate conversion, size estimate and rounding.

use std::fmt;

use bitcoin::Transaction;
use bitcoin::consensus::encode::serialize;
use nowallet_core::constants::{BYTES_PER_KB, COIN};

/// Bytes added per input for the P2PKH unlocking script (DER signature,
/// sighash byte, compressed key and push opcodes) missing from an unsigned
/// transaction.
pub const P2PKH_SCRIPT_SIG_ALLOWANCE: usize = 107;

/// Fee rate in satoshis per kilobyte (1024 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeeRate(u64);

impl FeeRate {
    pub const fn from_sat_per_kb(sat_per_kb: u64) -> Self {
        Self(sat_per_kb)
    }

    /// Convert a server estimate in coins per kilobyte. `None` for a
    /// non-positive or non-finite estimate, which servers return when they
    /// have no data.
    pub fn from_btc_per_kb(btc_per_kb: f64) -> Option<Self> {
        if !btc_per_kb.is_finite() || btc_per_kb <= 0.0 {
            return None;
        }
        Some(Self((btc_per_kb * COIN as f64).round() as u64))
    }

    pub fn sat_per_kb(&self) -> u64 {
        self.0
    }

    /// Fee for `size` bytes, truncated to whole satoshis.
    pub fn fee_for_size(&self, size: usize) -> u64 {
        (size as u128 * self.0 as u128 / BYTES_PER_KB as u128) as u64
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/KB", self.0)
    }
}

/// Size of `tx` once every input carries a P2PKH unlocking script.
pub fn estimated_size(unsigned: &Transaction) -> usize {
    serialize(unsigned).len() + unsigned.input.len() * P2PKH_SCRIPT_SIG_ALLOWANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    #[test]
    fn fee_truncates() {
        // 250 / 1024 * 4 = 0.977
        assert_eq!(FeeRate::from_sat_per_kb(4).fee_for_size(250), 0);
        assert_eq!(FeeRate::from_sat_per_kb(4).fee_for_size(1024), 4);
        assert_eq!(FeeRate::from_sat_per_kb(1000).fee_for_size(250), 244);
        assert_eq!(FeeRate::from_sat_per_kb(1).fee_for_size(1023), 0);
    }

    #[test]
    fn from_btc_per_kb_rounds() {
        assert_eq!(FeeRate::from_btc_per_kb(0.0001), Some(FeeRate::from_sat_per_kb(10_000)));
        assert_eq!(FeeRate::from_btc_per_kb(0.00000001), Some(FeeRate::from_sat_per_kb(1)));
        assert_eq!(FeeRate::from_btc_per_kb(0.000012344), Some(FeeRate::from_sat_per_kb(1_234)));
    }

    #[test]
    fn from_btc_per_kb_rejects_unusable_estimates() {
        assert_eq!(FeeRate::from_btc_per_kb(-1.0), None);
        assert_eq!(FeeRate::from_btc_per_kb(0.0), None);
        assert_eq!(FeeRate::from_btc_per_kb(f64::NAN), None);
        assert_eq!(FeeRate::from_btc_per_kb(f64::INFINITY), None);
    }

    #[test]
    fn display() {
        assert_eq!(FeeRate::from_sat_per_kb(12).to_string(), "12 sat/KB");
    }

    #[test]
    fn estimated_size_adds_allowance_per_input() {
        let input = TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        };
        let output = TxOut {
            value: Amount::from_sat(1),
            script_pubkey: ScriptBuf::new(),
        };
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![input.clone(), input],
            output: vec![output],
        };
        assert_eq!(estimated_size(&tx), serialize(&tx).len() + 2 * 107);
    }
}
