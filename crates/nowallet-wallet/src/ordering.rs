//! Canonical (BIP-69) ordering of transaction inputs and outputs.
//!
//! Inputs sort by previous txid in its displayed (big-endian hex) byte
//! order, then by output index. Outputs sort by value, then by locking
//! script bytes.

use std::cmp::Ordering;

use bitcoin::hashes::Hash;
use bitcoin::{Transaction, TxIn, TxOut};

pub fn input_order(a: &TxIn, b: &TxIn) -> Ordering {
    let a_txid = a.previous_output.txid.to_byte_array();
    let b_txid = b.previous_output.txid.to_byte_array();
    a_txid
        .iter()
        .rev()
        .cmp(b_txid.iter().rev())
        .then(a.previous_output.vout.cmp(&b.previous_output.vout))
}

pub fn output_order(a: &TxOut, b: &TxOut) -> Ordering {
    a.value
        .cmp(&b.value)
        .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
}

/// Sort inputs and outputs of `tx` in place.
pub fn sort_canonical(tx: &mut Transaction) {
    tx.input.sort_by(input_order);
    tx.output.sort_by(output_order);
}

pub fn is_canonical(tx: &Transaction) -> bool {
    tx.input.windows(2).all(|w| input_order(&w[0], &w[1]) != Ordering::Greater)
        && tx.output.windows(2).all(|w| output_order(&w[0], &w[1]) != Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Txid, Witness};
    use proptest::prelude::*;
    use std::str::FromStr;

    fn input(txid: Txid, vout: u32) -> TxIn {
        TxIn {
            previous_output: OutPoint { txid, vout },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }
    }

    fn output(value: u64, script: &[u8]) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(script.to_vec()),
        }
    }

    fn tx(input: Vec<TxIn>, output: Vec<TxOut>) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input,
            output,
        }
    }

    #[test]
    fn inputs_compare_in_display_order() {
        // Displayed hex starts with 00.. vs ff..; internal bytes are reversed.
        let low = Txid::from_str("00000000000000000000000000000000000000000000000000000000000000ff").unwrap();
        let high = Txid::from_str("ff00000000000000000000000000000000000000000000000000000000000000").unwrap();
        assert_eq!(input_order(&input(low, 5), &input(high, 0)), Ordering::Less);
    }

    #[test]
    fn inputs_tie_break_on_vout() {
        let t = Txid::from_byte_array([3; 32]);
        assert_eq!(input_order(&input(t, 0), &input(t, 1)), Ordering::Less);
        assert_eq!(input_order(&input(t, 1), &input(t, 1)), Ordering::Equal);
    }

    #[test]
    fn outputs_by_value_then_script() {
        assert_eq!(output_order(&output(1, &[9]), &output(2, &[0])), Ordering::Less);
        assert_eq!(output_order(&output(5, &[0, 1]), &output(5, &[0, 2])), Ordering::Less);
        assert_eq!(output_order(&output(5, &[0]), &output(5, &[0, 0])), Ordering::Less);
    }

    #[test]
    fn p2pkh_and_p2pk_outputs_sort_by_value() {
        let big = output(
            40_000_000_000,
            &hex_bytes("76a9145be32612930b8323add2212a4ec03c1562084f8488ac"),
        );
        let small = output(
            100_000_000,
            &hex_bytes("41046a0765b5865641ce08dd39690aade26dfbf5511430ca428a3089261361cef170e3929a68aee3d8d4848b0c5111b0a37b82b86ad559fd2a745b44d8e8d9dfdc0cac"),
        );
        let mut t = tx(vec![], vec![big.clone(), small.clone()]);
        sort_canonical(&mut t);
        assert_eq!(t.output, vec![small, big]);
    }

    fn hex_bytes(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn sorting_is_idempotent_and_canonical(
            ins in prop::collection::vec((any::<[u8; 32]>(), 0u32..4), 0..8),
            outs in prop::collection::vec((0u64..10, prop::collection::vec(any::<u8>(), 0..4)), 0..8),
        ) {
            let mut t = tx(
                ins.iter().map(|(h, v)| input(Txid::from_byte_array(*h), *v)).collect(),
                outs.iter().map(|(v, s)| output(*v, s)).collect(),
            );
            sort_canonical(&mut t);
            prop_assert!(is_canonical(&t));
            let once = t.clone();
            sort_canonical(&mut t);
            prop_assert_eq!(once, t);
        }

        #[test]
        fn sorting_ignores_initial_permutation(
            outs in prop::collection::vec((0u64..5, prop::collection::vec(any::<u8>(), 0..3)), 1..8),
            rotate in 0usize..8,
        ) {
            let outputs: Vec<TxOut> = outs.iter().map(|(v, s)| output(*v, s)).collect();
            let mut rotated = outputs.clone();
            let k = rotate % rotated.len();
            rotated.rotate_left(k);
            let mut a = tx(vec![], outputs);
            let mut b = tx(vec![], rotated);
            sort_canonical(&mut a);
            sort_canonical(&mut b);
            prop_assert_eq!(a, b);
        }
    }
}
