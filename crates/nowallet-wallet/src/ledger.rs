//! In-memory wallet ledger: balance, UTXO set, per-address history and the
//! used/unused index tables of both chains.
//!
//! Every mutation goes through a method on [`LedgerState`] so that
//! `balance == Σ utxo.value` holds after each call. The wallet keeps the
//! ledger behind one mutex and never holds it across an await.

use std::collections::{BTreeMap, HashSet};

use bitcoin::{OutPoint, Transaction, Txid};
use nowallet_core::types::{Chain, Utxo};

use crate::error::WalletError;
use crate::keys::KeyTree;

/// Used flags of one chain, indexed by derivation index.
///
/// Grows monotonically. Entries only ever flip from unused to used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexTable {
    used: Vec<bool>,
}

impl IndexTable {
    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// `None` for an index past the end of the table.
    pub fn get(&self, index: u32) -> Option<bool> {
        self.used.get(index as usize).copied()
    }

    pub fn is_used(&self, index: u32) -> bool {
        self.get(index).unwrap_or(false)
    }

    /// Mark `index` used, extending the table with unused entries as needed.
    pub fn mark_used(&mut self, index: u32) {
        self.extend_to(index);
        self.used[index as usize] = true;
    }

    /// Record `index` as scanned. Never clears a used entry.
    pub fn mark_unused(&mut self, index: u32) {
        self.extend_to(index);
    }

    /// First unused index, or the index just past the end of the table when
    /// every entry is used.
    pub fn next_unused(&self) -> u32 {
        self.used
            .iter()
            .position(|used| !used)
            .unwrap_or(self.used.len()) as u32
    }

    pub fn used_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.used
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .map(|(i, _)| i as u32)
    }

    fn extend_to(&mut self, index: u32) {
        let needed = index as usize + 1;
        if self.used.len() < needed {
            self.used.resize(needed, false);
        }
    }
}

/// A transaction that touched a wallet address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTx {
    pub txid: Txid,
    /// Confirmation height as reported by the server; 0 for a local spend
    /// not yet seen by the server.
    pub height: i64,
    pub tx: Transaction,
}

/// Everything observed for one used address. The input of
/// [`LedgerState::apply_used`], shared by discovery and live sync.
#[derive(Debug, Clone)]
pub struct AddressActivity {
    pub chain: Chain,
    pub index: u32,
    pub address: String,
    /// Transactions in server order.
    pub history: Vec<WalletTx>,
    /// Current unspent outputs of the address.
    pub utxos: Vec<Utxo>,
}

/// What an [`apply_used`](LedgerState::apply_used) call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldOutcome {
    pub new_txs: usize,
    pub new_utxos: usize,
    pub balance_delta: u64,
}

/// The local effects of a broadcast spend.
#[derive(Debug, Clone)]
pub struct SpendRecord {
    pub tx: WalletTx,
    /// Outpoints spent by the transaction.
    pub consumed: Vec<OutPoint>,
    /// The change output, if the transaction has one.
    pub change: Option<Utxo>,
    pub destination: String,
}

/// The wallet's view of its funds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    balance: u64,
    utxos: Vec<Utxo>,
    outpoints: HashSet<OutPoint>,
    /// Outpoints consumed by local spends; never re-added.
    spent: HashSet<OutPoint>,
    history: BTreeMap<String, Vec<WalletTx>>,
    spend: IndexTable,
    change: IndexTable,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the activity of a used address: mark its index used, append
    /// transactions not yet recorded for it, and add UTXOs not already known.
    pub fn apply_used(&mut self, activity: AddressActivity) -> FoldOutcome {
        let mut outcome = FoldOutcome::default();
        self.table_mut(activity.chain).mark_used(activity.index);

        let entry = self.history.entry(activity.address).or_default();
        for tx in activity.history {
            match entry.iter_mut().find(|known| known.txid == tx.txid) {
                Some(known) => known.height = tx.height,
                None => {
                    entry.push(tx);
                    outcome.new_txs += 1;
                }
            }
        }

        for utxo in activity.utxos {
            let value = utxo.value;
            if self.add_utxo(utxo) {
                outcome.new_utxos += 1;
                outcome.balance_delta += value;
            }
        }
        outcome
    }

    /// Record a scanned index without history.
    pub fn apply_unused(&mut self, chain: Chain, index: u32) {
        self.table_mut(chain).mark_unused(index);
    }

    /// Add a UTXO. Returns false (and changes nothing) if the outpoint is
    /// already in the set or was consumed by a local spend.
    pub fn add_utxo(&mut self, utxo: Utxo) -> bool {
        if self.spent.contains(&utxo.outpoint) || !self.outpoints.insert(utxo.outpoint) {
            return false;
        }
        self.balance += utxo.value;
        self.utxos.push(utxo);
        true
    }

    /// Remove a UTXO spent by a local transaction.
    pub fn consume_utxo(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        if !self.outpoints.remove(outpoint) {
            return None;
        }
        self.spent.insert(*outpoint);
        let pos = self.utxos.iter().position(|u| &u.outpoint == outpoint)?;
        let utxo = self.utxos.remove(pos);
        self.balance -= utxo.value;
        Some(utxo)
    }

    /// Fold a broadcast spend: consume its inputs, add the change, mark the
    /// change index used and record the transaction in the history of the
    /// change address and of the destination when it is a wallet address
    /// already in the history.
    pub fn apply_spend(&mut self, record: SpendRecord) {
        for outpoint in &record.consumed {
            self.consume_utxo(outpoint);
        }

        if let Some(change) = record.change {
            self.change.mark_used(change.owner.index);
            self.append_history(&change.owner.address, record.tx.clone());
            self.add_utxo(change);
        }

        if self.history.contains_key(&record.destination) {
            self.append_history(&record.destination, record.tx);
        }
    }

    fn append_history(&mut self, address: &str, tx: WalletTx) {
        let entry = self.history.entry(address.to_string()).or_default();
        if !entry.iter().any(|known| known.txid == tx.txid) {
            entry.push(tx);
        }
    }

    /// Total value of the UTXO set in satoshis.
    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// The balance summed from scratch over the UTXO set.
    pub fn recomputed_balance(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }

    /// UTXOs in storage (arrival) order.
    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn history(&self) -> &BTreeMap<String, Vec<WalletTx>> {
        &self.history
    }

    pub fn history_for(&self, address: &str) -> Option<&[WalletTx]> {
        self.history.get(address).map(Vec::as_slice)
    }

    pub fn table(&self, chain: Chain) -> &IndexTable {
        match chain {
            Chain::Spend => &self.spend,
            Chain::Change => &self.change,
        }
    }

    fn table_mut(&mut self, chain: Chain) -> &mut IndexTable {
        match chain {
            Chain::Spend => &mut self.spend,
            Chain::Change => &mut self.change,
        }
    }

    /// First unused index of `chain`, never "none available".
    pub fn next_unused(&self, chain: Chain) -> u32 {
        self.table(chain).next_unused()
    }

    /// Addresses of every index recorded in `chain`'s table, used or not.
    pub fn all_known_addresses(&self, chain: Chain, keys: &KeyTree) -> Result<Vec<String>, WalletError> {
        (0..self.table(chain).len() as u32)
            .map(|index| keys.address(chain, index))
            .collect()
    }

    /// Addresses that have appeared in at least one transaction.
    pub fn all_used_addresses(&self) -> Vec<String> {
        self.history.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{ScriptBuf, absolute::LockTime};
    use nowallet_core::types::Owner;
    use proptest::prelude::*;

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn wallet_tx(n: u8) -> WalletTx {
        WalletTx {
            txid: txid(n),
            height: 100,
            tx: Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input: vec![],
                output: vec![],
            },
        }
    }

    fn utxo(n: u8, vout: u32, value: u64, chain: Chain, index: u32) -> Utxo {
        Utxo {
            outpoint: OutPoint { txid: txid(n), vout },
            owner: Owner { chain, index, address: format!("{chain}-{index}") },
            value,
            script_pubkey: ScriptBuf::new(),
            height: 100,
        }
    }

    fn activity(chain: Chain, index: u32, txs: &[u8], utxos: Vec<Utxo>) -> AddressActivity {
        AddressActivity {
            chain,
            index,
            address: format!("{chain}-{index}"),
            history: txs.iter().map(|n| wallet_tx(*n)).collect(),
            utxos,
        }
    }

    #[test]
    fn index_table_next_unused() {
        let mut t = IndexTable::default();
        assert_eq!(t.next_unused(), 0);
        t.mark_used(0);
        t.mark_used(1);
        assert_eq!(t.next_unused(), 2);
        t.mark_unused(2);
        t.mark_used(3);
        assert_eq!(t.next_unused(), 2);
    }

    #[test]
    fn index_table_all_used_falls_past_end() {
        let mut t = IndexTable::default();
        for i in 0..5 {
            t.mark_used(i);
        }
        assert_eq!(t.next_unused(), 5);
    }

    #[test]
    fn index_table_extends_with_unused() {
        let mut t = IndexTable::default();
        t.mark_used(4);
        assert_eq!(t.len(), 5);
        assert_eq!(t.used_indices().collect::<Vec<_>>(), vec![4]);
        assert_eq!(t.get(2), Some(false));
        assert_eq!(t.get(5), None);
    }

    #[test]
    fn index_table_unused_never_clears() {
        let mut t = IndexTable::default();
        t.mark_used(1);
        t.mark_unused(1);
        assert!(t.is_used(1));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn apply_used_adds_history_and_utxos() {
        let mut ledger = LedgerState::new();
        let out = ledger.apply_used(activity(
            Chain::Spend,
            2,
            &[1, 2],
            vec![utxo(1, 0, 500, Chain::Spend, 2), utxo(2, 1, 700, Chain::Spend, 2)],
        ));
        assert_eq!(out, FoldOutcome { new_txs: 2, new_utxos: 2, balance_delta: 1200 });
        assert_eq!(ledger.balance(), 1200);
        assert_eq!(ledger.table(Chain::Spend).len(), 3);
        assert!(ledger.table(Chain::Spend).is_used(2));
        assert_eq!(ledger.history_for("spend-2").unwrap().len(), 2);
        assert_eq!(ledger.all_used_addresses(), vec!["spend-2".to_string()]);
    }

    #[test]
    fn apply_used_twice_does_not_double_count() {
        let mut ledger = LedgerState::new();
        let act = activity(Chain::Change, 0, &[1], vec![utxo(1, 0, 500, Chain::Change, 0)]);
        ledger.apply_used(act.clone());
        let out = ledger.apply_used(act);
        assert_eq!(out, FoldOutcome::default());
        assert_eq!(ledger.balance(), 500);
        assert_eq!(ledger.utxos().len(), 1);
        assert_eq!(ledger.history_for("change-0").unwrap().len(), 1);
    }

    #[test]
    fn apply_used_updates_height_of_known_tx() {
        let mut ledger = LedgerState::new();
        let mut act = activity(Chain::Spend, 0, &[1], vec![]);
        act.history[0].height = 0;
        ledger.apply_used(act.clone());
        act.history[0].height = 250;
        ledger.apply_used(act);
        assert_eq!(ledger.history_for("spend-0").unwrap()[0].height, 250);
    }

    #[test]
    fn consume_then_readd_is_ignored() {
        let mut ledger = LedgerState::new();
        let u = utxo(1, 0, 500, Chain::Spend, 0);
        assert!(ledger.add_utxo(u.clone()));
        assert_eq!(ledger.consume_utxo(&u.outpoint).unwrap().value, 500);
        assert_eq!(ledger.balance(), 0);
        assert!(!ledger.add_utxo(u.clone()));
        assert!(ledger.consume_utxo(&u.outpoint).is_none());
        assert_eq!(ledger.balance(), 0);
    }

    #[test]
    fn apply_spend_moves_value_to_change() {
        let mut ledger = LedgerState::new();
        ledger.apply_used(activity(Chain::Spend, 0, &[1], vec![utxo(1, 0, 1_000, Chain::Spend, 0)]));

        let spend_tx = wallet_tx(9);
        ledger.apply_spend(SpendRecord {
            tx: spend_tx.clone(),
            consumed: vec![OutPoint { txid: txid(1), vout: 0 }],
            change: Some(utxo(9, 1, 550, Chain::Change, 0)),
            destination: "elsewhere".into(),
        });

        assert_eq!(ledger.balance(), 550);
        assert_eq!(ledger.recomputed_balance(), 550);
        assert!(ledger.table(Chain::Change).is_used(0));
        assert_eq!(ledger.next_unused(Chain::Change), 1);
        assert_eq!(ledger.history_for("change-0").unwrap(), &[spend_tx][..]);
        assert!(ledger.history_for("elsewhere").is_none());
    }

    #[test]
    fn apply_spend_records_known_destination() {
        let mut ledger = LedgerState::new();
        ledger.apply_used(activity(Chain::Spend, 0, &[1], vec![utxo(1, 0, 1_000, Chain::Spend, 0)]));
        ledger.apply_used(activity(Chain::Spend, 1, &[2], vec![]));

        ledger.apply_spend(SpendRecord {
            tx: wallet_tx(9),
            consumed: vec![OutPoint { txid: txid(1), vout: 0 }],
            change: None,
            destination: "spend-1".into(),
        });

        assert_eq!(ledger.balance(), 0);
        assert_eq!(ledger.history_for("spend-1").unwrap().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn balance_matches_utxo_sum(
            ops in prop::collection::vec((0u8..3, 0u8..16, 0u32..3, 1u64..1_000_000), 1..60)
        ) {
            let mut ledger = LedgerState::new();
            for (kind, n, vout, value) in ops {
                match kind {
                    0 => {
                        let chain = if n % 2 == 0 { Chain::Spend } else { Chain::Change };
                        let index = u32::from(n % 5);
                        ledger.apply_used(activity(chain, index, &[n], vec![utxo(n, vout, value, chain, index)]));
                    }
                    1 => {
                        ledger.consume_utxo(&OutPoint { txid: txid(n), vout });
                    }
                    _ => {
                        ledger.add_utxo(utxo(n, vout, value, Chain::Spend, 0));
                    }
                }
                prop_assert_eq!(ledger.balance(), ledger.recomputed_balance());
                let unique: HashSet<_> = ledger.utxos().iter().map(|u| u.outpoint).collect();
                prop_assert_eq!(unique.len(), ledger.utxos().len());
            }
        }
    }
}
