//! Gap-limit address discovery.
//!
//! Each chain is scanned in windows of `gap_limit` consecutive indices. The
//! history lookups of a window run concurrently; the window is then folded
//! into the ledger in index order under a single lock. Scanning stops after
//! the first window in which no address has history, so a cluster of used
//! addresses further than `gap_limit` past the last used one is never found.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nowallet_core::error::LinkError;
use nowallet_core::traits::ServerLink;
use nowallet_core::types::Chain;

use crate::activity::lookup_activity;
use crate::error::WalletError;
use crate::keys::{KeyHandle, KeyTree};
use crate::ledger::{AddressActivity, LedgerState};

/// Outcome of scanning one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainScan {
    pub chain: Chain,
    /// Number of indices scanned (the table length reached).
    pub scanned: u32,
    /// Number of scanned indices with history.
    pub used: u32,
    pub windows: u32,
}

/// Outcome of scanning both chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub spend: ChainScan,
    pub change: ChainScan,
}

/// Populates a ledger from the server.
pub struct AddressDiscoverer {
    keys: Arc<KeyTree>,
    link: Arc<dyn ServerLink>,
    ledger: Arc<Mutex<LedgerState>>,
    gap_limit: u32,
    window_timeout: Duration,
}

impl AddressDiscoverer {
    pub fn new(
        keys: Arc<KeyTree>,
        link: Arc<dyn ServerLink>,
        ledger: Arc<Mutex<LedgerState>>,
        gap_limit: u32,
        window_timeout: Duration,
    ) -> Self {
        Self {
            keys,
            link,
            ledger,
            gap_limit: gap_limit.max(1),
            window_timeout,
        }
    }

    /// Scan the spend chain, then the change chain.
    ///
    /// A failure on the spend chain does not prevent the change chain from
    /// being scanned; the first error is returned once both have run.
    pub async fn discover(&self) -> Result<DiscoveryReport, WalletError> {
        let spend = self.discover_chain(Chain::Spend).await;
        let change = self.discover_chain(Chain::Change).await;
        Ok(DiscoveryReport {
            spend: spend?,
            change: change?,
        })
    }

    /// Scan one chain until a window without any used address.
    pub async fn discover_chain(&self, chain: Chain) -> Result<ChainScan, WalletError> {
        let mut scan = ChainScan {
            chain,
            scanned: 0,
            used: 0,
            windows: 0,
        };
        let mut current: u32 = 0;

        loop {
            let keys = (current..current.saturating_add(self.gap_limit))
                .map(|index| self.keys.key(chain, index))
                .collect::<Result<Vec<_>, _>>()?;

            let results = match self.scan_window(&keys).await {
                Ok(results) => results,
                Err(source) => {
                    warn!(%chain, start = current, error = %source, "discovery window failed");
                    return Err(WalletError::DiscoveryFailed { chain, source });
                }
            };

            let mut window_used = 0u32;
            {
                let mut ledger = self.ledger.lock();
                for (key, activity) in keys.iter().zip(results) {
                    match activity {
                        Some(activity) => {
                            window_used += 1;
                            ledger.apply_used(activity);
                        }
                        None => ledger.apply_unused(chain, key.index()),
                    }
                }
            }

            scan.windows += 1;
            scan.scanned = current + self.gap_limit;
            scan.used += window_used;
            debug!(%chain, start = current, used = window_used, "scanned discovery window");

            if window_used == 0 {
                break;
            }
            current += self.gap_limit;
        }

        info!(%chain, scanned = scan.scanned, used = scan.used, "chain discovery complete");
        Ok(scan)
    }

    /// Look up every address of a window concurrently and fetch the activity
    /// of the used ones. Results are in key order.
    async fn scan_window(&self, keys: &[KeyHandle]) -> Result<Vec<Option<AddressActivity>>, LinkError> {
        let lookups = keys.iter().map(|key| lookup_activity(self.link.as_ref(), key));
        let results = tokio::time::timeout(self.window_timeout, join_all(lookups))
            .await
            .map_err(|_| LinkError::Timeout)?;
        results.into_iter().collect()
    }
}
