//! Wallet engine configuration.

use bitcoin::Network;
use nowallet_core::constants::{FEE_TARGET_BLOCKS, GAP_LIMIT};
use std::time::Duration;

use crate::fees::FeeRate;

/// Cost parameters of the brainwallet seed derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedParams {
    /// log2 of the scrypt cost parameter N.
    pub scrypt_log_n: u8,
    /// scrypt block size.
    pub scrypt_r: u32,
    /// scrypt parallelism.
    pub scrypt_p: u32,
    /// PBKDF2-HMAC-SHA256 iteration count.
    pub pbkdf2_rounds: u32,
}

impl Default for SeedParams {
    fn default() -> Self {
        Self {
            scrypt_log_n: 18,
            scrypt_r: 8,
            scrypt_p: 1,
            pbkdf2_rounds: 1 << 16,
        }
    }
}

/// Configuration for a [`Wallet`](crate::Wallet).
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Bitcoin network; selects the coin type and address encoding.
    pub network: Network,
    /// BIP-44 account number.
    pub account: u32,
    /// Consecutive unused addresses that end a discovery scan.
    pub gap_limit: u32,
    /// Timeout for one discovery window or one live refresh.
    pub request_timeout: Duration,
    /// Confirmation target passed to the fee estimator.
    pub fee_target_blocks: u32,
    /// Rate used when the server cannot estimate a fee.
    pub fallback_fee_rate: FeeRate,
    /// Seed derivation cost.
    pub seed_params: SeedParams,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            account: 0,
            gap_limit: GAP_LIMIT,
            request_timeout: Duration::from_secs(30),
            fee_target_blocks: FEE_TARGET_BLOCKS,
            fallback_fee_rate: FeeRate::from_sat_per_kb(1_000),
            seed_params: SeedParams::default(),
        }
    }
}

impl WalletConfig {
    /// Configuration preset for Bitcoin mainnet.
    pub fn mainnet() -> Self {
        Self {
            network: Network::Bitcoin,
            ..Self::default()
        }
    }

    /// Configuration preset for testnet.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            ..Self::default()
        }
    }
}
