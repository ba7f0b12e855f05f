//! Brainwallet seed and BIP-44 key tree.
//!
//! The seed is stretched from a salt (an email-like string) and a
//! passphrase, then used directly as the master secret and chain code.
//! Keys live under `m/44'/<coin_type>'/<account>'/<chain>/<index>`, with
//! `chain` 0 for spend (receive) addresses and 1 for change.

use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, PrivateKey, PublicKey, ScriptBuf};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use nowallet_core::constants::{BIP44_PURPOSE, coin_type};
use nowallet_core::types::{Chain, Owner};

use crate::config::SeedParams;
use crate::error::WalletError;

/// Version bytes of a serialized extended private key.
const XPRV_MAINNET: [u8; 4] = [0x04, 0x88, 0xAD, 0xE4];
const XPRV_TESTNET: [u8; 4] = [0x04, 0x35, 0x83, 0x94];

/// Root key material: a secret exponent and a chain code.
///
/// Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    secret: [u8; 32],
    chain_code: [u8; 32],
}

impl Seed {
    /// Stretch `(salt, passphrase)` into a seed.
    ///
    /// `scrypt(passphrase‖1, salt‖1) XOR PBKDF2-HMAC-SHA256(passphrase‖2, salt‖2)`,
    /// 64 bytes; the first half is the secret, the second the chain code.
    /// CPU-heavy at full cost; run it off the async executor.
    pub fn derive(salt: &str, passphrase: &str, params: &SeedParams) -> Result<Self, WalletError> {
        let tagged = |bytes: &[u8], tag: u8| {
            let mut v = Zeroizing::new(Vec::with_capacity(bytes.len() + 1));
            v.extend_from_slice(bytes);
            v.push(tag);
            v
        };

        let scrypt_params = scrypt::Params::new(params.scrypt_log_n, params.scrypt_r, params.scrypt_p, 64)
            .map_err(|e| WalletError::KeyDerivation(format!("scrypt parameters: {e}")))?;
        let mut stretched = Zeroizing::new([0u8; 64]);
        scrypt::scrypt(
            &tagged(passphrase.as_bytes(), 1),
            &tagged(salt.as_bytes(), 1),
            &scrypt_params,
            stretched.as_mut_slice(),
        )
        .map_err(|e| WalletError::KeyDerivation(format!("scrypt: {e}")))?;

        let mut mixed = Zeroizing::new([0u8; 64]);
        pbkdf2_hmac::<Sha256>(
            &tagged(passphrase.as_bytes(), 2),
            &tagged(salt.as_bytes(), 2),
            params.pbkdf2_rounds,
            mixed.as_mut_slice(),
        );

        for (a, b) in stretched.iter_mut().zip(mixed.iter()) {
            *a ^= b;
        }

        let mut secret = [0u8; 32];
        let mut chain_code = [0u8; 32];
        secret.copy_from_slice(&stretched[..32]);
        chain_code.copy_from_slice(&stretched[32..]);
        Ok(Self { secret, chain_code })
    }

    /// Create a seed from raw parts.
    pub fn from_parts(secret: [u8; 32], chain_code: [u8; 32]) -> Self {
        Self { secret, chain_code }
    }

    /// The secret exponent. Handle with care.
    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    /// Master extended private key for `network`.
    fn master(&self, network: Network) -> Result<Xpriv, WalletError> {
        let mut data = Zeroizing::new([0u8; 78]);
        let version = if network == Network::Bitcoin {
            XPRV_MAINNET
        } else {
            XPRV_TESTNET
        };
        data[..4].copy_from_slice(&version);
        // depth, parent fingerprint and child number stay zero
        data[13..45].copy_from_slice(&self.chain_code);
        data[46..].copy_from_slice(&self.secret);
        Xpriv::decode(data.as_slice()).map_err(|e| WalletError::KeyDerivation(e.to_string()))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed")
            .field("secret", &"[REDACTED]")
            .field("chain_code", &"[REDACTED]")
            .finish()
    }
}

/// A derived child key.
#[derive(Clone)]
pub struct KeyHandle {
    chain: Chain,
    index: u32,
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Address,
}

impl KeyHandle {
    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// P2PKH address of the compressed public key.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Locking script paying to this key.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Signing material as a WIF string.
    pub fn wif(&self) -> Zeroizing<String> {
        Zeroizing::new(self.private_key.to_wif())
    }

    /// The ledger-side description of this key.
    pub fn owner(&self) -> Owner {
        Owner {
            chain: self.chain,
            index: self.index,
            address: self.address.to_string(),
        }
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("chain", &self.chain)
            .field("index", &self.index)
            .field("address", &self.address.to_string())
            .finish()
    }
}

/// The spend and change key sequences of one account.
pub struct KeyTree {
    secp: Secp256k1<All>,
    master: Xpriv,
    /// `m/44'/coin'/account'/0` and `.../1`, indexed by [`Chain::branch`].
    chains: [Xpriv; 2],
    network: Network,
    account: u32,
}

impl KeyTree {
    /// Build the key tree of `account` from a seed.
    pub fn derive(seed: &Seed, network: Network, account: u32) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let master = seed.master(network)?;

        let hardened = |i: u32| {
            ChildNumber::from_hardened_idx(i).map_err(|e| WalletError::KeyDerivation(e.to_string()))
        };
        let account_path = DerivationPath::from(vec![
            hardened(BIP44_PURPOSE)?,
            hardened(coin_type(network))?,
            hardened(account)?,
        ]);
        let account_key = master
            .derive_priv(&secp, &account_path)
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;

        let branch = |chain: Chain| -> Result<Xpriv, WalletError> {
            let child = ChildNumber::from_normal_idx(chain.branch())
                .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
            account_key
                .derive_priv(&secp, &[child])
                .map_err(|e| WalletError::KeyDerivation(e.to_string()))
        };
        let chains = [branch(Chain::Spend)?, branch(Chain::Change)?];

        Ok(Self {
            secp,
            master,
            chains,
            network,
            account,
        })
    }

    /// Derive the key at `(chain, index)`.
    ///
    /// Fails with [`WalletError::InvalidDerivationIndex`] for indices at or
    /// above 2^31, which are not valid non-hardened children.
    pub fn key(&self, chain: Chain, index: u32) -> Result<KeyHandle, WalletError> {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|_| WalletError::InvalidDerivationIndex(index))?;
        let xpriv = self.chains[chain.branch() as usize]
            .derive_priv(&self.secp, &[child])
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;

        let private_key = PrivateKey::new(xpriv.private_key, self.network);
        let public_key = private_key.public_key(&self.secp);
        let address = Address::p2pkh(public_key.pubkey_hash(), self.network);

        Ok(KeyHandle {
            chain,
            index,
            private_key,
            public_key,
            address,
        })
    }

    /// Address string at `(chain, index)`.
    pub fn address(&self, chain: Chain, index: u32) -> Result<String, WalletError> {
        Ok(self.key(chain, index)?.address().to_string())
    }

    /// Extended public key of the master node.
    pub fn xpub(&self) -> Xpub {
        Xpub::from_priv(&self.secp, &self.master)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn account(&self) -> u32 {
        self.account
    }
}

impl fmt::Debug for KeyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyTree")
            .field("network", &self.network)
            .field("account", &self.account)
            .field("xpub", &self.xpub().to_string())
            .finish()
    }
}
