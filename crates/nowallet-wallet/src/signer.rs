//! Transaction signing boundary and the P2PKH signer.

use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PrivateKey, ScriptBuf, Transaction};
use zeroize::Zeroizing;

use crate::error::WalletError;

/// Signing material for one input.
pub struct SigningInput {
    /// Position of the input in the transaction.
    pub index: usize,
    /// Locking script of the output being spent.
    pub script_pubkey: ScriptBuf,
    /// Private key in WIF.
    pub wif: Zeroizing<String>,
}

/// Signs every input of an assembled transaction.
pub trait TxSigner: Send + Sync {
    /// Return the fully signed transaction or [`WalletError::SigningFailed`].
    fn sign(&self, tx: Transaction, inputs: &[SigningInput]) -> Result<Transaction, WalletError>;
}

/// Legacy P2PKH signer (`SIGHASH_ALL`, compressed keys).
pub struct P2pkhSigner {
    secp: Secp256k1<All>,
}

impl P2pkhSigner {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Default for P2pkhSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl TxSigner for P2pkhSigner {
    fn sign(&self, mut tx: Transaction, inputs: &[SigningInput]) -> Result<Transaction, WalletError> {
        if inputs.len() != tx.input.len() {
            return Err(WalletError::SigningFailed(format!(
                "{} signing inputs for {} transaction inputs",
                inputs.len(),
                tx.input.len()
            )));
        }

        let sighash_type = EcdsaSighashType::All;
        let mut script_sigs = Vec::with_capacity(inputs.len());
        {
            let cache = SighashCache::new(&tx);
            for input in inputs {
                let key = PrivateKey::from_wif(&input.wif)
                    .map_err(|e| WalletError::SigningFailed(format!("input {}: {e}", input.index)))?;
                let public_key = key.public_key(&self.secp);
                if ScriptBuf::new_p2pkh(&public_key.pubkey_hash()) != input.script_pubkey {
                    return Err(WalletError::SigningFailed(format!(
                        "input {}: key does not control the spent output",
                        input.index
                    )));
                }

                let sighash = cache
                    .legacy_signature_hash(input.index, &input.script_pubkey, sighash_type.to_u32())
                    .map_err(|e| WalletError::SigningFailed(format!("input {}: {e}", input.index)))?;
                let message = Message::from_digest_slice(sighash.as_ref())
                    .map_err(|e| WalletError::SigningFailed(e.to_string()))?;
                let signature = self.secp.sign_ecdsa(&message, &key.inner);

                let mut sig_bytes = signature.serialize_der().to_vec();
                sig_bytes.push(sighash_type.to_u32() as u8);
                let sig_push = PushBytesBuf::try_from(sig_bytes)
                    .map_err(|e| WalletError::SigningFailed(e.to_string()))?;

                let script_sig = Builder::new()
                    .push_slice(sig_push)
                    .push_key(&public_key)
                    .into_script();
                script_sigs.push((input.index, script_sig));
            }
        }

        for (index, script_sig) in script_sigs {
            tx.input[index].script_sig = script_sig;
        }
        Ok(tx)
    }
}
