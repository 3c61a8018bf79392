//! Keyrings: the derived artifact at one address path.
//!
//! A [`KeyRing`] carries everything needed to recognize and redeem outputs
//! at a single derivation path: the derived public key, the cosigner set at
//! the same index for multisig accounts, and the script assembly rules
//! selected by the account type and witness flag. Keyrings are derived on
//! demand and never persisted.

use crate::path::{AddressHash, Path};
use crate::{WalletError, WalletResult};
use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, PushBytesBuf, ScriptBuf};
use bitcoin::{PubkeyHash, ScriptHash, WPubkeyHash, WScriptHash, Witness};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// Address kind an account derives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Single-key pay-to-pubkey-hash addresses.
    Pubkeyhash,
    /// `m`-of-`n` multisig script addresses.
    Multisig,
}

impl AccountType {
    pub fn to_u8(self) -> u8 {
        match self {
            AccountType::Pubkeyhash => 0,
            AccountType::Multisig => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<AccountType> {
        match v {
            0 => Some(AccountType::Pubkeyhash),
            1 => Some(AccountType::Multisig),
            _ => None,
        }
    }
}

/// Materials for one derivation path.
#[derive(Debug, Clone)]
pub struct KeyRing {
    /// Location of this ring in the wallet store.
    pub path: Path,
    /// The wallet's own derived public key.
    pub public_key: PublicKey,
    /// All cosigner public keys at this index, in account key order.
    /// Element 0 is always `public_key`'s parent chain.
    pub keys: Vec<PublicKey>,
    /// Script kind.
    pub account_type: AccountType,
    /// Multisig threshold.
    pub m: u8,
    /// Multisig cosigner count.
    pub n: u8,
    /// Whether addresses use a version-0 witness program.
    pub witness: bool,
}

impl KeyRing {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: Path,
        public_key: PublicKey,
        keys: Vec<PublicKey>,
        account_type: AccountType,
        m: u8,
        n: u8,
        witness: bool,
    ) -> Self {
        Self {
            path,
            public_key,
            keys,
            account_type,
            m,
            n,
            witness,
        }
    }

    /// The multisig redeem script, with cosigner keys sorted so every
    /// cosigner derives the same script regardless of key arrival order.
    /// `None` for single-key rings.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        if self.account_type != AccountType::Multisig {
            return None;
        }
        let mut sorted: Vec<[u8; 33]> = self.keys.iter().map(|k| k.serialize()).collect();
        sorted.sort_unstable();

        let mut builder = Builder::new().push_int(self.m as i64);
        for key in &sorted {
            builder = builder.push_slice(*key);
        }
        Some(
            builder
                .push_int(self.n as i64)
                .push_opcode(OP_CHECKMULTISIG)
                .into_script(),
        )
    }

    /// The locking script outputs to this ring carry.
    pub fn script_pubkey(&self) -> ScriptBuf {
        match (self.account_type, self.witness) {
            (AccountType::Pubkeyhash, false) => {
                let h = hash160::Hash::hash(&self.public_key.serialize());
                ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(h))
            }
            (AccountType::Pubkeyhash, true) => {
                let h = hash160::Hash::hash(&self.public_key.serialize());
                ScriptBuf::new_p2wpkh(&WPubkeyHash::from_raw_hash(h))
            }
            (AccountType::Multisig, false) => {
                let redeem = self.redeem_script().unwrap_or_default();
                let h = hash160::Hash::hash(redeem.as_bytes());
                ScriptBuf::new_p2sh(&ScriptHash::from_raw_hash(h))
            }
            (AccountType::Multisig, true) => {
                let redeem = self.redeem_script().unwrap_or_default();
                let h = sha256::Hash::hash(redeem.as_bytes());
                ScriptBuf::new_p2wsh(&WScriptHash::from_raw_hash(h))
            }
        }
    }

    /// The witness program scriptPubKey, when the ring is witness.
    pub fn program(&self) -> Option<ScriptBuf> {
        if self.witness {
            Some(self.script_pubkey())
        } else {
            None
        }
    }

    /// Hash payload keyed into the address reverse index.
    pub fn address_hash(&self) -> AddressHash {
        match (self.account_type, self.witness) {
            (AccountType::Pubkeyhash, _) => AddressHash::hash160(&self.public_key.serialize()),
            (AccountType::Multisig, false) => {
                let redeem = self.redeem_script().unwrap_or_default();
                AddressHash::hash160(redeem.as_bytes())
            }
            (AccountType::Multisig, true) => {
                let redeem = self.redeem_script().unwrap_or_default();
                AddressHash::sha256(redeem.as_bytes())
            }
        }
    }

    /// Script signed over in the sighash: the P2PKH form for single-key
    /// rings (including P2WPKH per BIP143), the redeem script for multisig.
    pub fn script_code(&self) -> ScriptBuf {
        match self.account_type {
            AccountType::Pubkeyhash => {
                let h = hash160::Hash::hash(&self.public_key.serialize());
                ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(h))
            }
            AccountType::Multisig => self.redeem_script().unwrap_or_default(),
        }
    }

    /// Number of signature slots an input spending this ring requires.
    pub fn sig_slots(&self) -> usize {
        match self.account_type {
            AccountType::Pubkeyhash => 1,
            AccountType::Multisig => self.m as usize,
        }
    }

    /// Slot the wallet's own signature occupies, following the sorted key
    /// order inside the script.
    pub fn sign_position(&self) -> usize {
        if self.account_type == AccountType::Pubkeyhash {
            return 0;
        }
        let own = self.public_key.serialize();
        let mut sorted: Vec<[u8; 33]> = self.keys.iter().map(|k| k.serialize()).collect();
        sorted.sort_unstable();
        let rank = sorted.iter().position(|k| *k == own).unwrap_or(0);
        rank.min(self.sig_slots().saturating_sub(1))
    }

    /// Assemble the input script and witness from the signature slots.
    ///
    /// Empty slots become `OP_0` placeholders (or empty witness items), so
    /// the same assembly serves both the unsigned template and the final
    /// signed input.
    pub fn build_input(&self, sigs: &[Option<Vec<u8>>]) -> WalletResult<(ScriptBuf, Witness)> {
        match (self.account_type, self.witness) {
            (AccountType::Pubkeyhash, false) => {
                let mut builder = Builder::new();
                builder = match sigs.first().and_then(|s| s.as_ref()) {
                    Some(sig) => builder.push_slice(push_bytes(sig)?),
                    None => builder.push_int(0),
                };
                builder = builder.push_slice(self.public_key.serialize());
                Ok((builder.into_script(), Witness::new()))
            }
            (AccountType::Pubkeyhash, true) => {
                let mut witness = Witness::new();
                match sigs.first().and_then(|s| s.as_ref()) {
                    Some(sig) => witness.push(sig),
                    None => witness.push([0u8; 0]),
                }
                witness.push(self.public_key.serialize());
                Ok((ScriptBuf::new(), witness))
            }
            (AccountType::Multisig, false) => {
                let redeem = self
                    .redeem_script()
                    .ok_or_else(|| WalletError::Script("missing redeem script".into()))?;
                // Leading OP_0 absorbs the CHECKMULTISIG off-by-one.
                let mut builder = Builder::new().push_int(0);
                for slot in sigs {
                    builder = match slot {
                        Some(sig) => builder.push_slice(push_bytes(sig)?),
                        None => builder.push_int(0),
                    };
                }
                builder = builder.push_slice(push_bytes(redeem.as_bytes())?);
                Ok((builder.into_script(), Witness::new()))
            }
            (AccountType::Multisig, true) => {
                let redeem = self
                    .redeem_script()
                    .ok_or_else(|| WalletError::Script("missing redeem script".into()))?;
                let mut witness = Witness::new();
                witness.push([0u8; 0]);
                for slot in sigs {
                    match slot {
                        Some(sig) => witness.push(sig),
                        None => witness.push([0u8; 0]),
                    }
                }
                witness.push(redeem.as_bytes());
                Ok((ScriptBuf::new(), witness))
            }
        }
    }
}

fn push_bytes(data: &[u8]) -> WalletResult<PushBytesBuf> {
    PushBytesBuf::try_from(data.to_vec())
        .map_err(|_| WalletError::Script("push exceeds script limits".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Branch;
    use secp256k1::{Secp256k1, SecretKey};

    fn pk(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn ring(account_type: AccountType, witness: bool, m: u8, keys: Vec<PublicKey>) -> KeyRing {
        let n = keys.len() as u8;
        KeyRing::new(
            Path::new(1, 0, Branch::Receive, 0),
            keys[0],
            keys,
            account_type,
            m,
            n,
            witness,
        )
    }

    #[test]
    fn test_p2pkh_script() {
        let r = ring(AccountType::Pubkeyhash, false, 1, vec![pk(1)]);
        assert!(r.script_pubkey().is_p2pkh());
        assert!(r.redeem_script().is_none());
        assert_eq!(
            r.address_hash(),
            AddressHash::hash160(&r.public_key.serialize())
        );
    }

    #[test]
    fn test_p2wpkh_script() {
        let r = ring(AccountType::Pubkeyhash, true, 1, vec![pk(1)]);
        assert!(r.script_pubkey().is_p2wpkh());
        assert!(r.program().is_some());
    }

    #[test]
    fn test_multisig_script_key_order_independent() {
        let keys_a = vec![pk(1), pk(2), pk(3)];
        let keys_b = vec![pk(3), pk(1), pk(2)];
        let ra = ring(AccountType::Multisig, false, 2, keys_a);
        let rb = ring(AccountType::Multisig, false, 2, keys_b);
        assert_eq!(ra.redeem_script(), rb.redeem_script());
        assert_eq!(ra.address_hash(), rb.address_hash());
        assert!(ra.script_pubkey().is_p2sh());
    }

    #[test]
    fn test_p2wsh_hash_is_sha256() {
        let r = ring(AccountType::Multisig, true, 2, vec![pk(1), pk(2)]);
        let redeem = r.redeem_script().unwrap();
        assert!(r.script_pubkey().is_p2wsh());
        assert_eq!(r.address_hash(), AddressHash::sha256(redeem.as_bytes()));
    }

    #[test]
    fn test_template_round_trip_via_script_hash() {
        let r = ring(AccountType::Multisig, false, 2, vec![pk(1), pk(2), pk(3)]);
        let (script_sig, witness) = r.build_input(&[None, None]).unwrap();
        assert!(witness.is_empty());
        // The template must end with a push of the redeem script.
        let redeem = r.redeem_script().unwrap();
        let bytes = script_sig.into_bytes();
        assert!(bytes.ends_with(redeem.as_bytes()));
    }

    #[test]
    fn test_sig_slots() {
        assert_eq!(ring(AccountType::Pubkeyhash, false, 1, vec![pk(1)]).sig_slots(), 1);
        assert_eq!(
            ring(AccountType::Multisig, false, 2, vec![pk(1), pk(2), pk(3)]).sig_slots(),
            2
        );
    }
}
