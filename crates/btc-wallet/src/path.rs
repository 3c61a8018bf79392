//! Derivation paths and the address reverse index key.
//!
//! A [`Path`] pins an address to `(wid, account, branch, index)` inside the
//! wallet store. The reverse index maps an [`AddressHash`] (the 20- or
//! 32-byte payload of the scriptPubKey) back to its path, which is how the
//! wallet recognizes its own outputs on incoming transactions.

use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::script::Script;
use serde::{Deserialize, Serialize};
use std::fmt;

/// External (receive) or internal (change) branch of a BIP44 account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    /// External chain, `change = 0`.
    Receive,
    /// Internal chain, `change = 1`.
    Change,
}

impl Branch {
    /// The `change` bit at the BIP44 branch level.
    pub fn bit(&self) -> u32 {
        match self {
            Branch::Receive => 0,
            Branch::Change => 1,
        }
    }

    pub fn from_bit(bit: u32) -> Option<Branch> {
        match bit {
            0 => Some(Branch::Receive),
            1 => Some(Branch::Change),
            _ => None,
        }
    }
}

/// Unique location of an address within a wallet store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    /// Wallet identifier assigned by the database.
    pub wid: u32,
    /// Account index (the hardened `account'` level).
    pub account: u32,
    /// Receive or change branch.
    pub branch: Branch,
    /// Address index on the branch.
    pub index: u32,
}

impl Path {
    pub fn new(wid: u32, account: u32, branch: Branch, index: u32) -> Self {
        Self {
            wid,
            account,
            branch,
            index,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/44'/{}'/{}/{}",
            self.account,
            self.branch.bit(),
            self.index
        )
    }
}

/// Hash payload of a scriptPubKey the wallet can recognize.
///
/// Key-hash outputs (P2PKH, P2WPKH) and script-hash outputs (P2SH) carry a
/// 20-byte payload; witness script-hash outputs (P2WSH) carry 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressHash {
    /// 20-byte `HASH160` payload.
    H160([u8; 20]),
    /// 32-byte `SHA256` payload.
    H256([u8; 32]),
}

impl AddressHash {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AddressHash::H160(h) => h,
            AddressHash::H256(h) => h,
        }
    }

    /// `HASH160` of arbitrary data.
    pub fn hash160(data: &[u8]) -> AddressHash {
        AddressHash::H160(hash160::Hash::hash(data).to_byte_array())
    }

    /// `SHA256` of arbitrary data.
    pub fn sha256(data: &[u8]) -> AddressHash {
        AddressHash::H256(sha256::Hash::hash(data).to_byte_array())
    }

    /// Extract the hash payload from a standard scriptPubKey.
    ///
    /// Returns `None` for non-standard scripts the wallet cannot own.
    pub fn from_script_pubkey(script: &Script) -> Option<AddressHash> {
        let bytes = script.as_bytes();
        if script.is_p2pkh() {
            let mut h = [0u8; 20];
            h.copy_from_slice(&bytes[3..23]);
            Some(AddressHash::H160(h))
        } else if script.is_p2sh() {
            let mut h = [0u8; 20];
            h.copy_from_slice(&bytes[2..22]);
            Some(AddressHash::H160(h))
        } else if script.is_p2wpkh() {
            let mut h = [0u8; 20];
            h.copy_from_slice(&bytes[2..22]);
            Some(AddressHash::H160(h))
        } else if script.is_p2wsh() {
            let mut h = [0u8; 32];
            h.copy_from_slice(&bytes[2..34]);
            Some(AddressHash::H256(h))
        } else {
            None
        }
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::script::ScriptBuf;
    use bitcoin::{PubkeyHash, WScriptHash};

    #[test]
    fn test_branch_bits() {
        assert_eq!(Branch::Receive.bit(), 0);
        assert_eq!(Branch::Change.bit(), 1);
        assert_eq!(Branch::from_bit(0), Some(Branch::Receive));
        assert_eq!(Branch::from_bit(1), Some(Branch::Change));
        assert_eq!(Branch::from_bit(2), None);
    }

    #[test]
    fn test_path_display() {
        let path = Path::new(1, 3, Branch::Change, 7);
        assert_eq!(path.to_string(), "m/44'/3'/1/7");
    }

    #[test]
    fn test_hash_from_p2pkh() {
        let h = hash160::Hash::hash(b"pubkey");
        let script = ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(h));
        assert_eq!(
            AddressHash::from_script_pubkey(&script),
            Some(AddressHash::H160(h.to_byte_array()))
        );
    }

    #[test]
    fn test_hash_from_p2wsh() {
        let h = sha256::Hash::hash(b"witness script");
        let script = ScriptBuf::new_p2wsh(&WScriptHash::from_raw_hash(h));
        assert_eq!(
            AddressHash::from_script_pubkey(&script),
            Some(AddressHash::H256(h.to_byte_array()))
        );
    }

    #[test]
    fn test_hash_from_nonstandard() {
        let script = ScriptBuf::new();
        assert_eq!(AddressHash::from_script_pubkey(&script), None);
    }
}
