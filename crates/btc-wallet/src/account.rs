//! BIP44 accounts.
//!
//! An [`Account`] owns one `m/44'/coin'/index'` subtree: the account-level
//! public key, the cosigner key set for multisig accounts, and the receive
//! and change depths. Addresses are pre-derived `LOOKAHEAD` indices past each
//! depth so inbound payments to near-future addresses are still recognized.
//!
//! Accounts carry only identifiers (`wid`, `index`); persistence and event
//! routing go through the owning wallet.

use crate::codec;
use crate::keyring::{AccountType, KeyRing};
use crate::network::Network;
use crate::path::{Branch, Path};
use crate::{WalletError, WalletResult};
use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::hashes::{sha256d, Hash};
use secp256k1::{PublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::str::FromStr;
use tracing::debug;

/// Unused addresses pre-derived past each branch depth.
pub const LOOKAHEAD: u32 = 5;

/// Construction parameters for a new account.
#[derive(Debug, Clone)]
pub struct AccountOptions {
    /// Account name; account 0 is conventionally "default".
    pub name: String,
    /// Account index within the wallet.
    pub index: u32,
    /// HD public key at `m/44'/coin'/index'`.
    pub account_key: Xpub,
    /// Address kind. Coerced to multisig whenever `n > 1`.
    pub account_type: AccountType,
    /// Multisig threshold.
    pub m: u8,
    /// Multisig cosigner count.
    pub n: u8,
    /// Whether addresses use a witness program.
    pub witness: bool,
}

/// One BIP44 subtree of a wallet.
#[derive(Debug, Clone)]
pub struct Account {
    /// Owning wallet identifier.
    pub wid: u32,
    pub name: String,
    pub account_index: u32,
    pub account_key: Xpub,
    pub account_type: AccountType,
    pub m: u8,
    pub n: u8,
    pub witness: bool,
    /// Set once the cosigner set is complete and depth 1 is derived.
    pub initialized: bool,
    /// Index of the next receive address.
    pub receive_depth: u32,
    /// Index of the next change address.
    pub change_depth: u32,
    /// Cosigner account keys; element 0 is always `account_key`.
    pub keys: Vec<Xpub>,
    /// Cached ring at `receive_depth - 1`. `None` until initialized.
    pub receive_address: Option<KeyRing>,
    /// Cached ring at `change_depth - 1`. `None` until initialized.
    pub change_address: Option<KeyRing>,
}

impl Account {
    pub fn new(wid: u32, options: AccountOptions) -> WalletResult<Account> {
        let n = options.n.max(1);
        let m = options.m.max(1);
        if m > n {
            return Err(WalletError::InvalidKey(format!(
                "threshold {} exceeds cosigner count {}",
                m, n
            )));
        }
        let account_type = if n > 1 {
            AccountType::Multisig
        } else {
            options.account_type
        };
        if options.account_key.depth != 3 {
            return Err(WalletError::InvalidKey(
                "account key must be derived at the BIP44 account level".into(),
            ));
        }

        Ok(Account {
            wid,
            name: options.name,
            account_index: options.index,
            account_key: options.account_key,
            account_type,
            m,
            n,
            witness: options.witness,
            initialized: false,
            receive_depth: 0,
            change_depth: 0,
            keys: vec![options.account_key],
            receive_address: None,
            change_address: None,
        })
    }

    /// Whether the cosigner set has reached `n` keys.
    pub fn complete(&self) -> bool {
        self.keys.len() == self.n as usize
    }

    /// Add a cosigner key. The caller initializes the account once the set
    /// is complete and the shared-script check has passed.
    pub fn push_key(&mut self, key: Xpub) -> WalletResult<()> {
        if key.depth != 3 {
            return Err(WalletError::InvalidKey(
                "cosigner key must be derived at the BIP44 account level".into(),
            ));
        }
        if self.keys.iter().any(|k| k.encode() == key.encode()) {
            return Err(WalletError::KeyExists);
        }
        if self.keys.len() >= self.n as usize {
            return Err(WalletError::KeyLimit);
        }
        self.keys.push(key);
        Ok(())
    }

    /// Remove a cosigner key. Refused once the set is complete.
    pub fn remove_key(&mut self, key: &Xpub) -> WalletResult<()> {
        if self.keys.len() >= self.n as usize {
            return Err(WalletError::KeyLimit);
        }
        if key.encode() == self.account_key.encode() {
            return Err(WalletError::InvalidKey(
                "cannot remove the account's own key".into(),
            ));
        }
        let pos = self
            .keys
            .iter()
            .position(|k| k.encode() == key.encode())
            .ok_or(WalletError::KeyAbsent)?;
        self.keys.remove(pos);
        Ok(())
    }

    /// Mark the account initialized and derive the first address on each
    /// branch plus lookahead. Returns every newly derived ring.
    pub fn init_depths(&mut self) -> WalletResult<Vec<KeyRing>> {
        if !self.complete() {
            return Err(WalletError::NotInitialized);
        }
        self.initialized = true;
        let rings = self.set_depth(1, 1)?;
        debug!(
            account = self.account_index,
            name = %self.name,
            "Account initialized"
        );
        Ok(rings)
    }

    /// Derive the keyring at one branch index.
    pub fn derive_ring(&self, branch: Branch, index: u32) -> WalletResult<KeyRing> {
        let chain = [
            ChildNumber::Normal { index: branch.bit() },
            ChildNumber::Normal { index },
        ];
        let own = self.account_key.derive_pub(SECP256K1, &chain)?;

        let keys: Vec<PublicKey> = if self.account_type == AccountType::Multisig {
            let mut derived = Vec::with_capacity(self.keys.len());
            for key in &self.keys {
                derived.push(key.derive_pub(SECP256K1, &chain)?.public_key);
            }
            derived
        } else {
            vec![own.public_key]
        };

        Ok(KeyRing::new(
            Path::new(self.wid, self.account_index, branch, index),
            own.public_key,
            keys,
            self.account_type,
            self.m,
            self.n,
            self.witness,
        ))
    }

    /// Raise branch depths, deriving `[current, new + LOOKAHEAD)` on every
    /// branch that advances. Depths never decrease. Returns the newly
    /// derived rings in branch-then-index order; the caller persists their
    /// paths and drops the batch on failure, so no partial advancement is
    /// ever observable.
    pub fn set_depth(&mut self, receive: u32, change: u32) -> WalletResult<Vec<KeyRing>> {
        let mut rings = Vec::new();

        if receive > self.receive_depth {
            for index in self.receive_depth..receive + LOOKAHEAD {
                rings.push(self.derive_ring(Branch::Receive, index)?);
            }
            self.receive_address = Some(self.derive_ring(Branch::Receive, receive - 1)?);
            self.receive_depth = receive;
        }

        if change > self.change_depth {
            for index in self.change_depth..change + LOOKAHEAD {
                rings.push(self.derive_ring(Branch::Change, index)?);
            }
            self.change_address = Some(self.derive_ring(Branch::Change, change - 1)?);
            self.change_depth = change;
        }

        Ok(rings)
    }

    /// Whether the given account-level key is part of this account.
    pub fn has_key(&self, key: &Xpub) -> bool {
        self.keys.iter().any(|k| k.encode() == key.encode())
    }

    /// Serialize to the persisted record layout.
    pub fn to_raw(&self, network: Network) -> WalletResult<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out, network)?;
        Ok(out)
    }

    fn write_to<W: Write>(&self, w: &mut W, network: Network) -> WalletResult<()> {
        codec::write_u32(w, network.magic())?;
        codec::write_varstring(w, &self.name)?;
        codec::write_u8(w, self.initialized as u8)?;
        codec::write_u8(w, self.account_type.to_u8())?;
        codec::write_u8(w, self.m)?;
        codec::write_u8(w, self.n)?;
        codec::write_u8(w, self.witness as u8)?;
        codec::write_u32(w, self.account_index)?;
        codec::write_u32(w, self.receive_depth)?;
        codec::write_u32(w, self.change_depth)?;
        w.write_all(&xpub_to_extended(&self.account_key))?;
        let cosigners = &self.keys[1..];
        codec::write_u8(w, cosigners.len() as u8)?;
        for key in cosigners {
            w.write_all(&xpub_to_extended(key))?;
        }
        Ok(())
    }

    /// Deserialize from the persisted record layout, re-deriving the cached
    /// branch rings for initialized accounts.
    pub fn from_raw(wid: u32, data: &[u8], network: Network) -> WalletResult<Account> {
        let mut r = data;
        let magic = codec::read_u32(&mut r)?;
        if Network::from_magic(magic) != Some(network) {
            return Err(WalletError::Record(format!(
                "account magic {:#010x} does not match network {}",
                magic, network
            )));
        }
        let name = codec::read_varstring(&mut r, 64)?;
        let initialized = codec::read_u8(&mut r)? != 0;
        let account_type = AccountType::from_u8(codec::read_u8(&mut r)?)
            .ok_or_else(|| WalletError::Record("unknown account type".into()))?;
        let m = codec::read_u8(&mut r)?;
        let n = codec::read_u8(&mut r)?;
        let witness = codec::read_u8(&mut r)? != 0;
        let account_index = codec::read_u32(&mut r)?;
        let receive_depth = codec::read_u32(&mut r)?;
        let change_depth = codec::read_u32(&mut r)?;
        let account_key = xpub_from_extended(&codec::read_bytes::<_, 82>(&mut r)?)?;
        let count = codec::read_u8(&mut r)? as usize;
        let mut keys = Vec::with_capacity(count + 1);
        keys.push(account_key);
        for _ in 0..count {
            keys.push(xpub_from_extended(&codec::read_bytes::<_, 82>(&mut r)?)?);
        }

        let mut account = Account {
            wid,
            name,
            account_index,
            account_key,
            account_type,
            m,
            n,
            witness,
            initialized,
            receive_depth,
            change_depth,
            keys,
            receive_address: None,
            change_address: None,
        };

        if account.initialized {
            if account.receive_depth > 0 {
                account.receive_address =
                    Some(account.derive_ring(Branch::Receive, account.receive_depth - 1)?);
            }
            if account.change_depth > 0 {
                account.change_address =
                    Some(account.derive_ring(Branch::Change, account.change_depth - 1)?);
            }
        }

        Ok(account)
    }

    /// JSON view.
    pub fn to_json(&self) -> AccountJson {
        AccountJson {
            name: self.name.clone(),
            index: self.account_index,
            account_type: self.account_type,
            m: self.m,
            n: self.n,
            witness: self.witness,
            initialized: self.initialized,
            receive_depth: self.receive_depth,
            change_depth: self.change_depth,
            account_key: self.account_key.to_string(),
            keys: self.keys[1..].iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn from_json(wid: u32, json: &AccountJson) -> WalletResult<Account> {
        let account_key = Xpub::from_str(&json.account_key)
            .map_err(|_| WalletError::Record("bad account key".into()))?;
        let mut keys = vec![account_key];
        for key in &json.keys {
            keys.push(
                Xpub::from_str(key).map_err(|_| WalletError::Record("bad cosigner key".into()))?,
            );
        }

        let mut account = Account {
            wid,
            name: json.name.clone(),
            account_index: json.index,
            account_key,
            account_type: json.account_type,
            m: json.m,
            n: json.n,
            witness: json.witness,
            initialized: json.initialized,
            receive_depth: json.receive_depth,
            change_depth: json.change_depth,
            keys,
            receive_address: None,
            change_address: None,
        };

        if account.initialized {
            if account.receive_depth > 0 {
                account.receive_address =
                    Some(account.derive_ring(Branch::Receive, account.receive_depth - 1)?);
            }
            if account.change_depth > 0 {
                account.change_address =
                    Some(account.derive_ring(Branch::Change, account.change_depth - 1)?);
            }
        }

        Ok(account)
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.wid == other.wid
            && self.name == other.name
            && self.account_index == other.account_index
            && self.account_key == other.account_key
            && self.account_type == other.account_type
            && self.m == other.m
            && self.n == other.n
            && self.witness == other.witness
            && self.initialized == other.initialized
            && self.receive_depth == other.receive_depth
            && self.change_depth == other.change_depth
            && self.keys == other.keys
    }
}

/// JSON shape of the account record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountJson {
    pub name: String,
    pub index: u32,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub m: u8,
    pub n: u8,
    pub witness: bool,
    pub initialized: bool,
    pub receive_depth: u32,
    pub change_depth: u32,
    pub account_key: String,
    pub keys: Vec<String>,
}

/// 78-byte BIP32 serialization plus 4-byte double-SHA256 checksum.
pub(crate) fn xpub_to_extended(key: &Xpub) -> [u8; 82] {
    let mut out = [0u8; 82];
    out[..78].copy_from_slice(&key.encode());
    let checksum = sha256d::Hash::hash(&out[..78]).to_byte_array();
    out[78..].copy_from_slice(&checksum[..4]);
    out
}

pub(crate) fn xpub_from_extended(data: &[u8; 82]) -> WalletResult<Xpub> {
    let (payload, checksum) = data.split_at(78);
    let expected = sha256d::Hash::hash(payload).to_byte_array();
    if checksum != &expected[..4] {
        return Err(WalletError::Record("extended key checksum mismatch".into()));
    }
    Xpub::decode(payload).map_err(|_| WalletError::Record("bad extended public key".into()))
}
