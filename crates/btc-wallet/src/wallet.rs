//! Wallet orchestration.
//!
//! The [`Wallet`] ties the subsystems together: identity and API token,
//! account lifecycle, master key custody, funding and signing. Two logical
//! mutexes guard observable state: the write lock serializes every mutation
//! of persistent state, the fund lock serializes coin selection so no two
//! in-flight spends can pick the same coin.
//!
//! Every write-mutating operation follows the same batch discipline:
//! acquire the write lock, `db.start(wid)`, stage mutations, save records,
//! then `db.commit(wid)`; any error drops the batch before it escapes, so a
//! failed operation leaves neither persisted nor in-memory state changed.

use crate::account::{Account, AccountOptions};
use crate::db::WalletDb;
use crate::events::{BalanceSnapshot, EventBus, WalletEvent};
use crate::keyring::{AccountType, KeyRing};
use crate::master::{MasterJson, MasterKey, DEFAULT_UNLOCK_TIMEOUT};
use crate::mtx::{FundOptions, Mtx, Selection};
use crate::network::Network;
use crate::path::{AddressHash, Branch, Path};
use crate::workers::{SignJob, WorkerPool};
use crate::{codec, WalletError, WalletResult};
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::hashes::{hash160, sha256d, Hash};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{base58, OutPoint, ScriptBuf, Transaction};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::RngCore;
use secp256k1::SECP256K1;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroize;

/// Wallet id prefix bytes; base58 renders them as `WLT`.
const ID_PREFIX: [u8; 3] = [0x03, 0xbe, 0x04];

/// Construction parameters for a new wallet.
#[derive(Debug, Clone)]
pub struct WalletOptions {
    /// Explicit id; derived from the master key when absent.
    pub id: Option<String>,
    /// Root key; generated from fresh entropy when absent.
    pub master: Option<Xpriv>,
    /// Encrypt the master under this passphrase.
    pub passphrase: Option<String>,
    /// Address kind of the default account.
    pub account_type: AccountType,
    pub m: u8,
    pub n: u8,
    pub witness: bool,
    /// Cosigner account keys for the default account.
    pub account_keys: Vec<Xpub>,
}

impl Default for WalletOptions {
    fn default() -> Self {
        Self {
            id: None,
            master: None,
            passphrase: None,
            account_type: AccountType::Pubkeyhash,
            m: 1,
            n: 1,
            witness: false,
            account_keys: Vec::new(),
        }
    }
}

/// Parameters for [`Wallet::create_account`].
#[derive(Debug, Clone)]
pub struct CreateAccountOptions {
    /// Account name; defaults to the decimal account index.
    pub name: Option<String>,
    pub account_type: AccountType,
    pub m: u8,
    pub n: u8,
    pub witness: bool,
    /// Cosigner account keys.
    pub keys: Vec<Xpub>,
}

impl Default for CreateAccountOptions {
    fn default() -> Self {
        Self {
            name: None,
            account_type: AccountType::Pubkeyhash,
            m: 1,
            n: 1,
            witness: false,
            keys: Vec::new(),
        }
    }
}

/// Account selector: by index or by name.
#[derive(Debug, Clone)]
pub enum AccountQuery {
    Index(u32),
    Name(String),
}

impl From<u32> for AccountQuery {
    fn from(index: u32) -> Self {
        AccountQuery::Index(index)
    }
}

impl From<&str> for AccountQuery {
    fn from(name: &str) -> Self {
        AccountQuery::Name(name.to_string())
    }
}

impl Default for AccountQuery {
    fn default() -> Self {
        AccountQuery::Index(0)
    }
}

/// Funding parameters for [`Wallet::fund`].
#[derive(Debug, Clone, Default)]
pub struct FundTxOptions {
    /// Account to draw coins from; the default account when absent.
    pub account: Option<AccountQuery>,
    /// Explicit fee rate, satoshis per kilobyte. Falls back to the fee
    /// estimator, then the network relay rate.
    pub rate: Option<u64>,
    pub selection: Selection,
    /// Round the fee up to the nearest kilobyte.
    pub round: bool,
    /// Allow a zero fee when input priority qualifies.
    pub free: bool,
    /// Hard fee override.
    pub hard_fee: Option<u64>,
    /// Take the fee from the outputs.
    pub subtract_fee: bool,
    /// Spend confirmed coins only.
    pub confirmed: bool,
    /// Re-enter without re-acquiring the fund lock. Only for callers that
    /// already hold it.
    pub force: bool,
}

/// Parameters for [`Wallet::create_tx`] and [`Wallet::send`].
#[derive(Debug, Clone, Default)]
pub struct CreateTxOptions {
    /// `(locking script, value)` pairs, appended in order.
    pub outputs: Vec<(ScriptBuf, u64)>,
    pub fund: FundTxOptions,
}

/// Parameters for [`Wallet::sign`].
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Passphrase to unlock the master if it is locked.
    pub passphrase: Option<String>,
    /// Unlock deadline; `None` disables the auto-wipe.
    pub timeout: Option<Duration>,
    pub sighash_type: EcdsaSighashType,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            passphrase: None,
            timeout: Some(DEFAULT_UNLOCK_TIMEOUT),
            sighash_type: EcdsaSighashType::All,
        }
    }
}

/// A transaction or a single input of it, for path resolution.
#[derive(Debug, Clone, Copy)]
pub enum InputRef<'a> {
    /// Every input of the transaction.
    Transaction(&'a Mtx),
    /// One input by index.
    Input(&'a Mtx, usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WalletState {
    initialized: bool,
    account_depth: u32,
    token_depth: u32,
    token: [u8; 32],
}

/// A BIP44 wallet bound to a database.
pub struct Wallet {
    db: Arc<dyn WalletDb>,
    network: Network,
    wid: u32,
    id: String,
    master: MasterKey,
    state: RwLock<WalletState>,
    account0: RwLock<Option<Account>>,
    events: EventBus,
    workers: Option<Arc<WorkerPool>>,
    write_lock: Mutex<()>,
    fund_lock: Mutex<()>,
    locked_coins: Mutex<HashSet<OutPoint>>,
}

impl Wallet {
    /// Register and initialize a new wallet in one shot.
    pub fn create(db: Arc<dyn WalletDb>, options: WalletOptions) -> WalletResult<Wallet> {
        let network = db.network();

        let master_key = match options.master {
            Some(key) => key,
            None => {
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                let key = Xpriv::new_master(network.kind(), &seed)?;
                seed.zeroize();
                key
            }
        };

        let id = match &options.id {
            Some(id) => id.clone(),
            None => Self::id_for(&master_key, network)?,
        };
        let wid = db.register(&id)?;

        let wallet = Wallet {
            db,
            network,
            wid,
            id,
            master: MasterKey::from_key(master_key),
            state: RwLock::new(WalletState {
                initialized: false,
                account_depth: 0,
                token_depth: 0,
                token: [0u8; 32],
            }),
            account0: RwLock::new(None),
            events: EventBus::default(),
            workers: None,
            write_lock: Mutex::new(()),
            fund_lock: Mutex::new(()),
            locked_coins: Mutex::new(HashSet::new()),
        };

        wallet.init(options)?;
        Ok(wallet)
    }

    /// One-shot initialization: derive the token, create the default
    /// account, encrypt the master when a passphrase is supplied.
    pub fn init(&self, options: WalletOptions) -> WalletResult<()> {
        let _guard = self.write_lock.lock();

        if self.state.read().initialized {
            return Err(WalletError::AlreadyInitialized);
        }

        let master_key = self.master.key()?;
        let token = Self::compute_token(&master_key, 0)?;

        let mut account = Account::new(
            self.wid,
            AccountOptions {
                name: "default".into(),
                index: 0,
                account_key: self.derive_account_key(&master_key, 0)?,
                account_type: options.account_type,
                m: options.m,
                n: options.n,
                witness: options.witness,
            },
        )?;
        for key in &options.account_keys {
            account.push_key(*key)?;
        }

        let staged = WalletState {
            initialized: true,
            account_depth: 1,
            token_depth: 0,
            token,
        };

        self.with_batch(|| {
            if account.complete() {
                self.check_shared_script(&account)?;
                let rings = account.init_depths()?;
                self.save_rings(&rings)?;
            }
            self.db.save_account(
                self.wid,
                account.account_index,
                &account.name,
                account.to_raw(self.network)?,
            )?;
            if let Some(passphrase) = &options.passphrase {
                self.master.encrypt(passphrase)?;
            }
            self.db
                .save_wallet(self.wid, self.serialize_state(&staged)?)?;
            Ok(())
        })?;

        *self.state.write() = staged;
        *self.account0.write() = Some(account);

        info!(wid = self.wid, id = %self.id, "Wallet initialized");
        Ok(())
    }

    /// Reattach a persisted wallet, loading the default account into cache.
    pub fn open(db: Arc<dyn WalletDb>, id: &str) -> WalletResult<Wallet> {
        let record = db
            .get_wallet(id)?
            .ok_or_else(|| WalletError::Record(format!("wallet {} not found", id)))?;
        let wallet = Self::from_raw(db, &record)?;

        let account = wallet
            .db
            .get_account_raw(wallet.wid, 0)?
            .map(|raw| Account::from_raw(wallet.wid, &raw, wallet.network))
            .transpose()?;
        *wallet.account0.write() = account;

        debug!(wid = wallet.wid, id = %wallet.id, "Wallet opened");
        Ok(wallet)
    }

    /// Unregister from the database and zero the decrypted master.
    ///
    /// Must not be called while operations are in flight.
    pub fn destroy(self) -> WalletResult<()> {
        let _guard = self.write_lock.lock();
        self.master.destroy();
        self.db.unregister(self.wid)?;
        info!(wid = self.wid, id = %self.id, "Wallet destroyed");
        Ok(())
    }

    /// Attach a signing worker pool.
    pub fn set_workers(&mut self, pool: Arc<WorkerPool>) {
        self.workers = Some(pool);
    }

    pub fn wid(&self) -> u32 {
        self.wid
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn account_depth(&self) -> u32 {
        self.state.read().account_depth
    }

    pub fn token(&self) -> [u8; 32] {
        self.state.read().token
    }

    pub fn token_depth(&self) -> u32 {
        self.state.read().token_depth
    }

    pub fn master(&self) -> &MasterKey {
        &self.master
    }

    /// Subscribe to wallet events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Deterministic wallet id: base58check over
    /// `0x03be04 || HASH160(pubkey(m/44) || magic_le)`.
    pub fn id_for(master: &Xpriv, network: Network) -> WalletResult<String> {
        let child = master.derive_priv(SECP256K1, &[ChildNumber::Normal { index: 44 }])?;
        let pubkey = Xpub::from_priv(SECP256K1, &child).public_key;

        let mut data = pubkey.serialize().to_vec();
        data.extend_from_slice(&network.magic().to_le_bytes());
        let hash = hash160::Hash::hash(&data).to_byte_array();

        let mut payload = ID_PREFIX.to_vec();
        payload.extend_from_slice(&hash);
        Ok(base58::encode_check(&payload))
    }

    /// API token: `HASH256(privkey(m/44') || nonce_le)`.
    fn compute_token(master: &Xpriv, nonce: u32) -> WalletResult<[u8; 32]> {
        let child = master.derive_priv(SECP256K1, &[ChildNumber::Hardened { index: 44 }])?;
        let mut data = child.private_key.secret_bytes().to_vec();
        data.extend_from_slice(&nonce.to_le_bytes());
        let token = sha256d::Hash::hash(&data).to_byte_array();
        data.zeroize();
        Ok(token)
    }

    fn derive_account_key(&self, master: &Xpriv, index: u32) -> WalletResult<Xpub> {
        let path = [
            ChildNumber::Hardened { index: 44 },
            ChildNumber::Hardened {
                index: self.network.coin_type(),
            },
            ChildNumber::Hardened { index },
        ];
        let child = master.derive_priv(SECP256K1, &path)?;
        Ok(Xpub::from_priv(SECP256K1, &child))
    }

    // ------------------------------------------------------------------
    // Master key operations
    // ------------------------------------------------------------------

    /// Decrypt under the old passphrase, re-encrypt under the new one.
    /// Master state is unchanged if either step fails.
    pub fn set_passphrase(&self, old: Option<&str>, new: &str) -> WalletResult<()> {
        let _guard = self.write_lock.lock();

        if self.master.is_encrypted() {
            let old = old.ok_or(WalletError::BadPassphrase)?;
            self.master.decrypt(old)?;
        }
        self.master.encrypt(new)?;

        let state = self.state.read().clone();
        self.with_batch(|| {
            self.db
                .save_wallet(self.wid, self.serialize_state(&state)?)?;
            Ok(())
        })?;
        debug!(wid = self.wid, "Passphrase rotated");
        Ok(())
    }

    /// Bump the token nonce and derive the next token.
    pub fn retoken(&self, passphrase: Option<&str>) -> WalletResult<[u8; 32]> {
        let _guard = self.write_lock.lock();

        let master_key = self.unlocked_key(passphrase, Some(DEFAULT_UNLOCK_TIMEOUT))?;
        let mut staged = self.state.read().clone();
        staged.token_depth += 1;
        staged.token = Self::compute_token(&master_key, staged.token_depth)?;

        self.with_batch(|| {
            self.db
                .save_wallet(self.wid, self.serialize_state(&staged)?)?;
            Ok(())
        })?;

        let token = staged.token;
        *self.state.write() = staged;
        debug!(wid = self.wid, depth = self.token_depth(), "Token rotated");
        Ok(token)
    }

    /// Unlock the master key for `timeout` (`None` disables the auto-wipe).
    pub fn unlock(&self, passphrase: &str, timeout: Option<Duration>) -> WalletResult<()> {
        self.master.unlock(passphrase, timeout).map(|_| ())
    }

    /// Wipe the decrypted master material.
    pub fn lock(&self) {
        self.master.lock();
    }

    fn unlocked_key(
        &self,
        passphrase: Option<&str>,
        timeout: Option<Duration>,
    ) -> WalletResult<Xpriv> {
        if self.master.is_locked() {
            let passphrase = passphrase.ok_or(WalletError::MasterLocked)?;
            self.master.unlock(passphrase, timeout)
        } else {
            self.master.key()
        }
    }

    // ------------------------------------------------------------------
    // Accounts and addresses
    // ------------------------------------------------------------------

    /// Resolve an account by index or name.
    pub fn get_account(&self, query: impl Into<AccountQuery>) -> WalletResult<Account> {
        let index = self.account_index(query)?;
        if index == 0 {
            if let Some(account) = self.account0.read().clone() {
                return Ok(account);
            }
        }
        let raw = self
            .db
            .get_account_raw(self.wid, index)?
            .ok_or_else(|| WalletError::AccountNotFound(index.to_string()))?;
        Account::from_raw(self.wid, &raw, self.network)
    }

    /// Resolve an account selector to its index.
    pub fn account_index(&self, query: impl Into<AccountQuery>) -> WalletResult<u32> {
        match query.into() {
            AccountQuery::Index(index) => Ok(index),
            AccountQuery::Name(name) => self
                .db
                .get_account_index(self.wid, &name)?
                .ok_or(WalletError::AccountNotFound(name)),
        }
    }

    pub fn has_account(&self, query: impl Into<AccountQuery>) -> WalletResult<bool> {
        match query.into() {
            AccountQuery::Index(index) => self.db.has_account(self.wid, index),
            AccountQuery::Name(name) => {
                Ok(self.db.get_account_index(self.wid, &name)?.is_some())
            }
        }
    }

    /// All account indices.
    pub fn accounts(&self) -> WalletResult<Vec<u32>> {
        self.db.get_accounts(self.wid)
    }

    /// Create the next account at the current account depth.
    ///
    /// Requires the master to be unlocked (or a passphrase) when encrypted.
    pub fn create_account(
        &self,
        options: CreateAccountOptions,
        passphrase: Option<&str>,
    ) -> WalletResult<Account> {
        let _guard = self.write_lock.lock();

        if !self.state.read().initialized {
            return Err(WalletError::NotInitialized);
        }

        let master_key = self.unlocked_key(passphrase, Some(DEFAULT_UNLOCK_TIMEOUT))?;
        let mut staged = self.state.read().clone();
        let index = staged.account_depth;
        let name = options.name.unwrap_or_else(|| index.to_string());

        if self.db.get_account_index(self.wid, &name)?.is_some() {
            return Err(WalletError::Record(format!(
                "account {} already exists",
                name
            )));
        }

        let mut account = Account::new(
            self.wid,
            AccountOptions {
                name,
                index,
                account_key: self.derive_account_key(&master_key, index)?,
                account_type: options.account_type,
                m: options.m,
                n: options.n,
                witness: options.witness,
            },
        )?;
        for key in &options.keys {
            account.push_key(*key)?;
        }
        staged.account_depth += 1;

        self.with_batch(|| {
            if account.complete() {
                self.check_shared_script(&account)?;
                let rings = account.init_depths()?;
                self.save_rings(&rings)?;
            }
            self.db.save_account(
                self.wid,
                account.account_index,
                &account.name,
                account.to_raw(self.network)?,
            )?;
            self.db
                .save_wallet(self.wid, self.serialize_state(&staged)?)?;
            Ok(())
        })?;

        *self.state.write() = staged;
        info!(
            wid = self.wid,
            account = account.account_index,
            name = %account.name,
            "Account created"
        );
        Ok(account)
    }

    /// Add a cosigner key to a multisig account. Reaching `n` keys
    /// initializes the account and derives its first addresses.
    pub fn add_key(&self, query: impl Into<AccountQuery>, key: Xpub) -> WalletResult<Account> {
        let _guard = self.write_lock.lock();

        let mut account = self.get_account(query)?;

        // A key that already belongs to a different account of this wallet
        // is refused outright.
        for index in self.db.get_accounts(self.wid)? {
            if index == account.account_index {
                continue;
            }
            let other = self.get_account(index)?;
            if other.has_key(&key) {
                return Err(WalletError::KeyExists);
            }
        }

        self.with_batch(|| {
            account.push_key(key)?;
            if account.complete() {
                self.check_shared_script(&account)?;
                let rings = account.init_depths()?;
                self.save_rings(&rings)?;
            }
            self.db.save_account(
                self.wid,
                account.account_index,
                &account.name,
                account.to_raw(self.network)?,
            )?;
            Ok(())
        })?;

        self.refresh_account0(&account);
        Ok(account)
    }

    /// Remove a cosigner key from an incomplete multisig account.
    pub fn remove_key(&self, query: impl Into<AccountQuery>, key: &Xpub) -> WalletResult<Account> {
        let _guard = self.write_lock.lock();

        let mut account = self.get_account(query)?;
        self.with_batch(|| {
            account.remove_key(key)?;
            self.db.save_account(
                self.wid,
                account.account_index,
                &account.name,
                account.to_raw(self.network)?,
            )?;
            Ok(())
        })?;

        self.refresh_account0(&account);
        Ok(account)
    }

    /// Advance one branch of an account by a single address.
    pub fn create_address(
        &self,
        query: impl Into<AccountQuery>,
        branch: Branch,
    ) -> WalletResult<KeyRing> {
        let _guard = self.write_lock.lock();

        let mut account = self.get_account(query)?;
        if !account.initialized {
            return Err(WalletError::NotInitialized);
        }

        let (receive, change) = match branch {
            Branch::Receive => (account.receive_depth + 1, account.change_depth),
            Branch::Change => (account.receive_depth, account.change_depth + 1),
        };

        self.with_batch(|| {
            let rings = account.set_depth(receive, change)?;
            self.save_rings(&rings)?;
            self.db.save_account(
                self.wid,
                account.account_index,
                &account.name,
                account.to_raw(self.network)?,
            )?;
            Ok(())
        })?;

        self.refresh_account0(&account);

        let ring = match branch {
            Branch::Receive => account.receive_address,
            Branch::Change => account.change_address,
        };
        ring.ok_or(WalletError::NotInitialized)
    }

    /// Next receive address of an account.
    pub fn create_receive(&self, query: impl Into<AccountQuery>) -> WalletResult<KeyRing> {
        self.create_address(query, Branch::Receive)
    }

    /// Next change address of an account.
    pub fn create_change(&self, query: impl Into<AccountQuery>) -> WalletResult<KeyRing> {
        self.create_address(query, Branch::Change)
    }

    /// Look up the path of an address hash.
    pub fn get_path(&self, hash: &AddressHash) -> WalletResult<Option<Path>> {
        self.db.get_path(self.wid, hash)
    }

    /// Paths of the wallet-owned coins spent by a transaction, or by one of
    /// its inputs.
    pub fn get_input_paths(&self, source: InputRef<'_>) -> WalletResult<Vec<Path>> {
        let resolve = |mtx: &Mtx, index: usize| -> WalletResult<Option<Path>> {
            let input = mtx
                .tx
                .input
                .get(index)
                .ok_or_else(|| WalletError::Script("input index out of range".into()))?;
            let Some(coin) = mtx.coin(&input.previous_output) else {
                return Ok(None);
            };
            let Some(hash) = AddressHash::from_script_pubkey(&coin.script_pubkey) else {
                return Ok(None);
            };
            self.db.get_path(self.wid, &hash)
        };

        let mut paths = Vec::new();
        match source {
            InputRef::Transaction(mtx) => {
                for index in 0..mtx.tx.input.len() {
                    if let Some(path) = resolve(mtx, index)? {
                        paths.push(path);
                    }
                }
            }
            InputRef::Input(mtx, index) => {
                if let Some(path) = resolve(mtx, index)? {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// Raise account depths after confirmed outputs matched wallet paths:
    /// each affected branch advances to one past the highest matched index,
    /// plus one padding address. Emits an `Address` event listing the newly
    /// derived receive rings.
    pub fn sync_output_depth(&self, paths: &[Path]) -> WalletResult<Vec<KeyRing>> {
        let _guard = self.write_lock.lock();

        let mut targets: HashMap<u32, (Option<u32>, Option<u32>)> = HashMap::new();
        for path in paths {
            let entry = targets.entry(path.account).or_default();
            match path.branch {
                Branch::Receive => {
                    entry.0 = Some(entry.0.map_or(path.index, |i| i.max(path.index)));
                }
                Branch::Change => {
                    entry.1 = Some(entry.1.map_or(path.index, |i| i.max(path.index)));
                }
            }
        }

        let mut derived = Vec::new();
        let mut updated = Vec::new();

        self.with_batch(|| {
            for (index, (receive, change)) in &targets {
                let mut account = self.get_account(*index)?;
                let receive = receive.map_or(account.receive_depth, |i| i + 2);
                let change = change.map_or(account.change_depth, |i| i + 2);

                let rings = account.set_depth(receive, change)?;
                if rings.is_empty() {
                    continue;
                }
                self.save_rings(&rings)?;
                self.db.save_account(
                    self.wid,
                    account.account_index,
                    &account.name,
                    account.to_raw(self.network)?,
                )?;
                derived.extend(rings);
                updated.push(account);
            }
            Ok(())
        })?;

        for account in &updated {
            self.refresh_account0(account);
        }

        let receive_rings: Vec<KeyRing> = derived
            .iter()
            .filter(|r| r.path.branch == Branch::Receive)
            .cloned()
            .collect();
        if !receive_rings.is_empty() {
            self.events.emit(WalletEvent::Address {
                wallet_id: self.id.clone(),
                rings: receive_rings.clone(),
            });
        }
        Ok(receive_rings)
    }

    // ------------------------------------------------------------------
    // Coin reservation
    // ------------------------------------------------------------------

    /// Reserve an outpoint against selection.
    pub fn lock_coin(&self, outpoint: OutPoint) {
        self.locked_coins.lock().insert(outpoint);
    }

    /// Release a reserved outpoint.
    pub fn unlock_coin(&self, outpoint: &OutPoint) {
        self.locked_coins.lock().remove(outpoint);
    }

    /// Currently reserved outpoints.
    pub fn locked_coins(&self) -> Vec<OutPoint> {
        self.locked_coins.lock().iter().copied().collect()
    }

    // ------------------------------------------------------------------
    // Funding, signing, sending
    // ------------------------------------------------------------------

    /// Fund a transaction from one account's coins.
    ///
    /// Holds the fund lock unless `force` is set by a caller that already
    /// owns it.
    pub fn fund(&self, mtx: &mut Mtx, options: &FundTxOptions) -> WalletResult<()> {
        let _guard: Option<MutexGuard<'_, ()>> = if options.force {
            None
        } else {
            Some(self.fund_lock.lock())
        };
        self.fund_locked(mtx, options)
    }

    fn fund_locked(&self, mtx: &mut Mtx, options: &FundTxOptions) -> WalletResult<()> {
        if !self.state.read().initialized {
            return Err(WalletError::NotInitialized);
        }

        let account = match &options.account {
            Some(query) => self.get_account(query.clone())?,
            None => self.get_account(0u32)?,
        };
        if !account.initialized {
            return Err(WalletError::NotInitialized);
        }

        let height = self.db.height();
        let mut coins = self.db.get_coins(self.wid, account.account_index)?;
        if options.confirmed {
            coins.retain(|c| c.confirmations(height) > 0);
        }
        coins.retain(|c| c.spendable(height));
        {
            let locked = self.locked_coins.lock();
            coins.retain(|c| !locked.contains(&c.outpoint));
        }

        let rate = options
            .rate
            .or_else(|| self.db.fee_estimate())
            .unwrap_or_else(|| self.network.relay_rate());

        let change_script = account
            .change_address
            .as_ref()
            .ok_or(WalletError::NotInitialized)?
            .script_pubkey();

        mtx.fund(
            coins,
            &FundOptions {
                selection: options.selection,
                rate,
                round: options.round,
                free: options.free,
                hard_fee: options.hard_fee,
                subtract_fee: options.subtract_fee,
                change_script,
                height,
                m: account.m,
                n: account.n,
            },
        )?;

        // A reserved coin slipping into the selection means another spend
        // of it is in flight.
        {
            let locked = self.locked_coins.lock();
            for input in &mtx.tx.input {
                if locked.contains(&input.previous_output) {
                    return Err(WalletError::CoinLocked(input.previous_output));
                }
            }
        }
        Ok(())
    }

    /// Build, fund, order and template a transaction without signing it.
    pub fn create_tx(&self, options: CreateTxOptions) -> WalletResult<Mtx> {
        let mut mtx = Mtx::new();
        for (script, value) in &options.outputs {
            mtx.add_output(script.clone(), *value)?;
        }

        self.fund(&mut mtx, &options.fund)?;

        mtx.sort_members();
        mtx.check_sanity()?;
        mtx.check_inputs(self.db.height())?;
        self.script_inputs(&mut mtx)?;
        Ok(mtx)
    }

    /// Install signature-slot templates for every recognized input.
    /// Returns the number of inputs templated.
    pub fn script_inputs(&self, mtx: &mut Mtx) -> WalletResult<usize> {
        let rings = self.input_rings(mtx)?;
        let count = rings.len();
        for (index, ring) in rings {
            mtx.template_input(index, ring)?;
        }
        Ok(count)
    }

    /// Derive keyrings for every input whose coin belongs to this wallet.
    fn input_rings(&self, mtx: &Mtx) -> WalletResult<Vec<(usize, KeyRing)>> {
        let mut accounts: HashMap<u32, Account> = HashMap::new();
        let mut rings = Vec::new();

        for (index, input) in mtx.tx.input.iter().enumerate() {
            let Some(coin) = mtx.coin(&input.previous_output) else {
                continue;
            };
            let Some(hash) = AddressHash::from_script_pubkey(&coin.script_pubkey) else {
                continue;
            };
            let Some(path) = self.db.get_path(self.wid, &hash)? else {
                continue;
            };

            let account = match accounts.entry(path.account) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(self.get_account(path.account)?)
                }
            };
            rings.push((index, account.derive_ring(path.branch, path.index)?));
        }
        Ok(rings)
    }

    /// Sign every recognized input. Returns the count of inputs signed.
    ///
    /// Verifies each derived child key against its ring before signing, so
    /// corrupted key material fails fast instead of producing an invalid
    /// signature.
    pub fn sign(&self, mtx: &mut Mtx, options: &SignOptions) -> WalletResult<usize> {
        let rings = self.input_rings(mtx)?;
        let master_key = self.unlocked_key(options.passphrase.as_deref(), options.timeout)?;

        let mut entries = Vec::with_capacity(rings.len());
        for (index, ring) in rings {
            let path = [
                ChildNumber::Hardened { index: 44 },
                ChildNumber::Hardened {
                    index: self.network.coin_type(),
                },
                ChildNumber::Hardened {
                    index: ring.path.account,
                },
                ChildNumber::Normal {
                    index: ring.path.branch.bit(),
                },
                ChildNumber::Normal {
                    index: ring.path.index,
                },
            ];
            let child = master_key.derive_priv(SECP256K1, &path)?;
            let public = secp256k1::PublicKey::from_secret_key(SECP256K1, &child.private_key);
            if public != ring.public_key {
                return Err(WalletError::KeyMismatch(ring.path));
            }
            entries.push((index, ring, child.private_key));
        }

        let signed = match &self.workers {
            Some(pool) => {
                let outcome = pool.sign(SignJob {
                    mtx: mtx.clone(),
                    entries,
                    sighash_type: options.sighash_type,
                })?;
                *mtx = outcome.mtx;
                outcome.signed
            }
            None => {
                let signed = mtx.sign_rings(&entries, options.sighash_type)?;
                for (_, _, secret) in entries.iter_mut() {
                    secret.non_secure_erase();
                }
                signed
            }
        };

        debug!(wid = self.wid, signed, "Inputs signed");
        Ok(signed)
    }

    /// Create, sign and record a transaction, then emit `Send`.
    ///
    /// The whole sequence runs under the fund lock, so no two concurrent
    /// sends can select the same coin. A partially-signed result aborts
    /// before anything is recorded.
    pub fn send(&self, options: CreateTxOptions, sign: &SignOptions) -> WalletResult<Transaction> {
        let _guard = self.fund_lock.lock();

        let mut create = options;
        create.fund.force = true;
        let mut mtx = self.create_tx(create)?;

        let outpoints: Vec<OutPoint> =
            mtx.tx.input.iter().map(|i| i.previous_output).collect();
        for outpoint in &outpoints {
            self.lock_coin(*outpoint);
        }

        let result = (|| {
            let signed = self.sign(&mut mtx, sign)?;
            if !mtx.is_fully_signed() {
                return Err(WalletError::NotFullySigned {
                    signed,
                    inputs: mtx.tx.input.len(),
                });
            }
            let tx = mtx.to_tx();
            self.db.add_tx(self.wid, &tx)?;
            Ok(tx)
        })();

        for outpoint in &outpoints {
            self.unlock_coin(outpoint);
        }

        let tx = result?;
        info!(wid = self.wid, txid = %tx.compute_txid(), "Transaction sent");
        self.events.emit(WalletEvent::Send(tx.clone()));
        match self.balance() {
            Ok(balance) => self.events.emit(WalletEvent::Balance {
                wallet_id: self.id.clone(),
                balance,
            }),
            Err(err) => self.events.emit(WalletEvent::Error(err.to_string())),
        }
        Ok(tx)
    }

    /// Current balance across all accounts.
    pub fn balance(&self) -> WalletResult<BalanceSnapshot> {
        let height = self.db.height();
        let mut snapshot = BalanceSnapshot::default();
        for account in self.db.get_accounts(self.wid)? {
            for coin in self.db.get_coins(self.wid, account)? {
                if coin.confirmations(height) > 0 {
                    snapshot.confirmed += coin.value;
                } else {
                    snapshot.unconfirmed += coin.value;
                }
            }
        }
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn with_batch<T>(&self, f: impl FnOnce() -> WalletResult<T>) -> WalletResult<T> {
        self.db.start(self.wid);
        match f() {
            Ok(value) => {
                self.db.commit(self.wid)?;
                Ok(value)
            }
            Err(err) => {
                self.db.drop_batch(self.wid);
                Err(err)
            }
        }
    }

    /// Refuse a multisig key set whose first receive address is already
    /// owned by this wallet: two accounts may not share a script.
    fn check_shared_script(&self, account: &Account) -> WalletResult<()> {
        let ring = account.derive_ring(Branch::Receive, 0)?;
        if self.db.has_path(self.wid, &ring.address_hash())? {
            return Err(WalletError::SharedScript);
        }
        Ok(())
    }

    fn save_rings(&self, rings: &[KeyRing]) -> WalletResult<()> {
        let entries: Vec<(AddressHash, Path)> =
            rings.iter().map(|r| (r.address_hash(), r.path)).collect();
        self.db.save_paths(self.wid, &entries)
    }

    fn refresh_account0(&self, account: &Account) {
        if account.account_index == 0 {
            *self.account0.write() = Some(account.clone());
        }
    }

    fn serialize_state(&self, state: &WalletState) -> WalletResult<Vec<u8>> {
        let mut out = Vec::new();
        codec::write_u32(&mut out, self.network.magic())?;
        codec::write_u32(&mut out, self.wid)?;
        codec::write_varstring(&mut out, &self.id)?;
        codec::write_u8(&mut out, state.initialized as u8)?;
        codec::write_u32(&mut out, state.account_depth)?;
        out.extend_from_slice(&state.token);
        codec::write_u32(&mut out, state.token_depth)?;
        codec::write_varbytes(&mut out, &self.master.to_raw()?)?;
        Ok(out)
    }

    /// Serialize the persisted wallet record.
    pub fn to_raw(&self) -> WalletResult<Vec<u8>> {
        self.serialize_state(&self.state.read())
    }

    /// Rebuild a wallet from its persisted record.
    pub fn from_raw(db: Arc<dyn WalletDb>, data: &[u8]) -> WalletResult<Wallet> {
        let network = db.network();
        let mut r = data;

        let magic = codec::read_u32(&mut r)?;
        if Network::from_magic(magic) != Some(network) {
            return Err(WalletError::Record(format!(
                "wallet magic {:#010x} does not match network {}",
                magic, network
            )));
        }
        let wid = codec::read_u32(&mut r)?;
        let id = codec::read_varstring(&mut r, 128)?;
        let initialized = codec::read_u8(&mut r)? != 0;
        let account_depth = codec::read_u32(&mut r)?;
        let token = codec::read_bytes::<_, 32>(&mut r)?;
        let token_depth = codec::read_u32(&mut r)?;
        let master_raw = codec::read_varbytes(&mut r, 2048)?;
        let master = MasterKey::from_raw(&master_raw)?;

        Ok(Wallet {
            db,
            network,
            wid,
            id,
            master,
            state: RwLock::new(WalletState {
                initialized,
                account_depth,
                token_depth,
                token,
            }),
            account0: RwLock::new(None),
            events: EventBus::default(),
            workers: None,
            write_lock: Mutex::new(()),
            fund_lock: Mutex::new(()),
            locked_coins: Mutex::new(HashSet::new()),
        })
    }

    /// JSON view. The decrypted master never appears once encrypted.
    pub fn to_json(&self) -> WalletResult<WalletJson> {
        let state = self.state.read();
        Ok(WalletJson {
            network: self.network,
            wid: self.wid,
            id: self.id.clone(),
            initialized: state.initialized,
            account_depth: state.account_depth,
            token: hex::encode(state.token),
            token_depth: state.token_depth,
            master: self.master.to_json()?,
        })
    }

    /// Rebuild a wallet from its JSON view.
    pub fn from_json(db: Arc<dyn WalletDb>, json: &WalletJson) -> WalletResult<Wallet> {
        if json.network != db.network() {
            return Err(WalletError::Record(format!(
                "wallet network {} does not match database {}",
                json.network,
                db.network()
            )));
        }
        let token_bytes =
            hex::decode(&json.token).map_err(|_| WalletError::Record("bad token hex".into()))?;
        if token_bytes.len() != 32 {
            return Err(WalletError::Record("token must be 32 bytes".into()));
        }
        let mut token = [0u8; 32];
        token.copy_from_slice(&token_bytes);

        Ok(Wallet {
            db: Arc::clone(&db),
            network: json.network,
            wid: json.wid,
            id: json.id.clone(),
            master: MasterKey::from_json(&json.master)?,
            state: RwLock::new(WalletState {
                initialized: json.initialized,
                account_depth: json.account_depth,
                token_depth: json.token_depth,
                token,
            }),
            account0: RwLock::new(None),
            events: EventBus::default(),
            workers: None,
            write_lock: Mutex::new(()),
            fund_lock: Mutex::new(()),
            locked_coins: Mutex::new(HashSet::new()),
        })
    }
}

impl PartialEq for Wallet {
    fn eq(&self, other: &Self) -> bool {
        self.wid == other.wid
            && self.id == other.id
            && self.network == other.network
            && *self.state.read() == *other.state.read()
            && self.master == other.master
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Wallet")
            .field("wid", &self.wid)
            .field("id", &self.id)
            .field("network", &self.network)
            .field("initialized", &state.initialized)
            .field("account_depth", &state.account_depth)
            .field("token_depth", &state.token_depth)
            .finish()
    }
}

/// JSON shape of the wallet record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletJson {
    pub network: Network,
    pub wid: u32,
    pub id: String,
    pub initialized: bool,
    pub account_depth: u32,
    pub token: String,
    pub token_depth: u32,
    pub master: MasterJson,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::LOOKAHEAD;
    use crate::db::MemoryWalletDb;
    use bitcoin::NetworkKind;

    fn db() -> Arc<MemoryWalletDb> {
        Arc::new(MemoryWalletDb::new(Network::Mainnet))
    }

    fn master(seed: u8) -> Xpriv {
        Xpriv::new_master(NetworkKind::Main, &[seed; 32]).unwrap()
    }

    fn create(db: &Arc<MemoryWalletDb>, seed: u8) -> Wallet {
        Wallet::create(
            db.clone() as Arc<dyn WalletDb>,
            WalletOptions {
                master: Some(master(seed)),
                ..WalletOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_id_is_deterministic_with_wlt_prefix() {
        let a = Wallet::id_for(&master(1), Network::Mainnet).unwrap();
        let b = Wallet::id_for(&master(1), Network::Mainnet).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("WLT"));

        // Different key or network changes the id.
        assert_ne!(a, Wallet::id_for(&master(2), Network::Mainnet).unwrap());
        assert_ne!(a, Wallet::id_for(&master(1), Network::Testnet).unwrap());
    }

    #[test]
    fn test_init_creates_default_account() {
        let db = db();
        let wallet = create(&db, 1);

        assert!(wallet.initialized());
        assert_eq!(wallet.account_depth(), 1);

        let account = wallet.get_account("default").unwrap();
        assert_eq!(account.account_index, 0);
        assert_eq!(account.receive_depth, 1);
        assert_eq!(account.change_depth, 1);

        // Lookahead coverage on both branches.
        let paths = db.get_wallet_paths(wallet.wid()).unwrap();
        let receive = paths.iter().filter(|p| p.branch == Branch::Receive).count();
        let change = paths.iter().filter(|p| p.branch == Branch::Change).count();
        assert_eq!(receive as u32, 1 + LOOKAHEAD);
        assert_eq!(change as u32, 1 + LOOKAHEAD);
    }

    #[test]
    fn test_init_twice_fails() {
        let db = db();
        let wallet = create(&db, 1);
        assert!(matches!(
            wallet.init(WalletOptions::default()),
            Err(WalletError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_open_round_trip() {
        let db = db();
        let wallet = create(&db, 1);
        let reopened = Wallet::open(db.clone() as Arc<dyn WalletDb>, wallet.id()).unwrap();
        assert_eq!(wallet, reopened);
        assert_eq!(
            reopened.get_account(0u32).unwrap(),
            wallet.get_account(0u32).unwrap()
        );
    }

    #[test]
    fn test_token_changes_with_depth_only() {
        let db = db();
        let wallet = create(&db, 1);
        let token0 = wallet.token();
        let id = wallet.id().to_string();

        let token1 = wallet.retoken(None).unwrap();
        assert_eq!(wallet.token_depth(), 1);
        assert_ne!(token0, token1);
        assert_eq!(wallet.token(), token1);
        // Identity and accounts are untouched.
        assert_eq!(wallet.id(), id);
        assert_eq!(wallet.account_depth(), 1);

        // Token is a pure function of master key and nonce.
        let expected = Wallet::compute_token(&master(1), 1).unwrap();
        assert_eq!(token1, expected);
    }

    #[test]
    fn test_passphrase_rotation() {
        let db = db();
        let wallet = Wallet::create(
            db.clone() as Arc<dyn WalletDb>,
            WalletOptions {
                master: Some(master(1)),
                passphrase: Some("old".into()),
                ..WalletOptions::default()
            },
        )
        .unwrap();

        let id = wallet.id().to_string();
        let token = wallet.token();

        wallet.set_passphrase(Some("old"), "new").unwrap();
        assert!(matches!(
            wallet.unlock("old", None),
            Err(WalletError::BadPassphrase)
        ));
        wallet.unlock("new", None).unwrap();

        assert_eq!(wallet.id(), id);
        assert_eq!(wallet.token(), token);
    }

    #[test]
    fn test_create_account_increments_depth() {
        let db = db();
        let wallet = create(&db, 1);

        let account = wallet
            .create_account(CreateAccountOptions::default(), None)
            .unwrap();
        assert_eq!(account.account_index, 1);
        assert_eq!(account.name, "1");
        assert_eq!(wallet.account_depth(), 2);
        assert_eq!(wallet.accounts().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_create_account_requires_unlocked_master() {
        let db = db();
        let wallet = Wallet::create(
            db.clone() as Arc<dyn WalletDb>,
            WalletOptions {
                master: Some(master(1)),
                passphrase: Some("pw".into()),
                ..WalletOptions::default()
            },
        )
        .unwrap();

        assert!(matches!(
            wallet.create_account(CreateAccountOptions::default(), None),
            Err(WalletError::MasterLocked)
        ));
        wallet
            .create_account(CreateAccountOptions::default(), Some("pw"))
            .unwrap();
    }

    #[test]
    fn test_create_address_advances_depth() {
        let db = db();
        let wallet = create(&db, 1);

        let before = wallet.get_account(0u32).unwrap();
        let ring = wallet.create_receive(0u32).unwrap();
        let after = wallet.get_account(0u32).unwrap();

        assert_eq!(after.receive_depth, before.receive_depth + 1);
        assert_eq!(ring.path.index, after.receive_depth - 1);
        assert_eq!(after.change_depth, before.change_depth);

        // The new ring is indexed.
        assert!(wallet.get_path(&ring.address_hash()).unwrap().is_some());
    }

    #[test]
    fn test_sync_output_depth_raises_and_emits() {
        let db = db();
        let wallet = create(&db, 1);
        let mut events = wallet.subscribe();

        let paths = vec![Path::new(wallet.wid(), 0, Branch::Receive, 3)];
        let rings = wallet.sync_output_depth(&paths).unwrap();
        assert!(!rings.is_empty());

        let account = wallet.get_account(0u32).unwrap();
        assert_eq!(account.receive_depth, 5);
        assert_eq!(account.change_depth, 1);

        match events.try_recv().unwrap() {
            WalletEvent::Address { rings: emitted, .. } => {
                assert_eq!(emitted.len(), rings.len())
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Depths never regress.
        let rings = wallet
            .sync_output_depth(&[Path::new(wallet.wid(), 0, Branch::Receive, 1)])
            .unwrap();
        assert!(rings.is_empty());
        assert_eq!(wallet.get_account(0u32).unwrap().receive_depth, 5);
    }

    #[test]
    fn test_raw_round_trip() {
        let db = db();
        let wallet = create(&db, 7);
        let raw = wallet.to_raw().unwrap();
        let restored = Wallet::from_raw(db.clone() as Arc<dyn WalletDb>, &raw).unwrap();
        assert_eq!(wallet, restored);
    }

    #[test]
    fn test_json_round_trip() {
        let db = db();
        let wallet = create(&db, 7);
        let json = wallet.to_json().unwrap();
        let text = serde_json::to_string(&json).unwrap();
        let parsed: WalletJson = serde_json::from_str(&text).unwrap();
        let restored = Wallet::from_json(db.clone() as Arc<dyn WalletDb>, &parsed).unwrap();
        assert_eq!(wallet, restored);
    }

    #[test]
    fn test_failed_operation_changes_nothing() {
        let db = db();
        let wallet = create(&db, 1);
        let raw_before = wallet.to_raw().unwrap();
        let depth_before = wallet.account_depth();

        // Duplicate account name forces a failure before commit.
        let result = wallet.create_account(
            CreateAccountOptions {
                name: Some("default".into()),
                ..CreateAccountOptions::default()
            },
            None,
        );
        assert!(result.is_err());

        assert_eq!(wallet.account_depth(), depth_before);
        assert_eq!(wallet.to_raw().unwrap(), raw_before);
        assert_eq!(
            db.get_wallet(wallet.id()).unwrap().unwrap(),
            raw_before
        );

        // A failure inside the batch leaves no trace either: the default
        // account is complete, so add_key trips KeyLimit mid-batch.
        let key = {
            let other = master(9);
            let path = [
                ChildNumber::Hardened { index: 44 },
                ChildNumber::Hardened { index: 0 },
                ChildNumber::Hardened { index: 0 },
            ];
            Xpub::from_priv(SECP256K1, &other.derive_priv(SECP256K1, &path).unwrap())
        };
        assert!(matches!(
            wallet.add_key(0u32, key),
            Err(WalletError::KeyLimit)
        ));
        assert_eq!(db.get_wallet(wallet.id()).unwrap().unwrap(), raw_before);
        assert_eq!(wallet.get_account(0u32).unwrap().keys.len(), 1);
    }
}
