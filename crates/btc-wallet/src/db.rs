//! Wallet database contract and the memory-backed reference store.
//!
//! The engine only ever talks to a [`WalletDb`]: a per-wallet record store
//! with batched writes. Mutations are staged into a batch opened by
//! [`WalletDb::start`] and become visible atomically on
//! [`WalletDb::commit`]; [`WalletDb::drop_batch`] abandons them. Reads
//! observe staged writes of the same wallet's open batch.
//!
//! [`MemoryWalletDb`] is the in-process implementation backing the test
//! suite. Production deployments plug a persistent store in behind the same
//! trait; the page layout underneath is not the engine's concern.

use crate::coins::Coin;
use crate::network::Network;
use crate::path::{AddressHash, Path};
use crate::{WalletError, WalletResult};
use bitcoin::Transaction;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// External fee estimator consulted when funding without an explicit rate.
pub trait FeeEstimator: Send + Sync {
    /// Estimated fee rate in satoshis per kilobyte, if one is available.
    fn estimate_fee(&self) -> Option<u64>;
}

/// Record store the wallet engine runs against.
pub trait WalletDb: Send + Sync {
    /// Network all wallets in this store operate on.
    fn network(&self) -> Network;
    /// Current chain height.
    fn height(&self) -> u32;
    /// Fee rate from the attached estimator, satoshis per kilobyte.
    fn fee_estimate(&self) -> Option<u64>;

    /// Register a wallet id, assigning its numeric `wid`.
    fn register(&self, id: &str) -> WalletResult<u32>;
    /// Remove a wallet and everything keyed under it.
    fn unregister(&self, wid: u32) -> WalletResult<()>;
    /// Fetch a persisted wallet record by id.
    fn get_wallet(&self, id: &str) -> WalletResult<Option<Vec<u8>>>;

    /// Open a write batch for the wallet.
    fn start(&self, wid: u32);
    /// Atomically apply the wallet's staged batch.
    fn commit(&self, wid: u32) -> WalletResult<()>;
    /// Abandon the wallet's staged batch.
    fn drop_batch(&self, wid: u32);

    /// Stage the wallet record.
    fn save_wallet(&self, wid: u32, record: Vec<u8>) -> WalletResult<()>;
    /// Stage an account record.
    fn save_account(&self, wid: u32, index: u32, name: &str, record: Vec<u8>)
        -> WalletResult<()>;
    /// Stage reverse-index entries for derived addresses.
    fn save_paths(&self, wid: u32, entries: &[(AddressHash, Path)]) -> WalletResult<()>;

    /// Fetch an account record.
    fn get_account_raw(&self, wid: u32, index: u32) -> WalletResult<Option<Vec<u8>>>;
    /// Resolve an account name to its index.
    fn get_account_index(&self, wid: u32, name: &str) -> WalletResult<Option<u32>>;
    /// Whether the account exists.
    fn has_account(&self, wid: u32, index: u32) -> WalletResult<bool>;
    /// All account indices of a wallet.
    fn get_accounts(&self, wid: u32) -> WalletResult<Vec<u32>>;

    /// Look up the path of an address hash within one wallet.
    fn get_path(&self, wid: u32, hash: &AddressHash) -> WalletResult<Option<Path>>;
    /// All paths of a wallet.
    fn get_wallet_paths(&self, wid: u32) -> WalletResult<Vec<Path>>;
    /// Paths of an address hash across all wallets.
    fn get_address_paths(&self, hash: &AddressHash) -> WalletResult<Vec<Path>>;
    /// Whether the wallet owns the address hash.
    fn has_path(&self, wid: u32, hash: &AddressHash) -> WalletResult<bool>;

    /// Unspent coins of one account.
    fn get_coins(&self, wid: u32, account: u32) -> WalletResult<Vec<Coin>>;
    /// Record a transaction: spend its inputs, credit recognized outputs.
    fn add_tx(&self, wid: u32, tx: &Transaction) -> WalletResult<()>;
}

enum Op {
    SaveWallet(Vec<u8>),
    SaveAccount {
        index: u32,
        name: String,
        record: Vec<u8>,
    },
    SavePath(AddressHash, Path),
}

#[derive(Default)]
struct Batch {
    ops: Vec<Op>,
}

#[derive(Default)]
struct Store {
    next_wid: u32,
    wallets: HashMap<u32, Vec<u8>>,
    wallet_ids: HashMap<String, u32>,
    accounts: HashMap<(u32, u32), Vec<u8>>,
    account_names: HashMap<(u32, String), u32>,
    paths: HashMap<(u32, AddressHash), Path>,
    coins: HashMap<u32, Vec<Coin>>,
}

/// In-process [`WalletDb`] with the same batch semantics a persistent store
/// provides: staged operations apply atomically on commit.
pub struct MemoryWalletDb {
    network: Network,
    height: AtomicU32,
    fees: RwLock<Option<Arc<dyn FeeEstimator>>>,
    store: RwLock<Store>,
    batches: Mutex<HashMap<u32, Batch>>,
}

impl MemoryWalletDb {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            height: AtomicU32::new(0),
            fees: RwLock::new(None),
            store: RwLock::new(Store {
                next_wid: 1,
                ..Store::default()
            }),
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Advance the chain height seen by the engine.
    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }

    /// Attach a fee estimator.
    pub fn set_fees(&self, fees: Arc<dyn FeeEstimator>) {
        *self.fees.write() = Some(fees);
    }

    /// Credit a coin to a wallet, outside any batch. Test fixture entry
    /// point standing in for the transaction index.
    pub fn credit(&self, wid: u32, coin: Coin) {
        self.store.write().coins.entry(wid).or_default().push(coin);
    }

    fn with_batch_op(&self, wid: u32, op: Op) -> WalletResult<()> {
        let mut batches = self.batches.lock();
        let batch = batches
            .get_mut(&wid)
            .ok_or_else(|| WalletError::Database(format!("no batch open for wallet {}", wid)))?;
        batch.ops.push(op);
        Ok(())
    }
}

impl WalletDb for MemoryWalletDb {
    fn network(&self) -> Network {
        self.network
    }

    fn height(&self) -> u32 {
        self.height.load(Ordering::SeqCst)
    }

    fn fee_estimate(&self) -> Option<u64> {
        self.fees.read().as_ref().and_then(|f| f.estimate_fee())
    }

    fn register(&self, id: &str) -> WalletResult<u32> {
        let mut store = self.store.write();
        if store.wallet_ids.contains_key(id) {
            return Err(WalletError::Database(format!(
                "wallet {} already registered",
                id
            )));
        }
        let wid = store.next_wid;
        store.next_wid += 1;
        store.wallet_ids.insert(id.to_string(), wid);
        debug!(wid, id, "Wallet registered");
        Ok(wid)
    }

    fn unregister(&self, wid: u32) -> WalletResult<()> {
        let mut store = self.store.write();
        store.wallets.remove(&wid);
        store.wallet_ids.retain(|_, w| *w != wid);
        store.accounts.retain(|(w, _), _| *w != wid);
        store.account_names.retain(|(w, _), _| *w != wid);
        store.paths.retain(|(w, _), _| *w != wid);
        store.coins.remove(&wid);
        self.batches.lock().remove(&wid);
        debug!(wid, "Wallet unregistered");
        Ok(())
    }

    fn get_wallet(&self, id: &str) -> WalletResult<Option<Vec<u8>>> {
        let store = self.store.read();
        Ok(store
            .wallet_ids
            .get(id)
            .and_then(|wid| store.wallets.get(wid))
            .cloned())
    }

    fn start(&self, wid: u32) {
        self.batches.lock().insert(wid, Batch::default());
    }

    fn commit(&self, wid: u32) -> WalletResult<()> {
        let batch = self
            .batches
            .lock()
            .remove(&wid)
            .ok_or_else(|| WalletError::Database(format!("no batch open for wallet {}", wid)))?;

        let mut store = self.store.write();
        for op in batch.ops {
            match op {
                Op::SaveWallet(record) => {
                    store.wallets.insert(wid, record);
                }
                Op::SaveAccount {
                    index,
                    name,
                    record,
                } => {
                    store.accounts.insert((wid, index), record);
                    store.account_names.insert((wid, name), index);
                }
                Op::SavePath(hash, path) => {
                    store.paths.insert((wid, hash), path);
                }
            }
        }
        debug!(wid, "Batch committed");
        Ok(())
    }

    fn drop_batch(&self, wid: u32) {
        if self.batches.lock().remove(&wid).is_some() {
            debug!(wid, "Batch dropped");
        }
    }

    fn save_wallet(&self, wid: u32, record: Vec<u8>) -> WalletResult<()> {
        self.with_batch_op(wid, Op::SaveWallet(record))
    }

    fn save_account(
        &self,
        wid: u32,
        index: u32,
        name: &str,
        record: Vec<u8>,
    ) -> WalletResult<()> {
        self.with_batch_op(
            wid,
            Op::SaveAccount {
                index,
                name: name.to_string(),
                record,
            },
        )
    }

    fn save_paths(&self, wid: u32, entries: &[(AddressHash, Path)]) -> WalletResult<()> {
        for (hash, path) in entries {
            self.with_batch_op(wid, Op::SavePath(*hash, *path))?;
        }
        Ok(())
    }

    fn get_account_raw(&self, wid: u32, index: u32) -> WalletResult<Option<Vec<u8>>> {
        // Staged writes shadow committed state.
        if let Some(batch) = self.batches.lock().get(&wid) {
            for op in batch.ops.iter().rev() {
                if let Op::SaveAccount {
                    index: i, record, ..
                } = op
                {
                    if *i == index {
                        return Ok(Some(record.clone()));
                    }
                }
            }
        }
        Ok(self.store.read().accounts.get(&(wid, index)).cloned())
    }

    fn get_account_index(&self, wid: u32, name: &str) -> WalletResult<Option<u32>> {
        if let Some(batch) = self.batches.lock().get(&wid) {
            for op in batch.ops.iter().rev() {
                if let Op::SaveAccount { index, name: n, .. } = op {
                    if n == name {
                        return Ok(Some(*index));
                    }
                }
            }
        }
        Ok(self
            .store
            .read()
            .account_names
            .get(&(wid, name.to_string()))
            .copied())
    }

    fn has_account(&self, wid: u32, index: u32) -> WalletResult<bool> {
        Ok(self.get_account_raw(wid, index)?.is_some())
    }

    fn get_accounts(&self, wid: u32) -> WalletResult<Vec<u32>> {
        // Lock order matches get_account_raw: batch registry, then store.
        let mut indices: Vec<u32> = Vec::new();
        if let Some(batch) = self.batches.lock().get(&wid) {
            for op in &batch.ops {
                if let Op::SaveAccount { index, .. } = op {
                    indices.push(*index);
                }
            }
        }
        indices.extend(
            self.store
                .read()
                .accounts
                .keys()
                .filter(|(w, _)| *w == wid)
                .map(|(_, i)| *i),
        );
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    fn get_path(&self, wid: u32, hash: &AddressHash) -> WalletResult<Option<Path>> {
        if let Some(batch) = self.batches.lock().get(&wid) {
            for op in batch.ops.iter().rev() {
                if let Op::SavePath(h, path) = op {
                    if h == hash {
                        return Ok(Some(*path));
                    }
                }
            }
        }
        Ok(self.store.read().paths.get(&(wid, *hash)).copied())
    }

    fn get_wallet_paths(&self, wid: u32) -> WalletResult<Vec<Path>> {
        Ok(self
            .store
            .read()
            .paths
            .iter()
            .filter(|((w, _), _)| *w == wid)
            .map(|(_, p)| *p)
            .collect())
    }

    fn get_address_paths(&self, hash: &AddressHash) -> WalletResult<Vec<Path>> {
        Ok(self
            .store
            .read()
            .paths
            .iter()
            .filter(|((_, h), _)| h == hash)
            .map(|(_, p)| *p)
            .collect())
    }

    fn has_path(&self, wid: u32, hash: &AddressHash) -> WalletResult<bool> {
        Ok(self.get_path(wid, hash)?.is_some())
    }

    fn get_coins(&self, wid: u32, account: u32) -> WalletResult<Vec<Coin>> {
        Ok(self
            .store
            .read()
            .coins
            .get(&wid)
            .map(|coins| {
                coins
                    .iter()
                    .filter(|c| c.account == account)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn add_tx(&self, wid: u32, tx: &Transaction) -> WalletResult<()> {
        let txid = tx.compute_txid();
        let mut store = self.store.write();

        // Spend consumed coins.
        if let Some(coins) = store.coins.get_mut(&wid) {
            coins.retain(|c| !tx.input.iter().any(|i| i.previous_output == c.outpoint));
        }

        // Credit outputs paying back to this wallet.
        let mut credits = Vec::new();
        for (vout, output) in tx.output.iter().enumerate() {
            if let Some(hash) = AddressHash::from_script_pubkey(&output.script_pubkey) {
                if let Some(path) = store.paths.get(&(wid, hash)) {
                    credits.push(Coin {
                        outpoint: bitcoin::OutPoint::new(txid, vout as u32),
                        value: output.value.to_sat(),
                        script_pubkey: output.script_pubkey.clone(),
                        height: None,
                        coinbase: false,
                        account: path.account,
                    });
                }
            }
        }
        store.coins.entry(wid).or_default().extend(credits);

        debug!(wid, %txid, "Transaction recorded");
        Ok(())
    }
}
