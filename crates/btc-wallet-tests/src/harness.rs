//! Test harness for integration tests.
//!
//! Provides a shared context wrapping the memory store plus helpers for
//! creating and funding wallets.

use crate::generators;
use btc_wallet::{
    Branch, Coin, FeeEstimator, MemoryWalletDb, Network, Wallet, WalletDb, WalletOptions,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Fixed fee estimator for deterministic funding tests.
pub struct FixedFees(pub u64);

impl FeeEstimator for FixedFees {
    fn estimate_fee(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// Test context containing shared resources for integration tests.
pub struct TestContext {
    /// The memory-backed wallet store.
    pub db: Arc<MemoryWalletDb>,
    next_txid: AtomicU8,
}

impl TestContext {
    /// Create a new test context on mainnet at height 100.
    pub fn new() -> Self {
        let db = Arc::new(MemoryWalletDb::new(Network::Mainnet));
        db.set_height(100);
        Self {
            db,
            next_txid: AtomicU8::new(1),
        }
    }

    /// Create a wallet from a deterministic seed.
    pub fn create_wallet(&self, seed: u8) -> Wallet {
        Wallet::create(
            self.db.clone() as Arc<dyn WalletDb>,
            WalletOptions {
                master: Some(generators::master_key(seed)),
                ..WalletOptions::default()
            },
        )
        .expect("wallet creation")
    }

    /// Create a wallet with custom options and a deterministic seed.
    pub fn create_wallet_with(&self, seed: u8, mut options: WalletOptions) -> Wallet {
        options.master = Some(generators::master_key(seed));
        Wallet::create(self.db.clone() as Arc<dyn WalletDb>, options).expect("wallet creation")
    }

    /// Credit coins to the wallet's first receive address, confirmed at the
    /// given height. Returns the coins as seen by the store.
    pub fn fund_wallet(&self, wallet: &Wallet, values: &[u64], height: u32) -> Vec<Coin> {
        let account = wallet.get_account(0u32).expect("default account");
        let ring = account
            .derive_ring(Branch::Receive, 0)
            .expect("receive ring");
        let script = ring.script_pubkey();

        let mut coins = Vec::with_capacity(values.len());
        for (vout, value) in values.iter().enumerate() {
            let tx_byte = self.next_txid.fetch_add(1, Ordering::SeqCst);
            let coin =
                generators::coin_at(tx_byte, vout as u32, *value, script.clone(), Some(height));
            self.db.credit(wallet.wid(), coin.clone());
            coins.push(coin);
        }
        coins
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
