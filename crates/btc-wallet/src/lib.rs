//! # btc-wallet
//!
//! BIP32/BIP44 hierarchical-deterministic wallet engine for Bitcoin-like
//! networks.
//!
//! This crate provides:
//! - Wallet lifecycle with deterministic ids and rotating API tokens
//! - BIP44 accounts with multisig key sets and lookahead address derivation
//! - Encrypted master-key custody with a timed auto-wipe
//! - Transaction funding (coin selection, fee math, change), BIP69 ordering,
//!   input templating and ECDSA signing
//! - A batched [`WalletDb`] contract with an in-memory reference store
//!
//! ## Example
//!
//! ```ignore
//! use btc_wallet::{MemoryWalletDb, Network, Wallet, WalletOptions};
//! use std::sync::Arc;
//!
//! let db = Arc::new(MemoryWalletDb::new(Network::Mainnet));
//! let wallet = Wallet::create(db, WalletOptions::default())?;
//!
//! let ring = wallet.create_receive(0u32)?;
//! println!("next address hash: {}", ring.address_hash());
//! ```

mod account;
mod codec;
mod coins;
mod db;
mod error;
mod events;
mod keyring;
mod master;
mod mtx;
mod network;
mod path;
mod wallet;
mod workers;

pub use account::{Account, AccountJson, AccountOptions, LOOKAHEAD};
pub use coins::Coin;
pub use db::{FeeEstimator, MemoryWalletDb, WalletDb};
pub use error::{WalletError, WalletResult};
pub use events::{BalanceSnapshot, EventBus, WalletEvent};
pub use keyring::{AccountType, KeyRing};
pub use master::{EncryptedMaster, MasterJson, MasterKey, DEFAULT_UNLOCK_TIMEOUT};
pub use mtx::{FundOptions, InputTemplate, Mtx, Selection};
pub use network::{
    Network, COIN, COINBASE_MATURITY, DUST_THRESHOLD, FREE_THRESHOLD, MAX_MONEY, MAX_TX_SIZE,
};
pub use path::{AddressHash, Branch, Path};
pub use wallet::{
    AccountQuery, CreateAccountOptions, CreateTxOptions, FundTxOptions, InputRef, SignOptions,
    Wallet, WalletJson, WalletOptions,
};
pub use workers::{SignJob, SignOutcome, WorkerPool};

// Re-export the chain primitives callers need to drive the API.
pub use bitcoin;
pub use bitcoin::bip32::{Xpriv, Xpub};
