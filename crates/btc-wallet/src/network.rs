//! Static network parameters.
//!
//! Consensus- and policy-level constants that differ per network. These do
//! not change at runtime; everything dynamic (chain height, fee estimates)
//! comes from the database the wallet is attached to.

use bitcoin::NetworkKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Satoshis in one coin.
pub const COIN: u64 = 100_000_000;

/// Maximum amount of money in satoshis (21 million coins).
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Blocks a coinbase output must age before it is spendable.
pub const COINBASE_MATURITY: u32 = 100;

/// Priority threshold for free transactions, as defined by the legacy
/// relay policy: one coin, one day old, in a 250-byte transaction.
pub const FREE_THRESHOLD: u64 = COIN * 144 / 250;

/// Output value below which change is folded into the fee.
pub const DUST_THRESHOLD: u64 = 546;

/// Maximum standard transaction size in bytes.
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Network the wallet operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Main network.
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression test network.
    Regtest,
}

impl Network {
    /// Protocol magic, used in persisted records and the wallet ID hash.
    pub fn magic(&self) -> u32 {
        match self {
            Network::Mainnet => 0xD9B4_BEF9,
            Network::Testnet => 0x0709_110B,
            Network::Regtest => 0xDAB5_BFFA,
        }
    }

    /// Resolve a network from its protocol magic.
    pub fn from_magic(magic: u32) -> Option<Network> {
        match magic {
            0xD9B4_BEF9 => Some(Network::Mainnet),
            0x0709_110B => Some(Network::Testnet),
            0xDAB5_BFFA => Some(Network::Regtest),
            _ => None,
        }
    }

    /// BIP44 coin type for the `m/44'/coin'` level.
    pub fn coin_type(&self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    /// Default relay rate in satoshis per kilobyte, used when no fee
    /// estimator is attached.
    pub fn relay_rate(&self) -> u64 {
        10_000
    }

    /// Network kind for extended-key version bytes.
    pub fn kind(&self) -> NetworkKind {
        match self {
            Network::Mainnet => NetworkKind::Main,
            Network::Testnet | Network::Regtest => NetworkKind::Test,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        write!(f, "{}", name)
    }
}
