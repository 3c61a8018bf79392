//! Spendable coin view.

use bitcoin::{OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};

/// An unspent output the wallet can fund with.
///
/// This is the funding view of a UTXO as handed out by the transaction
/// index: enough to select, estimate and sign, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    /// Location of the output being spent.
    pub outpoint: OutPoint,
    /// Value in satoshis.
    pub value: u64,
    /// Locking script of the output.
    pub script_pubkey: ScriptBuf,
    /// Block height the containing transaction confirmed at.
    /// `None` while unconfirmed.
    pub height: Option<u32>,
    /// Whether the output is a coinbase output.
    pub coinbase: bool,
    /// Account the owning address belongs to.
    pub account: u32,
}

impl Coin {
    /// Confirmations at the given chain height. Unconfirmed coins have zero.
    pub fn confirmations(&self, chain_height: u32) -> u32 {
        match self.height {
            Some(h) if h <= chain_height => chain_height - h + 1,
            _ => 0,
        }
    }

    /// Whether the coin may be spent at the given chain height.
    /// Coinbase outputs must mature first.
    pub fn spendable(&self, chain_height: u32) -> bool {
        if self.coinbase {
            self.confirmations(chain_height) >= crate::network::COINBASE_MATURITY
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(height: Option<u32>, coinbase: bool) -> Coin {
        Coin {
            outpoint: OutPoint::null(),
            value: 50_000,
            script_pubkey: ScriptBuf::new(),
            height,
            coinbase,
            account: 0,
        }
    }

    #[test]
    fn test_confirmations() {
        assert_eq!(coin(Some(100), false).confirmations(100), 1);
        assert_eq!(coin(Some(100), false).confirmations(105), 6);
        assert_eq!(coin(None, false).confirmations(105), 0);
        // A coin "above" the chain tip counts as unconfirmed.
        assert_eq!(coin(Some(200), false).confirmations(105), 0);
    }

    #[test]
    fn test_coinbase_maturity() {
        let c = coin(Some(1), true);
        assert!(!c.spendable(50));
        assert!(c.spendable(100));
        assert!(coin(Some(1), false).spendable(1));
    }
}
