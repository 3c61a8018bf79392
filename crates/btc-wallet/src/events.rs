//! Wallet event bus.
//!
//! The engine does not broadcast transactions or touch the network itself;
//! it publishes events for the surrounding node to act on.

use crate::keyring::KeyRing;
use bitcoin::Transaction;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Balance totals at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Satoshis in confirmed coins.
    pub confirmed: u64,
    /// Satoshis in unconfirmed coins.
    pub unconfirmed: u64,
}

impl BalanceSnapshot {
    pub fn total(&self) -> u64 {
        self.confirmed + self.unconfirmed
    }
}

/// Events published by a wallet.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// A fully-signed transaction is ready for relay.
    Send(Transaction),
    /// New addresses were derived.
    Address {
        wallet_id: String,
        rings: Vec<KeyRing>,
    },
    /// Balance changed.
    Balance {
        wallet_id: String,
        balance: BalanceSnapshot,
    },
    /// A background operation failed.
    Error(String),
}

/// Broadcast bus wallets publish on. Slow or absent subscribers never block
/// the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn emit(&self, event: WalletEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(WalletEvent::Error("nobody listening".into()));
    }

    #[test]
    fn test_subscriber_receives() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(WalletEvent::Balance {
            wallet_id: "w".into(),
            balance: BalanceSnapshot {
                confirmed: 10,
                unconfirmed: 0,
            },
        });
        match rx.try_recv().unwrap() {
            WalletEvent::Balance { balance, .. } => assert_eq!(balance.total(), 10),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
