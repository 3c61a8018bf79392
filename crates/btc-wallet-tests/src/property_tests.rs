//! Property-based tests for the engine's invariants.
//!
//! These verify the determinism, monotonicity and round-trip guarantees of
//! the wallet over randomly generated inputs.

use crate::generators::destination;
use crate::harness::TestContext;
use btc_wallet::bitcoin::hashes::Hash;
use btc_wallet::{
    Branch, MasterKey, Mtx, Network, Wallet, WalletDb, WalletOptions, Xpriv, LOOKAHEAD,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn master_from(seed: [u8; 32]) -> Xpriv {
    Xpriv::new_master(Network::Mainnet.kind(), &seed).expect("seed length is valid")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Same master and network always yield the same base58 id, and the
    /// record prefix always renders as WLT.
    #[test]
    fn prop_wallet_id_deterministic(seed in any::<[u8; 32]>()) {
        let master = master_from(seed);
        let a = Wallet::id_for(&master, Network::Mainnet).unwrap();
        let b = Wallet::id_for(&master, Network::Mainnet).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert!(a.starts_with("WLT"));

        let testnet = Wallet::id_for(&master, Network::Testnet).unwrap();
        prop_assert_ne!(a, testnet);
    }

    /// Depths only grow, and the reverse index always covers
    /// `[0, depth + lookahead)` on both branches.
    #[test]
    fn prop_depth_monotonic_with_lookahead(ops in prop::collection::vec(any::<bool>(), 0..10)) {
        let ctx = TestContext::new();
        let wallet = ctx.create_wallet(1);

        let mut receive = 1u32;
        let mut change = 1u32;
        for use_receive in ops {
            if use_receive {
                wallet.create_receive(0u32).unwrap();
                receive += 1;
            } else {
                wallet.create_change(0u32).unwrap();
                change += 1;
            }
            let account = wallet.get_account(0u32).unwrap();
            prop_assert_eq!(account.receive_depth, receive);
            prop_assert_eq!(account.change_depth, change);
        }

        let paths = ctx.db.get_wallet_paths(wallet.wid()).unwrap();
        let receive_set: HashSet<u32> = paths
            .iter()
            .filter(|p| p.branch == Branch::Receive)
            .map(|p| p.index)
            .collect();
        let change_set: HashSet<u32> = paths
            .iter()
            .filter(|p| p.branch == Branch::Change)
            .map(|p| p.index)
            .collect();
        for index in 0..receive + LOOKAHEAD {
            prop_assert!(receive_set.contains(&index));
        }
        for index in 0..change + LOOKAHEAD {
            prop_assert!(change_set.contains(&index));
        }
    }

    /// No two accounts of one wallet expose the same receive-0 hash.
    #[test]
    fn prop_accounts_never_share_scripts(count in 1u32..5) {
        let ctx = TestContext::new();
        let wallet = ctx.create_wallet(1);
        for _ in 0..count {
            wallet
                .create_account(Default::default(), None)
                .unwrap();
        }

        let mut hashes = HashSet::new();
        for index in wallet.accounts().unwrap() {
            let account = wallet.get_account(index).unwrap();
            let ring = account.derive_ring(Branch::Receive, 0).unwrap();
            prop_assert!(hashes.insert(ring.address_hash()));
        }
    }

    /// Wallet records survive the raw round trip.
    #[test]
    fn prop_wallet_record_round_trip(seed in any::<[u8; 32]>()) {
        let ctx = TestContext::new();
        let wallet = Wallet::create(
            ctx.db.clone() as Arc<dyn WalletDb>,
            WalletOptions {
                master: Some(master_from(seed)),
                ..WalletOptions::default()
            },
        )
        .unwrap();

        let raw = wallet.to_raw().unwrap();
        let restored = Wallet::from_raw(ctx.db.clone() as Arc<dyn WalletDb>, &raw).unwrap();
        prop_assert!(wallet == restored);
        prop_assert_eq!(restored.to_raw().unwrap(), raw);
    }

    /// BIP69 ordering is a total order on the final members.
    #[test]
    fn prop_bip69_sort_is_canonical(
        outputs in prop::collection::vec((1_000u64..1_000_000, any::<u8>()), 1..6),
    ) {
        let mut mtx = Mtx::new();
        for (value, byte) in &outputs {
            mtx.add_output(destination(*byte), *value).unwrap();
        }
        mtx.sort_members();

        let members: Vec<_> = mtx
            .tx
            .output
            .iter()
            .map(|o| (o.value.to_sat(), o.script_pubkey.to_bytes()))
            .collect();
        let mut sorted = members.clone();
        sorted.sort();
        prop_assert_eq!(members, sorted);
    }
}

proptest! {
    // Encryption runs the full 50k-round KDF; keep the case count low.
    #![proptest_config(ProptestConfig::with_cases(4))]

    /// Master custody round-trips through the byte-exact record and only
    /// the right passphrase unlocks it.
    #[test]
    fn prop_master_record_round_trip(
        seed in any::<[u8; 32]>(),
        passphrase in "[a-z0-9]{4,16}",
    ) {
        let master = MasterKey::from_key(master_from(seed));
        master.encrypt(&passphrase).unwrap();

        let raw = master.to_raw().unwrap();
        let restored = MasterKey::from_raw(&raw).unwrap();
        prop_assert!(master == restored);

        prop_assert!(restored.unlock("not-the-passphrase", None).is_err());
        let key = restored.unlock(&passphrase, None).unwrap();
        prop_assert_eq!(key, master_from(seed));
    }

    /// The token is a pure function of the master key and nonce.
    #[test]
    fn prop_token_rotation_changes_token(seed in any::<[u8; 32]>()) {
        let ctx = TestContext::new();
        let wallet = Wallet::create(
            ctx.db.clone() as Arc<dyn WalletDb>,
            WalletOptions {
                master: Some(master_from(seed)),
                ..WalletOptions::default()
            },
        )
        .unwrap();

        let mut seen = HashSet::new();
        seen.insert(wallet.token());
        for depth in 1..=4u32 {
            let token = wallet.retoken(None).unwrap();
            prop_assert_eq!(wallet.token_depth(), depth);
            prop_assert!(seen.insert(token));
        }
    }
}

#[test]
fn test_txid_byte_order_matches_display() {
    // The BIP69 input key is the little-endian txid bytes, which is the
    // reverse of the hex people read.
    let txid = btc_wallet::bitcoin::Txid::from_byte_array([0xab; 32]);
    assert_eq!(txid.to_byte_array(), [0xab; 32]);
}
