//! Deterministic fixtures for wallet tests.

use btc_wallet::bitcoin::bip32::ChildNumber;
use btc_wallet::bitcoin::hashes::{hash160, Hash};
use btc_wallet::bitcoin::secp256k1::SECP256K1;
use btc_wallet::bitcoin::{OutPoint, PubkeyHash, ScriptBuf, Txid};
use btc_wallet::{Coin, Network, Xpriv, Xpub};

/// Deterministic master key from a one-byte seed.
pub fn master_key(seed: u8) -> Xpriv {
    Xpriv::new_master(Network::Mainnet.kind(), &[seed; 32]).expect("static seed")
}

/// Account-level public key `m/44'/coin'/{index}'` for a seeded master.
pub fn account_xpub(seed: u8, network: Network, index: u32) -> Xpub {
    let path = [
        ChildNumber::Hardened { index: 44 },
        ChildNumber::Hardened {
            index: network.coin_type(),
        },
        ChildNumber::Hardened { index },
    ];
    let child = master_key(seed)
        .derive_priv(SECP256K1, &path)
        .expect("static path");
    Xpub::from_priv(SECP256K1, &child)
}

/// A P2PKH destination script that does not belong to any test wallet.
pub fn destination(byte: u8) -> ScriptBuf {
    let h = hash160::Hash::from_byte_array([byte; 20]);
    ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(h))
}

/// A coin paying `value` satoshis to `script`, confirmed at `height`.
pub fn coin_at(
    tx_byte: u8,
    vout: u32,
    value: u64,
    script: ScriptBuf,
    height: Option<u32>,
) -> Coin {
    Coin {
        outpoint: OutPoint::new(Txid::from_byte_array([tx_byte; 32]), vout),
        value,
        script_pubkey: script,
        height,
        coinbase: false,
        account: 0,
    }
}
