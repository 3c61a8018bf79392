//! Wallet error types.

use thiserror::Error;

/// Wallet errors.
#[derive(Error, Debug)]
pub enum WalletError {
    /// Operation requires an initialized wallet or account.
    #[error("Not initialized")]
    NotInitialized,

    /// `init` was invoked on an already-initialized wallet.
    #[error("Already initialized")]
    AlreadyInitialized,

    /// Account resolution by name or index failed.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// The key is already part of this wallet.
    #[error("Key already added")]
    KeyExists,

    /// The key is not part of the account.
    #[error("Key not found")]
    KeyAbsent,

    /// The key is unusable in the requested role.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The cosigner set is already full.
    #[error("Cannot modify keys: key set is complete")]
    KeyLimit,

    /// A multisig key set collides with an existing account of the wallet.
    #[error("Cannot add a shared key")]
    SharedScript,

    /// A cryptographic operation requires an unlocked master key.
    #[error("Master key is locked")]
    MasterLocked,

    /// Decryption produced invalid extended-key material.
    #[error("Could not decrypt master key: bad passphrase")]
    BadPassphrase,

    /// Master key state-machine violation.
    #[error("Master key error: {0}")]
    Master(String),

    /// Coin selection could not cover outputs plus fee.
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    /// A selected coin is reserved by another in-flight fund.
    #[error("Coin is locked: {0}")]
    CoinLocked(bitcoin::OutPoint),

    /// Post-sort transaction validation failed.
    #[error("Transaction check failed: {0}")]
    CheckTransaction(String),

    /// Input validation against the coin view failed.
    #[error("Input check failed: {0}")]
    CheckInputs(String),

    /// `send` produced a partially-signed transaction.
    #[error("Transaction is not fully signed ({signed}/{inputs} inputs)")]
    NotFullySigned { signed: usize, inputs: usize },

    /// A derived private key does not match the keyring's public key.
    #[error("Derived key does not match ring at {0}")]
    KeyMismatch(crate::path::Path),

    /// A persisted record could not be decoded.
    #[error("Malformed record: {0}")]
    Record(String),

    /// Script assembly error.
    #[error("Script error: {0}")]
    Script(String),

    /// BIP32 derivation error.
    #[error("Key derivation error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    /// Database error surfaced verbatim after dropping the in-flight batch.
    #[error("Database error: {0}")]
    Database(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wallet operations.
pub type WalletResult<T> = Result<T, WalletError>;
