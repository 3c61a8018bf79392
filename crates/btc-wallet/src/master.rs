//! Master key custody.
//!
//! The [`MasterKey`] holds the root extended private key in one of three
//! states: **clear** (plaintext key, never encrypted), **encrypted**
//! (ciphertext only), or **unlocked** (ciphertext plus a decrypted copy with
//! a wipe deadline). All transitions serialize through one internal mutex.
//!
//! ## Security
//!
//! - Ciphertext is AES-256-CTR with a random 16-byte IV
//! - The cipher key is derived with PBKDF2-HMAC-SHA256 (50 000 rounds)
//! - Decrypted material is zeroized on lock, destroy and wipe-timer expiry
//! - The wipe timer is best-effort only; expiry is also enforced on access

use crate::codec;
use crate::{WalletError, WalletResult};
use aes::cipher::{KeyIvInit, StreamCipher};
use bitcoin::bip32::Xpriv;
use bitcoin::hashes::{sha256d, Hash};
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroize;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// PBKDF2 rounds for the passphrase-derived cipher key.
const KDF_ITERATIONS: u32 = 50_000;

/// Cipher algorithm slot persisted in the master record. Only PBKDF2 +
/// AES-256-CTR (0) is defined; the remaining slots are reserved.
const ALG_PBKDF2_AES_CTR: u8 = 0;

/// Default auto-wipe deadline after `unlock`.
pub const DEFAULT_UNLOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Encrypted master key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMaster {
    /// AES-CTR initialization vector, also the KDF salt.
    pub iv: [u8; 16],
    /// Encrypted extended private key.
    pub ciphertext: Vec<u8>,
    /// Algorithm slot.
    pub alg: u8,
    /// KDF iteration count.
    pub iterations: u32,
    /// Reserved memory parameter.
    pub r: u32,
    /// Reserved parallelism parameter.
    pub p: u32,
}

struct MasterState {
    /// Decrypted key, present in the clear and unlocked states.
    key: Option<Xpriv>,
    /// Ciphertext, present once the master has been encrypted.
    encrypted: Option<EncryptedMaster>,
    /// Wipe deadline while unlocked. `None` disables auto-wipe.
    until: Option<Instant>,
    /// Bumped on every lock/unlock so stale timer threads become no-ops.
    generation: u64,
}

impl MasterState {
    fn wipe_key(&mut self) {
        if let Some(key) = self.key.take() {
            let mut bytes = key.private_key.secret_bytes();
            bytes.zeroize();
        }
        self.until = None;
    }

    fn expire(&mut self) {
        if let Some(until) = self.until {
            if Instant::now() >= until && self.encrypted.is_some() {
                self.wipe_key();
                debug!("Master key wipe deadline reached");
            }
        }
    }
}

/// Time-bounded custody of the root extended private key.
pub struct MasterKey {
    inner: Arc<Mutex<MasterState>>,
}

impl MasterKey {
    /// Take custody of a plaintext key. State: **clear**.
    pub fn from_key(key: Xpriv) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MasterState {
                key: Some(key),
                encrypted: None,
                until: None,
                generation: 0,
            })),
        }
    }

    fn from_encrypted(encrypted: EncryptedMaster) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MasterState {
                key: None,
                encrypted: Some(encrypted),
                until: None,
                generation: 0,
            })),
        }
    }

    /// Whether ciphertext exists (the key survives a lock).
    pub fn is_encrypted(&self) -> bool {
        self.inner.lock().encrypted.is_some()
    }

    /// Whether the decrypted key is currently absent.
    pub fn is_locked(&self) -> bool {
        let mut state = self.inner.lock();
        state.expire();
        state.key.is_none()
    }

    /// Access the decrypted key, honoring the wipe deadline.
    pub fn key(&self) -> WalletResult<Xpriv> {
        let mut state = self.inner.lock();
        state.expire();
        state.key.ok_or(WalletError::MasterLocked)
    }

    /// Encrypt the plaintext key under a passphrase. Precondition: **clear**.
    pub fn encrypt(&self, passphrase: &str) -> WalletResult<()> {
        let mut state = self.inner.lock();
        if state.encrypted.is_some() {
            return Err(WalletError::Master("already encrypted".into()));
        }
        let key = state.key.ok_or(WalletError::MasterLocked)?;

        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut plaintext = xpriv_to_extended(&key);
        apply_cipher(passphrase, &iv, KDF_ITERATIONS, &mut plaintext);

        state.encrypted = Some(EncryptedMaster {
            iv,
            ciphertext: plaintext,
            alg: ALG_PBKDF2_AES_CTR,
            iterations: KDF_ITERATIONS,
            r: 0,
            p: 0,
        });
        state.wipe_key();
        state.generation += 1;
        debug!("Master key encrypted");
        Ok(())
    }

    /// Decrypt back to the **clear** state, dropping the ciphertext.
    pub fn decrypt(&self, passphrase: &str) -> WalletResult<()> {
        let mut state = self.inner.lock();
        state.expire();
        if state.key.is_some() && state.encrypted.is_none() {
            return Err(WalletError::Master("not encrypted".into()));
        }
        let encrypted = state
            .encrypted
            .as_ref()
            .ok_or_else(|| WalletError::Master("not encrypted".into()))?;

        let key = decrypt_key(encrypted, passphrase)?;
        state.encrypted = None;
        state.key = Some(key);
        state.until = None;
        state.generation += 1;
        debug!("Master key decrypted");
        Ok(())
    }

    /// Return the decrypted key, decrypting first if necessary.
    ///
    /// A fresh decryption arms a best-effort wipe timer; `timeout = None`
    /// disables it. Re-unlocking while already unlocked returns the key
    /// without resetting the deadline.
    pub fn unlock(&self, passphrase: &str, timeout: Option<Duration>) -> WalletResult<Xpriv> {
        let mut state = self.inner.lock();
        state.expire();

        if let Some(key) = state.key {
            return Ok(key);
        }

        let encrypted = state
            .encrypted
            .as_ref()
            .ok_or(WalletError::MasterLocked)?;
        let key = decrypt_key(encrypted, passphrase)?;
        state.key = Some(key);
        state.generation += 1;

        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            state.until = Some(deadline);
            let generation = state.generation;
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name("master-key-wipe".into())
                .spawn(move || {
                    std::thread::sleep(timeout);
                    let mut state = inner.lock();
                    if state.generation == generation {
                        state.wipe_key();
                        debug!("Master key auto-wiped");
                    }
                })
                .map_err(WalletError::Io)?;
        } else {
            state.until = None;
        }

        debug!("Master key unlocked");
        Ok(key)
    }

    /// Zero the decrypted material. Returns to **encrypted** when ciphertext
    /// exists; a never-encrypted master keeps its key (there is nothing to
    /// re-derive it from).
    pub fn lock(&self) {
        let mut state = self.inner.lock();
        state.generation += 1;
        if state.encrypted.is_some() {
            state.wipe_key();
            debug!("Master key locked");
        } else {
            state.until = None;
        }
    }

    /// Alias of [`lock`](Self::lock); the wipe itself is idempotent.
    pub fn destroy(&self) {
        self.lock();
    }

    /// Serialize to the persisted record layout.
    pub fn to_raw(&self) -> WalletResult<Vec<u8>> {
        let state = self.inner.lock();
        let mut out = Vec::new();
        match &state.encrypted {
            Some(enc) => {
                codec::write_u8(&mut out, 1)?;
                codec::write_varbytes(&mut out, &enc.iv)?;
                codec::write_varbytes(&mut out, &enc.ciphertext)?;
                codec::write_u8(&mut out, enc.alg)?;
                codec::write_u32(&mut out, enc.iterations)?;
                codec::write_u32(&mut out, enc.r)?;
                codec::write_u32(&mut out, enc.p)?;
            }
            None => {
                let key = state.key.ok_or(WalletError::MasterLocked)?;
                codec::write_u8(&mut out, 0)?;
                codec::write_varbytes(&mut out, &xpriv_to_extended(&key))?;
            }
        }
        Ok(out)
    }

    /// Deserialize from the persisted record layout.
    pub fn from_raw(data: &[u8]) -> WalletResult<MasterKey> {
        let mut cur = data;
        Self::read_from(&mut cur)
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> WalletResult<MasterKey> {
        match codec::read_u8(r)? {
            1 => {
                let iv_bytes = codec::read_varbytes(r, 64)?;
                if iv_bytes.len() != 16 {
                    return Err(WalletError::Record("master iv must be 16 bytes".into()));
                }
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&iv_bytes);
                let ciphertext = codec::read_varbytes(r, 1024)?;
                let alg = codec::read_u8(r)?;
                if alg != ALG_PBKDF2_AES_CTR {
                    return Err(WalletError::Record(format!("unknown master alg {}", alg)));
                }
                let iterations = codec::read_u32(r)?;
                let rr = codec::read_u32(r)?;
                let p = codec::read_u32(r)?;
                Ok(MasterKey::from_encrypted(EncryptedMaster {
                    iv,
                    ciphertext,
                    alg,
                    iterations,
                    r: rr,
                    p,
                }))
            }
            0 => {
                let extended = codec::read_varbytes(r, 128)?;
                let key = xpriv_from_extended(&extended)?;
                Ok(MasterKey::from_key(key))
            }
            flag => Err(WalletError::Record(format!("bad master flag {}", flag))),
        }
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> WalletResult<()> {
        let raw = self.to_raw()?;
        w.write_all(&raw)?;
        Ok(())
    }

    /// JSON view. The decrypted key never appears once ciphertext exists.
    pub fn to_json(&self) -> WalletResult<MasterJson> {
        let state = self.inner.lock();
        match &state.encrypted {
            Some(enc) => Ok(MasterJson {
                encrypted: true,
                iv: Some(hex::encode(enc.iv)),
                ciphertext: Some(hex::encode(&enc.ciphertext)),
                iterations: Some(enc.iterations),
                key: None,
            }),
            None => {
                let key = state.key.ok_or(WalletError::MasterLocked)?;
                Ok(MasterJson {
                    encrypted: false,
                    iv: None,
                    ciphertext: None,
                    iterations: None,
                    key: Some(key.to_string()),
                })
            }
        }
    }

    pub fn from_json(json: &MasterJson) -> WalletResult<MasterKey> {
        if json.encrypted {
            let iv_hex = json
                .iv
                .as_ref()
                .ok_or_else(|| WalletError::Record("missing master iv".into()))?;
            let ct_hex = json
                .ciphertext
                .as_ref()
                .ok_or_else(|| WalletError::Record("missing master ciphertext".into()))?;
            let iv_bytes =
                hex::decode(iv_hex).map_err(|_| WalletError::Record("bad master iv".into()))?;
            if iv_bytes.len() != 16 {
                return Err(WalletError::Record("master iv must be 16 bytes".into()));
            }
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&iv_bytes);
            let ciphertext = hex::decode(ct_hex)
                .map_err(|_| WalletError::Record("bad master ciphertext".into()))?;
            Ok(MasterKey::from_encrypted(EncryptedMaster {
                iv,
                ciphertext,
                alg: ALG_PBKDF2_AES_CTR,
                iterations: json.iterations.unwrap_or(KDF_ITERATIONS),
                r: 0,
                p: 0,
            }))
        } else {
            let key_str = json
                .key
                .as_ref()
                .ok_or_else(|| WalletError::Record("missing master key".into()))?;
            let key = Xpriv::from_str(key_str)
                .map_err(|_| WalletError::Record("bad master key".into()))?;
            Ok(MasterKey::from_key(key))
        }
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        let a = self.inner.lock();
        let b = other.inner.lock();
        a.key == b.key && a.encrypted == b.encrypted
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MasterKey")
            .field("encrypted", &state.encrypted.is_some())
            .field("locked", &state.key.is_none())
            .finish()
    }
}

/// JSON shape of the master record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterJson {
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Derive the cipher key from a passphrase and run AES-256-CTR in place.
/// CTR is symmetric, so the same call encrypts and decrypts.
fn apply_cipher(passphrase: &str, iv: &[u8; 16], iterations: u32, data: &mut [u8]) {
    let mut cipher_key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), iv, iterations, &mut cipher_key);
    let mut cipher = Aes256Ctr::new(&cipher_key.into(), iv.into());
    cipher.apply_keystream(data);
    cipher_key.zeroize();
}

fn decrypt_key(encrypted: &EncryptedMaster, passphrase: &str) -> WalletResult<Xpriv> {
    let mut plaintext = encrypted.ciphertext.clone();
    apply_cipher(passphrase, &encrypted.iv, encrypted.iterations, &mut plaintext);
    let key = xpriv_from_extended(&plaintext).map_err(|_| WalletError::BadPassphrase);
    plaintext.zeroize();
    key
}

/// 78-byte BIP32 serialization plus 4-byte double-SHA256 checksum.
pub(crate) fn xpriv_to_extended(key: &Xpriv) -> Vec<u8> {
    let mut out = key.encode().to_vec();
    let checksum = sha256d::Hash::hash(&out).to_byte_array();
    out.extend_from_slice(&checksum[..4]);
    out
}

pub(crate) fn xpriv_from_extended(data: &[u8]) -> WalletResult<Xpriv> {
    let payload = check_extended(data)?;
    Xpriv::decode(payload).map_err(|_| WalletError::Record("bad extended private key".into()))
}

fn check_extended(data: &[u8]) -> WalletResult<&[u8]> {
    if data.len() != 82 {
        return Err(WalletError::Record(format!(
            "extended key must be 82 bytes, got {}",
            data.len()
        )));
    }
    let (payload, checksum) = data.split_at(78);
    let expected = sha256d::Hash::hash(payload).to_byte_array();
    if checksum != &expected[..4] {
        return Err(WalletError::Record("extended key checksum mismatch".into()));
    }
    Ok(payload)
}
