//! Background signing pool.
//!
//! Signing a large transaction is pure CPU work; a wallet may offload it to
//! a small pool of worker threads. Each `sign` call ships one job (the
//! transaction snapshot plus the derived child keys, by value) and blocks
//! for the result. The workers run the same signing loop the inline path
//! uses, so pooled and inline signing produce identical transactions.

use crate::keyring::KeyRing;
use crate::mtx::Mtx;
use crate::{WalletError, WalletResult};
use bitcoin::sighash::EcdsaSighashType;
use secp256k1::SecretKey;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info};

/// One signing request.
pub struct SignJob {
    /// Transaction snapshot to sign.
    pub mtx: Mtx,
    /// `(input index, ring, derived child key)` per recognized input.
    pub entries: Vec<(usize, KeyRing, SecretKey)>,
    /// Sighash flags.
    pub sighash_type: EcdsaSighashType,
}

/// Outcome of a signing request.
pub struct SignOutcome {
    /// The signed transaction snapshot.
    pub mtx: Mtx,
    /// Inputs newly signed.
    pub signed: usize,
}

struct Request {
    job: SignJob,
    reply: mpsc::Sender<WalletResult<SignOutcome>>,
}

/// Pool of signing worker threads.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Request>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads.
    pub fn spawn(size: usize) -> WalletResult<WorkerPool> {
        let (sender, receiver) = mpsc::channel::<Request>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(size);
        for id in 0..size.max(1) {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("sign-worker-{}", id))
                .spawn(move || Self::worker_loop(id, receiver))
                .map_err(WalletError::Io)?;
            handles.push(handle);
        }

        info!(workers = size.max(1), "Signing pool spawned");
        Ok(WorkerPool {
            sender: Some(sender),
            handles,
        })
    }

    fn worker_loop(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Request>>>) {
        loop {
            let request = {
                let guard = match receiver.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                guard.recv()
            };
            let Ok(Request { job, reply }) = request else {
                // Channel closed: pool is shutting down.
                return;
            };

            let SignJob {
                mut mtx,
                mut entries,
                sighash_type,
            } = job;
            let result = mtx
                .sign_rings(&entries, sighash_type)
                .map(|signed| SignOutcome { mtx, signed });
            for (_, _, secret) in entries.iter_mut() {
                secret.non_secure_erase();
            }

            debug!(worker = id, "Signing job finished");
            let _ = reply.send(result);
        }
    }

    /// Run one signing job on the pool and wait for it.
    pub fn sign(&self, job: SignJob) -> WalletResult<SignOutcome> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| WalletError::Master("worker pool is shut down".into()))?;
        let (reply, result) = mpsc::channel();
        sender
            .send(Request { job, reply })
            .map_err(|_| WalletError::Master("worker pool is shut down".into()))?;
        result
            .recv()
            .map_err(|_| WalletError::Master("signing worker died".into()))?
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel stops the workers.
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::Coin;
    use crate::keyring::AccountType;
    use crate::path::{Branch, Path};
    use bitcoin::hashes::{hash160, Hash};
    use bitcoin::{OutPoint, PubkeyHash, ScriptBuf, Txid};
    use secp256k1::{PublicKey, SECP256K1};

    fn signed_fixture() -> (Mtx, Vec<(usize, KeyRing, SecretKey)>) {
        let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let public_key = PublicKey::from_secret_key(SECP256K1, &secret);
        let ring = KeyRing::new(
            Path::new(1, 0, Branch::Receive, 0),
            public_key,
            vec![public_key],
            AccountType::Pubkeyhash,
            1,
            1,
            false,
        );

        let mut mtx = Mtx::new();
        let dest = ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(hash160::Hash::from_byte_array(
            [0xaa; 20],
        )));
        mtx.add_output(dest, 40_000).unwrap();
        mtx.add_input(Coin {
            outpoint: OutPoint::new(Txid::from_byte_array([1; 32]), 0),
            value: 50_000,
            script_pubkey: ring.script_pubkey(),
            height: Some(10),
            coinbase: false,
            account: 0,
        });

        (mtx, vec![(0, ring, secret)])
    }

    #[test]
    fn test_pool_matches_inline_signing() {
        let (mtx, entries) = signed_fixture();

        let mut inline = mtx.clone();
        let inline_signed = inline
            .sign_rings(&entries, EcdsaSighashType::All)
            .unwrap();

        let pool = WorkerPool::spawn(2).unwrap();
        let outcome = pool
            .sign(SignJob {
                mtx,
                entries,
                sighash_type: EcdsaSighashType::All,
            })
            .unwrap();

        assert_eq!(outcome.signed, inline_signed);
        assert_eq!(outcome.mtx.tx, inline.tx);
        assert!(outcome.mtx.is_fully_signed());
    }

    #[test]
    fn test_pool_shuts_down_cleanly() {
        let pool = WorkerPool::spawn(1).unwrap();
        drop(pool);
    }
}
