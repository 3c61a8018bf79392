//! Mutable transactions.
//!
//! An [`Mtx`] is a transaction under construction together with the coin
//! view of its inputs. It owns the funding pipeline (coin selection, fee
//! math, change insertion), BIP69 ordering, the post-sort validity checks,
//! and per-input templating and ECDSA signing. Which coins it may spend and
//! under which locks is the wallet's business, not the Mtx's.

use crate::coins::Coin;
use crate::keyring::KeyRing;
use crate::network::{DUST_THRESHOLD, FREE_THRESHOLD, MAX_MONEY, MAX_TX_SIZE};
use crate::{WalletError, WalletResult};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::seq::SliceRandom;
use secp256k1::{Message, SecretKey, SECP256K1};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Coin selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// Oldest confirmations first.
    #[default]
    Age,
    /// Uniformly shuffled.
    Random,
    /// Spend everything available.
    All,
}

/// Funding parameters, resolved by the wallet before selection runs.
#[derive(Debug, Clone)]
pub struct FundOptions {
    pub selection: Selection,
    /// Fee rate in satoshis per kilobyte.
    pub rate: u64,
    /// Round the fee up to the nearest kilobyte.
    pub round: bool,
    /// Allow a zero fee when the input priority qualifies.
    pub free: bool,
    /// Hard fee override; disables rate math entirely.
    pub hard_fee: Option<u64>,
    /// Take the fee out of the outputs instead of adding input value.
    pub subtract_fee: bool,
    /// Locking script change is returned to.
    pub change_script: ScriptBuf,
    /// Current chain height, for priority and maturity.
    pub height: u32,
    /// Multisig parameters for input size estimation.
    pub m: u8,
    pub n: u8,
}

/// Signature slots of one templated input.
#[derive(Debug, Clone)]
pub struct InputTemplate {
    pub ring: KeyRing,
    pub sigs: Vec<Option<Vec<u8>>>,
}

impl InputTemplate {
    fn filled(&self) -> bool {
        self.sigs.iter().all(|s| s.is_some())
    }
}

/// A transaction under construction plus its input coin view.
#[derive(Debug, Clone)]
pub struct Mtx {
    pub tx: Transaction,
    view: HashMap<OutPoint, Coin>,
    templates: HashMap<OutPoint, InputTemplate>,
}

impl Default for Mtx {
    fn default() -> Self {
        Self::new()
    }
}

impl Mtx {
    pub fn new() -> Self {
        Self {
            tx: Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input: Vec::new(),
                output: Vec::new(),
            },
            view: HashMap::new(),
            templates: HashMap::new(),
        }
    }

    /// Append an output, validating its value range.
    pub fn add_output(&mut self, script: ScriptBuf, value: u64) -> WalletResult<()> {
        if value > MAX_MONEY {
            return Err(WalletError::CheckTransaction(
                "output value out of range".into(),
            ));
        }
        self.tx.output.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script,
        });
        Ok(())
    }

    /// Add a coin as an input and record it in the view.
    pub fn add_input(&mut self, coin: Coin) {
        self.tx.input.push(TxIn {
            previous_output: coin.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        self.view.insert(coin.outpoint, coin);
    }

    pub fn coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.view.get(outpoint)
    }

    pub fn has_coins(&self) -> bool {
        !self.view.is_empty()
    }

    /// Total satoshis entering the transaction.
    pub fn input_value(&self) -> u64 {
        self.tx
            .input
            .iter()
            .filter_map(|i| self.view.get(&i.previous_output))
            .map(|c| c.value)
            .sum()
    }

    /// Total satoshis leaving the transaction.
    pub fn output_value(&self) -> u64 {
        self.tx.output.iter().map(|o| o.value.to_sat()).sum()
    }

    /// Script hashes of the outputs, for matching against the path index.
    pub fn output_hashes(&self) -> Vec<crate::path::AddressHash> {
        self.tx
            .output
            .iter()
            .filter_map(|o| crate::path::AddressHash::from_script_pubkey(&o.script_pubkey))
            .collect()
    }

    /// Script hashes of the input coins, for keyring resolution.
    pub fn input_hashes(&self) -> Vec<crate::path::AddressHash> {
        self.tx
            .input
            .iter()
            .filter_map(|i| self.view.get(&i.previous_output))
            .filter_map(|c| crate::path::AddressHash::from_script_pubkey(&c.script_pubkey))
            .collect()
    }

    /// Fund the transaction from the given coins.
    ///
    /// Coins are taken in strategy order until input value covers outputs
    /// plus the (size-dependent) fee, then change above the dust threshold
    /// is returned to `change_script`. Fails with `InsufficientFunds` when
    /// the coins cannot cover the target.
    pub fn fund(&mut self, coins: Vec<Coin>, opts: &FundOptions) -> WalletResult<()> {
        if self.tx.output.is_empty() {
            return Err(WalletError::CheckTransaction(
                "cannot fund a transaction without outputs".into(),
            ));
        }

        let available: u64 = coins.iter().map(|c| c.value).sum();
        let total_out = self.output_value();

        let mut ordered = coins;
        match opts.selection {
            Selection::Age => {
                // Confirmed before unconfirmed, oldest first.
                ordered.sort_by_key(|c| match c.height {
                    Some(h) => (0u8, h),
                    None => (1u8, u32::MAX),
                });
            }
            Selection::Random => {
                ordered.shuffle(&mut rand::thread_rng());
            }
            Selection::All => {}
        }

        let mut chosen: Vec<Coin> = Vec::new();
        let mut in_value: u64 = 0;

        if opts.selection == Selection::All {
            for coin in ordered {
                in_value += coin.value;
                chosen.push(coin);
            }
            let fee = self.resolve_fee(&chosen, opts);
            let target = if opts.subtract_fee {
                total_out
            } else {
                total_out.saturating_add(fee)
            };
            if in_value < target {
                return Err(WalletError::InsufficientFunds {
                    needed: target,
                    available,
                });
            }
        } else {
            let mut iter = ordered.into_iter();
            loop {
                let fee = self.resolve_fee(&chosen, opts);
                let target = if opts.subtract_fee {
                    total_out
                } else {
                    total_out.saturating_add(fee)
                };
                if in_value >= target {
                    break;
                }
                match iter.next() {
                    Some(coin) => {
                        in_value += coin.value;
                        chosen.push(coin);
                    }
                    None => {
                        return Err(WalletError::InsufficientFunds {
                            needed: target,
                            available,
                        })
                    }
                }
            }
        }

        let fee = self.resolve_fee(&chosen, opts);

        if opts.subtract_fee {
            self.subtract_fee_from_outputs(fee)?;
        }

        for coin in chosen {
            self.add_input(coin);
        }

        // Anything left beyond outputs and fee is change; dust folds into
        // the fee instead of creating an unspendable output.
        let spent = self.output_value().saturating_add(fee);
        let change = in_value.saturating_sub(spent);
        if change >= DUST_THRESHOLD {
            self.tx.output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: opts.change_script.clone(),
            });
        }

        debug!(
            inputs = self.tx.input.len(),
            in_value,
            out_value = self.output_value(),
            fee,
            change,
            "Transaction funded"
        );
        Ok(())
    }

    /// Fee for the current outputs with `chosen` inputs, honoring the hard
    /// override and the free-priority escape hatch.
    fn resolve_fee(&self, chosen: &[Coin], opts: &FundOptions) -> u64 {
        if let Some(fee) = opts.hard_fee {
            return fee;
        }
        let size = self.estimate_vsize(chosen, opts);
        if opts.free && priority(chosen, opts.height, size) >= FREE_THRESHOLD as u128 {
            return 0;
        }
        if opts.round {
            opts.rate * (size as u64).div_ceil(1000)
        } else {
            (opts.rate * size as u64).div_ceil(1000)
        }
    }

    /// Virtual size estimate with `chosen` inputs added and a change output
    /// assumed present.
    fn estimate_vsize(&self, chosen: &[Coin], opts: &FundOptions) -> usize {
        let mut base = 4 + 9 + 9 + 4;
        let mut witness = 0usize;

        for output in &self.tx.output {
            base += 8 + 9 + output.script_pubkey.len();
        }
        // Change output.
        base += 8 + 9 + opts.change_script.len();

        for input in &self.tx.input {
            let coin = self.view.get(&input.previous_output);
            let (b, w) = input_size(coin.map(|c| c.script_pubkey.as_script()), opts);
            base += b;
            witness += w;
        }
        for coin in chosen {
            let (b, w) = input_size(Some(coin.script_pubkey.as_script()), opts);
            base += b;
            witness += w;
        }

        if witness > 0 {
            witness += 2; // marker and flag
        }
        base + witness.div_ceil(4)
    }

    fn subtract_fee_from_outputs(&mut self, fee: u64) -> WalletResult<()> {
        let count = self.tx.output.len() as u64;
        let share = fee / count;
        let mut remainder = fee % count;

        for output in &mut self.tx.output {
            let mut cut = share;
            if remainder > 0 {
                cut += 1;
                remainder -= 1;
            }
            let value = output.value.to_sat();
            if value < cut + DUST_THRESHOLD {
                return Err(WalletError::CheckTransaction(
                    "fee exceeds output value".into(),
                ));
            }
            output.value = Amount::from_sat(value - cut);
        }
        Ok(())
    }

    /// BIP69 deterministic ordering: inputs by previous outpoint, outputs by
    /// value then script bytes.
    pub fn sort_members(&mut self) {
        self.tx.input.sort_by(|a, b| {
            let ta = a.previous_output.txid.to_byte_array();
            let tb = b.previous_output.txid.to_byte_array();
            ta.cmp(&tb)
                .then(a.previous_output.vout.cmp(&b.previous_output.vout))
        });
        self.tx.output.sort_by(|a, b| {
            a.value
                .cmp(&b.value)
                .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
        });
    }

    /// Context-free validity: value ranges, duplicate inputs, size cap.
    pub fn check_sanity(&self) -> WalletResult<()> {
        if self.tx.input.is_empty() {
            return Err(WalletError::CheckTransaction("no inputs".into()));
        }
        if self.tx.output.is_empty() {
            return Err(WalletError::CheckTransaction("no outputs".into()));
        }

        let mut total: u64 = 0;
        for output in &self.tx.output {
            let value = output.value.to_sat();
            if value > MAX_MONEY {
                return Err(WalletError::CheckTransaction(
                    "output value out of range".into(),
                ));
            }
            total = total.saturating_add(value);
            if total > MAX_MONEY {
                return Err(WalletError::CheckTransaction(
                    "total output value out of range".into(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for input in &self.tx.input {
            if !seen.insert(input.previous_output) {
                return Err(WalletError::CheckTransaction("duplicate inputs".into()));
            }
        }

        if self.tx.total_size() > MAX_TX_SIZE {
            return Err(WalletError::CheckTransaction("transaction too large".into()));
        }

        Ok(())
    }

    /// Validity against the coin view at the given chain height.
    pub fn check_inputs(&self, height: u32) -> WalletResult<()> {
        let mut in_value: u64 = 0;
        for input in &self.tx.input {
            let coin = self
                .view
                .get(&input.previous_output)
                .ok_or_else(|| WalletError::CheckInputs("input has no coin".into()))?;
            if let Some(h) = coin.height {
                if h > height {
                    return Err(WalletError::CheckInputs(
                        "coin height above chain height".into(),
                    ));
                }
            }
            if !coin.spendable(height) {
                return Err(WalletError::CheckInputs("immature coinbase spend".into()));
            }
            in_value = in_value.saturating_add(coin.value);
        }
        if in_value < self.output_value() {
            return Err(WalletError::CheckInputs("fee would be negative".into()));
        }
        Ok(())
    }

    /// Install the signature-slot template for one input. Idempotent.
    pub fn template_input(&mut self, index: usize, ring: KeyRing) -> WalletResult<()> {
        let outpoint = self
            .tx
            .input
            .get(index)
            .map(|i| i.previous_output)
            .ok_or_else(|| WalletError::Script("input index out of range".into()))?;

        let template = self
            .templates
            .entry(outpoint)
            .or_insert_with(|| InputTemplate {
                sigs: vec![None; ring.sig_slots()],
                ring,
            });

        let (script_sig, witness) = template.ring.build_input(&template.sigs)?;
        self.tx.input[index].script_sig = script_sig;
        self.tx.input[index].witness = witness;
        Ok(())
    }

    /// Sign one input with the ring's derived private key.
    ///
    /// Templates the input first if needed. Returns `true` when a new
    /// signature was produced, `false` when the slot was already filled.
    pub fn sign_input(
        &mut self,
        index: usize,
        ring: &KeyRing,
        secret: &SecretKey,
        sighash_type: EcdsaSighashType,
    ) -> WalletResult<bool> {
        let outpoint = self
            .tx
            .input
            .get(index)
            .map(|i| i.previous_output)
            .ok_or_else(|| WalletError::Script("input index out of range".into()))?;
        let coin = self
            .view
            .get(&outpoint)
            .ok_or_else(|| WalletError::CheckInputs("input has no coin".into()))?
            .clone();

        if !self.templates.contains_key(&outpoint) {
            self.template_input(index, ring.clone())?;
        }

        let slot = ring.sign_position();
        if self
            .templates
            .get(&outpoint)
            .and_then(|t| t.sigs.get(slot))
            .map(|s| s.is_some())
            .unwrap_or(false)
        {
            return Ok(false);
        }

        let digest = {
            let mut cache = SighashCache::new(&self.tx);
            if ring.witness {
                let hash = match ring.account_type {
                    crate::keyring::AccountType::Pubkeyhash => cache
                        .p2wpkh_signature_hash(
                            index,
                            &coin.script_pubkey,
                            Amount::from_sat(coin.value),
                            sighash_type,
                        )
                        .map_err(|e| WalletError::Script(e.to_string()))?,
                    crate::keyring::AccountType::Multisig => cache
                        .p2wsh_signature_hash(
                            index,
                            &ring.script_code(),
                            Amount::from_sat(coin.value),
                            sighash_type,
                        )
                        .map_err(|e| WalletError::Script(e.to_string()))?,
                };
                hash.to_byte_array()
            } else {
                cache
                    .legacy_signature_hash(index, &ring.script_code(), sighash_type.to_u32())
                    .map_err(|e| WalletError::Script(e.to_string()))?
                    .to_byte_array()
            }
        };

        let message = Message::from_digest(digest);
        let signature = SECP256K1.sign_ecdsa(&message, secret);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(sighash_type.to_u32() as u8);

        let template = self
            .templates
            .get_mut(&outpoint)
            .ok_or_else(|| WalletError::Script("input is not templated".into()))?;
        template.sigs[slot] = Some(sig_bytes);
        let (script_sig, witness) = template.ring.build_input(&template.sigs)?;
        self.tx.input[index].script_sig = script_sig;
        self.tx.input[index].witness = witness;
        Ok(true)
    }

    /// Sign a batch of resolved rings. This is the one signing loop; the
    /// worker pool and the inline path both run it, so results are
    /// identical either way.
    pub fn sign_rings(
        &mut self,
        entries: &[(usize, KeyRing, SecretKey)],
        sighash_type: EcdsaSighashType,
    ) -> WalletResult<usize> {
        let mut signed = 0;
        for (index, ring, secret) in entries {
            if self.sign_input(*index, ring, secret, sighash_type)? {
                signed += 1;
            }
        }
        Ok(signed)
    }

    /// Whether every input is templated with all signature slots filled.
    pub fn is_fully_signed(&self) -> bool {
        !self.tx.input.is_empty()
            && self.tx.input.iter().all(|i| {
                self.templates
                    .get(&i.previous_output)
                    .map(|t| t.filled())
                    .unwrap_or(false)
            })
    }

    /// Count of inputs with all signature slots filled.
    pub fn signed_inputs(&self) -> usize {
        self.tx
            .input
            .iter()
            .filter(|i| {
                self.templates
                    .get(&i.previous_output)
                    .map(|t| t.filled())
                    .unwrap_or(false)
            })
            .count()
    }

    /// Extract the final transaction.
    pub fn to_tx(&self) -> Transaction {
        self.tx.clone()
    }
}

/// Legacy priority: coin-value times confirmations, per byte.
fn priority(coins: &[Coin], height: u32, size: usize) -> u128 {
    if size == 0 {
        return 0;
    }
    let weighted: u128 = coins
        .iter()
        .map(|c| c.value as u128 * c.confirmations(height) as u128)
        .sum();
    weighted / size as u128
}

/// (base bytes, witness bytes) consumed by one input spending the given
/// locking script. Unknown scripts assume the worst standard case.
fn input_size(script_pubkey: Option<&bitcoin::Script>, opts: &FundOptions) -> (usize, usize) {
    const OUTPOINT_AND_SEQUENCE: usize = 36 + 4;
    const SIG: usize = 73;
    const PUBKEY: usize = 33;

    let m = opts.m.max(1) as usize;
    let n = opts.n.max(1) as usize;
    let redeem = 3 + n * (1 + PUBKEY);

    match script_pubkey {
        Some(s) if s.is_p2pkh() => {
            let script_sig = 1 + SIG + 1 + PUBKEY;
            (OUTPOINT_AND_SEQUENCE + 1 + script_sig, 0)
        }
        Some(s) if s.is_p2wpkh() => {
            let witness = 1 + 1 + SIG + 1 + PUBKEY;
            (OUTPOINT_AND_SEQUENCE + 1, witness)
        }
        Some(s) if s.is_p2sh() => {
            let script_sig = 1 + m * (1 + SIG) + 2 + redeem;
            (OUTPOINT_AND_SEQUENCE + 3 + script_sig, 0)
        }
        Some(s) if s.is_p2wsh() => {
            let witness = 1 + 1 + m * (1 + SIG) + 2 + redeem;
            (OUTPOINT_AND_SEQUENCE + 1, witness)
        }
        _ => {
            let script_sig = 1 + m * (1 + SIG) + 2 + redeem;
            (OUTPOINT_AND_SEQUENCE + 3 + script_sig, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::AccountType;
    use crate::path::{Branch, Path};
    use bitcoin::hashes::{hash160, Hash};
    use bitcoin::{PubkeyHash, Txid};
    use secp256k1::PublicKey;

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([byte; 32]), vout)
    }

    fn p2pkh_script(byte: u8) -> ScriptBuf {
        let h = hash160::Hash::from_byte_array([byte; 20]);
        ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(h))
    }

    fn coin(byte: u8, value: u64, height: Option<u32>) -> Coin {
        Coin {
            outpoint: outpoint(byte, 0),
            value,
            script_pubkey: p2pkh_script(byte),
            height,
            coinbase: false,
            account: 0,
        }
    }

    fn options() -> FundOptions {
        FundOptions {
            selection: Selection::Age,
            rate: 10_000,
            round: false,
            free: false,
            hard_fee: None,
            subtract_fee: false,
            change_script: p2pkh_script(0xcc),
            height: 100,
            m: 1,
            n: 1,
        }
    }

    #[test]
    fn test_fund_selects_and_adds_change() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 50_000).unwrap();

        let coins = vec![coin(1, 100_000, Some(10)), coin(2, 100_000, Some(20))];
        mtx.fund(coins, &options()).unwrap();

        // One old coin covers output plus fee; change comes back.
        assert_eq!(mtx.tx.input.len(), 1);
        assert_eq!(mtx.tx.input[0].previous_output, outpoint(1, 0));
        assert_eq!(mtx.tx.output.len(), 2);
        let fee = mtx.input_value() - mtx.output_value();
        assert!(fee > 0 && fee < 10_000);
    }

    #[test]
    fn test_fund_insufficient() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 150_000).unwrap();

        let err = mtx.fund(vec![coin(1, 100_000, Some(10))], &options());
        match err {
            Err(WalletError::InsufficientFunds { needed, available }) => {
                assert!(needed > 150_000);
                assert_eq!(available, 100_000);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn test_fund_age_prefers_oldest() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 10_000).unwrap();

        let coins = vec![
            coin(1, 50_000, None),
            coin(2, 50_000, Some(90)),
            coin(3, 50_000, Some(5)),
        ];
        mtx.fund(coins, &options()).unwrap();
        assert_eq!(mtx.tx.input[0].previous_output, outpoint(3, 0));
    }

    #[test]
    fn test_fund_all_spends_everything() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 10_000).unwrap();

        let mut opts = options();
        opts.selection = Selection::All;
        mtx.fund(
            vec![coin(1, 50_000, Some(1)), coin(2, 50_000, Some(2))],
            &opts,
        )
        .unwrap();
        assert_eq!(mtx.tx.input.len(), 2);
    }

    #[test]
    fn test_hard_fee_is_exact() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 50_000).unwrap();

        let mut opts = options();
        opts.hard_fee = Some(1_234);
        mtx.fund(vec![coin(1, 100_000, Some(10))], &opts).unwrap();
        assert_eq!(mtx.input_value() - mtx.output_value(), 1_234);
    }

    #[test]
    fn test_subtract_fee_reduces_outputs() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 100_000).unwrap();

        let mut opts = options();
        opts.subtract_fee = true;
        opts.hard_fee = Some(5_000);
        mtx.fund(vec![coin(1, 100_000, Some(10))], &opts).unwrap();

        // Output absorbed the fee; input exactly covers output + fee.
        assert_eq!(mtx.tx.output[0].value.to_sat(), 95_000);
        assert_eq!(mtx.input_value(), 100_000);
    }

    #[test]
    fn test_free_priority_zeroes_fee() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 10 * crate::network::COIN).unwrap();

        let mut opts = options();
        opts.free = true;
        opts.height = 100_000;
        // Huge, deeply confirmed coin: priority clears the threshold.
        mtx.fund(vec![coin(1, 11 * crate::network::COIN, Some(1))], &opts)
            .unwrap();
        let change = mtx.input_value() - mtx.output_value();
        assert_eq!(change, 0); // zero fee, exact change returned
    }

    #[test]
    fn test_dust_change_folds_into_fee() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 99_800).unwrap();

        let mut opts = options();
        opts.hard_fee = Some(100);
        // Change would be 100 sat: below dust, folded into the fee.
        mtx.fund(vec![coin(1, 100_000, Some(10))], &opts).unwrap();
        assert_eq!(mtx.tx.output.len(), 1);
    }

    #[test]
    fn test_bip69_ordering() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xbb), 20_000).unwrap();
        mtx.add_output(p2pkh_script(0xaa), 20_000).unwrap();
        mtx.add_output(p2pkh_script(0x01), 10_000).unwrap();
        mtx.add_input(coin(9, 1_000, Some(1)));
        mtx.add_input(Coin {
            outpoint: outpoint(9, 1),
            ..coin(9, 1_000, Some(1))
        });
        mtx.add_input(coin(3, 1_000, Some(1)));

        mtx.sort_members();

        let prevs: Vec<_> = mtx.tx.input.iter().map(|i| i.previous_output).collect();
        assert_eq!(prevs, vec![outpoint(3, 0), outpoint(9, 0), outpoint(9, 1)]);

        let values: Vec<_> = mtx.tx.output.iter().map(|o| o.value.to_sat()).collect();
        assert_eq!(values, vec![10_000, 20_000, 20_000]);
        // Equal values tie-break on script bytes.
        assert!(mtx.tx.output[1].script_pubkey.as_bytes() < mtx.tx.output[2].script_pubkey.as_bytes());
    }

    #[test]
    fn test_sanity_rejects_duplicates() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 1_000).unwrap();
        mtx.add_input(coin(1, 10_000, Some(1)));
        let duplicate = mtx.tx.input[0].clone();
        mtx.tx.input.push(duplicate);
        assert!(matches!(
            mtx.check_sanity(),
            Err(WalletError::CheckTransaction(_))
        ));
    }

    #[test]
    fn test_check_inputs_missing_coin() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 1_000).unwrap();
        mtx.tx.input.push(TxIn {
            previous_output: outpoint(7, 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        assert!(matches!(
            mtx.check_inputs(100),
            Err(WalletError::CheckInputs(_))
        ));
    }

    #[test]
    fn test_check_inputs_immature_coinbase() {
        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 1_000).unwrap();
        let mut c = coin(1, 10_000, Some(95));
        c.coinbase = true;
        mtx.add_input(c);
        assert!(matches!(
            mtx.check_inputs(100),
            Err(WalletError::CheckInputs(_))
        ));
    }

    fn signing_ring(secret: &SecretKey, witness: bool) -> KeyRing {
        let public_key = PublicKey::from_secret_key(SECP256K1, secret);
        KeyRing::new(
            Path::new(1, 0, Branch::Receive, 0),
            public_key,
            vec![public_key],
            AccountType::Pubkeyhash,
            1,
            1,
            witness,
        )
    }

    #[test]
    fn test_sign_p2pkh_input() {
        let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let ring = signing_ring(&secret, false);

        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 40_000).unwrap();
        mtx.add_input(Coin {
            outpoint: outpoint(1, 0),
            value: 50_000,
            script_pubkey: ring.script_pubkey(),
            height: Some(10),
            coinbase: false,
            account: 0,
        });

        assert!(!mtx.is_fully_signed());
        let signed = mtx
            .sign_input(0, &ring, &secret, EcdsaSighashType::All)
            .unwrap();
        assert!(signed);
        assert!(mtx.is_fully_signed());
        assert_eq!(mtx.signed_inputs(), 1);

        // Signing again is a no-op.
        let again = mtx
            .sign_input(0, &ring, &secret, EcdsaSighashType::All)
            .unwrap();
        assert!(!again);

        // Final scriptSig carries the DER signature plus the pubkey.
        let script_sig = &mtx.tx.input[0].script_sig;
        assert!(script_sig.len() > 100);
    }

    #[test]
    fn test_sign_p2wpkh_input_fills_witness() {
        let secret = SecretKey::from_slice(&[0x43; 32]).unwrap();
        let ring = signing_ring(&secret, true);

        let mut mtx = Mtx::new();
        mtx.add_output(p2pkh_script(0xaa), 40_000).unwrap();
        mtx.add_input(Coin {
            outpoint: outpoint(1, 0),
            value: 50_000,
            script_pubkey: ring.script_pubkey(),
            height: Some(10),
            coinbase: false,
            account: 0,
        });

        mtx.sign_input(0, &ring, &secret, EcdsaSighashType::All)
            .unwrap();
        assert!(mtx.is_fully_signed());
        assert!(mtx.tx.input[0].script_sig.is_empty());
        assert_eq!(mtx.tx.input[0].witness.len(), 2);
    }
}
