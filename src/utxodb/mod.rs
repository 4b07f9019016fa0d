//! In-memory UTXO ledger used as a deterministic stand-in for the value
//! tangle.
//!
//! The ledger is seeded with a genesis transaction crediting the whole
//! supply to the genesis address. Transactions are validated for per-color
//! balance and signatures, applied atomically, and indexed by address.
//! The total value held by the UTXO set is checked against the supply after
//! every mutation; a mismatch is a programmer error and aborts.

pub mod confirm;

use crate::ledger::LedgerError;
use crate::transaction::Transaction;
use crate::types::{Address, Balance, Color, OutputId, TxId};
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Total token supply, pinned at genesis.
pub const SUPPLY: i64 = 100_000_000_000;

/// Amount handed out by the faucet, same as the public testnet faucet.
pub const REQUEST_FUNDS_AMOUNT: i64 = 1337;

/// Seed of the genesis key pair (base58).
pub const GENESIS_SEED: &str = "EFonzaUz5ngYeDxbRKu8qV5aoSogUQ5qVSTSjn7hJ8FQ";

/// Derive a deterministic ed25519 key from a base58 seed and an index.
pub fn signing_key_from_seed(seed: &str, index: u64) -> SigningKey {
    let seed_bytes = bs58::decode(seed)
        .into_vec()
        .expect("invalid base58 key seed");
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed_bytes);
    hasher.update(&index.to_le_bytes());
    SigningKey::from_bytes(hasher.finalize().as_bytes())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AddressStats {
    pub total: i64,
    pub num_outputs: usize,
}

struct LedgerState {
    transactions: HashMap<TxId, Arc<Transaction>>,
    utxo: HashSet<OutputId>,
    utxo_by_address: HashMap<Address, Vec<TxId>>,
}

pub struct UtxoDb {
    state: RwLock<LedgerState>,
    genesis_key: SigningKey,
    genesis_address: Address,
    genesis_txid: TxId,
}

impl Default for UtxoDb {
    fn default() -> Self {
        Self::new()
    }
}

impl UtxoDb {
    pub fn new() -> Self {
        let genesis_key = signing_key_from_seed(GENESIS_SEED, 0);
        let genesis_address = Address::from_public_key(&genesis_key.verifying_key());

        let mut genesis_tx = Transaction::new(
            vec![OutputId::new(genesis_address, TxId::zero())],
            vec![(genesis_address, vec![Balance::iota(SUPPLY)])],
        );
        genesis_tx.sign(&genesis_key);
        let genesis_txid = genesis_tx.id();

        let mut transactions = HashMap::new();
        transactions.insert(genesis_txid, Arc::new(genesis_tx));
        let mut utxo = HashSet::new();
        utxo.insert(OutputId::new(genesis_address, genesis_txid));
        let mut utxo_by_address = HashMap::new();
        utxo_by_address.insert(genesis_address, vec![genesis_txid]);

        UtxoDb {
            state: RwLock::new(LedgerState {
                transactions,
                utxo,
                utxo_by_address,
            }),
            genesis_key,
            genesis_address,
            genesis_txid,
        }
    }

    pub fn genesis_address(&self) -> Address {
        self.genesis_address
    }

    pub fn genesis_txid(&self) -> TxId {
        self.genesis_txid
    }

    pub fn genesis_key(&self) -> &SigningKey {
        &self.genesis_key
    }

    /// Check per-color balance and signatures without touching the ledger.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), LedgerError> {
        let state = self.state.read();
        Self::validate_locked(&state, tx)
    }

    fn validate_locked(state: &LedgerState, tx: &Transaction) -> Result<(), LedgerError> {
        Self::check_inputs_outputs(state, tx)?;
        if !tx.signatures_valid() {
            return Err(LedgerError::InvalidSignatures(tx.id()));
        }
        Ok(())
    }

    fn check_inputs_outputs(state: &LedgerState, tx: &Transaction) -> Result<(), LedgerError> {
        let txid = tx.id();
        if tx.inputs().is_empty() {
            return Err(LedgerError::Unbalanced(txid, "no inputs"));
        }
        if tx.outputs().is_empty() {
            return Err(LedgerError::Unbalanced(txid, "no outputs"));
        }

        // resolve input values from the creating transactions; colors are
        // reported post-minting, so Color::NEW never appears on an input
        let mut in_totals: HashMap<Color, i64> = HashMap::new();
        for input in tx.inputs() {
            let source = state
                .transactions
                .get(&input.txid)
                .ok_or(LedgerError::UnknownOutput {
                    txid,
                    output: *input,
                })?;
            let balances = source
                .output_balances(&input.address)
                .ok_or(LedgerError::UnknownOutput {
                    txid,
                    output: *input,
                })?;
            for b in balances {
                let color = Self::minted_color(b.color, &input.txid);
                *in_totals.entry(color).or_insert(0) += b.value;
            }
        }

        let out_totals = tx.output_totals_by_color();
        for (_, balances) in tx.outputs() {
            for b in balances {
                if b.value <= 0 {
                    return Err(LedgerError::Unbalanced(txid, "non-positive output value"));
                }
            }
        }

        // minted tokens absorb the remainder of the consumed native tokens;
        // every typed color must be passed through unchanged
        let minted = out_totals.get(&Color::NEW).copied().unwrap_or(0);
        let iota_in = in_totals.get(&Color::IOTA).copied().unwrap_or(0);
        let iota_out = out_totals.get(&Color::IOTA).copied().unwrap_or(0);
        if iota_in != iota_out + minted {
            return Err(LedgerError::Unbalanced(txid, "native token sum mismatch"));
        }
        for (color, out_value) in &out_totals {
            if *color == Color::IOTA || *color == Color::NEW {
                continue;
            }
            if in_totals.get(color).copied().unwrap_or(0) != *out_value {
                return Err(LedgerError::Unbalanced(txid, "colored token sum mismatch"));
            }
        }
        for (color, in_value) in &in_totals {
            if *color == Color::IOTA {
                continue;
            }
            if out_totals.get(color).copied().unwrap_or(0) != *in_value {
                return Err(LedgerError::Unbalanced(txid, "colored token sum mismatch"));
            }
        }
        Ok(())
    }

    fn minted_color(color: Color, source_txid: &TxId) -> Color {
        if color == Color::NEW {
            Color::from(*source_txid)
        } else {
            color
        }
    }

    /// Validate and apply a transaction. Inputs must be unspent; on success
    /// they are removed from the UTXO set and the new outputs indexed.
    pub fn add_transaction(&self, tx: Transaction) -> Result<Arc<Transaction>, LedgerError> {
        let mut state = self.state.write();
        Self::validate_locked(&state, &tx)?;

        let txid = tx.id();
        if state.transactions.contains_key(&txid) {
            return Err(LedgerError::Duplicate(txid));
        }
        for input in tx.inputs() {
            if !state.utxo.contains(input) {
                return Err(LedgerError::DoubleSpend {
                    txid,
                    output: *input,
                });
            }
        }

        for input in tx.inputs() {
            state.utxo.remove(input);
            if let Some(ids) = state.utxo_by_address.get_mut(&input.address) {
                ids.retain(|id| *id != input.txid);
            }
        }
        for (addr, _) in tx.outputs() {
            state.utxo.insert(OutputId::new(*addr, txid));
            state.utxo_by_address.entry(*addr).or_default().push(txid);
        }
        let tx = Arc::new(tx);
        state.transactions.insert(txid, tx.clone());

        Self::check_ledger_balance(&state);
        Ok(tx)
    }

    pub fn get_transaction(&self, id: &TxId) -> Option<Arc<Transaction>> {
        self.state.read().transactions.get(id).cloned()
    }

    pub fn is_confirmed(&self, id: &TxId) -> bool {
        self.state.read().transactions.contains_key(id)
    }

    /// Confirmed unspent outputs of an address, with [`Color::NEW`] replaced
    /// by the minting transaction's id in the returned view.
    pub fn get_address_outputs(&self, addr: &Address) -> HashMap<OutputId, Vec<Balance>> {
        let state = self.state.read();
        let mut ret = HashMap::new();

        let Some(txids) = state.utxo_by_address.get(addr) else {
            return ret;
        };
        for txid in txids {
            assert!(!txid.is_zero(), "zero txid in UTXO index");
            let tx = state
                .transactions
                .get(txid)
                .unwrap_or_else(|| panic!("transaction {} missing from ledger", txid));
            let balances = tx
                .output_balances(addr)
                .unwrap_or_else(|| panic!("output of {} missing at indexed address", txid));
            let adjusted = balances
                .iter()
                .map(|b| Balance::new(Self::minted_color(b.color, txid), b.value))
                .collect();
            ret.insert(OutputId::new(*addr, *txid), adjusted);
        }
        ret
    }

    /// Two transactions conflict when they share an id or spend a common
    /// output.
    pub fn are_conflicting(tx1: &Transaction, tx2: &Transaction) -> bool {
        if tx1.id() == tx2.id() {
            return true;
        }
        tx1.inputs()
            .iter()
            .any(|input| tx2.inputs().contains(input))
    }

    /// Faucet: send [`REQUEST_FUNDS_AMOUNT`] native tokens from the genesis
    /// address to `target`, returning the change to genesis.
    pub fn request_funds(&self, target: &Address) -> Result<Arc<Transaction>, LedgerError> {
        let tx = self.request_funds_tx(target)?;
        self.add_transaction(tx)
    }

    fn request_funds_tx(&self, target: &Address) -> Result<Transaction, LedgerError> {
        let source_outputs = self.get_address_outputs(&self.genesis_address);

        let mut inputs = Vec::new();
        let mut sum = 0i64;
        for (oid, balances) in &source_outputs {
            let iotas: i64 = balances
                .iter()
                .filter(|b| b.color == Color::IOTA)
                .map(|b| b.value)
                .sum();
            if iotas > 0 {
                inputs.push(*oid);
                sum += iotas;
            }
            if sum >= REQUEST_FUNDS_AMOUNT {
                break;
            }
        }
        if sum < REQUEST_FUNDS_AMOUNT {
            return Err(LedgerError::NotEnoughFunds);
        }

        let mut outputs = vec![(*target, vec![Balance::iota(REQUEST_FUNDS_AMOUNT)])];
        if sum > REQUEST_FUNDS_AMOUNT {
            outputs.push((
                self.genesis_address,
                vec![Balance::iota(sum - REQUEST_FUNDS_AMOUNT)],
            ));
        }

        let mut tx = Transaction::new(inputs, outputs);
        tx.sign(&self.genesis_key);
        assert!(tx.signatures_valid(), "faucet produced invalid signatures");
        Ok(tx)
    }

    /// Per-address totals and output counts, for the startup banner and
    /// tests.
    pub fn ledger_stats(&self) -> HashMap<Address, AddressStats> {
        let state = self.state.read();
        let mut ret: HashMap<Address, AddressStats> = HashMap::new();
        for output_id in &state.utxo {
            let stats = ret.entry(output_id.address).or_default();
            stats.total += Self::output_total(&state, output_id);
            stats.num_outputs += 1;
        }
        ret
    }

    fn output_total(state: &LedgerState, output_id: &OutputId) -> i64 {
        let tx = state
            .transactions
            .get(&output_id.txid)
            .unwrap_or_else(|| panic!("transaction {} missing from ledger", output_id.txid));
        tx.output_balances(&output_id.address)
            .unwrap_or_else(|| panic!("output {} missing from ledger", output_id))
            .iter()
            .map(|b| b.value)
            .sum()
    }

    /// Supply conservation: the total value held by the UTXO set equals the
    /// genesis supply after every mutation. A colored token is a recolored
    /// native token, so all colors count.
    fn check_ledger_balance(state: &LedgerState) {
        let total: i64 = state
            .utxo
            .iter()
            .map(|oid| Self::output_total(state, oid))
            .sum();
        assert!(total == SUPPLY, "wrong ledger balance: {} != {}", total, SUPPLY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance_of(u: &UtxoDb, addr: &Address) -> i64 {
        u.get_address_outputs(addr)
            .values()
            .flatten()
            .map(|b| b.value)
            .sum()
    }

    fn fresh_address(index: u64) -> (SigningKey, Address) {
        let key = signing_key_from_seed("C6hPhCS2E2dKUGS3qj4264itKXohwgL3Lm2fNxayAKr", index);
        let addr = Address::from_public_key(&key.verifying_key());
        (key, addr)
    }

    #[test]
    fn test_genesis() {
        let u = UtxoDb::new();
        let gen_tx = u.get_transaction(&u.genesis_txid()).unwrap();
        assert_eq!(gen_tx.id(), u.genesis_txid());

        let outputs = u.get_address_outputs(&u.genesis_address());
        assert_eq!(outputs.len(), 1);
        let balances = outputs
            .get(&OutputId::new(u.genesis_address(), u.genesis_txid()))
            .unwrap();
        assert_eq!(balances.as_slice(), &[Balance::iota(SUPPLY)]);
    }

    #[test]
    fn test_request_funds() {
        let u = UtxoDb::new();
        let (_, addr) = fresh_address(0);
        u.request_funds(&addr).unwrap();
        assert_eq!(balance_of(&u, &u.genesis_address()), SUPPLY - REQUEST_FUNDS_AMOUNT);
        assert_eq!(balance_of(&u, &addr), REQUEST_FUNDS_AMOUNT);
    }

    #[test]
    fn test_replaying_transaction_fails() {
        let u = UtxoDb::new();
        let (_, addr) = fresh_address(0);
        let tx = u.request_funds(&addr).unwrap();
        let err = u.add_transaction((*tx).clone()).unwrap_err();
        assert!(matches!(err, LedgerError::Duplicate(_)));
    }

    #[test]
    fn test_double_spend_rejected() {
        let u = UtxoDb::new();
        let (key, addr) = fresh_address(0);
        let (_, target_a) = fresh_address(1);
        let (_, target_b) = fresh_address(2);
        let funding = u.request_funds(&addr).unwrap();

        let input = OutputId::new(addr, funding.id());
        let mut t1 = Transaction::new(
            vec![input],
            vec![(target_a, vec![Balance::iota(REQUEST_FUNDS_AMOUNT)])],
        );
        t1.sign(&key);
        let mut t2 = Transaction::new(
            vec![input],
            vec![(target_b, vec![Balance::iota(REQUEST_FUNDS_AMOUNT)])],
        );
        t2.sign(&key);

        u.add_transaction(t1).unwrap();
        let err = u.add_transaction(t2).unwrap_err();
        assert!(matches!(err, LedgerError::DoubleSpend { .. }));
        assert_eq!(balance_of(&u, &target_a), REQUEST_FUNDS_AMOUNT);
        assert_eq!(balance_of(&u, &target_b), 0);
    }

    #[test]
    fn test_unbalanced_transaction_rejected() {
        let u = UtxoDb::new();
        let (key, addr) = fresh_address(0);
        let (_, target) = fresh_address(1);
        let funding = u.request_funds(&addr).unwrap();

        let mut tx = Transaction::new(
            vec![OutputId::new(addr, funding.id())],
            vec![(target, vec![Balance::iota(REQUEST_FUNDS_AMOUNT + 1)])],
        );
        tx.sign(&key);
        assert!(matches!(
            u.add_transaction(tx),
            Err(LedgerError::Unbalanced(_, _))
        ));
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let u = UtxoDb::new();
        let (_, addr) = fresh_address(0);
        let (other_key, _) = fresh_address(3);
        let (_, target) = fresh_address(1);
        let funding = u.request_funds(&addr).unwrap();

        let mut tx = Transaction::new(
            vec![OutputId::new(addr, funding.id())],
            vec![(target, vec![Balance::iota(REQUEST_FUNDS_AMOUNT)])],
        );
        tx.sign(&other_key);
        assert!(matches!(
            u.add_transaction(tx),
            Err(LedgerError::InvalidSignatures(_))
        ));
    }

    #[test]
    fn test_mint_colored_tokens() {
        let u = UtxoDb::new();
        let (key, addr) = fresh_address(0);
        let funding = u.request_funds(&addr).unwrap();

        // color 100 of the faucet tokens, keep the rest native
        let mut mint = Transaction::new(
            vec![OutputId::new(addr, funding.id())],
            vec![(
                addr,
                vec![
                    Balance::new(Color::NEW, 100),
                    Balance::iota(REQUEST_FUNDS_AMOUNT - 100),
                ],
            )],
        );
        mint.sign(&key);
        let mint = u.add_transaction(mint).unwrap();

        // the view reports the minted color as the minting tx id
        let outputs = u.get_address_outputs(&addr);
        let balances = outputs.get(&OutputId::new(addr, mint.id())).unwrap();
        assert!(balances.contains(&Balance::new(Color::from(mint.id()), 100)));
        assert!(balances.contains(&Balance::iota(REQUEST_FUNDS_AMOUNT - 100)));
        assert_eq!(balance_of(&u, &addr), REQUEST_FUNDS_AMOUNT);

        // the colored tokens can be passed on under their minted color
        let (_, target) = fresh_address(1);
        let mut spend = Transaction::new(
            vec![OutputId::new(addr, mint.id())],
            vec![
                (target, vec![Balance::new(Color::from(mint.id()), 100)]),
                (addr, vec![Balance::iota(REQUEST_FUNDS_AMOUNT - 100)]),
            ],
        );
        spend.sign(&key);
        u.add_transaction(spend).unwrap();
        assert_eq!(balance_of(&u, &target), 100);
    }

    #[test]
    fn test_are_conflicting() {
        let u = UtxoDb::new();
        let (key, addr) = fresh_address(0);
        let (_, target) = fresh_address(1);
        let funding = u.request_funds(&addr).unwrap();

        let input = OutputId::new(addr, funding.id());
        let mut t1 = Transaction::new(
            vec![input],
            vec![(target, vec![Balance::iota(REQUEST_FUNDS_AMOUNT)])],
        );
        t1.sign(&key);
        let mut t2 = Transaction::new(
            vec![input],
            vec![(addr, vec![Balance::iota(REQUEST_FUNDS_AMOUNT)])],
        );
        t2.sign(&key);

        assert!(UtxoDb::are_conflicting(&t1, &t1));
        assert!(UtxoDb::are_conflicting(&t1, &t2));

        let disjoint = Transaction::new(
            vec![OutputId::new(addr, TxId([0xAA; 32]))],
            vec![(target, vec![Balance::iota(1)])],
        );
        assert!(!UtxoDb::are_conflicting(&t1, &disjoint));
    }

    #[test]
    fn test_ledger_stats() {
        let u = UtxoDb::new();
        let (_, addr) = fresh_address(0);
        u.request_funds(&addr).unwrap();

        let stats = u.ledger_stats();
        assert_eq!(stats[&addr].total, REQUEST_FUNDS_AMOUNT);
        assert_eq!(stats[&addr].num_outputs, 1);
        assert_eq!(
            stats[&u.genesis_address()].total,
            SUPPLY - REQUEST_FUNDS_AMOUNT
        );
        let total: i64 = stats.values().map(|s| s.total).sum();
        assert_eq!(total, SUPPLY);
    }
}
