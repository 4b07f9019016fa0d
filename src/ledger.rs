//! The ledger adapter: the single surface the connection engine depends on.
//!
//! Two implementations exist. [`EmulatorLedger`] runs against the in-memory
//! UTXO emulator. [`TangleLedger`] runs against an external value tangle
//! expressed as the [`TangleSource`] trait; the host that embeds this crate
//! provides the source. The engine never branches on which one is active.

use crate::transaction::Transaction;
use crate::types::{Address, Balance, InclusionState, OutputId, TxId};
use crate::utxodb::confirm::ConfirmEmulator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transaction {0} is unbalanced: {1}")]
    Unbalanced(TxId, &'static str),

    #[error("invalid signatures in transaction {0}")]
    InvalidSignatures(TxId),

    #[error("duplicate transaction {0}")]
    Duplicate(TxId),

    #[error("unknown output {output} referenced by transaction {txid}")]
    UnknownOutput { txid: TxId, output: OutputId },

    #[error("conflict/double spend: output {output} already spent, transaction {txid}")]
    DoubleSpend { txid: TxId, output: OutputId },

    #[error("rejected: transaction {txid} conflicts with pending transaction {pending_txid}")]
    ConflictsWithPending { txid: TxId, pending_txid: TxId },

    #[error("not enough balance on the faucet source")]
    NotEnoughFunds,

    #[error("ledger backend unavailable: {0}")]
    Backend(String),
}

/// One observed ledger state change, as delivered to the connection engine.
#[derive(Clone, Debug)]
pub enum LedgerEvent {
    Confirmed(Arc<Transaction>),
    /// The flag is true while a conflict decision is still outstanding.
    Booked(Arc<Transaction>, bool),
    Rejected(Arc<Transaction>),
}

pub type ConfirmedHandler = Box<dyn Fn(Arc<Transaction>) + Send + Sync>;
pub type BookedHandler = Box<dyn Fn(Arc<Transaction>, bool) + Send + Sync>;
pub type RejectedHandler = Box<dyn Fn(Arc<Transaction>) + Send + Sync>;

/// Uniform access to whichever ledger backs the bridge.
///
/// The three event hooks are single-handler slots: re-registering replaces
/// the previous handler, and they are meant to be set once at attach time.
pub trait Ledger: Send + Sync {
    /// Confirmed and unspent outputs of an address.
    fn get_confirmed_address_outputs(
        &self,
        addr: &Address,
    ) -> Result<HashMap<OutputId, Vec<Balance>>, LedgerError>;

    fn get_confirmed_transaction(&self, txid: &TxId) -> Option<Arc<Transaction>>;

    fn get_inclusion_state(&self, txid: &TxId) -> InclusionState;

    fn is_confirmed(&self, txid: &TxId) -> Result<bool, LedgerError>;

    fn post_transaction(&self, tx: Transaction) -> Result<(), LedgerError>;

    fn request_funds(&self, target: &Address) -> Result<(), LedgerError>;

    fn on_transaction_confirmed(&self, cb: ConfirmedHandler);

    fn on_transaction_booked(&self, cb: BookedHandler);

    fn on_transaction_rejected(&self, cb: RejectedHandler);

    /// Break the binding to the underlying event source. Idempotent.
    fn detach(&self);
}

#[derive(Default)]
struct HandlerSlots {
    confirmed: Mutex<Option<ConfirmedHandler>>,
    booked: Mutex<Option<BookedHandler>>,
    rejected: Mutex<Option<RejectedHandler>>,
}

impl HandlerSlots {
    fn dispatch(&self, event: LedgerEvent) {
        match event {
            LedgerEvent::Confirmed(tx) => {
                if let Some(cb) = self.confirmed.lock().as_ref() {
                    cb(tx);
                }
            }
            LedgerEvent::Booked(tx, decision_pending) => {
                if let Some(cb) = self.booked.lock().as_ref() {
                    cb(tx, decision_pending);
                }
            }
            LedgerEvent::Rejected(tx) => {
                if let Some(cb) = self.rejected.lock().as_ref() {
                    cb(tx);
                }
            }
        }
    }

    fn clear(&self) {
        self.confirmed.lock().take();
        self.booked.lock().take();
        self.rejected.lock().take();
    }
}

/// Adapter over the in-memory UTXO emulator. One instance per connection:
/// each owns its handler slots and its forwarding task off the emulator's
/// event hub.
pub struct EmulatorLedger {
    emulator: Arc<ConfirmEmulator>,
    handlers: Arc<HandlerSlots>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl EmulatorLedger {
    pub fn new(emulator: Arc<ConfirmEmulator>) -> Self {
        let handlers = Arc::new(HandlerSlots::default());
        let forwarder = spawn_event_forwarder(emulator.subscribe(), handlers.clone());
        EmulatorLedger {
            emulator,
            handlers,
            forwarder: Mutex::new(Some(forwarder)),
        }
    }
}

fn spawn_event_forwarder(
    mut rx: broadcast::Receiver<LedgerEvent>,
    handlers: Arc<HandlerSlots>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => handlers.dispatch(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("ledger event forwarder lagged, lost {} event(s)", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

impl Ledger for EmulatorLedger {
    fn get_confirmed_address_outputs(
        &self,
        addr: &Address,
    ) -> Result<HashMap<OutputId, Vec<Balance>>, LedgerError> {
        Ok(self.emulator.utxodb().get_address_outputs(addr))
    }

    fn get_confirmed_transaction(&self, txid: &TxId) -> Option<Arc<Transaction>> {
        self.emulator.utxodb().get_transaction(txid)
    }

    fn get_inclusion_state(&self, txid: &TxId) -> InclusionState {
        if self.emulator.utxodb().is_confirmed(txid) {
            InclusionState::Confirmed
        } else if self.emulator.is_pending(txid) {
            InclusionState::Booked
        } else {
            InclusionState::Undef
        }
    }

    fn is_confirmed(&self, txid: &TxId) -> Result<bool, LedgerError> {
        Ok(self.emulator.utxodb().is_confirmed(txid))
    }

    fn post_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        self.emulator.add_transaction(tx, None)
    }

    fn request_funds(&self, target: &Address) -> Result<(), LedgerError> {
        self.emulator.request_funds(target)
    }

    fn on_transaction_confirmed(&self, cb: ConfirmedHandler) {
        *self.handlers.confirmed.lock() = Some(cb);
    }

    fn on_transaction_booked(&self, cb: BookedHandler) {
        *self.handlers.booked.lock() = Some(cb);
    }

    fn on_transaction_rejected(&self, cb: RejectedHandler) {
        *self.handlers.rejected.lock() = Some(cb);
    }

    fn detach(&self) {
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        self.handlers.clear();
    }
}

impl Drop for EmulatorLedger {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Inclusion metadata of a transaction known to the tangle.
#[derive(Clone, Copy, Debug, Default)]
pub struct TxMetadata {
    pub confirmed: bool,
    pub rejected: bool,
}

/// A cached transaction handle loaned out by the tangle. The underlying
/// cache entry is released when the last clone is dropped; the adapter
/// consumes handles promptly and never stores them.
#[derive(Clone)]
pub struct TangleTxHandle {
    tx: Arc<Transaction>,
    _release: Arc<ReleaseOnDrop>,
}

impl std::fmt::Debug for TangleTxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TangleTxHandle").field("tx", &self.tx).finish()
    }
}

struct ReleaseOnDrop(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(release) = self.0.lock().take() {
            release();
        }
    }
}

impl TangleTxHandle {
    pub fn new(tx: Arc<Transaction>, release: impl FnOnce() + Send + 'static) -> Self {
        TangleTxHandle {
            tx,
            _release: Arc::new(ReleaseOnDrop(Mutex::new(Some(Box::new(release))))),
        }
    }

    /// The transaction behind the handle.
    pub fn transaction(&self) -> Arc<Transaction> {
        self.tx.clone()
    }
}

/// Raw event feed of an external value tangle.
#[derive(Clone, Debug)]
pub enum TangleEvent {
    Confirmed(TangleTxHandle),
    Booked {
        handle: TangleTxHandle,
        decision_pending: bool,
    },
    Rejected(TangleTxHandle),
}

/// The external value tangle as the adapter sees it. Implementations are
/// provided by the embedding host.
pub trait TangleSource: Send + Sync + 'static {
    fn load_transaction(&self, txid: &TxId) -> Option<TangleTxHandle>;

    fn load_metadata(&self, txid: &TxId) -> Option<TxMetadata>;

    /// Confirmed and unspent outputs only; unconfirmed outputs with no
    /// consumers yet must not appear here.
    fn confirmed_address_outputs(
        &self,
        addr: &Address,
    ) -> Result<HashMap<OutputId, Vec<Balance>>, LedgerError>;

    fn post_transaction(&self, tx: Transaction) -> Result<(), LedgerError>;

    fn request_funds(&self, target: &Address) -> Result<(), LedgerError>;

    fn subscribe(&self) -> broadcast::Receiver<TangleEvent>;
}

/// Adapter over an external value tangle. Unwraps event handles and
/// releases them in the forwarding task, whether or not a handler is
/// attached.
pub struct TangleLedger {
    source: Arc<dyn TangleSource>,
    handlers: Arc<HandlerSlots>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl TangleLedger {
    pub fn new(source: Arc<dyn TangleSource>) -> Self {
        let handlers = Arc::new(HandlerSlots::default());
        let mut rx = source.subscribe();
        let task_handlers = handlers.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // unwrap the handle and drop it here: the cache
                        // entry is released even when no handler is set
                        let event = match event {
                            TangleEvent::Confirmed(handle) => {
                                LedgerEvent::Confirmed(handle.transaction())
                            }
                            TangleEvent::Booked {
                                handle,
                                decision_pending,
                            } => LedgerEvent::Booked(handle.transaction(), decision_pending),
                            TangleEvent::Rejected(handle) => {
                                LedgerEvent::Rejected(handle.transaction())
                            }
                        };
                        task_handlers.dispatch(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("tangle event forwarder lagged, lost {} event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        TangleLedger {
            source,
            handlers,
            forwarder: Mutex::new(Some(forwarder)),
        }
    }
}

impl Ledger for TangleLedger {
    fn get_confirmed_address_outputs(
        &self,
        addr: &Address,
    ) -> Result<HashMap<OutputId, Vec<Balance>>, LedgerError> {
        self.source.confirmed_address_outputs(addr)
    }

    fn get_confirmed_transaction(&self, txid: &TxId) -> Option<Arc<Transaction>> {
        let handle = self.source.load_transaction(txid)?;
        let meta = self.source.load_metadata(txid)?;
        if meta.confirmed {
            Some(handle.transaction())
        } else {
            None
        }
    }

    fn get_inclusion_state(&self, txid: &TxId) -> InclusionState {
        let Some(_handle) = self.source.load_transaction(txid) else {
            return InclusionState::Undef;
        };
        match self.source.load_metadata(txid) {
            None => InclusionState::Undef,
            Some(meta) if meta.rejected => InclusionState::Rejected,
            Some(meta) if meta.confirmed => InclusionState::Confirmed,
            Some(_) => InclusionState::Booked,
        }
    }

    fn is_confirmed(&self, txid: &TxId) -> Result<bool, LedgerError> {
        Ok(self
            .source
            .load_metadata(txid)
            .map(|meta| meta.confirmed)
            .unwrap_or(false))
    }

    fn post_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        self.source.post_transaction(tx)
    }

    fn request_funds(&self, target: &Address) -> Result<(), LedgerError> {
        self.source.request_funds(target)
    }

    fn on_transaction_confirmed(&self, cb: ConfirmedHandler) {
        *self.handlers.confirmed.lock() = Some(cb);
    }

    fn on_transaction_booked(&self, cb: BookedHandler) {
        *self.handlers.booked.lock() = Some(cb);
    }

    fn on_transaction_rejected(&self, cb: RejectedHandler) {
        *self.handlers.rejected.lock() = Some(cb);
    }

    fn detach(&self) {
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        self.handlers.clear();
    }
}

impl Drop for TangleLedger {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Balance;
    use crate::utxodb::confirm::ConfirmConfig;
    use crate::utxodb::signing_key_from_seed;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fresh_address(index: u64) -> Address {
        let key = signing_key_from_seed("C6hPhCS2E2dKUGS3qj4264itKXohwgL3Lm2fNxayAKr", index);
        Address::from_public_key(&key.verifying_key())
    }

    #[tokio::test]
    async fn test_emulator_adapter_inclusion_states() {
        let emulator = Arc::new(ConfirmEmulator::new(ConfirmConfig::default()));
        let ledger = EmulatorLedger::new(emulator.clone());

        let addr = fresh_address(0);
        assert_eq!(
            ledger.get_inclusion_state(&TxId([5u8; 32])),
            InclusionState::Undef
        );

        ledger.request_funds(&addr).unwrap();
        let outputs = ledger.get_confirmed_address_outputs(&addr).unwrap();
        assert_eq!(outputs.len(), 1);
        let txid = outputs.keys().next().unwrap().txid;
        assert_eq!(ledger.get_inclusion_state(&txid), InclusionState::Confirmed);
        assert!(ledger.is_confirmed(&txid).unwrap());
        assert!(ledger.get_confirmed_transaction(&txid).is_some());
    }

    #[tokio::test]
    async fn test_emulator_adapter_detach_is_idempotent() {
        let emulator = Arc::new(ConfirmEmulator::new(ConfirmConfig::default()));
        let ledger = EmulatorLedger::new(emulator);
        ledger.on_transaction_confirmed(Box::new(|_| {}));
        ledger.detach();
        ledger.detach();
    }

    struct MockSource {
        tx: Arc<Transaction>,
        meta: Option<TxMetadata>,
        releases: Arc<AtomicUsize>,
        events: broadcast::Sender<TangleEvent>,
    }

    impl MockSource {
        fn new(meta: Option<TxMetadata>) -> Self {
            let key = signing_key_from_seed("C6hPhCS2E2dKUGS3qj4264itKXohwgL3Lm2fNxayAKr", 9);
            let addr = Address::from_public_key(&key.verifying_key());
            let mut tx = Transaction::new(
                vec![OutputId::new(addr, TxId([1u8; 32]))],
                vec![(addr, vec![Balance::iota(1)])],
            );
            tx.sign(&key);
            let (events, _) = broadcast::channel(16);
            MockSource {
                tx: Arc::new(tx),
                meta,
                releases: Arc::new(AtomicUsize::new(0)),
                events,
            }
        }

        fn handle(&self) -> TangleTxHandle {
            let releases = self.releases.clone();
            TangleTxHandle::new(self.tx.clone(), move || {
                releases.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    impl TangleSource for MockSource {
        fn load_transaction(&self, txid: &TxId) -> Option<TangleTxHandle> {
            (*txid == self.tx.id()).then(|| self.handle())
        }

        fn load_metadata(&self, txid: &TxId) -> Option<TxMetadata> {
            if *txid == self.tx.id() {
                self.meta
            } else {
                None
            }
        }

        fn confirmed_address_outputs(
            &self,
            _addr: &Address,
        ) -> Result<HashMap<OutputId, Vec<Balance>>, LedgerError> {
            Ok(HashMap::new())
        }

        fn post_transaction(&self, _tx: Transaction) -> Result<(), LedgerError> {
            Ok(())
        }

        fn request_funds(&self, _target: &Address) -> Result<(), LedgerError> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<TangleEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test]
    async fn test_tangle_adapter_inclusion_mapping() {
        let cases = [
            (None, InclusionState::Undef),
            (
                Some(TxMetadata {
                    confirmed: false,
                    rejected: false,
                }),
                InclusionState::Booked,
            ),
            (
                Some(TxMetadata {
                    confirmed: true,
                    rejected: false,
                }),
                InclusionState::Confirmed,
            ),
            (
                Some(TxMetadata {
                    confirmed: false,
                    rejected: true,
                }),
                InclusionState::Rejected,
            ),
        ];
        for (meta, expected) in cases {
            let source = Arc::new(MockSource::new(meta));
            let txid = source.tx.id();
            let ledger = TangleLedger::new(source.clone());
            assert_eq!(ledger.get_inclusion_state(&txid), expected);
            // unknown transactions map to undef regardless of metadata
            assert_eq!(
                ledger.get_inclusion_state(&TxId([0xEE; 32])),
                InclusionState::Undef
            );
        }
    }

    #[tokio::test]
    async fn test_tangle_adapter_releases_event_handles() {
        let source = Arc::new(MockSource::new(Some(TxMetadata {
            confirmed: true,
            rejected: false,
        })));
        let ledger = TangleLedger::new(source.clone());

        // no handler registered: the handle must still be released
        source
            .events
            .send(TangleEvent::Confirmed(source.handle()))
            .unwrap();
        tokio::task::yield_now().await;
        for _ in 0..100 {
            if source.releases.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);
        ledger.detach();
    }
}
