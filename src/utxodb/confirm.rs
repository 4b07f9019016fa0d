//! Confirmation-delay emulation on top of the UTXO ledger.
//!
//! With a zero confirmation time every transaction is validated and applied
//! synchronously. Otherwise accepted transactions sit in a pending map until
//! their deadline passes; a background loop applies matured transactions.
//! Two pending transactions spending a common output mark each other
//! conflicting: the newer one is rejected on arrival, the older one is
//! dropped at maturity unless the first-in-conflict policy confirms it.
//!
//! Every state change is published on a broadcast hub so that all attached
//! connections observe the same stream of ledger events.

use crate::ledger::{LedgerError, LedgerEvent};
use crate::transaction::Transaction;
use crate::types::{Address, TxId};
use crate::utxodb::UtxoDb;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const CONFIRM_LOOP_PERIOD: Duration = Duration::from_millis(500);
const EVENT_HUB_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct ConfirmConfig {
    /// Emulated confirmation delay; zero confirms synchronously.
    pub confirm_time: Duration,
    /// Draw each deadline uniformly from `[t/2, 3t/2)` instead of `t`.
    pub randomize: bool,
    /// Confirm the first of a conflict set instead of dropping all of it.
    pub confirm_first_in_conflict: bool,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        ConfirmConfig {
            confirm_time: Duration::ZERO,
            randomize: false,
            confirm_first_in_conflict: false,
        }
    }
}

pub type OnConfirm = Box<dyn FnOnce() + Send>;

struct PendingTransaction {
    confirm_deadline: Instant,
    tx: Arc<Transaction>,
    has_conflicts: bool,
    on_confirm: Option<OnConfirm>,
}

pub struct ConfirmEmulator {
    utxodb: UtxoDb,
    config: ConfirmConfig,
    pending: Mutex<HashMap<TxId, PendingTransaction>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl ConfirmEmulator {
    pub fn new(config: ConfirmConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_HUB_CAPACITY);
        ConfirmEmulator {
            utxodb: UtxoDb::new(),
            config,
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn utxodb(&self) -> &UtxoDb {
        &self.utxodb
    }

    pub fn config(&self) -> &ConfirmConfig {
        &self.config
    }

    /// Subscribe to the stream of ledger events.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    pub fn is_pending(&self, txid: &TxId) -> bool {
        self.pending.lock().contains_key(txid)
    }

    /// Accept a transaction for (emulated) confirmation. `on_confirm` fires
    /// once the transaction lands in the ledger; with a zero confirmation
    /// time that happens before this call returns.
    pub fn add_transaction(
        &self,
        tx: Transaction,
        on_confirm: Option<OnConfirm>,
    ) -> Result<(), LedgerError> {
        if self.config.confirm_time.is_zero() {
            let tx = self.utxodb.add_transaction(tx)?;
            if let Some(cb) = on_confirm {
                cb();
            }
            tracing::debug!("confirmed immediately: {}", tx.id());
            self.emit(LedgerEvent::Confirmed(tx));
            return Ok(());
        }

        self.utxodb.validate_transaction(&tx)?;
        let tx = Arc::new(tx);
        let txid = tx.id();

        let mut pending = self.pending.lock();
        for (pending_txid, ptx) in pending.iter_mut() {
            if UtxoDb::are_conflicting(&tx, &ptx.tx) {
                ptx.has_conflicts = true;
                return Err(LedgerError::ConflictsWithPending {
                    txid,
                    pending_txid: *pending_txid,
                });
            }
        }

        let delay = if self.config.randomize {
            let t = self.config.confirm_time.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(t / 2..t + t / 2))
        } else {
            self.config.confirm_time
        };
        pending.insert(
            txid,
            PendingTransaction {
                confirm_deadline: Instant::now() + delay,
                tx: tx.clone(),
                has_conflicts: false,
                on_confirm,
            },
        );
        drop(pending);

        tracing::debug!("added pending transaction: {}", txid);
        self.emit(LedgerEvent::Booked(tx, false));
        Ok(())
    }

    /// Faucet. Applied without confirmation delay, as the real faucet
    /// endpoint does.
    pub fn request_funds(&self, target: &Address) -> Result<(), LedgerError> {
        let tx = self.utxodb.request_funds(target)?;
        tracing::debug!("faucet sent funds to {} with {}", target, tx.id());
        self.emit(LedgerEvent::Confirmed(tx));
        Ok(())
    }

    /// Background loop applying matured pending transactions.
    pub fn spawn_confirm_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let emulator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONFIRM_LOOP_PERIOD);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => emulator.confirm_matured(),
                }
            }
        })
    }

    fn confirm_matured(&self) {
        let nowis = Instant::now();
        let mut pending = self.pending.lock();
        let matured: Vec<TxId> = pending
            .iter()
            .filter(|(_, ptx)| ptx.confirm_deadline <= nowis)
            .map(|(txid, _)| *txid)
            .collect();

        for txid in matured {
            let ptx = pending.remove(&txid).unwrap();
            if ptx.has_conflicts && !self.config.confirm_first_in_conflict {
                tracing::warn!("rejected because of conflicts: {}", txid);
                self.emit(LedgerEvent::Rejected(ptx.tx));
                continue;
            }
            match self.utxodb.add_transaction((*ptx.tx).clone()) {
                Ok(tx) => {
                    if let Some(cb) = ptx.on_confirm {
                        cb();
                    }
                    tracing::info!(
                        "confirmed {} after {:?}",
                        txid,
                        self.config.confirm_time
                    );
                    self.emit(LedgerEvent::Confirmed(tx));
                }
                Err(e) => {
                    tracing::warn!("could not confirm {}: {}", txid, e);
                    self.emit(LedgerEvent::Rejected(ptx.tx));
                }
            }
        }
    }

    fn emit(&self, event: LedgerEvent) {
        // send fails when no connection is attached
        let _ = self.events.send(event);
    }
}
