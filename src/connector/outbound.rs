//! Sending messages to the wasp client and pushing ledger events.

use super::WaspConnector;
use crate::ledger::LedgerEvent;
use crate::transaction::Transaction;
use crate::types::{Address, Color, InclusionState, TxId};
use crate::wire::framing::{write_frame, MAX_MESSAGE_SIZE};
use crate::wire::msg::{outputs_to_balances, Balances, WaspMessage, CHUNK_MESSAGE_OVERHEAD};
use crate::wire::WireResult;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

impl WaspConnector {
    /// Encode and write one message, chunking it when it exceeds the frame
    /// cap. Chunks of one message are written back to back.
    pub(super) async fn send_msg(&self, msg: &WaspMessage) -> WireResult<()> {
        let data = msg.encode()?;
        let max_chunk = MAX_MESSAGE_SIZE - CHUNK_MESSAGE_OVERHEAD;

        match self.chopper.chop_data(&data, max_chunk) {
            None => {
                let mut writer = self.writer.lock().await;
                write_frame(&mut *writer, &data).await
            }
            Some(chunks) => {
                debug!(
                    "{}: {} bytes long message was split into {} chunks",
                    self.id(),
                    data.len(),
                    chunks.len()
                );
                let mut writer = self.writer.lock().await;
                for piece in chunks {
                    let wrapped = WaspMessage::Chunk { data: piece }.encode()?;
                    assert!(
                        wrapped.len() <= MAX_MESSAGE_SIZE,
                        "chunked message exceeds the frame cap"
                    );
                    write_frame(&mut *writer, &wrapped).await?;
                }
                Ok(())
            }
        }
    }

    pub(super) async fn handle_event(&self, event: LedgerEvent) {
        match event {
            LedgerEvent::Confirmed(tx) => self.process_confirmed_transaction(&tx).await,
            LedgerEvent::Booked(tx, _decision_pending) => {
                self.process_inclusion_event(&tx, InclusionState::Booked)
                    .await
            }
            LedgerEvent::Rejected(tx) => {
                self.process_inclusion_event(&tx, InclusionState::Rejected)
                    .await
            }
        }
    }

    /// A confirmed transaction reaches the client only when one of its
    /// output addresses is subscribed; the engine is a filter.
    async fn process_confirmed_transaction(&self, tx: &Arc<Transaction>) {
        let txid = tx.id();
        debug!("{}: processing confirmed transaction {}", self.id(), txid);

        let subscribed = self.subscribed_output_addresses(tx);
        if subscribed.is_empty() {
            debug!("{}: not subscribed, dismissing {}", self.id(), txid);
            return;
        }

        for addr in &subscribed {
            let outputs = match self.ledger.get_confirmed_address_outputs(addr) {
                Ok(outputs) => outputs,
                Err(e) => {
                    warn!("{}: reading outputs of {}: {}", self.id(), addr, e);
                    continue;
                }
            };
            let result = self
                .send_address_update(addr, outputs_to_balances(&outputs), tx)
                .await;
            if let Err(e) = result {
                warn!("{}: sending address update: {}", self.id(), e);
            }
        }
    }

    /// Booked and rejected events share the subscription filter and are
    /// reported as one inclusion-state message naming the matching
    /// addresses.
    async fn process_inclusion_event(&self, tx: &Arc<Transaction>, state: InclusionState) {
        let subscribed = self.subscribed_output_addresses(tx);
        if subscribed.is_empty() {
            return;
        }
        let msg = WaspMessage::TxInclusionState {
            state,
            txid: tx.id(),
            subscribed_addresses: subscribed,
        };
        if let Err(e) = self.send_msg(&msg).await {
            warn!("{}: sending inclusion state: {}", self.id(), e);
        }
    }

    async fn send_address_update(
        &self,
        addr: &Address,
        balances: Balances,
        tx: &Transaction,
    ) -> WireResult<()> {
        self.send_msg(&WaspMessage::AddressUpdate {
            address: *addr,
            balances,
            tx: tx.clone(),
        })
        .await
    }

    /// Push the backlog of a freshly subscribed address: for every foreign
    /// color resident at the address, re-send the update for the
    /// transaction that created it.
    pub(super) async fn push_backlog(&self, addr: &Address, sc_color: &Color) {
        let outputs = match self.ledger.get_confirmed_address_outputs(addr) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("{}: reading backlog of {}: {}", self.id(), addr, e);
                return;
            }
        };
        if outputs.is_empty() {
            return;
        }
        let balances = outputs_to_balances(&outputs);

        let mut totals_by_color: HashMap<Color, i64> = HashMap::new();
        for bals in balances.values() {
            for b in bals {
                *totals_by_color.entry(b.color).or_insert(0) += b.value;
            }
        }

        let mut backlog_txids = Vec::new();
        for (color, total) in &totals_by_color {
            if *color == Color::IOTA {
                continue;
            }
            if *color == Color::NEW {
                warn!("{}: unexpected uncolored token at {}", self.id(), addr);
                continue;
            }
            if color == sc_color && *total == 1 {
                // the chain's own identity token is not backlog
                continue;
            }
            backlog_txids.push(TxId::from(*color));
        }

        for txid in backlog_txids {
            let Some(tx) = self.ledger.get_confirmed_transaction(&txid) else {
                // the creating transaction was snapshotted out of history
                warn!("{}: can't find backlog transaction {}", self.id(), txid);
                continue;
            };
            let result = self.send_address_update(addr, balances.clone(), &tx).await;
            if let Err(e) = result {
                debug!("{}: sending backlog update: {}", self.id(), e);
            }
        }
    }
}
