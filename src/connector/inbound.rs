//! Dispatch of messages received from the wasp client.

use super::WaspConnector;
use crate::chopper::CHUNK_HEADER_SIZE;
use crate::transaction::Transaction;
use crate::types::{Address, InclusionState};
use crate::wire::framing::MAX_MESSAGE_SIZE;
use crate::wire::msg::{outputs_to_balances, WaspMessage, CHUNK_MESSAGE_OVERHEAD};
use crate::wire::WireError;
use std::sync::Arc;
use tracing::{debug, error, warn};

impl WaspConnector {
    /// Decode and dispatch one message from the client. Chunk messages loop
    /// back through the reassembler until a full message emerges.
    pub(super) async fn process_msg_data(self: &Arc<Self>, data: Vec<u8>) {
        let mut data = data;
        loop {
            let msg = match WaspMessage::decode(&data, false) {
                Ok(msg) => msg,
                Err(WireError::BadMessageCode(code)) => {
                    // the peer is confused or hostile
                    error!("{}: unknown message code {}, closing", self.id(), code);
                    self.token.cancel();
                    return;
                }
                Err(e) => {
                    error!("{}: dropping message: {}", self.id(), e);
                    return;
                }
            };

            match msg {
                WaspMessage::Chunk { data: chunk } => {
                    let max_chunk = MAX_MESSAGE_SIZE - CHUNK_MESSAGE_OVERHEAD;
                    match self.chopper.incoming_chunk(&chunk, max_chunk) {
                        Ok(Some(full)) => {
                            data = full;
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("{}: bad chunk: {}", self.id(), e),
                    }
                }

                WaspMessage::Ping { id, timestamp } => {
                    debug!("{}: ping {} received", self.id(), id);
                    if let Err(e) = self.send_msg(&WaspMessage::Ping { id, timestamp }).await {
                        warn!("{}: responding to ping: {}", self.id(), e);
                    }
                }

                WaspMessage::PostTransaction { tx, sc_address, .. } => {
                    self.post_transaction(tx, &sc_address);
                }

                WaspMessage::Subscribe {
                    addresses_with_colors,
                } => {
                    for ac in &addresses_with_colors {
                        self.subscribe(&ac.address);
                    }
                    // backlog is pushed off the dispatch path
                    let conn = self.clone();
                    tokio::spawn(async move {
                        for ac in &addresses_with_colors {
                            conn.push_backlog(&ac.address, &ac.color).await;
                        }
                    });
                }

                WaspMessage::GetConfirmedTransaction { txid } => {
                    debug!("{}: requested transaction {}", self.id(), txid);
                    let Some(tx) = self.ledger.get_confirmed_transaction(&txid) else {
                        debug!("{}: transaction {} not found", self.id(), txid);
                        return;
                    };
                    let msg = WaspMessage::ConfirmedTransaction {
                        tx: (*tx).clone(),
                    };
                    if let Err(e) = self.send_msg(&msg).await {
                        warn!("{}: sending confirmed transaction: {}", self.id(), e);
                    }
                }

                WaspMessage::GetTxInclusionState { txid, sc_address } => {
                    let state = self.ledger.get_inclusion_state(&txid);
                    if state == InclusionState::Undef {
                        debug!("{}: inclusion state of {} is undef", self.id(), txid);
                        return;
                    }
                    let msg = WaspMessage::TxInclusionState {
                        state,
                        txid,
                        subscribed_addresses: vec![sc_address],
                    };
                    if let Err(e) = self.send_msg(&msg).await {
                        warn!("{}: sending inclusion state: {}", self.id(), e);
                    }
                }

                WaspMessage::GetOutputs { address } => {
                    self.get_address_balance(&address).await;
                }

                WaspMessage::SetId { wasp_id } => self.set_id(wasp_id),

                // node-originated messages are rejected by the direction
                // check in decode
                WaspMessage::ConfirmedTransaction { .. }
                | WaspMessage::AddressUpdate { .. }
                | WaspMessage::AddressOutputs { .. }
                | WaspMessage::TxInclusionState { .. } => {
                    unreachable!("direction check admitted a node message")
                }
            }
            return;
        }
    }

    fn post_transaction(&self, tx: Transaction, sc_address: &Address) {
        let txid = tx.id();
        if let Err(e) = self.ledger.post_transaction(tx) {
            // no reply: the client polls the inclusion state
            warn!("{}: posting transaction {}: {}", self.id(), txid, e);
            return;
        }
        debug!(
            "{}: posted transaction {} for chain {}",
            self.id(),
            txid,
            sc_address
        );
    }

    async fn get_address_balance(&self, addr: &Address) {
        debug!("{}: balance requested for address {}", self.id(), addr);
        let outputs = match self.ledger.get_confirmed_address_outputs(addr) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("{}: reading outputs of {}: {}", self.id(), addr, e);
                return;
            }
        };
        if outputs.is_empty() {
            return;
        }
        let msg = WaspMessage::AddressOutputs {
            address: *addr,
            balances: outputs_to_balances(&outputs),
        };
        if let Err(e) = self.send_msg(&msg).await {
            warn!("{}: sending address outputs: {}", self.id(), e);
        }
    }
}

const _: () = assert!(MAX_MESSAGE_SIZE - CHUNK_MESSAGE_OVERHEAD > CHUNK_HEADER_SIZE);
