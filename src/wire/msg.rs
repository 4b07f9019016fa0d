//! The closed message set of the client link.
//!
//! Every frame body is one encoded [`WaspMessage`]: a one-byte message code
//! followed by the body. Codes are stable wire constants; decoding enforces
//! that a message originates from the correct side of the link.

use crate::transaction::Transaction;
use crate::types::{Address, Balance, Color, InclusionState, OutputId, TxId};
use crate::wire::{io, WireError, WireResult};
use std::collections::{BTreeMap, HashMap};

const MSG_PING: u8 = 0;
const MSG_CHUNK: u8 = 1;
// wasp -> node
const MSG_TO_NODE_POST_TRANSACTION: u8 = 2;
const MSG_TO_NODE_SUBSCRIBE: u8 = 3;
const MSG_TO_NODE_GET_CONFIRMED_TRANSACTION: u8 = 4;
const MSG_TO_NODE_GET_TX_INCLUSION_STATE: u8 = 5;
const MSG_TO_NODE_GET_OUTPUTS: u8 = 6;
const MSG_TO_NODE_SET_ID: u8 = 7;
// node -> wasp
const MSG_FROM_NODE_CONFIRMED_TRANSACTION: u8 = 8;
const MSG_FROM_NODE_ADDRESS_UPDATE: u8 = 9;
const MSG_FROM_NODE_ADDRESS_OUTPUTS: u8 = 10;
const MSG_FROM_NODE_TX_INCLUSION_STATE: u8 = 11;

/// Overhead of wrapping a chunk frame into a `Chunk` message: the message
/// code byte plus the 16-bit length prefix of the data field.
pub const CHUNK_MESSAGE_OVERHEAD: usize = 3;

/// Balances grouped by the transaction that created them. Ordered so that
/// encoding is deterministic and re-encoding is byte-identical.
pub type Balances = BTreeMap<TxId, Vec<Balance>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressColor {
    pub address: Address,
    pub color: Color,
}

#[derive(Clone, Debug)]
pub enum WaspMessage {
    /// Echoed back verbatim by the peer.
    Ping { id: u32, timestamp: i64 },
    /// One output of the chunker; reassembled and re-dispatched on receipt.
    Chunk { data: Vec<u8> },
    PostTransaction {
        tx: Transaction,
        sc_address: Address,
        leader: u16,
    },
    Subscribe {
        addresses_with_colors: Vec<AddressColor>,
    },
    GetConfirmedTransaction { txid: TxId },
    GetTxInclusionState { txid: TxId, sc_address: Address },
    GetOutputs { address: Address },
    SetId { wasp_id: String },
    ConfirmedTransaction { tx: Transaction },
    AddressUpdate {
        address: Address,
        balances: Balances,
        tx: Transaction,
    },
    AddressOutputs { address: Address, balances: Balances },
    TxInclusionState {
        state: InclusionState,
        txid: TxId,
        subscribed_addresses: Vec<Address>,
    },
}

impl WaspMessage {
    fn code(&self) -> u8 {
        match self {
            WaspMessage::Ping { .. } => MSG_PING,
            WaspMessage::Chunk { .. } => MSG_CHUNK,
            WaspMessage::PostTransaction { .. } => MSG_TO_NODE_POST_TRANSACTION,
            WaspMessage::Subscribe { .. } => MSG_TO_NODE_SUBSCRIBE,
            WaspMessage::GetConfirmedTransaction { .. } => MSG_TO_NODE_GET_CONFIRMED_TRANSACTION,
            WaspMessage::GetTxInclusionState { .. } => MSG_TO_NODE_GET_TX_INCLUSION_STATE,
            WaspMessage::GetOutputs { .. } => MSG_TO_NODE_GET_OUTPUTS,
            WaspMessage::SetId { .. } => MSG_TO_NODE_SET_ID,
            WaspMessage::ConfirmedTransaction { .. } => MSG_FROM_NODE_CONFIRMED_TRANSACTION,
            WaspMessage::AddressUpdate { .. } => MSG_FROM_NODE_ADDRESS_UPDATE,
            WaspMessage::AddressOutputs { .. } => MSG_FROM_NODE_ADDRESS_OUTPUTS,
            WaspMessage::TxInclusionState { .. } => MSG_FROM_NODE_TX_INCLUSION_STATE,
        }
    }

    /// Message type name for logging.
    pub fn message_type(&self) -> &'static str {
        match self {
            WaspMessage::Ping { .. } => "Ping",
            WaspMessage::Chunk { .. } => "Chunk",
            WaspMessage::PostTransaction { .. } => "PostTransaction",
            WaspMessage::Subscribe { .. } => "Subscribe",
            WaspMessage::GetConfirmedTransaction { .. } => "GetConfirmedTransaction",
            WaspMessage::GetTxInclusionState { .. } => "GetTxInclusionState",
            WaspMessage::GetOutputs { .. } => "GetOutputs",
            WaspMessage::SetId { .. } => "SetId",
            WaspMessage::ConfirmedTransaction { .. } => "ConfirmedTransaction",
            WaspMessage::AddressUpdate { .. } => "AddressUpdate",
            WaspMessage::AddressOutputs { .. } => "AddressOutputs",
            WaspMessage::TxInclusionState { .. } => "TxInclusionState",
        }
    }

    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut buf = Vec::new();
        io::write_u8(&mut buf, self.code());
        match self {
            WaspMessage::Ping { id, timestamp } => {
                io::write_u32(&mut buf, *id);
                io::write_u64(&mut buf, *timestamp as u64);
            }
            WaspMessage::Chunk { data } => {
                io::write_bytes16(&mut buf, data);
            }
            WaspMessage::PostTransaction {
                tx,
                sc_address,
                leader,
            } => {
                io::write_bytes32(&mut buf, &tx.to_bytes());
                io::write_address(&mut buf, sc_address);
                io::write_u16(&mut buf, *leader);
            }
            WaspMessage::Subscribe {
                addresses_with_colors,
            } => {
                io::write_u16(&mut buf, addresses_with_colors.len() as u16);
                for ac in addresses_with_colors {
                    io::write_address(&mut buf, &ac.address);
                    io::write_color(&mut buf, &ac.color);
                }
            }
            WaspMessage::GetConfirmedTransaction { txid } => {
                io::write_txid(&mut buf, txid);
            }
            WaspMessage::GetTxInclusionState { txid, sc_address } => {
                io::write_txid(&mut buf, txid);
                io::write_address(&mut buf, sc_address);
            }
            WaspMessage::GetOutputs { address } => {
                io::write_address(&mut buf, address);
            }
            WaspMessage::SetId { wasp_id } => {
                io::write_string16(&mut buf, wasp_id);
            }
            WaspMessage::ConfirmedTransaction { tx } => {
                io::write_bytes32(&mut buf, &tx.to_bytes());
            }
            WaspMessage::AddressUpdate {
                address,
                balances,
                tx,
            } => {
                io::write_address(&mut buf, address);
                write_balances(&mut buf, balances)?;
                io::write_bytes32(&mut buf, &tx.to_bytes());
            }
            WaspMessage::AddressOutputs { address, balances } => {
                io::write_address(&mut buf, address);
                write_balances(&mut buf, balances)?;
            }
            WaspMessage::TxInclusionState {
                state,
                txid,
                subscribed_addresses,
            } => {
                io::write_u8(&mut buf, state.to_byte());
                io::write_txid(&mut buf, txid);
                io::write_u16(&mut buf, subscribed_addresses.len() as u16);
                for addr in subscribed_addresses {
                    io::write_address(&mut buf, addr);
                }
            }
        }
        Ok(buf)
    }

    /// Decode one message. `wasp_side` is true when the decoder is the wasp
    /// client; messages that must not originate from the opposite peer are
    /// rejected.
    pub fn decode(data: &[u8], wasp_side: bool) -> WireResult<WaspMessage> {
        let mut r = data;
        let code = io::read_u8(&mut r)?;

        // a wasp client never receives client-originated requests, and the
        // node never receives its own notifications back
        let from_wasp =
            (MSG_TO_NODE_POST_TRANSACTION..=MSG_TO_NODE_SET_ID).contains(&code);
        let from_node =
            (MSG_FROM_NODE_CONFIRMED_TRANSACTION..=MSG_FROM_NODE_TX_INCLUSION_STATE)
                .contains(&code);
        if (from_wasp && wasp_side) || (from_node && !wasp_side) {
            return Err(WireError::WrongDirection(code));
        }

        let msg = match code {
            MSG_PING => {
                let id = io::read_u32(&mut r)?;
                let timestamp = io::read_u64(&mut r)? as i64;
                WaspMessage::Ping { id, timestamp }
            }
            MSG_CHUNK => WaspMessage::Chunk {
                data: io::read_bytes16(&mut r)?,
            },
            MSG_TO_NODE_POST_TRANSACTION => {
                let tx_bytes = io::read_bytes32(&mut r)?;
                let tx = Transaction::from_bytes(&tx_bytes)?;
                let sc_address = io::read_address(&mut r)?;
                let leader = io::read_u16(&mut r)?;
                WaspMessage::PostTransaction {
                    tx,
                    sc_address,
                    leader,
                }
            }
            MSG_TO_NODE_SUBSCRIBE => {
                let count = io::read_u16(&mut r)?;
                let mut addresses_with_colors = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let address = io::read_address(&mut r)?;
                    let color = io::read_color(&mut r)?;
                    addresses_with_colors.push(AddressColor { address, color });
                }
                WaspMessage::Subscribe {
                    addresses_with_colors,
                }
            }
            MSG_TO_NODE_GET_CONFIRMED_TRANSACTION => WaspMessage::GetConfirmedTransaction {
                txid: io::read_txid(&mut r)?,
            },
            MSG_TO_NODE_GET_TX_INCLUSION_STATE => {
                let txid = io::read_txid(&mut r)?;
                let sc_address = io::read_address(&mut r)?;
                WaspMessage::GetTxInclusionState { txid, sc_address }
            }
            MSG_TO_NODE_GET_OUTPUTS => WaspMessage::GetOutputs {
                address: io::read_address(&mut r)?,
            },
            MSG_TO_NODE_SET_ID => WaspMessage::SetId {
                wasp_id: io::read_string16(&mut r)?,
            },
            MSG_FROM_NODE_CONFIRMED_TRANSACTION => {
                let tx_bytes = io::read_bytes32(&mut r)?;
                WaspMessage::ConfirmedTransaction {
                    tx: Transaction::from_bytes(&tx_bytes)?,
                }
            }
            MSG_FROM_NODE_ADDRESS_UPDATE => {
                let address = io::read_address(&mut r)?;
                let balances = read_balances(&mut r)?;
                let tx_bytes = io::read_bytes32(&mut r)?;
                WaspMessage::AddressUpdate {
                    address,
                    balances,
                    tx: Transaction::from_bytes(&tx_bytes)?,
                }
            }
            MSG_FROM_NODE_ADDRESS_OUTPUTS => {
                let address = io::read_address(&mut r)?;
                let balances = read_balances(&mut r)?;
                WaspMessage::AddressOutputs { address, balances }
            }
            MSG_FROM_NODE_TX_INCLUSION_STATE => {
                let state_byte = io::read_u8(&mut r)?;
                let state = InclusionState::from_byte(state_byte)
                    .ok_or(WireError::BadInclusionState(state_byte))?;
                let txid = io::read_txid(&mut r)?;
                let count = io::read_u16(&mut r)?;
                let mut subscribed_addresses = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    subscribed_addresses.push(io::read_address(&mut r)?);
                }
                WaspMessage::TxInclusionState {
                    state,
                    txid,
                    subscribed_addresses,
                }
            }
            other => return Err(WireError::BadMessageCode(other)),
        };
        io::expect_end(r)?;
        Ok(msg)
    }
}

/// Reject balances payloads that cannot have come from a consistent ledger.
pub fn validate_balances(balances: &Balances) -> WireResult<()> {
    for (txid, bals) in balances {
        if txid.is_zero() {
            return Err(WireError::InvalidBalances("zero transaction id"));
        }
        if bals.is_empty() {
            return Err(WireError::InvalidBalances("entry without balances"));
        }
        for b in bals {
            if b.value <= 0 {
                return Err(WireError::InvalidBalances("non-positive balance value"));
            }
        }
    }
    Ok(())
}

pub fn write_balances(buf: &mut Vec<u8>, balances: &Balances) -> WireResult<()> {
    validate_balances(balances)?;
    io::write_u16(buf, balances.len() as u16);
    for (txid, bals) in balances {
        io::write_txid(buf, txid);
        io::write_u16(buf, bals.len() as u16);
        for b in bals {
            io::write_color(buf, &b.color);
            io::write_u64(buf, b.value as u64);
        }
    }
    Ok(())
}

pub fn read_balances(r: &mut &[u8]) -> WireResult<Balances> {
    let count = io::read_u16(r)?;
    let mut ret = Balances::new();
    for _ in 0..count {
        let txid = io::read_txid(r)?;
        let num_balances = io::read_u16(r)?;
        let mut bals = Vec::with_capacity(num_balances as usize);
        for _ in 0..num_balances {
            let color = io::read_color(r)?;
            let value = io::read_u64(r)?;
            if value > i64::MAX as u64 {
                return Err(WireError::InvalidBalances("balance value overflows i64"));
            }
            bals.push(Balance::new(color, value as i64));
        }
        ret.insert(txid, bals);
    }
    validate_balances(&ret)?;
    Ok(ret)
}

/// Regroup per-output balances by creating transaction. Panics on a zero
/// txid: the UTXO index never holds one.
pub fn outputs_to_balances(outputs: &HashMap<OutputId, Vec<Balance>>) -> Balances {
    let mut ret = Balances::new();
    for (output_id, bals) in outputs {
        assert!(!output_id.txid.is_zero(), "zero txid in UTXO index");
        ret.insert(output_id.txid, bals.clone());
    }
    ret
}

/// Inverse of [`outputs_to_balances`] for a known address.
pub fn balances_to_outputs(
    addr: &Address,
    balances: &Balances,
) -> HashMap<OutputId, Vec<Balance>> {
    let mut ret = HashMap::new();
    for (txid, bals) in balances {
        assert!(!txid.is_zero(), "zero txid in balances");
        ret.insert(OutputId::new(*addr, *txid), bals.clone());
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn sample_tx() -> Transaction {
        let key = SigningKey::from_bytes(&[11u8; 32]);
        let source = Address::from_public_key(&key.verifying_key());
        let mut tx = Transaction::new(
            vec![OutputId::new(source, TxId([2u8; 32]))],
            vec![(Address([9u8; 32]), vec![Balance::iota(42)])],
        );
        tx.sign(&key);
        tx
    }

    fn sample_balances() -> Balances {
        let mut balances = Balances::new();
        balances.insert(TxId([3u8; 32]), vec![Balance::iota(42)]);
        balances.insert(
            TxId([1u8; 32]),
            vec![Balance::iota(7), Balance::new(Color([5u8; 32]), 1)],
        );
        balances
    }

    fn all_messages() -> Vec<(WaspMessage, bool)> {
        // (message, decoded on the wasp side)
        vec![
            (
                WaspMessage::Ping {
                    id: 42,
                    timestamp: 1_234_567_890,
                },
                true,
            ),
            (
                WaspMessage::Chunk {
                    data: vec![1, 2, 3, 4],
                },
                false,
            ),
            (
                WaspMessage::PostTransaction {
                    tx: sample_tx(),
                    sc_address: Address([4u8; 32]),
                    leader: 2,
                },
                false,
            ),
            (
                WaspMessage::Subscribe {
                    addresses_with_colors: vec![AddressColor {
                        address: Address([4u8; 32]),
                        color: Color([6u8; 32]),
                    }],
                },
                false,
            ),
            (
                WaspMessage::GetConfirmedTransaction {
                    txid: TxId([8u8; 32]),
                },
                false,
            ),
            (
                WaspMessage::GetTxInclusionState {
                    txid: TxId([8u8; 32]),
                    sc_address: Address([4u8; 32]),
                },
                false,
            ),
            (
                WaspMessage::GetOutputs {
                    address: Address([4u8; 32]),
                },
                false,
            ),
            (
                WaspMessage::SetId {
                    wasp_id: "wasp0".to_string(),
                },
                false,
            ),
            (
                WaspMessage::ConfirmedTransaction { tx: sample_tx() },
                true,
            ),
            (
                WaspMessage::AddressUpdate {
                    address: Address([4u8; 32]),
                    balances: sample_balances(),
                    tx: sample_tx(),
                },
                true,
            ),
            (
                WaspMessage::AddressOutputs {
                    address: Address([4u8; 32]),
                    balances: sample_balances(),
                },
                true,
            ),
            (
                WaspMessage::TxInclusionState {
                    state: InclusionState::Booked,
                    txid: TxId([8u8; 32]),
                    subscribed_addresses: vec![Address([4u8; 32])],
                },
                true,
            ),
        ]
    }

    #[test]
    fn test_roundtrip_every_message() {
        for (msg, wasp_side) in all_messages() {
            let data = msg.encode().unwrap();
            let back = WaspMessage::decode(&data, wasp_side).unwrap();
            // byte-identical re-encoding implies the message round-tripped
            assert_eq!(back.encode().unwrap(), data, "{}", msg.message_type());
        }
    }

    #[test]
    fn test_direction_check() {
        for (msg, wasp_side) in all_messages() {
            let data = msg.encode().unwrap();
            let wrong = WaspMessage::decode(&data, !wasp_side);
            match msg {
                // ping and chunk are valid in both directions
                WaspMessage::Ping { .. } | WaspMessage::Chunk { .. } => {
                    assert!(wrong.is_ok())
                }
                _ => assert!(
                    matches!(wrong, Err(WireError::WrongDirection(_))),
                    "{}",
                    msg.message_type()
                ),
            }
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(matches!(
            WaspMessage::decode(&[0xEE], false),
            Err(WireError::BadMessageCode(0xEE))
        ));
        assert!(matches!(
            WaspMessage::decode(&[], false),
            Err(WireError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_balances_roundtrip_byte_identical() {
        let balances = sample_balances();
        let mut buf = Vec::new();
        write_balances(&mut buf, &balances).unwrap();

        let mut r = buf.as_slice();
        let back = read_balances(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(back, balances);

        let mut buf_back = Vec::new();
        write_balances(&mut buf_back, &back).unwrap();
        assert_eq!(buf, buf_back);
    }

    #[test]
    fn test_invalid_balances_rejected() {
        let mut zero_txid = Balances::new();
        zero_txid.insert(TxId::zero(), vec![Balance::iota(1)]);
        let mut buf = Vec::new();
        assert!(write_balances(&mut buf, &zero_txid).is_err());

        let mut empty_entry = Balances::new();
        empty_entry.insert(TxId([1u8; 32]), vec![]);
        assert!(write_balances(&mut buf, &empty_entry).is_err());

        let mut negative = Balances::new();
        negative.insert(TxId([1u8; 32]), vec![Balance::iota(0)]);
        assert!(write_balances(&mut buf, &negative).is_err());
    }

    #[test]
    fn test_outputs_balances_conversion() {
        let addr = Address([4u8; 32]);
        let balances = sample_balances();
        let outputs = balances_to_outputs(&addr, &balances);
        assert_eq!(outputs.len(), balances.len());
        assert_eq!(outputs_to_balances(&outputs), balances);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let msg = WaspMessage::GetOutputs {
            address: Address([4u8; 32]),
        };
        let data = msg.encode().unwrap();
        assert!(WaspMessage::decode(&data[..data.len() - 1], false).is_err());
    }
}
