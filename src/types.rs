//! Core value-ledger types shared by the wire codec, the UTXO emulator and
//! the connection engine.

use ed25519_dalek::VerifyingKey;
use std::fmt;
use std::str::FromStr;

/// Length of addresses, transaction ids and colors on the wire.
pub const ID_LENGTH: usize = 32;

/// Address of a ledger account: blake3 digest of the ed25519 verifying key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; ID_LENGTH]);

/// Identifier of a transaction: blake3 digest of its serialized bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxId(pub [u8; ID_LENGTH]);

/// Token-type tag carried by every balance.
///
/// Two values are distinguished: [`Color::IOTA`] is the native token and
/// [`Color::NEW`] marks an output to be colored with the minting
/// transaction's id once that transaction confirms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Color(pub [u8; ID_LENGTH]);

impl Color {
    pub const IOTA: Color = Color([0u8; ID_LENGTH]);
    pub const NEW: Color = Color([0xFFu8; ID_LENGTH]);
}

/// A colored value held by one output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Balance {
    pub color: Color,
    pub value: i64,
}

impl Balance {
    pub fn new(color: Color, value: i64) -> Self {
        Balance { color, value }
    }

    pub fn iota(value: i64) -> Self {
        Balance::new(Color::IOTA, value)
    }
}

/// Unique name of an unspent output: the address it sits on plus the id of
/// the transaction that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId {
    pub address: Address,
    pub txid: TxId,
}

impl OutputId {
    pub fn new(address: Address, txid: TxId) -> Self {
        OutputId { address, txid }
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = [0u8; 2 * ID_LENGTH];
        bytes[..ID_LENGTH].copy_from_slice(&self.address.0);
        bytes[ID_LENGTH..].copy_from_slice(&self.txid.0);
        write!(f, "{}", bs58::encode(&bytes).into_string())
    }
}

/// Four-valued status of a transaction in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum InclusionState {
    Undef = 0,
    Booked = 1,
    Confirmed = 2,
    Rejected = 3,
}

impl InclusionState {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<InclusionState> {
        match b {
            0 => Some(InclusionState::Undef),
            1 => Some(InclusionState::Booked),
            2 => Some(InclusionState::Confirmed),
            3 => Some(InclusionState::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for InclusionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InclusionState::Undef => "undef",
            InclusionState::Booked => "booked",
            InclusionState::Confirmed => "confirmed",
            InclusionState::Rejected => "rejected",
        };
        write!(f, "{}", text)
    }
}

impl Address {
    /// Derive the address controlled by the given verifying key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Address(*blake3::hash(key.as_bytes()).as_bytes())
    }
}

impl TxId {
    /// The all-zero id, reserved for the genesis input.
    pub fn zero() -> Self {
        TxId([0u8; ID_LENGTH])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_LENGTH]
    }
}

/// A transaction id doubles as a color tag once the minting transaction is
/// confirmed.
impl From<TxId> for Color {
    fn from(id: TxId) -> Self {
        Color(id.0)
    }
}

impl From<Color> for TxId {
    fn from(color: Color) -> Self {
        TxId(color.0)
    }
}

macro_rules! impl_base58_id {
    ($name:ident) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", bs58::encode(&self.0).into_string())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|e| format!("invalid base58: {}", e))?;
                let arr: [u8; ID_LENGTH] = bytes
                    .try_into()
                    .map_err(|_| format!("expected {} bytes", ID_LENGTH))?;
                Ok($name(arr))
            }
        }
    };
}

impl_base58_id!(Address);
impl_base58_id!(TxId);
impl_base58_id!(Color);
