//! Binary wire protocol of the client link.
//!
//! Frames are length-prefixed ([`framing`]), each frame body starts with a
//! one-byte message code ([`msg`]) and all multi-byte integers are
//! big-endian ([`io`]).

pub mod framing;
pub mod io;
pub mod msg;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of message")]
    UnexpectedEof,

    #[error("wrong message code {0}")]
    BadMessageCode(u8),

    #[error("message code {0} not valid for this side of the link")]
    WrongDirection(u8),

    #[error("variable-length field of {got} bytes exceeds maximum {max}")]
    Oversize { got: usize, max: usize },

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("frame of {got} bytes exceeds maximum {max}")]
    FrameTooLarge { got: usize, max: usize },

    #[error("invalid utf-8 in string field")]
    BadString,

    #[error("invalid public key bytes")]
    BadPublicKey,

    #[error("invalid inclusion state {0}")]
    BadInclusionState(u8),

    #[error("invalid balances: {0}")]
    InvalidBalances(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WireResult<T> = Result<T, WireError>;
