//! Error types shared across the crate.
//!
//! Stream-facing operations (`read`/`write`/`accept`) speak `std::io::Error`
//! like any other connection type; the helpers below build the three values
//! the transport hands out. Construction-time and protocol-parse failures get
//! their own enums.

use std::io;

use thiserror::Error;

/// Errors from the KCP ARQ core.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KcpError {
    /// Input buffer shorter than a segment header, or truncated payload.
    #[error("segment framing too short")]
    ShortBuffer,
    /// Segment carries a different conversation id than this core.
    #[error("conversation id mismatch")]
    ConvMismatch,
    /// Segment command byte outside PUSH/ACK/WASK/WINS.
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    /// `recv` called with no complete message pending.
    #[error("no readable message")]
    NoData,
    /// `recv` buffer smaller than the pending message.
    #[error("receive buffer too small")]
    BufferTooSmall,
    /// `send` payload would need more than 255 fragments.
    #[error("payload requires too many fragments")]
    OversizePayload,
    /// Rejected MTU (below header floor or above the 1500 limit).
    #[error("invalid mtu")]
    InvalidMtu,
}

/// Errors from block crypt construction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptError {
    /// Key is not 16, 24 or 32 bytes.
    #[error("invalid key length {0}")]
    InvalidKeyLength(usize),
    /// The OS entropy source failed at nonce-generator setup.
    #[error("entropy source unavailable")]
    EntropyUnavailable,
}

/// Errors from FEC codec construction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FecError {
    /// data/parity shard counts the codec cannot support.
    #[error("invalid shard counts data={data} parity={parity}")]
    InvalidShards { data: usize, parity: usize },
}

pub(crate) fn err_timeout() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}

pub(crate) fn err_broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")
}

pub(crate) fn err_invalid_operation() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "invalid operation")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds() {
        assert_eq!(err_timeout().kind(), io::ErrorKind::TimedOut);
        assert_eq!(err_broken_pipe().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(err_invalid_operation().kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn display_strings() {
        assert_eq!(KcpError::ConvMismatch.to_string(), "conversation id mismatch");
        assert_eq!(CryptError::InvalidKeyLength(7).to_string(), "invalid key length 7");
    }
}
