use std::io;

use thiserror::Error;

use super::sexp::SexpError;

/// Failures while reading a framed message. All of them end the connection.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("stream closed")]
    Closed,
    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
    #[error("invalid length header {0:?}")]
    InvalidHeader(String),
    #[error("payload is not valid {coding}")]
    Decoding { coding: &'static str },
    #[error("malformed message: {0}")]
    Malformed(#[from] SexpError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures while producing an outgoing frame. Only the single send fails.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("payload of {size} bytes exceeds the 24-bit length header")]
    PayloadTooLarge { size: usize },
    #[error("character {ch:?} cannot be encoded as {coding}")]
    Unrepresentable { ch: char, coding: &'static str },
}

/// Failures while writing a frame to the peer.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AuthenticationFailure {
    #[error("client presented the wrong secret")]
    Mismatch,
    #[error("secret file {path} exists but could not be read: {source}")]
    UnreadableSecret {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read handshake: {0}")]
    Framing(#[from] FramingError),
}
