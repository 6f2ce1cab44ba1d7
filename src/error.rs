//! Error types and handling for NetworkNeuron

use thiserror::Error;

/// Result type alias for NetworkNeuron operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level NetworkNeuron error
#[derive(Debug, Error)]
pub enum Error {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("route error: {0}")]
    Route(#[from] RouteError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out: {0}")]
    TimedOut(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Cryptographic failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch: ciphertext, tag, nonce, or associated data was tampered with
    #[error("authentication failed")]
    AuthFail,

    #[error("key generation failed: {0}")]
    KeyGen(String),

    #[error("signing failed: {0}")]
    Sign(String),

    #[error("signature verification failed: {0}")]
    Verify(String),
}

/// Wire codec failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("bad envelope signature")]
    BadSignature,

    #[error("replayed message")]
    Replay,

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Peer plane failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("dial failed: {0}")]
    DialFail(String),

    #[error("handshake failed: {0}")]
    HandshakeFail(String),

    #[error("peer is quarantined")]
    Quarantined,

    #[error("peer is dropped")]
    Dropped,
}

/// Routing plane failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route satisfies the requirements")]
    NotFound,

    #[error("route expired")]
    Expired,

    #[error("route hop no longer active")]
    PeerGone,

    #[error("peer send queue full")]
    Congested,

    #[error("invalid route: {0}")]
    Invalid(String),
}

/// Session manager failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("session is not active")]
    NotActive,
}

/// Ledger failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("insufficient stake")]
    InsufficientStake,

    #[error("stake below configured minimum")]
    MinStakeNotMet,

    #[error("reward pool exhausted")]
    InsufficientRewardPool,

    #[error("bad transaction signature")]
    BadSignature,
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl Error {
    /// Whether the failure came from a misbehaving peer and should quarantine it
    /// rather than surface to the caller.
    pub fn quarantines_peer(&self) -> bool {
        matches!(self, Error::Crypto(_) | Error::Wire(_))
    }
}
