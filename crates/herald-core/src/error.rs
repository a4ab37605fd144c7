use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Replayed message counter {0}")]
    Replay(u64),

    #[error("Too many skipped messages")]
    TooManySkippedMessages,

    #[error("Store corruption: {0}")]
    StoreCorruption(String),

    #[error("Identity key changed for {0}")]
    TrustChanged(String),

    #[error("One-time pre-key pool exhausted")]
    ExhaustedPreKeys,

    #[error("No session for {0}")]
    SessionNotFound(String),

    #[error("Account {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Verification window expired")]
    VerificationExpired,

    #[error("Invalid flow transition: {0}")]
    InvalidFlow(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Retryable transport failure: {0}")]
    RetryableTransport(String),

    #[error("Terminal transport failure: {0}")]
    TerminalTransport(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Sync gap for device {device}: expected {expected}, buffered past limit")]
    SyncGap { device: String, expected: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, Error>;
