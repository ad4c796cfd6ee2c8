//! Error types shared across the store and the relay.

use thiserror::Error;

/// Failures while validating a single event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("id is computed incorrectly")]
    IdMismatch,
    #[error("signature is invalid")]
    BadSignature,
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Failures raised by the embedded event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate: event already stored")]
    Duplicate,
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error(
        "store at schema version {found} holds data that cannot be migrated in place to version \
         {target}; export the events with the previous release, remove the store directory and \
         import them again"
    )]
    MigrationRefused { found: u16, target: u16 },
    #[error("store schema version {found} is newer than this build supports ({supported})")]
    NewerSchema { found: u16, supported: u16 },
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("storage: {0}")]
    Storage(#[from] redb::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// redb reports a distinct error type per operation; funnel them all through `redb::Error`.
macro_rules! storage_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StoreError {
            fn from(e: $ty) -> Self {
                StoreError::Storage(e.into())
            }
        })*
    };
}

storage_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

/// Failures validating a NIP-42 authentication event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("wrong kind {0}")]
    WrongKind(u16),
    #[error("challenge tag does not match")]
    ChallengeMismatch,
    #[error("relay tag missing or unparsable")]
    BadRelayTag,
    #[error("relay tag does not match this relay")]
    RelayMismatch,
    #[error("created_at is too far from the current time")]
    Stale,
    #[error("{0}")]
    Signature(String),
}

/// Frames that cannot be decoded into an envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("unknown label {0:?}")]
    UnknownLabel(String),
    #[error("malformed {label}: {reason}")]
    Malformed { label: &'static str, reason: String },
    #[error("bad filter in {sub_id}: {reason}")]
    BadFilter { sub_id: String, reason: String },
}

/// A refusal reported to clients through OK or CLOSED.
///
/// `Display` renders the machine-readable reason, prefix included.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Reject {
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("error: {0}")]
    Error(String),
    #[error("auth-required: {0}")]
    AuthRequired(String),
    #[error("rate-limited: {0}")]
    RateLimited(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Reject {
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Reject::AuthRequired(_))
    }
}

impl From<StoreError> for Reject {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidFilter(msg) | StoreError::InvalidEvent(msg) => Reject::Invalid(msg),
            other => Reject::Error(other.to_string()),
        }
    }
}
