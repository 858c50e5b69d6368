//! Error types for the consensus core.
//!
//! The teacher's prototype referenced a `RaftError` (`super::super::common::RaftError`)
//! that never made it into the retrieved sources; this module is the real thing,
//! built with `thiserror` the way the rest of the corpus pairs a typed error enum
//! with `tokio`-based services.

use thiserror::Error;

/// Fatal errors raised by the core itself.
///
/// Transport failures are *not* represented here: per the spec, a transport error
/// on an outbound RPC is swallowed by the caller of `Transport` and never reaches
/// this type.
#[derive(Debug, Error)]
pub enum Error {
    /// `Storage::has_data()` reported existing data but one of the three required
    /// keys (`current_term`, `voted_for`, `log`) was missing. The restore contract
    /// is all-or-nothing; a replica in this state cannot start safely.
    #[error("storage reported existing data but is missing key {missing_key:?}")]
    CorruptStorage { missing_key: &'static str },

    /// A value could not be decoded from storage during restore.
    #[error("failed to decode {key:?} from storage: {source}")]
    DecodeFailed {
        key: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// A value could not be persisted to storage.
    #[error("failed to persist {key:?} to storage: {source}")]
    PersistFailed {
        key: &'static str,
        #[source]
        source: StorageError,
    },
}

/// Error returned by a `Storage` implementation's `set`.
#[derive(Debug, Error)]
#[error("storage set failed: {0}")]
pub struct StorageError(pub String);

/// Error returned by a `Transport` implementation.
///
/// Opaque by design: the core never inspects *why* an RPC failed, only that it did.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);
