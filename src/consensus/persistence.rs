//! Encodes/decodes durable replica state against a `Storage` backend.
//!
//! The teacher left this as a `TODO` comment on `ServerState`
//! (`// TODO: state and term must be persisted to disk`); implemented here
//! with `bincode` the way the rest of the corpus encodes persisted Raft state
//! (see e.g. the `bincode`-backed snapshot writers in the other example
//! repos retrieved alongside the teacher).

use super::State;
use crate::error::Error;
use crate::storage::{Storage, KEY_CURRENT_TERM, KEY_LOG, KEY_VOTED_FOR};
use crate::types::{Command, LogEntry, ServerId};

pub(crate) fn persist_to_storage<C: Command>(
    state: &State<C>,
    storage: &dyn Storage,
) -> Result<(), Error> {
    let term_bytes = bincode::serialize(&state.current_term).map_err(|source| Error::DecodeFailed {
        key: KEY_CURRENT_TERM,
        source,
    })?;
    storage
        .set(KEY_CURRENT_TERM, term_bytes)
        .map_err(|source| Error::PersistFailed {
            key: KEY_CURRENT_TERM,
            source,
        })?;

    let voted_for_bytes =
        bincode::serialize(&state.voted_for).map_err(|source| Error::DecodeFailed {
            key: KEY_VOTED_FOR,
            source,
        })?;
    storage
        .set(KEY_VOTED_FOR, voted_for_bytes)
        .map_err(|source| Error::PersistFailed {
            key: KEY_VOTED_FOR,
            source,
        })?;

    let log_bytes = bincode::serialize(&state.log).map_err(|source| Error::DecodeFailed {
        key: KEY_LOG,
        source,
    })?;
    storage
        .set(KEY_LOG, log_bytes)
        .map_err(|source| Error::PersistFailed {
            key: KEY_LOG,
            source,
        })?;

    Ok(())
}

pub(crate) fn restore_from_storage<C: Command>(
    state: &mut State<C>,
    storage: &dyn Storage,
) -> Result<(), Error> {
    let term_bytes = storage.get(KEY_CURRENT_TERM).ok_or(Error::CorruptStorage {
        missing_key: KEY_CURRENT_TERM,
    })?;
    state.current_term =
        bincode::deserialize(&term_bytes).map_err(|source| Error::DecodeFailed {
            key: KEY_CURRENT_TERM,
            source,
        })?;

    let voted_for_bytes = storage.get(KEY_VOTED_FOR).ok_or(Error::CorruptStorage {
        missing_key: KEY_VOTED_FOR,
    })?;
    state.voted_for = bincode::deserialize::<Option<ServerId>>(&voted_for_bytes).map_err(|source| {
        Error::DecodeFailed {
            key: KEY_VOTED_FOR,
            source,
        }
    })?;

    let log_bytes = storage.get(KEY_LOG).ok_or(Error::CorruptStorage {
        missing_key: KEY_LOG,
    })?;
    state.log = bincode::deserialize::<Vec<LogEntry<C>>>(&log_bytes).map_err(|source| {
        Error::DecodeFailed {
            key: KEY_LOG,
            source,
        }
    })?;

    Ok(())
}
