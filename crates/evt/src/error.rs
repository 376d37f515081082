use thiserror::Error;

/// The evt-relevant subset of the error taxonomy.
///
/// Everything here is reported back to the caller as a `{err}` reply (see
/// `hub::Msg::reply_err`); nothing in this enum is fatal on its own. A failed
/// revert during `Publish` is a distinct, unrecoverable condition and is not
/// represented here — see [`crate::mem_ledger::RevertFailure`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("transaction has no actions")]
    EmptyTransaction,
    #[error("base revision {base} is ahead of current revision {cur}")]
    InvalidBase { base: i64, cur: i64 },
    #[error("write conflict on {0:?}")]
    WriteConflict(crate::model::Sig),
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("unsupported primary key kind for topic {0}")]
    UnsupportedKey(String),
    #[error("failed to apply action on {0:?}: {1}")]
    ApplyFailure(crate::model::Sig, String),
    #[error("nested delta value at key {0}: only flat key/value merges are supported")]
    NestedDelta(String),
    #[error(transparent)]
    Hub(#[from] hub::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
