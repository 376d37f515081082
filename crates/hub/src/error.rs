use thiserror::Error;

/// Errors surfaced by the hub's routing, framing, and correlation primitives.
///
/// Services built on top of `hub` convert their own errors into a reply
/// envelope (`Msg::reply_err`) rather than propagating them through here;
/// this type is for hub-level failures that have nowhere else to go.
#[derive(Debug, Error)]
pub enum Error {
    #[error("private subject from remote connection: {0}")]
    PrivateSubjectFromRemote(String),
    #[error("unknown response token {0}")]
    UnknownToken(String),
    #[error("invalid response token encoding: {0}")]
    BadTokenEncoding(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid message framing: {0}")]
    InvalidFraming(String),
    #[error("message {0} has no body")]
    MissingBody(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
