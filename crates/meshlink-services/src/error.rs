use thiserror::Error;

use crate::registry::SessionId;

#[derive(Debug, Error)]
pub enum OverlayError {
    /// The owner task has stopped; the command was not applied.
    #[error("overlay owner is not running")]
    OwnerGone,
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("task header rejected: {0}")]
    TaskHeaderRejected(String),
}
