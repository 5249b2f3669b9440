//! Error types.

use thiserror::Error;

use crate::reactive::HandleId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The waiting listener was dropped before the awaited value arrived.
    #[error("handle {0} stopped delivering before the wait resolved")]
    WaitAbandoned(HandleId),

    #[error("invalid registry configuration: {0}")]
    Config(#[from] serde_json::Error),
}
