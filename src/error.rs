use crate::proxy::models::ProxyId;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored history is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("proxy not found: {0}")]
    NotFound(ProxyId),
    #[error("checker executable not found: {0}")]
    CheckerNotFound(String),
    #[error("failed to start checker: {0}")]
    CheckerSpawn(#[source] std::io::Error),
    #[error("checker process is no longer accepting requests")]
    CheckerClosed,
    #[error("invalid proxy scheme: {0}")]
    InvalidScheme(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("invalid stored value: {0}")]
    InvalidRow(String),
}
