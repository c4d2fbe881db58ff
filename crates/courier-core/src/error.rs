use courier_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("wrong receiver")]
    WrongReceiver,
    #[error("invalid payload {0}")]
    InvalidPayload(String),
    #[error("unknown loc key {0}")]
    UnknownLocKey(String),
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("server {0}")]
    Server(String),
    #[error("destroyed")]
    Destroyed,
}

impl From<StorageError> for NotificationError {
    fn from(_: StorageError) -> Self {
        NotificationError::StoreUnavailable
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::InvalidPayload(err.to_string())
    }
}
