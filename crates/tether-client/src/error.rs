use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("relay connection closed")]
    RelayClosed,

    #[error("session has ended")]
    SessionClosed,
}
