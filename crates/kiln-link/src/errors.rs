use kiln_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("link to {0} is not connected")]
    NotConnected(String),
    #[error("link to {0} was removed")]
    Removed(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("timed out waiting for a letter")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
