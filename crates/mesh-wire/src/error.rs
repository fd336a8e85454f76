use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake verification timed out")]
    HandshakeTimeout,
    #[error("handshake verification rejected the first frame")]
    VerifyRejected,
    #[error("websocket error: {0}")]
    Ws(String),
    #[error("client destroyed")]
    Destroyed,
}
