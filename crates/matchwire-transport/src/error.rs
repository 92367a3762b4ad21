/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Establishing the stream failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The 10 s connect deadline elapsed.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The CONNECT handshake did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The connection is gone and the event loop with it.
    #[error("connection closed")]
    Closed,

    /// The outbound queue overflowed while holding only critical
    /// frames. The connection must be torn down with BACKPRESSURE_ABORT.
    #[error("outbound queue full of critical frames")]
    BackpressureAbort,

    /// The reconnect loop ran out of attempts.
    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}
