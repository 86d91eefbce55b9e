use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for SIP transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for SIP transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to resolve the destination host
    #[error("Failed to resolve {0}")]
    ResolveFailed(String),

    /// Failed to bind a local socket
    #[error("Failed to bind: {0}")]
    BindFailed(io::Error),

    /// Failed to connect to the specified address
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, io::Error),

    /// Failed to send message to the peer
    #[error("Failed to send message: {0}")]
    SendFailed(io::Error),

    /// Failed to receive message
    #[error("Failed to receive message: {0}")]
    ReceiveFailed(io::Error),

    /// Channel is not connected yet
    #[error("Channel not connected")]
    NotConnected,

    /// Channel is closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Connection closed by peer
    #[error("Connection closed by peer")]
    ConnectionClosedByPeer,

    /// Connection reset
    #[error("Connection reset")]
    ConnectionReset,

    /// Connection timed out
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(SocketAddr),

    /// TLS general error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// TLS certificate verification failed
    #[error("TLS certificate error: {0}")]
    TlsCertificateError(String),

    /// The requested reconnect policy does not apply to this channel
    #[error("No pending certificate error to override")]
    NoPendingCertificateError,

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Message too large for transport
    #[error("Message too large for transport ({0} bytes)")]
    MessageTooLarge(usize),

    /// Failed to parse an inbound message
    #[error("Failed to parse message: {0}")]
    ParseError(String),

    /// URI scheme has no transport mapping
    #[error("Unsupported URI scheme: {0}")]
    UnsupportedUriScheme(String),

    /// Transport token has no protocol mapping
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Returns true if the error is related to a closed connection
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed | Error::ConnectionClosedByPeer | Error::ConnectionReset
        )
    }

    /// Returns true if the error is related to a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectionTimeout(_))
    }

    /// Returns true if the error is related to TLS
    pub fn is_tls_error(&self) -> bool {
        matches!(
            self,
            Error::TlsError(_) | Error::TlsHandshakeFailed(_) | Error::TlsCertificateError(_)
        )
    }

    /// Returns true if retrying the operation might succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::UnsupportedUriScheme(_)
                | Error::UnsupportedTransport(_)
                | Error::MessageTooLarge(_)
                | Error::InvalidState(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert!(Error::ChannelClosed.is_connection_closed());
        assert!(!Error::ChannelClosed.is_timeout());

        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        assert!(Error::ConnectionTimeout(addr).is_timeout());

        assert!(Error::TlsCertificateError("unknown issuer".into()).is_tls_error());
        assert!(!Error::ConnectionReset.is_tls_error());
    }

    #[test]
    fn test_recoverable_errors() {
        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        assert!(Error::ConnectionTimeout(addr).is_recoverable());
        assert!(Error::ConnectionReset.is_recoverable());

        assert!(!Error::UnsupportedTransport("xyz".into()).is_recoverable());
        assert!(!Error::MessageTooLarge(100000).is_recoverable());
    }
}
