use thiserror::Error;

use sipline_sip_transport::{EndPoint, Protocol};

/// Result type for transaction and network layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transaction layer and the network layer.
#[derive(Error, Debug)]
pub enum Error {
    /// `send` was called with a message parsed off the wire
    #[error("cannot send an incoming message")]
    InvalidDirection,

    /// No next hop could be derived from the message
    #[error("no next hop: {0}")]
    NoNextHop(String),

    /// ACK requests never open connections
    #[error("ACK requests cannot open connections")]
    AckWithoutChannel,

    /// A channel exists for the destination but is not connected yet
    #[error("channel to {0} not connected")]
    NotConnected(EndPoint),

    /// No channel factory is registered for the protocol
    #[error("no channel factory for {0}")]
    NoChannelFactory(Protocol),

    /// A response without a Via header cannot be routed
    #[error("impossible to route without Via")]
    MissingVia,

    /// The network layer has been shut down
    #[error("network layer shut down")]
    Shutdown,

    /// Connection establishment failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] sipline_sip_transport::Error),

    /// Message-layer failure
    #[error(transparent)]
    Message(#[from] sipline_sip_message::Error),

    /// Internal channel to a transaction event loop is gone
    #[error("transaction event loop unavailable: {0}")]
    TransactionGone(String),
}
