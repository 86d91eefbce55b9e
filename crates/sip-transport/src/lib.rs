//! SIP channel abstraction and the concrete transports.
//!
//! A [`Channel`] is a bidirectional, framed carrier of SIP messages
//! towards one destination [`EndPoint`], created lazily by a
//! [`ChannelFactory`] registered per [`Protocol`]. Channels report
//! connection completion, inbound messages and teardown as
//! [`ChannelEvent`]s posted on the owning layer's event queue — they
//! never call upward synchronously.
//!
//! Transports: UDP (connected socket per destination, one datagram per
//! message), TCP and TLS (stream reassembly on the blank line and
//! Content-Length), and WebSocket/secure WebSocket (RFC 7118, one WS
//! message per SIP message).

mod channel;
mod endpoint;
mod error;
mod framing;
mod resolve;
mod tcp;
mod tls;
mod udp;
mod ws;

pub use channel::{Channel, ChannelEvent, ChannelFactory, ConnectionState};
pub use endpoint::{EndPoint, Protocol};
pub use error::{Error, Result};
pub use framing::MessageAssembler;
pub use tcp::{TcpChannel, TcpChannelFactory};
pub use tls::{
    load_certificates, load_private_key, ClientIdentity, TlsChannel, TlsChannelFactory,
    TlsSettings,
};
pub use udp::{UdpChannel, UdpChannelFactory};
pub use ws::{WebSocketChannel, WebSocketChannelFactory};

use std::sync::Arc;

/// Returns factories for every protocol this crate implements, with the
/// given TLS settings applied to the TLS factory.
pub fn default_factories(tls: TlsSettings) -> Vec<Arc<dyn ChannelFactory>> {
    vec![
        Arc::new(UdpChannelFactory),
        Arc::new(TcpChannelFactory),
        Arc::new(TlsChannelFactory::new(tls)),
        Arc::new(WebSocketChannelFactory::plain()),
        Arc::new(WebSocketChannelFactory::secure()),
    ]
}
