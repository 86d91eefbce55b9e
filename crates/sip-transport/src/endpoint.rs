use std::fmt;
use std::net::SocketAddr;

use sipline_sip_message::headers::Via;
use sipline_sip_message::Uri;

use crate::error::{Error, Result};

/// The transport protocol of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// UDP (connectionless)
    Udp,
    /// TCP (connection-oriented)
    Tcp,
    /// TLS over TCP (secure, connection-oriented)
    Tls,
    /// WebSocket (RFC 7118)
    Ws,
    /// Secure WebSocket (RFC 7118)
    Wss,
}

impl Protocol {
    /// Maps a transport token (URI parameter or Via transport) to a
    /// protocol. Case-insensitive.
    pub fn from_transport_token(token: &str) -> Result<Self> {
        match token.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "tls" => Ok(Protocol::Tls),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            other => Err(Error::UnsupportedTransport(other.to_string())),
        }
    }

    /// Returns the canonical upper-case token (the form used in Via).
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Ws => "WS",
            Protocol::Wss => "WSS",
        }
    }

    /// Returns the lower-case token used in `;transport=` URI parameters.
    pub fn transport_param(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    /// Returns if this transport provides reliable delivery. Everything
    /// but UDP does; the transaction layer disables retransmission timers
    /// on reliable transports.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Protocol::Udp)
    }

    /// Returns if this is a secure transport
    pub fn is_secure(&self) -> bool {
        matches!(self, Protocol::Tls | Protocol::Wss)
    }

    /// Returns the default port for this protocol
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Udp => 5060,
            Protocol::Tcp => 5060,
            Protocol::Tls => 5061,
            Protocol::Ws => 80,
            Protocol::Wss => 443,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A next-hop destination: (host, port, protocol).
///
/// Endpoints key the network layer's channel map. Equality and hashing are
/// case-insensitive on the host (the host is lowercased on construction)
/// and exact on port and protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    host: String,
    port: u16,
    protocol: Protocol,
}

impl EndPoint {
    /// Creates an endpoint; the host is lowercased.
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        let mut host = host.into();
        host.make_ascii_lowercase();
        Self {
            host,
            port,
            protocol,
        }
    }

    /// Resolves the endpoint a request to this URI must be sent to:
    /// `sip:` defaults to UDP and `sips:` to TLS, a `transport=` parameter
    /// overrides (kept secure under `sips:`), and a missing port falls
    /// back to the protocol default.
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        if !uri.is_sip() {
            return Err(Error::UnsupportedUriScheme(uri.scheme().to_string()));
        }
        let secure = uri.is_sips();
        let mut protocol = if secure { Protocol::Tls } else { Protocol::Udp };
        if let Some(token) = uri.parameter("transport") {
            protocol = match Protocol::from_transport_token(token)? {
                Protocol::Tcp | Protocol::Tls if secure => Protocol::Tls,
                Protocol::Ws | Protocol::Wss if secure => Protocol::Wss,
                Protocol::Udp if secure => Protocol::Tls,
                other => other,
            };
        }
        let port = uri.port().unwrap_or_else(|| protocol.default_port());
        Ok(EndPoint::new(uri.host(), port, protocol))
    }

    /// Resolves the next hop for a response from its topmost Via entry:
    /// `received=` overrides the sent-by host and `rport=` the sent-by
    /// port (RFC 3581).
    pub fn next_hop_from_via(via: &Via) -> Result<Self> {
        let protocol = Protocol::from_transport_token(&via.protocol)?;
        let host = via.received().unwrap_or(&via.host);
        let port = via
            .rport()
            .or(via.port)
            .unwrap_or_else(|| protocol.default_port());
        Ok(EndPoint::new(host, port, protocol))
    }

    /// Builds an endpoint from a resolved socket address.
    pub fn from_socket_addr(addr: SocketAddr, protocol: Protocol) -> Self {
        EndPoint::new(addr.ip().to_string(), addr.port(), protocol)
    }

    /// Host, lowercased, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The `host:port` form used when stamping Via and Contact headers.
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host_port(), self.protocol)
    }
}
