//! Destination address resolution.
//!
//! SRV/NAPTR selection policy is outside this layer; an endpoint's host is
//! either an IP literal or a name resolved through the system resolver.

use std::net::{IpAddr, SocketAddr};

use crate::endpoint::EndPoint;
use crate::error::{Error, Result};

/// Resolves an endpoint to a socket address, preferring an IP literal when
/// the host is one.
pub(crate) async fn resolve_endpoint(endpoint: &EndPoint) -> Result<SocketAddr> {
    if let Ok(ip) = endpoint.host().parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, endpoint.port()));
    }
    let mut addrs = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
        .await
        .map_err(|_| Error::ResolveFailed(endpoint.host().to_string()))?;
    addrs
        .next()
        .ok_or_else(|| Error::ResolveFailed(endpoint.host().to_string()))
}
