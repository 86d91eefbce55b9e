use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use sipline_sip_message::MAGIC_COOKIE;
use sipline_sip_transport::{ClientIdentity, EndPoint};

use crate::timer::TimerSettings;

/// Generates branch parameters for stamped Via headers.
pub type BranchFactory = Arc<dyn Fn() -> String + Send + Sync>;

/// What to do about a TLS certificate verification failure.
pub enum CertErrorDecision {
    /// Reconnect accepting the rejected certificate.
    Accept,
    /// Reconnect presenting a client certificate.
    UseIdentity(ClientIdentity),
    /// Give up; the connection attempt is dismissed.
    Reject,
}

/// Decides the fate of channels whose TLS handshake failed certificate
/// verification. Without a handler every such failure is a dismissal.
#[async_trait::async_trait]
pub trait SslCertErrorHandler: Send + Sync {
    /// Called once per verification failure.
    async fn handle(&self, destination: &EndPoint, error: &str) -> CertErrorDecision;
}

/// Network layer configuration, immutable once constructed.
#[derive(Clone)]
pub struct NetworkConfig {
    /// Stamped into `User-Agent` (requests) and `Server` (responses) when
    /// the TU did not set one. Empty disables stamping.
    pub software_name: String,
    /// How long an unused channel lingers before being closed.
    pub reuse_lifetime: Duration,
    /// Timer durations handed to every transaction.
    pub timer_settings: TimerSettings,
    /// Branch generator for stamped Via headers.
    pub branch_factory: BranchFactory,
    /// Optional TLS certificate failure policy.
    pub ssl_cert_error_handler: Option<Arc<dyn SslCertErrorHandler>>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            software_name: concat!("sipline/", env!("CARGO_PKG_VERSION")).to_string(),
            reuse_lifetime: Duration::from_secs(60),
            timer_settings: TimerSettings::default(),
            branch_factory: default_branch_factory(),
            ssl_cert_error_handler: None,
        }
    }
}

impl fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("software_name", &self.software_name)
            .field("reuse_lifetime", &self.reuse_lifetime)
            .field("timer_settings", &self.timer_settings)
            .field(
                "ssl_cert_error_handler",
                &self.ssl_cert_error_handler.is_some(),
            )
            .finish()
    }
}

/// The default branch generator: the RFC 3261 magic cookie followed by a
/// random UUID.
pub fn default_branch_factory() -> BranchFactory {
    Arc::new(|| format!("{}{}", MAGIC_COOKIE, Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_branches_carry_the_magic_cookie() {
        let factory = default_branch_factory();
        let a = factory();
        let b = factory();
        assert!(a.starts_with(MAGIC_COOKIE));
        assert!(b.starts_with(MAGIC_COOKIE));
        assert_ne!(a, b);
    }

    #[test]
    fn default_config() {
        let config = NetworkConfig::default();
        assert!(config.software_name.starts_with("sipline/"));
        assert_eq!(config.reuse_lifetime, Duration::from_secs(60));
        assert!(config.ssl_cert_error_handler.is_none());
    }
}
