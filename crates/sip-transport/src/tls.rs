//! TLS channel: TCP + rustls client handshake, with the certificate-error
//! override paths used by the network layer's SSL error handling.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use sipline_sip_message::Message;

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ConnectionState, StateCell};
use crate::endpoint::{EndPoint, Protocol};
use crate::error::{Error, Result};
use crate::framing::{map_stream_error, pump, MessageAssembler};
use crate::resolve::resolve_endpoint;

const READ_BUFFER_SIZE: usize = 8192;

/// A client certificate chain and its private key, for
/// `reconnect_with_certificate`.
#[derive(Clone)]
pub struct ClientIdentity {
    /// Certificate chain, leaf first
    pub cert_chain: Vec<Certificate>,
    /// Private key for the leaf certificate
    pub key: PrivateKey,
}

impl ClientIdentity {
    /// Loads an identity from PEM files.
    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self> {
        Ok(Self {
            cert_chain: load_certificates(cert_path)?,
            key: load_private_key(key_path)?,
        })
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientIdentity({} certs)", self.cert_chain.len())
    }
}

/// Loads a certificate chain from a PEM file.
pub fn load_certificates(path: &str) -> Result<Vec<Certificate>> {
    let file = File::open(path).map_err(Error::IoError)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::TlsError(format!("failed to read certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::TlsError(format!("no certificates in {}", path)));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Loads a PKCS#8 or RSA private key from a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKey> {
    let file = File::open(path).map_err(Error::IoError)?;
    let mut reader = BufReader::new(file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::TlsError(format!("failed to read private key: {}", e)))?;
    if keys.is_empty() {
        let file = File::open(path).map_err(Error::IoError)?;
        let mut reader = BufReader::new(file);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)
            .map_err(|e| Error::TlsError(format!("failed to read private key: {}", e)))?;
    }
    keys.pop()
        .map(PrivateKey)
        .ok_or_else(|| Error::TlsError(format!("no private key in {}", path)))
}

/// TLS settings shared by every channel a factory creates.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM file with the trust anchors. With no anchors configured every
    /// handshake fails verification, which routes through the
    /// certificate-error handler.
    pub ca_path: Option<String>,
}

// Handshake verification policy for one connect attempt.
#[derive(Clone)]
enum VerifyPolicy {
    Standard,
    AcceptAny,
}

// Accepts whatever the peer presents. Installed only by
// `reconnect_ignoring_last_error`, after the upper layer explicitly chose
// to override a reported verification failure.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// TLS channel towards one destination endpoint.
#[derive(Clone)]
pub struct TlsChannel {
    inner: Arc<TlsChannelInner>,
}

struct TlsChannelInner {
    destination: EndPoint,
    events: mpsc::Sender<ChannelEvent>,
    settings: TlsSettings,
    state: StateCell,
    pending_cert_error: AtomicBool,
    write_half: Mutex<Option<WriteHalf<TlsStream<TcpStream>>>>,
    origin: OnceLock<SocketAddr>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TlsChannel {
    /// Creates a disconnected channel.
    pub fn new(
        destination: EndPoint,
        settings: TlsSettings,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TlsChannelInner {
                destination,
                events,
                settings,
                state: StateCell::new(ConnectionState::Disconnected),
                pending_cert_error: AtomicBool::new(false),
                write_half: Mutex::new(None),
                origin: OnceLock::new(),
                recv_task: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    fn build_config(
        &self,
        policy: VerifyPolicy,
        identity: Option<ClientIdentity>,
    ) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder().with_safe_defaults();
        let config = match policy {
            VerifyPolicy::Standard => {
                let mut roots = RootCertStore::empty();
                if let Some(ca_path) = &self.inner.settings.ca_path {
                    for cert in load_certificates(ca_path)? {
                        roots
                            .add(&cert)
                            .map_err(|e| Error::TlsError(format!("bad trust anchor: {}", e)))?;
                    }
                }
                let builder = builder.with_root_certificates(roots);
                match identity {
                    Some(identity) => builder
                        .with_client_auth_cert(identity.cert_chain, identity.key)
                        .map_err(|e| Error::TlsError(format!("bad client identity: {}", e)))?,
                    None => builder.with_no_client_auth(),
                }
            }
            VerifyPolicy::AcceptAny => {
                let builder =
                    builder.with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate));
                match identity {
                    Some(identity) => builder
                        .with_client_auth_cert(identity.cert_chain, identity.key)
                        .map_err(|e| Error::TlsError(format!("bad client identity: {}", e)))?,
                    None => builder.with_no_client_auth(),
                }
            }
        };
        Ok(Arc::new(config))
    }

    // Starts a connect attempt with the given handshake configuration.
    // Certificate verification failures end as `CertificateError` events
    // with the channel back in the disconnected state; every other outcome
    // ends as a `Connected` event.
    fn start_connect(&self, config: Arc<ClientConfig>) {
        let inner = self.inner.clone();
        if !inner
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            let inner_err = inner.clone();
            tokio::spawn(async move {
                let _ = inner_err
                    .events
                    .send(ChannelEvent::Connected {
                        destination: inner_err.destination.clone(),
                        result: Err(Error::InvalidState("connect already issued".to_string())),
                    })
                    .await;
            });
            return;
        }
        tokio::spawn(async move {
            match Self::establish(&inner, config).await {
                Ok(()) => {
                    inner.state.set(ConnectionState::Connected);
                    inner.pending_cert_error.store(false, Ordering::Release);
                    let _ = inner
                        .events
                        .send(ChannelEvent::Connected {
                            destination: inner.destination.clone(),
                            result: Ok(()),
                        })
                        .await;
                }
                Err(e) if matches!(e, Error::TlsCertificateError(_)) => {
                    // Keep the channel allocated for a reconnect override.
                    inner.state.set(ConnectionState::Disconnected);
                    inner.pending_cert_error.store(true, Ordering::Release);
                    let _ = inner
                        .events
                        .send(ChannelEvent::CertificateError {
                            destination: inner.destination.clone(),
                            error: e.to_string(),
                        })
                        .await;
                }
                Err(e) => {
                    inner.state.set(ConnectionState::Closed);
                    let _ = inner
                        .events
                        .send(ChannelEvent::Connected {
                            destination: inner.destination.clone(),
                            result: Err(e),
                        })
                        .await;
                }
            }
        });
    }

    async fn establish(inner: &Arc<TlsChannelInner>, config: Arc<ClientConfig>) -> Result<()> {
        let remote = resolve_endpoint(&inner.destination).await?;
        let tcp = TcpStream::connect(remote)
            .await
            .map_err(|e| Error::ConnectFailed(remote, e))?;
        let local = tcp.local_addr().map_err(Error::IoError)?;

        let server_name = ServerName::try_from(inner.destination.host())
            .map_err(|_| Error::TlsError(format!("invalid server name {}", inner.destination.host())))?;
        let connector = TlsConnector::from(config);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(classify_handshake_error)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let _ = inner.origin.set(local);
        *inner.write_half.lock().await = Some(write_half);

        debug!(
            destination = %inner.destination,
            local = %local,
            "TLS channel connected"
        );

        let mut handle_guard = inner.recv_task.lock().await;
        *handle_guard = Some(spawn_recv_loop(inner.clone(), read_half));
        Ok(())
    }
}

// Distinguishes verification failures (which the upper layer may decide to
// override) from other handshake failures.
fn classify_handshake_error(e: std::io::Error) -> Error {
    if let Some(tls_error) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        if let rustls::Error::InvalidCertificate(reason) = tls_error {
            return Error::TlsCertificateError(format!("{:?}", reason));
        }
        return Error::TlsHandshakeFailed(tls_error.to_string());
    }
    Error::TlsHandshakeFailed(e.to_string())
}

fn spawn_recv_loop(
    inner: Arc<TlsChannelInner>,
    mut read_half: ReadHalf<TlsStream<TcpStream>>,
) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut assembler = MessageAssembler::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        trace!(destination = %inner.destination, "TLS receive loop shutting down");
                        break;
                    }
                }
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            let error = if assembler.has_partial() {
                                Some(Error::ConnectionClosedByPeer)
                            } else {
                                None
                            };
                            inner.state.set(ConnectionState::Closed);
                            let _ = inner.events.send(ChannelEvent::Closed {
                                destination: inner.destination.clone(),
                                error,
                            }).await;
                            break;
                        }
                        Ok(n) => {
                            if let Err(e) = pump(
                                &inner.destination,
                                &inner.events,
                                &mut assembler,
                                &buf[..n],
                            ).await {
                                inner.state.set(ConnectionState::Closed);
                                let _ = inner.events.send(ChannelEvent::Closed {
                                    destination: inner.destination.clone(),
                                    error: Some(e),
                                }).await;
                                break;
                            }
                        }
                        Err(e) => {
                            inner.state.set(ConnectionState::Closed);
                            let _ = inner.events.send(ChannelEvent::Closed {
                                destination: inner.destination.clone(),
                                error: Some(map_stream_error(e)),
                            }).await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[async_trait::async_trait]
impl Channel for TlsChannel {
    fn destination(&self) -> &EndPoint {
        &self.inner.destination
    }

    fn origin(&self) -> Result<EndPoint> {
        self.inner
            .origin
            .get()
            .map(|addr| EndPoint::from_socket_addr(*addr, Protocol::Tls))
            .ok_or(Error::NotConnected)
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn connect(&self) {
        match self.build_config(VerifyPolicy::Standard, None) {
            Ok(config) => self.start_connect(config),
            Err(e) => {
                let inner = self.inner.clone();
                inner.state.set(ConnectionState::Closed);
                tokio::spawn(async move {
                    let _ = inner
                        .events
                        .send(ChannelEvent::Connected {
                            destination: inner.destination.clone(),
                            result: Err(e),
                        })
                        .await;
                });
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if self.inner.state.get() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let bytes = message.to_wire();
        let mut guard = self.inner.write_half.lock().await;
        let write_half = guard.as_mut().ok_or(Error::NotConnected)?;
        write_half
            .write_all(&bytes)
            .await
            .map_err(Error::SendFailed)?;
        write_half.flush().await.map_err(Error::SendFailed)?;
        trace!(destination = %self.inner.destination, len = bytes.len(), "sent over TLS");
        Ok(())
    }

    async fn close(&self) {
        self.inner.state.set(ConnectionState::Closed);
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(mut write_half) = self.inner.write_half.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
        if let Some(handle) = self.inner.recv_task.lock().await.take() {
            handle.abort();
        }
        debug!(destination = %self.inner.destination, "TLS channel closed");
    }

    async fn reconnect_ignoring_last_error(&self) -> Result<()> {
        if !self.inner.pending_cert_error.swap(false, Ordering::AcqRel) {
            return Err(Error::NoPendingCertificateError);
        }
        warn!(
            destination = %self.inner.destination,
            "retrying TLS handshake, accepting the rejected certificate"
        );
        let config = self.build_config(VerifyPolicy::AcceptAny, None)?;
        self.start_connect(config);
        Ok(())
    }

    async fn reconnect_with_certificate(&self, identity: ClientIdentity) -> Result<()> {
        if !self.inner.pending_cert_error.swap(false, Ordering::AcqRel) {
            return Err(Error::NoPendingCertificateError);
        }
        let config = self.build_config(VerifyPolicy::Standard, Some(identity))?;
        self.start_connect(config);
        Ok(())
    }
}

impl fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TlsChannel({}, {:?})",
            self.inner.destination, self.inner.state
        )
    }
}

/// Factory producing [`TlsChannel`]s.
#[derive(Debug, Default)]
pub struct TlsChannelFactory {
    settings: TlsSettings,
}

impl TlsChannelFactory {
    /// Creates a factory with the given TLS settings.
    pub fn new(settings: TlsSettings) -> Self {
        Self { settings }
    }
}

impl ChannelFactory for TlsChannelFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Tls
    }

    fn create_channel(
        &self,
        destination: &EndPoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(TlsChannel::new(
            destination.clone(),
            self.settings.clone(),
            events,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconnect_requires_pending_cert_error() {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let channel = TlsChannel::new(
            EndPoint::new("proxy.example.com", 5061, Protocol::Tls),
            TlsSettings::default(),
            events_tx,
        );
        assert!(matches!(
            channel.reconnect_ignoring_last_error().await,
            Err(Error::NoPendingCertificateError)
        ));
    }

    #[test]
    fn missing_pem_files_are_reported() {
        assert!(load_certificates("/nonexistent/ca.pem").is_err());
        assert!(load_private_key("/nonexistent/key.pem").is_err());
    }
}
