//! UDP channel: one connected socket per destination endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sipline_sip_message::Message;

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ConnectionState, StateCell};
use crate::endpoint::{EndPoint, Protocol};
use crate::error::{Error, Result};
use crate::resolve::resolve_endpoint;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// UDP channel towards one destination endpoint.
///
/// The socket is bound to an ephemeral local port and connected to the
/// destination, so `recv` only yields datagrams from the peer and the
/// local address is stable for Via/Contact stamping. Each datagram carries
/// exactly one SIP message. The connect completion is posted on the next
/// dispatch cycle, matching the contract for connectionless transports.
#[derive(Clone)]
pub struct UdpChannel {
    inner: Arc<UdpChannelInner>,
}

struct UdpChannelInner {
    destination: EndPoint,
    events: mpsc::Sender<ChannelEvent>,
    state: StateCell,
    socket: OnceLock<Arc<UdpSocket>>,
    origin: OnceLock<SocketAddr>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl UdpChannel {
    /// Creates a disconnected channel.
    pub fn new(destination: EndPoint, events: mpsc::Sender<ChannelEvent>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(UdpChannelInner {
                destination,
                events,
                state: StateCell::new(ConnectionState::Disconnected),
                socket: OnceLock::new(),
                origin: OnceLock::new(),
                recv_task: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    async fn establish(inner: &Arc<UdpChannelInner>) -> Result<()> {
        let remote = resolve_endpoint(&inner.destination).await?;
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(Error::BindFailed)?;
        socket
            .connect(remote)
            .await
            .map_err(|e| Error::ConnectFailed(remote, e))?;

        let local = socket.local_addr().map_err(Error::IoError)?;
        let socket = Arc::new(socket);
        let _ = inner.socket.set(socket.clone());
        let _ = inner.origin.set(local);

        debug!(
            destination = %inner.destination,
            local = %local,
            "UDP channel connected"
        );

        let mut handle_guard = inner.recv_task.lock().await;
        *handle_guard = Some(spawn_recv_loop(inner.clone(), socket));
        Ok(())
    }
}

fn spawn_recv_loop(inner: Arc<UdpChannelInner>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        trace!(destination = %inner.destination, "UDP receive loop shutting down");
                        break;
                    }
                }
                result = socket.recv(&mut buf) => {
                    match result {
                        Ok(n) => match Message::from_wire(&buf[..n]) {
                            Ok(message) => {
                                let event = ChannelEvent::MessageReceived {
                                    destination: inner.destination.clone(),
                                    message,
                                };
                                if inner.events.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // Malformed datagrams are dropped silently
                                // on the inbound path.
                                warn!(destination = %inner.destination, error = %e,
                                      "dropping unparsable UDP datagram");
                            }
                        },
                        Err(e) => {
                            warn!(destination = %inner.destination, error = %e,
                                  "UDP receive failed");
                            inner.state.set(ConnectionState::Closed);
                            let _ = inner.events.send(ChannelEvent::Closed {
                                destination: inner.destination.clone(),
                                error: Some(Error::ReceiveFailed(e)),
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
impl Channel for UdpChannel {
    fn destination(&self) -> &EndPoint {
        &self.inner.destination
    }

    fn origin(&self) -> Result<EndPoint> {
        self.inner
            .origin
            .get()
            .map(|addr| EndPoint::from_socket_addr(*addr, Protocol::Udp))
            .ok_or(Error::NotConnected)
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    fn connect(&self) {
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
            let result = UdpChannel::establish(&inner).await;
            match &result {
                Ok(()) => inner.state.set(ConnectionState::Connected),
                Err(_) => inner.state.set(ConnectionState::Closed),
            }
            let _ = inner
                .events
                .send(ChannelEvent::Connected {
                    destination: inner.destination.clone(),
                    result,
                })
                .await;
        });
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if self.inner.state.get() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let socket = self.inner.socket.get().ok_or(Error::NotConnected)?;
        let bytes = message.to_wire();
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge(bytes.len()));
        }
        trace!(destination = %self.inner.destination, len = bytes.len(), "sending UDP datagram");
        socket.send(&bytes).await.map_err(Error::SendFailed)?;
        Ok(())
    }

    async fn close(&self) {
        self.inner.state.set(ConnectionState::Closed);
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(handle) = self.inner.recv_task.lock().await.take() {
            handle.abort();
        }
        debug!(destination = %self.inner.destination, "UDP channel closed");
    }
}

impl fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UdpChannel({}, {:?})",
            self.inner.destination, self.inner.state
        )
    }
}

/// Factory producing [`UdpChannel`]s.
#[derive(Debug, Default)]
pub struct UdpChannelFactory;

impl ChannelFactory for UdpChannelFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn create_channel(
        &self,
        destination: &EndPoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(UdpChannel::new(destination.clone(), events)))
    }
}
