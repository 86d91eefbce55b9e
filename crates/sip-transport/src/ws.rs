//! WebSocket channel (RFC 7118): one WS message carries one SIP message.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use sipline_sip_message::Message;

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ConnectionState, StateCell};
use crate::endpoint::{EndPoint, Protocol};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// WebSocket channel towards one destination endpoint, plain (`ws`) or
/// secure (`wss`). The connection is negotiated with the `sip`
/// subprotocol per RFC 7118.
#[derive(Clone)]
pub struct WebSocketChannel {
    inner: Arc<WebSocketChannelInner>,
}

struct WebSocketChannelInner {
    destination: EndPoint,
    secure: bool,
    events: mpsc::Sender<ChannelEvent>,
    state: StateCell,
    sink: Mutex<Option<WsSink>>,
    origin: OnceLock<SocketAddr>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WebSocketChannel {
    /// Creates a disconnected channel. `secure` selects `wss`.
    pub fn new(destination: EndPoint, secure: bool, events: mpsc::Sender<ChannelEvent>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(WebSocketChannelInner {
                destination,
                secure,
                events,
                state: StateCell::new(ConnectionState::Disconnected),
                sink: Mutex::new(None),
                origin: OnceLock::new(),
                recv_task: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    async fn establish(inner: &Arc<WebSocketChannelInner>) -> Result<()> {
        let scheme = if inner.secure { "wss" } else { "ws" };
        let url = format!(
            "{}://{}:{}",
            scheme,
            inner.destination.host(),
            inner.destination.port()
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::WebSocketError(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| Error::WebSocketError(e.to_string()))?;

        let local = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr().map_err(Error::IoError)?,
            MaybeTlsStream::Rustls(tls) => tls.get_ref().0.local_addr().map_err(Error::IoError)?,
            _ => return Err(Error::WebSocketError("unknown stream type".to_string())),
        };

        let (sink, source) = stream.split();
        let _ = inner.origin.set(local);
        *inner.sink.lock().await = Some(sink);

        debug!(
            destination = %inner.destination,
            local = %local,
            secure = inner.secure,
            "WebSocket channel connected"
        );

        let mut handle_guard = inner.recv_task.lock().await;
        *handle_guard = Some(spawn_recv_loop(inner.clone(), source));
        Ok(())
    }
}

fn spawn_recv_loop(
    inner: Arc<WebSocketChannelInner>,
    mut source: SplitStream<WsStream>,
) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        trace!(destination = %inner.destination, "WebSocket receive loop shutting down");
                        break;
                    }
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Binary(data))) => {
                            deliver(&inner, &data).await;
                        }
                        Some(Ok(WsMessage::Text(text))) => {
                            deliver(&inner, text.as_bytes()).await;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let mut guard = inner.sink.lock().await;
                            if let Some(sink) = guard.as_mut() {
                                let _ = sink.send(WsMessage::Pong(payload)).await;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            inner.state.set(ConnectionState::Closed);
                            let _ = inner.events.send(ChannelEvent::Closed {
                                destination: inner.destination.clone(),
                                error: None,
                            }).await;
                            break;
                        }
                        Some(Ok(_)) => {
                            // Pong and raw frames carry nothing for us.
                        }
                        Some(Err(e)) => {
                            inner.state.set(ConnectionState::Closed);
                            let _ = inner.events.send(ChannelEvent::Closed {
                                destination: inner.destination.clone(),
                                error: Some(Error::WebSocketError(e.to_string())),
                            }).await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn deliver(inner: &Arc<WebSocketChannelInner>, data: &[u8]) {
    match Message::from_wire(data) {
        Ok(message) => {
            let event = ChannelEvent::MessageReceived {
                destination: inner.destination.clone(),
                message,
            };
            let _ = inner.events.send(event).await;
        }
        Err(e) => {
            warn!(destination = %inner.destination, error = %e,
                  "dropping unparsable WebSocket message");
        }
    }
}

#[async_trait::async_trait]
impl Channel for WebSocketChannel {
    fn destination(&self) -> &EndPoint {
        &self.inner.destination
    }

    fn origin(&self) -> Result<EndPoint> {
        let protocol = if self.inner.secure {
            Protocol::Wss
        } else {
            Protocol::Ws
        };
        self.inner
            .origin
            .get()
            .map(|addr| EndPoint::from_socket_addr(*addr, protocol))
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
            let result = WebSocketChannel::establish(&inner).await;
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
        let bytes = message.to_wire();
        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotConnected)?;
        sink.send(WsMessage::Binary(bytes))
            .await
            .map_err(|e| Error::WebSocketError(e.to_string()))?;
        trace!(destination = %self.inner.destination, "sent over WebSocket");
        Ok(())
    }

    async fn close(&self) {
        self.inner.state.set(ConnectionState::Closed);
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(handle) = self.inner.recv_task.lock().await.take() {
            handle.abort();
        }
        debug!(destination = %self.inner.destination, "WebSocket channel closed");
    }
}

impl fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WebSocketChannel({}, {:?})",
            self.inner.destination, self.inner.state
        )
    }
}

/// Factory producing [`WebSocketChannel`]s for `ws` or `wss`.
#[derive(Debug)]
pub struct WebSocketChannelFactory {
    secure: bool,
}

impl WebSocketChannelFactory {
    /// Plain `ws` factory.
    pub fn plain() -> Self {
        Self { secure: false }
    }

    /// Secure `wss` factory.
    pub fn secure() -> Self {
        Self { secure: true }
    }
}

impl ChannelFactory for WebSocketChannelFactory {
    fn protocol(&self) -> Protocol {
        if self.secure {
            Protocol::Wss
        } else {
            Protocol::Ws
        }
    }

    fn create_channel(
        &self,
        destination: &EndPoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(WebSocketChannel::new(
            destination.clone(),
            self.secure,
            events,
        )))
    }
}
