//! TCP channel: a byte stream with blank-line + Content-Length framing.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use sipline_sip_message::Message;

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ConnectionState, StateCell};
use crate::endpoint::{EndPoint, Protocol};
use crate::error::{Error, Result};
use crate::framing::MessageAssembler;
use crate::resolve::resolve_endpoint;

const READ_BUFFER_SIZE: usize = 8192;

/// TCP channel towards one destination endpoint.
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<TcpChannelInner>,
}

struct TcpChannelInner {
    destination: EndPoint,
    events: mpsc::Sender<ChannelEvent>,
    state: StateCell,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    origin: OnceLock<SocketAddr>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpChannel {
    /// Creates a disconnected channel.
    pub fn new(destination: EndPoint, events: mpsc::Sender<ChannelEvent>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TcpChannelInner {
                destination,
                events,
                state: StateCell::new(ConnectionState::Disconnected),
                write_half: Mutex::new(None),
                origin: OnceLock::new(),
                recv_task: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    async fn establish(inner: &Arc<TcpChannelInner>) -> Result<()> {
        let remote = resolve_endpoint(&inner.destination).await?;
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| Error::ConnectFailed(remote, e))?;
        let local = stream.local_addr().map_err(Error::IoError)?;
        let (read_half, write_half) = stream.into_split();

        let _ = inner.origin.set(local);
        *inner.write_half.lock().await = Some(write_half);

        debug!(
            destination = %inner.destination,
            local = %local,
            "TCP channel connected"
        );

        let mut handle_guard = inner.recv_task.lock().await;
        *handle_guard = Some(spawn_recv_loop(inner.clone(), read_half));
        Ok(())
    }
}

fn spawn_recv_loop(inner: Arc<TcpChannelInner>, mut read_half: OwnedReadHalf) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut assembler = MessageAssembler::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        trace!(destination = %inner.destination, "TCP receive loop shutting down");
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
                            if let Err(e) = crate::framing::pump(
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
                            let error = crate::framing::map_stream_error(e);
                            let _ = inner.events.send(ChannelEvent::Closed {
                                destination: inner.destination.clone(),
                                error: Some(error),
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
impl Channel for TcpChannel {
    fn destination(&self) -> &EndPoint {
        &self.inner.destination
    }

    fn origin(&self) -> Result<EndPoint> {
        self.inner
            .origin
            .get()
            .map(|addr| EndPoint::from_socket_addr(*addr, Protocol::Tcp))
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
            let result = TcpChannel::establish(&inner).await;
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
        let mut guard = self.inner.write_half.lock().await;
        let write_half = guard.as_mut().ok_or(Error::NotConnected)?;
        write_half.write_all(&bytes).await.map_err(|e| {
            if matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) {
                self.inner.state.set(ConnectionState::Closed);
                Error::ConnectionReset
            } else {
                Error::SendFailed(e)
            }
        })?;
        write_half.flush().await.map_err(Error::SendFailed)?;
        trace!(destination = %self.inner.destination, len = bytes.len(), "sent over TCP");
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
        debug!(destination = %self.inner.destination, "TCP channel closed");
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TcpChannel({}, {:?})",
            self.inner.destination, self.inner.state
        )
    }
}

/// Factory producing [`TcpChannel`]s.
#[derive(Debug, Default)]
pub struct TcpChannelFactory;

impl ChannelFactory for TcpChannelFactory {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn create_channel(
        &self,
        destination: &EndPoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(TcpChannel::new(destination.clone(), events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpChannel, mpsc::Receiver<ChannelEvent>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let destination = EndPoint::new(
            server_addr.ip().to_string(),
            server_addr.port(),
            Protocol::Tcp,
        );
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let channel = TcpChannel::new(destination, events_tx);
        channel.connect();

        let (server_stream, _) = listener.accept().await.unwrap();
        match events_rx.recv().await.unwrap() {
            ChannelEvent::Connected { result, .. } => result.unwrap(),
            other => panic!("unexpected event: {:?}", other),
        }
        (channel, events_rx, server_stream)
    }

    #[tokio::test]
    async fn connects_and_reports_origin() {
        let (channel, _events, _server) = connected_pair().await;
        assert!(channel.is_connected());
        let origin = channel.origin().unwrap();
        assert_eq!(origin.protocol(), Protocol::Tcp);
    }

    #[tokio::test]
    async fn sends_framed_messages_in_order() {
        let (channel, _events, mut server) = connected_pair().await;

        let first = Message::parse("OPTIONS sip:h SIP/2.0\0CSeq: 1 OPTIONS\0Content-Length: 0\0\0")
            .unwrap();
        let second = Message::parse("OPTIONS sip:h SIP/2.0\0CSeq: 2 OPTIONS\0Content-Length: 0\0\0")
            .unwrap();
        channel.send(&first).await.unwrap();
        channel.send(&second).await.unwrap();

        let mut collected = Vec::new();
        let mut buf = vec![0u8; 4096];
        while collected.iter().filter(|&&b| b == b'\n').count() < 8 {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&collected);
        let first_pos = text.find("CSeq: 1 OPTIONS").unwrap();
        let second_pos = text.find("CSeq: 2 OPTIONS").unwrap();
        assert!(first_pos < second_pos);
    }

    #[tokio::test]
    async fn reassembles_split_inbound_message() {
        let (_channel, mut events, mut server) = connected_pair().await;

        let wire = b"SIP/2.0 200 OK\r\nCSeq: 1 OPTIONS\r\nContent-Length: 4\r\n\r\nbody";
        let (a, b) = wire.split_at(20);
        server.write_all(a).await.unwrap();
        server.flush().await.unwrap();
        server.write_all(b).await.unwrap();
        server.flush().await.unwrap();

        match events.recv().await.unwrap() {
            ChannelEvent::MessageReceived { message, .. } => {
                assert_eq!(message.response_code(), Some(200));
                assert_eq!(message.body().unwrap().as_ref(), b"body");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn peer_close_posts_closed_event() {
        let (_channel, mut events, server) = connected_pair().await;
        drop(server);

        match events.recv().await.unwrap() {
            ChannelEvent::Closed { error, .. } => assert!(error.is_none()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let destination = EndPoint::new(addr.ip().to_string(), addr.port(), Protocol::Tcp);
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let channel = TcpChannel::new(destination, events_tx);
        channel.connect();

        match events_rx.recv().await.unwrap() {
            ChannelEvent::Connected { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(channel.state(), ConnectionState::Closed);
    }
}
