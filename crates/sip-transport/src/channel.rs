use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use sipline_sip_message::Message;

use crate::endpoint::{EndPoint, Protocol};
use crate::error::{Error, Result};
use crate::tls::ClientIdentity;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected
    Disconnected,
    /// Connection establishment in flight
    Connecting,
    /// Ready to send and receive
    Connected,
    /// Torn down, either locally or by the peer
    Closed,
}

/// Events a channel posts to its owner.
///
/// Channels never call back into the network layer synchronously; every
/// completion and every inbound message is queued on the owner's event
/// channel and handled on its event loop. This keeps sends issued from
/// within event handlers re-entrancy safe.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Connection establishment finished. For UDP this is posted on the
    /// dispatch cycle following `connect()`.
    Connected {
        /// The channel's destination endpoint
        destination: EndPoint,
        /// `Ok` on success, the connect error otherwise
        result: Result<()>,
    },

    /// A complete SIP message arrived on the channel.
    MessageReceived {
        /// The channel's destination endpoint
        destination: EndPoint,
        /// The parsed message, tagged incoming
        message: Message,
    },

    /// The channel stopped working without a local `close()` call: the
    /// peer closed the connection or the transport failed.
    Closed {
        /// The channel's destination endpoint
        destination: EndPoint,
        /// The error that tore the channel down, if any
        error: Option<Error>,
    },

    /// TLS certificate verification failed during the handshake. The
    /// channel stays allocated so a reconnect policy can be applied.
    CertificateError {
        /// The channel's destination endpoint
        destination: EndPoint,
        /// Human-readable verification failure
        error: String,
    },
}

/// A bidirectional, framed carrier of SIP messages towards one destination
/// endpoint over one transport.
///
/// Channels are created by a [`ChannelFactory`] in the disconnected state.
/// `connect()` starts connection establishment and returns immediately;
/// the outcome arrives as [`ChannelEvent::Connected`]. Messages sent on a
/// single channel reach the wire in `send` order.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// The destination endpoint this channel was created for.
    fn destination(&self) -> &EndPoint;

    /// The local endpoint, assigned once connected. Used to stamp
    /// outgoing Via and Contact headers.
    fn origin(&self) -> Result<EndPoint>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Whether the channel is ready to send.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Starts connection establishment. Completion is reported via
    /// [`ChannelEvent::Connected`]; calling `connect` more than once is an
    /// error surfaced through that same event.
    fn connect(&self);

    /// Serializes and transmits a message. Must not be called before the
    /// channel is connected.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Tears the channel down. No `Closed` event is posted for a local
    /// close; the caller already knows.
    async fn close(&self);

    /// Error-bearing close variant: records the error, then tears down.
    async fn close_with_error(&self, error: Error) {
        tracing::warn!(destination = %self.destination(), error = %error, "closing channel");
        self.close().await;
    }

    /// Re-attempts a TLS handshake that failed certificate verification,
    /// accepting the previously rejected certificate. Errors on non-TLS
    /// channels and when no verification failure is pending.
    async fn reconnect_ignoring_last_error(&self) -> Result<()> {
        Err(Error::NoPendingCertificateError)
    }

    /// Re-attempts a TLS handshake that failed certificate verification,
    /// presenting a client certificate. Errors on non-TLS channels and
    /// when no verification failure is pending.
    async fn reconnect_with_certificate(&self, _identity: ClientIdentity) -> Result<()> {
        Err(Error::NoPendingCertificateError)
    }
}

/// Creates channels for destination endpoints of one protocol.
///
/// The network layer registers one factory per [`Protocol`] and creates
/// channels lazily when a destination is first needed.
pub trait ChannelFactory: Send + Sync {
    /// The protocol this factory serves.
    fn protocol(&self) -> Protocol;

    /// Creates a disconnected channel for `destination`. Events are posted
    /// on `events`.
    fn create_channel(
        &self,
        destination: &EndPoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Arc<dyn Channel>>;
}

// Lock-free connection-state cell shared by the channel implementations.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(encode(state)))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(encode(state), Ordering::Release);
    }

    /// Transitions only when the current state matches; returns whether
    /// the swap happened.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(
                encode(from),
                encode(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.get())
    }
}

fn encode(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Disconnected => 0,
        ConnectionState::Connecting => 1,
        ConnectionState::Connected => 2,
        ConnectionState::Closed => 3,
    }
}

fn decode(value: u8) -> ConnectionState {
    match value {
        0 => ConnectionState::Disconnected,
        1 => ConnectionState::Connecting,
        2 => ConnectionState::Connected,
        _ => ConnectionState::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_transitions() {
        let cell = StateCell::new(ConnectionState::Disconnected);
        assert_eq!(cell.get(), ConnectionState::Disconnected);

        assert!(cell.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert!(!cell.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert_eq!(cell.get(), ConnectionState::Connecting);

        cell.set(ConnectionState::Closed);
        assert_eq!(cell.get(), ConnectionState::Closed);
    }
}
