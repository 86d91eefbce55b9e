//! The network layer: channel ownership, transaction routing, and the
//! delegate surface towards the Transaction User.
//!
//! The `NetworkLayer` owns the `destination → ChannelContext` map, one
//! transaction map per side, the channel factory registry and the alias
//! map. Everything that mutates this state runs on one event loop task,
//! fed by three queues: channel events, transaction events and idle-timer
//! firings. Channels and transactions never call into the network layer
//! synchronously.
//!
//! Channel lifetimes are reference counted: every transaction bound to a
//! channel holds one reference (plus any external holders via
//! `request_channel`). When the count reaches zero a reuse-lifetime timer
//! starts; a new user cancels it, its firing closes the channel.

mod config;

pub use config::{
    default_branch_factory, BranchFactory, CertErrorDecision, NetworkConfig, SslCertErrorHandler,
};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use sipline_sip_message::{Direction, Message, Method};
use sipline_sip_transport::{
    Channel, ChannelEvent, ChannelFactory, ClientIdentity, EndPoint, Protocol,
};

use crate::client::{ClientInviteTransaction, ClientNonInviteTransaction};
use crate::error::{Error, Result};
use crate::event::{CommandSender, InternalTransactionCommand, TransactionEvent};
use crate::key::TransactionKey;
use crate::server::{ServerInviteTransaction, ServerNonInviteTransaction};
use crate::timer::TimerManager;

const EVENT_QUEUE_CAPACITY: usize = 128;

// One live transaction as the network layer tracks it.
enum TransactionHandle {
    ClientInvite(ClientInviteTransaction),
    ClientNonInvite(ClientNonInviteTransaction),
    ServerInvite(ServerInviteTransaction),
    ServerNonInvite(ServerNonInviteTransaction),
}

impl TransactionHandle {
    fn command_sender(&self) -> CommandSender {
        match self {
            TransactionHandle::ClientInvite(tx) => tx.command_sender(),
            TransactionHandle::ClientNonInvite(tx) => tx.command_sender(),
            TransactionHandle::ServerInvite(tx) => tx.command_sender(),
            TransactionHandle::ServerNonInvite(tx) => tx.command_sender(),
        }
    }

    async fn start(&self) {
        match self {
            TransactionHandle::ClientInvite(tx) => tx.start().await,
            TransactionHandle::ClientNonInvite(tx) => tx.start().await,
            TransactionHandle::ServerInvite(tx) => tx.start().await,
            TransactionHandle::ServerNonInvite(tx) => tx.start().await,
        }
    }
}

struct TransactionEntry {
    handle: TransactionHandle,
    destination: EndPoint,
}

// Per-channel bookkeeping.
struct ChannelContext {
    channel: Arc<dyn Channel>,
    refs: usize,
    idle_timer: Option<JoinHandle<()>>,
    // A request stashed while the channel connects, with the completion
    // of the `send` that triggered the connect.
    initial: Option<(Message, oneshot::Sender<Result<()>>)>,
    transactions: HashSet<TransactionKey>,
}

impl ChannelContext {
    fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            refs: 0,
            idle_timer: None,
            initial: None,
            transactions: HashSet::new(),
        }
    }
}

/// The SIP network layer.
///
/// Created with [`NetworkLayer::new`], which returns the event receiver
/// acting as the delegate surface: channel lifecycle, incoming requests
/// and responses, timeouts and transport errors all arrive there as
/// [`TransactionEvent`]s.
#[derive(Clone)]
pub struct NetworkLayer {
    inner: Arc<Inner>,
}

struct Inner {
    config: NetworkConfig,
    factories: Mutex<HashMap<Protocol, Arc<dyn ChannelFactory>>>,
    channels: Mutex<HashMap<EndPoint, ChannelContext>>,
    aliases: Mutex<HashMap<EndPoint, EndPoint>>,
    client_transactions: Mutex<HashMap<TransactionKey, TransactionEntry>>,
    server_transactions: Mutex<HashMap<TransactionKey, TransactionEntry>>,
    timer_manager: Arc<TimerManager>,
    tu_events_tx: mpsc::Sender<TransactionEvent>,
    transaction_events_tx: mpsc::Sender<TransactionEvent>,
    channel_events_tx: mpsc::Sender<ChannelEvent>,
    idle_tx: mpsc::Sender<EndPoint>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
}

impl NetworkLayer {
    /// Creates a network layer with the given configuration and channel
    /// factories, and returns the delegate event receiver.
    pub fn new(
        config: NetworkConfig,
        factories: Vec<Arc<dyn ChannelFactory>>,
    ) -> (Self, mpsc::Receiver<TransactionEvent>) {
        let (tu_events_tx, tu_events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (transaction_events_tx, transaction_events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (channel_events_tx, channel_events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (idle_tx, idle_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut factory_map = HashMap::new();
        for factory in factories {
            factory_map.insert(factory.protocol(), factory);
        }

        let inner = Arc::new(Inner {
            config,
            factories: Mutex::new(factory_map),
            channels: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            client_transactions: Mutex::new(HashMap::new()),
            server_transactions: Mutex::new(HashMap::new()),
            timer_manager: Arc::new(TimerManager::new()),
            tu_events_tx,
            transaction_events_tx,
            channel_events_tx,
            idle_tx,
            shutdown_tx,
            running: AtomicBool::new(true),
        });

        tokio::spawn(run_event_loop(
            inner.clone(),
            channel_events_rx,
            transaction_events_rx,
            idle_rx,
            shutdown_rx,
        ));

        (Self { inner }, tu_events_rx)
    }

    /// Registers an additional channel factory, replacing any previous
    /// one for the same protocol.
    pub async fn register_channel_factory(&self, factory: Arc<dyn ChannelFactory>) {
        self.inner
            .factories
            .lock()
            .await
            .insert(factory.protocol(), factory);
    }

    /// Sends an outgoing message.
    ///
    /// Requests are routed by the first Route header (else the
    /// Request-URI); when no channel exists for the next hop, one is
    /// created and the call resolves once the connect and the send both
    /// finished. Responses are routed to their server transaction, else
    /// directly over an existing channel derived from the top Via.
    pub async fn send(&self, message: Message) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if message.direction() != Direction::Outgoing {
            debug!("trying to send an incoming message");
            return Err(Error::InvalidDirection);
        }
        if message.is_request() {
            self.inner.send_request(message).await
        } else {
            self.inner.send_response(message).await
        }
    }

    /// Opens a channel to the destination without sending anything yet.
    /// Completion arrives as a `ChannelConnected` event.
    pub async fn connect(&self, destination: EndPoint) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let canonical = self.inner.canonical(&destination).await;
        {
            let channels = self.inner.channels.lock().await;
            if channels.contains_key(&canonical) {
                return Ok(());
            }
        }
        let channel = self.inner.create_channel(&canonical).await?;
        {
            let mut channels = self.inner.channels.lock().await;
            // A concurrent caller may have created the context meanwhile.
            if channels.contains_key(&canonical) {
                return Ok(());
            }
            channels.insert(canonical, ChannelContext::new(channel.clone()));
        }
        channel.connect();
        Ok(())
    }

    /// Declares `alias` to reach the same peer as `destination`, so
    /// inbound traffic matched by transaction identifier resolves to the
    /// same channel context. Returns whether the destination is known.
    pub async fn add_alias(&self, destination: EndPoint, alias: EndPoint) -> bool {
        if !self.inner.channels.lock().await.contains_key(&destination) {
            return false;
        }
        self.inner.aliases.lock().await.insert(alias, destination);
        true
    }

    /// Takes an external reference on the destination's channel, keeping
    /// it alive independently of transactions. Returns whether a channel
    /// exists.
    pub async fn request_channel(&self, destination: &EndPoint) -> bool {
        let canonical = self.inner.canonical(destination).await;
        let mut channels = self.inner.channels.lock().await;
        match channels.get_mut(&canonical) {
            Some(context) => {
                Inner::add_channel_ref(context);
                true
            }
            None => false,
        }
    }

    /// Releases an external channel reference taken with
    /// [`NetworkLayer::request_channel`].
    pub async fn release_channel(&self, destination: &EndPoint) {
        let canonical = self.inner.canonical(destination).await;
        let mut channels = self.inner.channels.lock().await;
        if let Some(context) = channels.get_mut(&canonical) {
            self.inner.release_channel_ref(context, &canonical);
        }
    }

    /// The local endpoint of the destination's channel.
    pub async fn origin_of(&self, destination: &EndPoint) -> Result<EndPoint> {
        let canonical = self.inner.canonical(destination).await;
        let channels = self.inner.channels.lock().await;
        let context = channels
            .get(&canonical)
            .ok_or_else(|| Error::NotConnected(canonical.clone()))?;
        context.channel.origin().map_err(Error::Transport)
    }

    /// Re-attempts a TLS handshake that failed certificate verification,
    /// accepting the rejected certificate.
    pub async fn reconnect_ignoring_last_error(&self, destination: &EndPoint) -> Result<()> {
        let channel = self.inner.channel_for(destination).await?;
        channel
            .reconnect_ignoring_last_error()
            .await
            .map_err(Error::Transport)
    }

    /// Re-attempts a TLS handshake that failed certificate verification,
    /// presenting a client certificate.
    pub async fn reconnect_with_certificate(
        &self,
        destination: &EndPoint,
        identity: ClientIdentity,
    ) -> Result<()> {
        let channel = self.inner.channel_for(destination).await?;
        channel
            .reconnect_with_certificate(identity)
            .await
            .map_err(Error::Transport)
    }

    /// Gives up on a destination: destroys its channel context (cascading
    /// termination through its transactions), closes the channel and
    /// notifies the delegate.
    pub async fn dismiss_last_connection_attempt(&self, destination: &EndPoint) -> Result<()> {
        let canonical = self.inner.canonical(destination).await;
        self.inner.dismiss(&canonical).await
    }

    /// Tears the whole layer down: every channel context is destroyed,
    /// which cascades termination through all transactions; no delegate
    /// events are emitted after this call begins.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);

        let endpoints: Vec<EndPoint> = {
            let channels = self.inner.channels.lock().await;
            channels.keys().cloned().collect()
        };
        for endpoint in endpoints {
            if let Some(context) = self.inner.destroy_channel_context(&endpoint).await {
                context.channel.close().await;
                if let Some((_, done)) = context.initial {
                    let _ = done.send(Err(Error::Shutdown));
                }
            }
        }
        self.inner.aliases.lock().await.clear();
        let _ = self.inner.shutdown_tx.send(true);
        info!("network layer shut down");
    }
}

impl Inner {
    // ---- Outbound ------------------------------------------------------

    async fn send_request(self: &Arc<Self>, request: Message) -> Result<()> {
        let destination = next_hop_for_request(&request)?;
        trace!(destination = %destination, "routing request");

        let canonical = self.canonical(&destination).await;
        let existing = {
            let channels = self.channels.lock().await;
            channels.get(&canonical).map(|c| c.channel.is_connected())
        };

        match existing {
            Some(true) => self.send_on_connected_channel(&canonical, request).await,
            Some(false) => Err(Error::NotConnected(canonical)),
            None => {
                if request.method() == Some(&Method::Ack) {
                    debug!("ACK requests cannot open connections");
                    return Err(Error::AckWithoutChannel);
                }
                let channel = self.create_channel(&canonical).await?;
                let (done_tx, done_rx) = oneshot::channel();
                {
                    let mut channels = self.channels.lock().await;
                    // A concurrent caller may have created the context
                    // meanwhile; never clobber it.
                    if let Some(existing) = channels.get(&canonical) {
                        let connected = existing.channel.is_connected();
                        drop(channels);
                        return if connected {
                            self.send_on_connected_channel(&canonical, request).await
                        } else {
                            Err(Error::NotConnected(canonical))
                        };
                    }
                    let mut context = ChannelContext::new(channel.clone());
                    context.initial = Some((request, done_tx));
                    channels.insert(canonical.clone(), context);
                }
                channel.connect();
                // Resolves once the connect completed and the stashed
                // request was sent (or either failed).
                done_rx.await.unwrap_or(Err(Error::Shutdown))
            }
        }
    }

    // Stamps and transmits a request on a connected channel, creating the
    // client transaction that will drive retransmissions and responses.
    async fn send_on_connected_channel(
        self: &Arc<Self>,
        endpoint: &EndPoint,
        mut request: Message,
    ) -> Result<()> {
        let (channel, origin) = {
            let channels = self.channels.lock().await;
            let context = channels
                .get(endpoint)
                .ok_or_else(|| Error::NotConnected(endpoint.clone()))?;
            if !context.channel.is_connected() {
                return Err(Error::NotConnected(endpoint.clone()));
            }
            let origin = context.channel.origin().map_err(Error::Transport)?;
            (context.channel.clone(), origin)
        };

        // Stamp the topmost Via unless the upper layer copied a previous
        // one; a Via present without a branch still gets one.
        if !request.has_header("via") {
            let branch = (self.config.branch_factory)();
            request.add_header(&format!(
                "Via: SIP/2.0/{} {};branch={}",
                endpoint.protocol().as_str(),
                origin.host_port(),
                branch
            ))?;
        } else if request.top_via().and_then(|v| v.branch().map(String::from)).is_none() {
            let branch = (self.config.branch_factory)();
            request.set_via_branch(&branch)?;
        }

        if !self.config.software_name.is_empty() && !request.has_header("user-agent") {
            request.add_header(&format!("User-Agent: {}", self.config.software_name))?;
        }

        let is_register = request.method() == Some(&Method::Register);
        stamp_contact(&mut request, &origin, endpoint.protocol(), is_register)?;

        // ACKs travel outside transactions.
        if request.method() == Some(&Method::Ack) {
            return channel.send(&request).await.map_err(Error::Transport);
        }

        let id = TransactionKey::client_for_request(&request).ok_or(Error::MissingVia)?;
        let is_invite = request.method() == Some(&Method::Invite);

        let handle = if is_invite {
            TransactionHandle::ClientInvite(
                ClientInviteTransaction::spawn(
                    id.clone(),
                    request,
                    channel,
                    self.transaction_events_tx.clone(),
                    self.timer_manager.clone(),
                    self.config.timer_settings.clone(),
                )
                .await,
            )
        } else {
            TransactionHandle::ClientNonInvite(
                ClientNonInviteTransaction::spawn(
                    id.clone(),
                    request,
                    channel,
                    self.transaction_events_tx.clone(),
                    self.timer_manager.clone(),
                    self.config.timer_settings.clone(),
                )
                .await,
            )
        };

        {
            let mut channels = self.channels.lock().await;
            if let Some(context) = channels.get_mut(endpoint) {
                context.transactions.insert(id.clone());
                Self::add_channel_ref(context);
            }
        }
        // Registered before it starts, so the response to the first
        // transmission always finds the map entry.
        {
            let mut transactions = self.client_transactions.lock().await;
            transactions.insert(
                id.clone(),
                TransactionEntry {
                    handle,
                    destination: endpoint.clone(),
                },
            );
            if let Some(entry) = transactions.get(&id) {
                // The transaction transmits the request when it starts.
                entry.handle.start().await;
            }
        }
        debug!(id = %id, destination = %endpoint, "client transaction started");
        Ok(())
    }

    async fn send_response(self: &Arc<Self>, mut response: Message) -> Result<()> {
        if !self.config.software_name.is_empty() && !response.has_header("server") {
            response.add_header(&format!("Server: {}", self.config.software_name))?;
        }

        if let Some(id) = TransactionKey::server_for_response(&response) {
            let cmd_tx = {
                let transactions = self.server_transactions.lock().await;
                transactions.get(&id).map(|e| e.handle.command_sender())
            };
            if let Some(cmd_tx) = cmd_tx {
                cmd_tx
                    .send(InternalTransactionCommand::SendResponse(response))
                    .await
                    .map_err(|_| Error::TransactionGone(id.to_string()))?;
                return Ok(());
            }
        }

        // No server transaction: send directly through an existing channel
        // derived from the top Via (respecting received= and rport=).
        let via = response.top_via().ok_or(Error::MissingVia)?;
        let destination = EndPoint::next_hop_from_via(&via)?;
        let canonical = self.canonical(&destination).await;
        let channel = {
            let channels = self.channels.lock().await;
            let context = channels
                .get(&canonical)
                .ok_or_else(|| Error::NotConnected(canonical.clone()))?;
            if !context.channel.is_connected() {
                return Err(Error::NotConnected(canonical.clone()));
            }
            context.channel.clone()
        };
        channel.send(&response).await.map_err(Error::Transport)
    }

    // ---- Inbound -------------------------------------------------------

    async fn handle_incoming(self: &Arc<Self>, destination: EndPoint, mut message: Message) {
        if message.is_request() {
            self.stamp_received_and_rport(&destination, &mut message);

            let Some(id) = TransactionKey::server_for_request(&message) else {
                warn!("discarding request without transaction identity");
                return;
            };

            let cmd_tx = {
                let transactions = self.server_transactions.lock().await;
                transactions.get(&id).map(|e| e.handle.command_sender())
            };
            if let Some(cmd_tx) = cmd_tx {
                // Retransmissions and the ACK handshake are the
                // transaction's business; nothing goes up from here.
                let _ = cmd_tx
                    .send(InternalTransactionCommand::ProcessMessage(message))
                    .await;
                return;
            }

            if message.method() == Some(&Method::Ack) {
                // ACK for a 2xx final: no transaction matches it, the TU
                // handles it directly.
                self.emit(TransactionEvent::IncomingRequest {
                    transaction_id: None,
                    request: message,
                })
                .await;
                return;
            }

            self.create_server_transaction(destination, id, message).await;
        } else {
            let Some(id) = TransactionKey::client_for_response(&message) else {
                warn!("discarding response without transaction identity");
                return;
            };
            let cmd_tx = {
                let transactions = self.client_transactions.lock().await;
                transactions.get(&id).map(|e| e.handle.command_sender())
            };
            match cmd_tx {
                Some(cmd_tx) => {
                    let _ = cmd_tx
                        .send(InternalTransactionCommand::ProcessMessage(message))
                        .await;
                }
                None => {
                    warn!(
                        "discarded inbound response ({} {}), unattached to any request",
                        message.response_code().unwrap_or(0),
                        message.reason_phrase()
                    );
                }
            }
        }
    }

    // Stamps received= and rport= on the topmost Via when the sent-by
    // values do not match what the channel observed.
    fn stamp_received_and_rport(&self, destination: &EndPoint, message: &mut Message) {
        let Some(via) = message.top_via() else {
            return;
        };
        if !via.host.eq_ignore_ascii_case(destination.host()) {
            if let Err(e) = message.set_via_received(destination.host()) {
                warn!(error = %e, "failed to stamp received=");
            }
        }
        let via_port = via
            .port
            .unwrap_or_else(|| destination.protocol().default_port());
        if via_port != destination.port() {
            if let Err(e) = message.set_via_rport(destination.port()) {
                warn!(error = %e, "failed to stamp rport=");
            }
        }
    }

    async fn create_server_transaction(
        self: &Arc<Self>,
        destination: EndPoint,
        id: TransactionKey,
        request: Message,
    ) {
        let canonical = self.canonical(&destination).await;
        let channel = {
            let channels = self.channels.lock().await;
            match channels.get(&canonical) {
                Some(context) => context.channel.clone(),
                None => {
                    warn!(destination = %canonical, "request from unknown channel, discarding");
                    return;
                }
            }
        };

        let is_invite = request.method() == Some(&Method::Invite);
        let handle = if is_invite {
            TransactionHandle::ServerInvite(
                ServerInviteTransaction::spawn(
                    id.clone(),
                    request.clone(),
                    channel,
                    self.transaction_events_tx.clone(),
                    self.timer_manager.clone(),
                    self.config.timer_settings.clone(),
                )
                .await,
            )
        } else {
            TransactionHandle::ServerNonInvite(
                ServerNonInviteTransaction::spawn(
                    id.clone(),
                    request.clone(),
                    channel,
                    self.transaction_events_tx.clone(),
                    self.timer_manager.clone(),
                    self.config.timer_settings.clone(),
                )
                .await,
            )
        };

        {
            let mut channels = self.channels.lock().await;
            if let Some(context) = channels.get_mut(&canonical) {
                context.transactions.insert(id.clone());
                Self::add_channel_ref(context);
            }
        }
        {
            let mut transactions = self.server_transactions.lock().await;
            transactions.insert(
                id.clone(),
                TransactionEntry {
                    handle,
                    destination: canonical,
                },
            );
            if let Some(entry) = transactions.get(&id) {
                entry.handle.start().await;
            }
        }

        debug!(id = %id, "server transaction created");
        self.emit(TransactionEvent::IncomingRequest {
            transaction_id: Some(id),
            request,
        })
        .await;
    }

    // ---- Channel lifecycle ---------------------------------------------

    async fn create_channel(&self, destination: &EndPoint) -> Result<Arc<dyn Channel>> {
        let factories = self.factories.lock().await;
        let factory = factories
            .get(&destination.protocol())
            .ok_or(Error::NoChannelFactory(destination.protocol()))?;
        factory
            .create_channel(destination, self.channel_events_tx.clone())
            .map_err(Error::Transport)
    }

    async fn channel_for(&self, destination: &EndPoint) -> Result<Arc<dyn Channel>> {
        let canonical = self.canonical(destination).await;
        let channels = self.channels.lock().await;
        channels
            .get(&canonical)
            .map(|c| c.channel.clone())
            .ok_or(Error::NotConnected(canonical))
    }

    fn add_channel_ref(context: &mut ChannelContext) {
        context.refs += 1;
        if let Some(handle) = context.idle_timer.take() {
            handle.abort();
        }
    }

    fn release_channel_ref(&self, context: &mut ChannelContext, endpoint: &EndPoint) {
        context.refs = context.refs.saturating_sub(1);
        if context.refs == 0 {
            let idle_tx = self.idle_tx.clone();
            let endpoint = endpoint.clone();
            let lifetime = self.config.reuse_lifetime;
            context.idle_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(lifetime).await;
                let _ = idle_tx.send(endpoint).await;
            }));
        }
    }

    // Removes the context and terminates every transaction still using
    // it; the caller decides what to do with the channel itself.
    async fn destroy_channel_context(&self, endpoint: &EndPoint) -> Option<ChannelContext> {
        let context = self.channels.lock().await.remove(endpoint)?;
        if let Some(handle) = &context.idle_timer {
            handle.abort();
        }
        for id in &context.transactions {
            let cmd_tx = if id.is_server() {
                let transactions = self.server_transactions.lock().await;
                transactions.get(id).map(|e| e.handle.command_sender())
            } else {
                let transactions = self.client_transactions.lock().await;
                transactions.get(id).map(|e| e.handle.command_sender())
            };
            if let Some(cmd_tx) = cmd_tx {
                let _ = cmd_tx.send(InternalTransactionCommand::Terminate).await;
            }
        }
        Some(context)
    }

    async fn dismiss(&self, endpoint: &EndPoint) -> Result<()> {
        let Some(context) = self.destroy_channel_context(endpoint).await else {
            return Err(Error::NotConnected(endpoint.clone()));
        };
        context.channel.close().await;
        if let Some((_, done)) = context.initial {
            let _ = done.send(Err(Error::Transport(
                sipline_sip_transport::Error::ChannelClosed,
            )));
        }
        self.emit(TransactionEvent::ChannelClosed {
            destination: endpoint.clone(),
        })
        .await;
        Ok(())
    }

    // ---- Event loop handlers -------------------------------------------

    async fn handle_channel_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected {
                destination,
                result,
            } => self.handle_channel_connected(destination, result).await,
            ChannelEvent::MessageReceived {
                destination,
                message,
            } => self.handle_incoming(destination, message).await,
            ChannelEvent::Closed { destination, error } => {
                self.handle_channel_closed(destination, error).await;
            }
            ChannelEvent::CertificateError { destination, error } => {
                self.handle_certificate_error(destination, error).await;
            }
        }
    }

    async fn handle_channel_connected(
        self: &Arc<Self>,
        destination: EndPoint,
        result: sipline_sip_transport::Result<()>,
    ) {
        let connect_ok = result.is_ok();
        let connect_error = result.as_ref().err().map(|e| e.to_string());
        self.emit(TransactionEvent::ChannelConnected {
            destination: destination.clone(),
            result: result.map_err(|e| e.to_string()),
        })
        .await;

        if connect_ok {
            let initial = {
                let mut channels = self.channels.lock().await;
                channels
                    .get_mut(&destination)
                    .and_then(|context| context.initial.take())
            };
            if let Some((request, done)) = initial {
                let send_result = self.send_on_connected_channel(&destination, request).await;
                match send_result {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        // The channel connected but its first send failed:
                        // tear the context down and report the close.
                        error!(destination = %destination, error = %e,
                               "initial send failed after connect");
                        if let Some(context) = self.destroy_channel_context(&destination).await {
                            context.channel.close().await;
                        }
                        let _ = done.send(Err(e));
                        self.emit(TransactionEvent::ChannelClosed { destination }).await;
                    }
                }
            }
        } else {
            // Connect failed: the context never served anyone.
            if let Some(context) = self.destroy_channel_context(&destination).await {
                context.channel.close().await;
                if let Some((_, done)) = context.initial {
                    let _ = done.send(Err(Error::ConnectFailed(
                        connect_error.unwrap_or_default(),
                    )));
                }
            }
        }
    }

    async fn handle_channel_closed(
        self: &Arc<Self>,
        destination: EndPoint,
        error: Option<sipline_sip_transport::Error>,
    ) {
        if let Some(context) = self.destroy_channel_context(&destination).await {
            match error {
                Some(e) => context.channel.close_with_error(e).await,
                None => context.channel.close().await,
            }
            if let Some((_, done)) = context.initial {
                let _ = done.send(Err(Error::Transport(
                    sipline_sip_transport::Error::ChannelClosed,
                )));
            }
            self.emit(TransactionEvent::ChannelClosed { destination }).await;
        }
    }

    async fn handle_certificate_error(self: &Arc<Self>, destination: EndPoint, error: String) {
        let Some(handler) = self.config.ssl_cert_error_handler.clone() else {
            debug!(destination = %destination, "no certificate error handler, dismissing");
            let _ = self.dismiss(&destination).await;
            return;
        };

        // The handler may prompt a human; run it off the event loop.
        let inner = self.clone();
        tokio::spawn(async move {
            let decision = handler.handle(&destination, &error).await;
            let outcome = match decision {
                CertErrorDecision::Accept => match inner.channel_for(&destination).await {
                    Ok(channel) => channel
                        .reconnect_ignoring_last_error()
                        .await
                        .map_err(Error::Transport),
                    Err(e) => Err(e),
                },
                CertErrorDecision::UseIdentity(identity) => {
                    match inner.channel_for(&destination).await {
                        Ok(channel) => channel
                            .reconnect_with_certificate(identity)
                            .await
                            .map_err(Error::Transport),
                        Err(e) => Err(e),
                    }
                }
                CertErrorDecision::Reject => {
                    let _ = inner.dismiss(&destination).await;
                    return;
                }
            };
            if let Err(e) = outcome {
                warn!(destination = %destination, error = %e,
                      "certificate error recovery failed, dismissing");
                let _ = inner.dismiss(&destination).await;
            }
        });
    }

    async fn handle_transaction_event(self: &Arc<Self>, event: TransactionEvent) {
        if let TransactionEvent::TransactionTerminated { transaction_id } = &event {
            self.on_transaction_terminated(transaction_id).await;
        }
        self.emit(event).await;
    }

    async fn on_transaction_terminated(&self, id: &TransactionKey) {
        // Idempotent with the transaction's own unregistration; cascade
        // terminations skip that path.
        self.timer_manager.unregister_transaction(id).await;

        let entry = if id.is_server() {
            self.server_transactions.lock().await.remove(id)
        } else {
            self.client_transactions.lock().await.remove(id)
        };
        let Some(entry) = entry else {
            return;
        };
        trace!(id = %id, "transaction removed");

        let mut channels = self.channels.lock().await;
        if let Some(context) = channels.get_mut(&entry.destination) {
            context.transactions.remove(id);
            self.release_channel_ref(context, &entry.destination);
        }
    }

    async fn handle_idle_timeout(self: &Arc<Self>, endpoint: EndPoint) {
        {
            let channels = self.channels.lock().await;
            match channels.get(&endpoint) {
                // A new user arrived before the firing was processed.
                Some(context) if context.refs > 0 => return,
                Some(_) => {}
                None => return,
            }
        }
        debug!(destination = %endpoint, "closing idle channel");
        self.handle_channel_closed(endpoint, None).await;
    }

    // ---- Helpers -------------------------------------------------------

    async fn canonical(&self, endpoint: &EndPoint) -> EndPoint {
        {
            if self.channels.lock().await.contains_key(endpoint) {
                return endpoint.clone();
            }
        }
        {
            if let Some(target) = self.aliases.lock().await.get(endpoint) {
                return target.clone();
            }
        }
        endpoint.clone()
    }

    async fn emit(&self, event: TransactionEvent) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if self.tu_events_tx.send(event).await.is_err() {
            trace!("delegate receiver dropped");
        }
    }
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut channel_events_rx: mpsc::Receiver<ChannelEvent>,
    mut transaction_events_rx: mpsc::Receiver<TransactionEvent>,
    mut idle_rx: mpsc::Receiver<EndPoint>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            Some(event) = channel_events_rx.recv() => {
                inner.handle_channel_event(event).await;
            }
            Some(event) = transaction_events_rx.recv() => {
                inner.handle_transaction_event(event).await;
            }
            Some(endpoint) = idle_rx.recv() => {
                inner.handle_idle_timeout(endpoint).await;
            }
        }
    }
    debug!("network layer event loop ended");
}

/// Derives the next-hop endpoint of a request: the first Route header
/// when present, else the Request-URI.
fn next_hop_for_request(request: &Message) -> Result<EndPoint> {
    if let Some(route) = request.routes().next() {
        return EndPoint::from_uri(&route.address)
            .map_err(|e| Error::NoNextHop(e.to_string()));
    }
    let uri = request
        .request_uri()
        .ok_or_else(|| Error::NoNextHop("request without Request-URI".to_string()))?;
    EndPoint::from_uri(uri).map_err(|e| Error::NoNextHop(e.to_string()))
}

// Substitutes the `domain.invalid` placeholder in Contact addresses with
// the channel origin, adding `;transport=` for non-UDP channels and `;ob`
// for non-REGISTER requests.
fn stamp_contact(
    request: &mut Message,
    origin: &EndPoint,
    protocol: Protocol,
    is_register: bool,
) -> Result<()> {
    if !request.has_header("contact") {
        return Ok(());
    }
    let mut address = format!("sip:{}", origin.host_port());
    if protocol != Protocol::Udp {
        address.push_str(";transport=");
        address.push_str(protocol.transport_param());
    }
    if !is_register {
        address.push_str(";ob");
    }

    request.map_header_values("contact", |value| {
        let parsed = sipline_sip_message::headers::NameAddr::parse(value).ok()?;
        if !(parsed.address.is_sip()
            && parsed.address.host().eq_ignore_ascii_case("domain.invalid"))
        {
            return None;
        }
        let open = value.find('<')?;
        let close = value[open..].find('>')? + open;
        Some(format!(
            "{}{}{}",
            &value[..open + 1],
            address,
            &value[close..]
        ))
    })?;
    Ok(())
}
