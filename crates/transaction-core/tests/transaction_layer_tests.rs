//! End-to-end tests of the transaction layer and network layer against a
//! scripted channel, with the tokio clock paused for deterministic timer
//! schedules.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use sipline_sip_message::{Message, Method};
use sipline_sip_transport::{
    Channel, ChannelEvent, ChannelFactory, ConnectionState, EndPoint, Protocol,
};
use sipline_transaction_core::{
    Error, NetworkConfig, NetworkLayer, TimerSettings, TransactionEvent,
};

// ---- Scripted channel ----------------------------------------------------

#[derive(Clone)]
struct SentMessage {
    message: Message,
    at: Instant,
}

struct MockChannel {
    destination: EndPoint,
    origin: EndPoint,
    connected: AtomicBool,
    events: mpsc::Sender<ChannelEvent>,
    sent: Arc<StdMutex<Vec<SentMessage>>>,
}

impl MockChannel {
    fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    // Injects an inbound wire message as if the peer had sent it.
    async fn inject(&self, wire: &[u8]) {
        let message = Message::from_wire(wire).unwrap();
        self.events
            .send(ChannelEvent::MessageReceived {
                destination: self.destination.clone(),
                message,
            })
            .await
            .unwrap();
    }
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockChannel({})", self.destination)
    }
}

#[async_trait::async_trait]
impl Channel for MockChannel {
    fn destination(&self) -> &EndPoint {
        &self.destination
    }

    fn origin(&self) -> sipline_sip_transport::Result<EndPoint> {
        Ok(self.origin.clone())
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn connect(&self) {
        let events = self.events.clone();
        let destination = self.destination.clone();
        self.connected.store(true, Ordering::Release);
        tokio::spawn(async move {
            let _ = events
                .send(ChannelEvent::Connected {
                    destination,
                    result: Ok(()),
                })
                .await;
        });
    }

    async fn send(&self, message: &Message) -> sipline_sip_transport::Result<()> {
        self.sent.lock().unwrap().push(SentMessage {
            message: message.clone(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

struct MockChannelFactory {
    protocol: Protocol,
    created: Arc<StdMutex<Vec<Arc<MockChannel>>>>,
}

impl MockChannelFactory {
    fn new(protocol: Protocol) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            created: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    fn last_channel(&self) -> Arc<MockChannel> {
        self.created.lock().unwrap().last().unwrap().clone()
    }
}

impl ChannelFactory for MockChannelFactory {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn create_channel(
        &self,
        destination: &EndPoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> sipline_sip_transport::Result<Arc<dyn Channel>> {
        let channel = Arc::new(MockChannel {
            destination: destination.clone(),
            origin: EndPoint::new("192.0.2.1", 5060, self.protocol),
            connected: AtomicBool::new(false),
            events,
            sent: Arc::new(StdMutex::new(Vec::new())),
        });
        self.created.lock().unwrap().push(channel.clone());
        Ok(channel)
    }
}

// ---- Helpers -------------------------------------------------------------

fn stack(
    protocol: Protocol,
) -> (
    NetworkLayer,
    mpsc::Receiver<TransactionEvent>,
    Arc<MockChannelFactory>,
) {
    let factory = MockChannelFactory::new(protocol);
    let (network, events) = NetworkLayer::new(
        NetworkConfig::default(),
        vec![factory.clone() as Arc<dyn ChannelFactory>],
    );
    (network, events, factory)
}

fn options_request(target: &str) -> Message {
    Message::parse(&format!(
        "OPTIONS {target} SIP/2.0\0From: <sip:alice@atlanta.com>;tag=ft1\0To: <sip:bob@{host}>\0Call-ID: cid-options-1\0CSeq: 1 OPTIONS\0Max-Forwards: 70\0\0",
        target = target,
        host = "biloxi.com",
    ))
    .unwrap()
}

fn invite_request(target: &str) -> Message {
    Message::parse(&format!(
        "INVITE {} SIP/2.0\0From: <sip:alice@atlanta.com>;tag=ft2\0To: <sip:bob@biloxi.com>\0Call-ID: cid-invite-1\0CSeq: 1 INVITE\0Contact: <sip:alice@domain.invalid>\0Max-Forwards: 70\0\0",
        target,
    ))
    .unwrap()
}

const PEER_INVITE: &[u8] = b"INVITE sip:service@192.0.2.1:5060 SIP/2.0\r\n\
    Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKserver1\r\n\
    From: <sip:caller@remote.example>;tag=rt1\r\n\
    To: <sip:service@local.example>\r\n\
    Call-ID: cid-peer-invite\r\n\
    CSeq: 10 INVITE\r\n\
    \r\n";

async fn expect_connected(events: &mut mpsc::Receiver<TransactionEvent>) {
    match events.recv().await.unwrap() {
        TransactionEvent::ChannelConnected { result, .. } => result.unwrap(),
        other => panic!("expected ChannelConnected, got {:?}", other),
    }
}

// ---- Outbound client transactions ----------------------------------------

#[tokio::test(start_paused = true)]
async fn non_invite_retransmission_schedule_and_timeout() {
    let destination = EndPoint::new("10.0.0.9", 5060, Protocol::Udp);
    let (network, mut events, factory) = stack(Protocol::Udp);

    let started = Instant::now();
    network
        .send(options_request("sip:bob@10.0.0.9"))
        .await
        .unwrap();
    expect_connected(&mut events).await;

    // Run out the whole transaction (Timer F at 64*T1 = 32 s).
    tokio::time::sleep(Duration::from_secs(40)).await;

    let channel = factory.last_channel();
    assert_eq!(channel.destination(), &destination);
    let sent = channel.sent();

    // T1 doubling capped at T2: 0, 500, 1500, 3500, 7500, then +4 s steps
    // until Timer F fires at 32 s.
    let offsets: Vec<u64> = sent
        .iter()
        .map(|s| s.at.duration_since(started).as_millis() as u64)
        .collect();
    assert_eq!(
        offsets,
        vec![0, 500, 1500, 3500, 7500, 11500, 15500, 19500, 23500, 27500, 31500]
    );
    for sent_message in &sent {
        assert_eq!(sent_message.message.method(), Some(&Method::Options));
    }

    // The timeout surfaces once, with the original request.
    let mut saw_timeout = false;
    while let Ok(event) = events.try_recv() {
        if let TransactionEvent::TimedOut { request, .. } = event {
            assert_eq!(request.method(), Some(&Method::Options));
            assert!(!saw_timeout);
            saw_timeout = true;
        }
    }
    assert!(saw_timeout);
}

#[tokio::test(start_paused = true)]
async fn reliable_transport_sends_once() {
    let (network, mut events, factory) = stack(Protocol::Tcp);

    network
        .send(options_request("sip:bob@10.0.0.9;transport=tcp"))
        .await
        .unwrap();
    expect_connected(&mut events).await;

    tokio::time::sleep(Duration::from_secs(10)).await;

    // No retransmissions on a reliable channel.
    assert_eq!(factory.last_channel().sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn outgoing_request_gets_via_and_user_agent() {
    let (network, mut events, factory) = stack(Protocol::Udp);

    network
        .send(options_request("sip:bob@10.0.0.9"))
        .await
        .unwrap();
    expect_connected(&mut events).await;

    let sent = factory.last_channel().sent();
    let request = &sent[0].message;

    let via = request.top_via().unwrap();
    assert_eq!(via.protocol, "UDP");
    assert_eq!(via.sent_by(), "192.0.2.1:5060");
    assert!(via.branch().unwrap().starts_with("z9hG4bK"));
    assert!(request.has_header("user-agent"));
}

#[tokio::test(start_paused = true)]
async fn provisional_response_stops_retransmissions() {
    let (network, mut events, factory) = stack(Protocol::Udp);

    network
        .send(options_request("sip:bob@10.0.0.9"))
        .await
        .unwrap();
    expect_connected(&mut events).await;

    let channel = factory.last_channel();
    let branch = channel.sent()[0].message.top_via().unwrap().branch().unwrap().to_string();

    let ringing = format!(
        "SIP/2.0 100 Trying\r\nVia: SIP/2.0/UDP 192.0.2.1:5060;branch={}\r\nFrom: <sip:alice@atlanta.com>;tag=ft1\r\nTo: <sip:bob@biloxi.com>\r\nCall-ID: cid-options-1\r\nCSeq: 1 OPTIONS\r\n\r\n",
        branch
    );
    channel.inject(ringing.as_bytes()).await;

    match events.recv().await.unwrap() {
        TransactionEvent::IncomingResponse { response, .. } => {
            assert_eq!(response.response_code(), Some(100));
        }
        other => panic!("expected IncomingResponse, got {:?}", other),
    }

    // Retry is cancelled on a provisional; only the timeout remains.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(channel.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invite_non_2xx_final_is_acknowledged_and_ack_replayed() {
    let (network, mut events, factory) = stack(Protocol::Udp);

    network
        .send(invite_request("sip:bob@10.0.0.9"))
        .await
        .unwrap();
    expect_connected(&mut events).await;

    let channel = factory.last_channel();
    let invite = channel.sent()[0].message.clone();
    let branch = invite.top_via().unwrap().branch().unwrap().to_string();

    // Contact placeholder was rewritten to the channel origin.
    let contact = invite.contacts().next().unwrap();
    assert_eq!(contact.address.host(), "192.0.2.1");
    assert_eq!(contact.address.parameter("ob"), Some(""));

    let busy = format!(
        "SIP/2.0 486 Busy Here\r\nVia: SIP/2.0/UDP 192.0.2.1:5060;branch={}\r\nFrom: <sip:alice@atlanta.com>;tag=ft2\r\nTo: <sip:bob@biloxi.com>;tag=tt2\r\nCall-ID: cid-invite-1\r\nCSeq: 1 INVITE\r\n\r\n",
        branch
    );
    channel.inject(busy.as_bytes()).await;

    match events.recv().await.unwrap() {
        TransactionEvent::IncomingResponse { response, .. } => {
            assert_eq!(response.response_code(), Some(486));
        }
        other => panic!("expected IncomingResponse, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = channel.sent();
    let ack = sent
        .iter()
        .find(|s| s.message.method() == Some(&Method::Ack))
        .expect("transaction generates the ACK");
    assert_eq!(ack.message.top_via().unwrap().branch().unwrap(), branch);
    assert_eq!(ack.message.to_header().unwrap().tag(), Some("tt2"));

    // A retransmitted final response replays the ACK without a new event.
    let acks_before = sent
        .iter()
        .filter(|s| s.message.method() == Some(&Method::Ack))
        .count();
    channel.inject(busy.as_bytes()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let acks_after = channel
        .sent()
        .iter()
        .filter(|s| s.message.method() == Some(&Method::Ack))
        .count();
    assert_eq!(acks_after, acks_before + 1);
    assert!(events.try_recv().is_err(), "retransmission must not surface");
}

#[tokio::test(start_paused = true)]
async fn ack_requests_never_open_connections() {
    let (network, _events, _factory) = stack(Protocol::Udp);

    let ack = Message::parse(
        "ACK sip:bob@10.0.0.9 SIP/2.0\0Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKack\0From: <sip:a@h>;tag=1\0To: <sip:b@h>;tag=2\0Call-ID: cid-a\0CSeq: 1 ACK\0\0",
    )
    .unwrap();
    assert!(matches!(
        network.send(ack).await,
        Err(Error::AckWithoutChannel)
    ));
}

#[tokio::test(start_paused = true)]
async fn incoming_messages_cannot_be_sent() {
    let (network, _events, _factory) = stack(Protocol::Udp);
    let inbound = Message::from_wire(b"OPTIONS sip:x SIP/2.0\r\nCSeq: 1 OPTIONS\r\n\r\n").unwrap();
    assert!(matches!(
        network.send(inbound).await,
        Err(Error::InvalidDirection)
    ));
}

// ---- Inbound server transactions -----------------------------------------

#[tokio::test(start_paused = true)]
async fn server_invite_absorbs_retransmissions_and_sends_automatic_trying() {
    let destination = EndPoint::new("10.0.0.1", 5060, Protocol::Udp);
    let (network, mut events, factory) = stack(Protocol::Udp);

    network.connect(destination.clone()).await.unwrap();
    expect_connected(&mut events).await;
    let channel = factory.last_channel();

    // Two copies of the INVITE within 200 ms.
    channel.inject(PEER_INVITE).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.inject(PEER_INVITE).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Exactly one request surfaces.
    let mut requests = 0;
    while let Ok(event) = events.try_recv() {
        if let TransactionEvent::IncomingRequest { request, .. } = event {
            assert_eq!(request.method(), Some(&Method::Invite));
            requests += 1;
        }
    }
    assert_eq!(requests, 1);

    // The automatic 100 Trying goes out 200 ms after creation.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.response_code(), Some(100));

    // A further retransmission replays the provisional, still silently.
    channel.inject(PEER_INVITE).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.sent().len(), 2);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn tu_response_routes_through_server_transaction() {
    let destination = EndPoint::new("10.0.0.1", 5060, Protocol::Udp);
    let (network, mut events, factory) = stack(Protocol::Udp);

    network.connect(destination).await.unwrap();
    expect_connected(&mut events).await;
    let channel = factory.last_channel();

    channel.inject(PEER_INVITE).await;
    let request = match events.recv().await.unwrap() {
        TransactionEvent::IncomingRequest { request, .. } => request,
        other => panic!("expected IncomingRequest, got {:?}", other),
    };

    let ringing = Message::response_for(&request, 180, "Ringing").unwrap();
    network.send(ringing).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.response_code(), Some(180));

    // The TU provisional preempts the automatic 100 Trying.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(channel.sent().len(), 1);

    // Final response, then the ACK confirms the transaction.
    let busy = Message::response_for(&request, 486, "Busy Here").unwrap();
    network.send(busy).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(channel.sent().len(), 2);

    let ack = b"ACK sip:service@192.0.2.1:5060 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKserver1\r\n\
        From: <sip:caller@remote.example>;tag=rt1\r\n\
        To: <sip:service@local.example>;tag=st1\r\n\
        Call-ID: cid-peer-invite\r\n\
        CSeq: 10 ACK\r\n\
        \r\n";
    channel.inject(ack).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    // No further final-response retransmissions after the ACK: Timer G
    // would have fired at T1.
    let finals_before = channel.sent().len();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(channel.sent().len(), finals_before);
}

#[tokio::test(start_paused = true)]
async fn inbound_request_is_stamped_with_received_and_rport() {
    // The channel observes the peer at 10.0.0.2:5070 while the Via claims
    // 10.0.0.1:5060.
    let destination = EndPoint::new("10.0.0.2", 5070, Protocol::Udp);
    let (network, mut events, factory) = stack(Protocol::Udp);

    network.connect(destination).await.unwrap();
    expect_connected(&mut events).await;
    let channel = factory.last_channel();

    let options = b"OPTIONS sip:service@192.0.2.1:5060 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKnat1\r\n\
        From: <sip:caller@remote.example>;tag=rt9\r\n\
        To: <sip:service@local.example>\r\n\
        Call-ID: cid-nat-1\r\n\
        CSeq: 3 OPTIONS\r\n\
        \r\n";
    channel.inject(options).await;

    let request = match events.recv().await.unwrap() {
        TransactionEvent::IncomingRequest { request, .. } => request,
        other => panic!("expected IncomingRequest, got {:?}", other),
    };
    let via = request.top_via().unwrap();
    assert_eq!(via.received(), Some("10.0.0.2"));
    assert_eq!(via.rport(), Some(5070));
}

#[tokio::test(start_paused = true)]
async fn response_without_transaction_routes_by_via_received() {
    let destination = EndPoint::new("10.0.0.2", 5070, Protocol::Udp);
    let (network, mut events, factory) = stack(Protocol::Udp);

    network.connect(destination).await.unwrap();
    expect_connected(&mut events).await;
    let channel = factory.last_channel();

    // No server transaction matches this branch; the next hop comes from
    // received= and rport=, not from sent-by.
    let response = Message::parse(
        "SIP/2.0 200 OK\0Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKdirect;received=10.0.0.2;rport=5070\0From: <sip:a@h>;tag=1\0To: <sip:b@h>;tag=2\0Call-ID: cid-d\0CSeq: 5 OPTIONS\0\0",
    )
    .unwrap();
    network.send(response).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.response_code(), Some(200));
}

#[tokio::test(start_paused = true)]
async fn unmatched_inbound_response_is_discarded() {
    let destination = EndPoint::new("10.0.0.1", 5060, Protocol::Udp);
    let (network, mut events, factory) = stack(Protocol::Udp);

    network.connect(destination).await.unwrap();
    expect_connected(&mut events).await;
    let channel = factory.last_channel();

    let stray = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKstray\r\n\
        From: <sip:a@h>;tag=1\r\n\
        To: <sip:b@h>;tag=2\r\n\
        Call-ID: cid-s\r\n\
        CSeq: 9 OPTIONS\r\n\
        \r\n";
    channel.inject(stray).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unmatched_ack_goes_to_the_tu_without_a_transaction() {
    let destination = EndPoint::new("10.0.0.1", 5060, Protocol::Udp);
    let (network, mut events, factory) = stack(Protocol::Udp);

    network.connect(destination).await.unwrap();
    expect_connected(&mut events).await;
    let channel = factory.last_channel();

    // An ACK acknowledging a 2xx: its INVITE transaction is already gone.
    let ack = b"ACK sip:service@192.0.2.1:5060 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK2xxack\r\n\
        From: <sip:caller@remote.example>;tag=rt1\r\n\
        To: <sip:service@local.example>;tag=st1\r\n\
        Call-ID: cid-2xx\r\n\
        CSeq: 11 ACK\r\n\
        \r\n";
    channel.inject(ack).await;

    match events.recv().await.unwrap() {
        TransactionEvent::IncomingRequest {
            transaction_id,
            request,
        } => {
            assert!(transaction_id.is_none());
            assert_eq!(request.method(), Some(&Method::Ack));
        }
        other => panic!("expected IncomingRequest, got {:?}", other),
    }
}

// ---- Channel lifecycle ----------------------------------------------------

#[tokio::test(start_paused = true)]
async fn idle_channel_is_released_after_reuse_lifetime() {
    let mut config = NetworkConfig::default();
    config.reuse_lifetime = Duration::from_secs(5);
    config.timer_settings = TimerSettings {
        transaction_timeout: Duration::from_millis(400),
        ..TimerSettings::default()
    };
    let factory = MockChannelFactory::new(Protocol::Udp);
    let (network, mut events) = NetworkLayer::new(
        config,
        vec![factory.clone() as Arc<dyn ChannelFactory>],
    );

    network
        .send(options_request("sip:bob@10.0.0.9"))
        .await
        .unwrap();
    expect_connected(&mut events).await;

    // The transaction times out quickly, dropping the channel's last
    // reference; the reuse-lifetime timer then closes it.
    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TransactionEvent::ChannelClosed { .. }) {
            saw_closed = true;
        }
    }
    assert!(saw_closed);
    assert!(!factory.last_channel().connected.load(Ordering::Acquire));
}

#[tokio::test(start_paused = true)]
async fn external_holder_keeps_idle_channel_alive() {
    let mut config = NetworkConfig::default();
    config.reuse_lifetime = Duration::from_secs(5);
    let factory = MockChannelFactory::new(Protocol::Udp);
    let (network, mut events) = NetworkLayer::new(
        config,
        vec![factory.clone() as Arc<dyn ChannelFactory>],
    );

    let destination = EndPoint::new("10.0.0.1", 5060, Protocol::Udp);
    network.connect(destination.clone()).await.unwrap();
    expect_connected(&mut events).await;

    assert!(network.request_channel(&destination).await);

    tokio::time::sleep(Duration::from_secs(20)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, TransactionEvent::ChannelClosed { .. }));
    }

    // Releasing the last reference arms the idle timer.
    network.release_channel(&destination).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TransactionEvent::ChannelClosed { .. }) {
            saw_closed = true;
        }
    }
    assert!(saw_closed);
}

#[tokio::test(start_paused = true)]
async fn alias_resolves_to_the_same_channel_context() {
    let destination = EndPoint::new("10.0.0.1", 5060, Protocol::Udp);
    let alias = EndPoint::new("10.0.0.1", 40200, Protocol::Udp);
    let (network, mut events, _factory) = stack(Protocol::Udp);

    network.connect(destination.clone()).await.unwrap();
    expect_connected(&mut events).await;

    assert!(network.add_alias(destination.clone(), alias.clone()).await);
    assert!(network.request_channel(&alias).await);

    // Unknown destinations cannot be aliased.
    let unknown = EndPoint::new("203.0.113.9", 5060, Protocol::Udp);
    assert!(!network.add_alias(unknown.clone(), alias).await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_terminates_everything_silently() {
    let (network, mut events, factory) = stack(Protocol::Udp);

    network
        .send(options_request("sip:bob@10.0.0.9"))
        .await
        .unwrap();
    expect_connected(&mut events).await;

    network.shutdown().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // No events after destruction begins.
    assert!(events.try_recv().is_err());
    assert!(!factory.last_channel().connected.load(Ordering::Acquire));

    // The layer refuses further work.
    assert!(matches!(
        network.send(options_request("sip:bob@10.0.0.9")).await,
        Err(Error::Shutdown)
    ));
}
