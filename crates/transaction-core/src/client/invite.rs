//! Client INVITE transaction (RFC 3261 Section 17.1.1).
//!
//! `Calling → Proceeding → Completed → Terminated`. Timer A retransmits
//! the INVITE over unreliable transports, doubling without a cap. A 2xx
//! passes up and terminates directly (the ACK for 2xx belongs to the TU);
//! a 3xx–6xx final is acknowledged by the transaction itself, and the ACK
//! is replayed for every retransmitted final while Timer D runs.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sipline_sip_message::Message;
use sipline_sip_transport::Channel;

use crate::client::data::ClientTransactionData;
use crate::error::{Error, Result};
use crate::event::{CommandSender, InternalTransactionCommand, TransactionEvent};
use crate::key::TransactionKey;
use crate::logic::TransactionLogic;
use crate::runner::run_transaction_loop;
use crate::state::{AtomicTransactionState, TransactionKind, TransactionState};
use crate::timer::{TimerManager, TimerSettings, TimerType};

/// Client INVITE transaction handle.
#[derive(Debug, Clone)]
pub struct ClientInviteTransaction {
    data: Arc<ClientTransactionData>,
}

/// Timer handles for the INVITE client machine.
#[derive(Default)]
pub(crate) struct ClientInviteTimerHandles {
    timer_a: Option<JoinHandle<()>>,
    current_interval_a: Option<std::time::Duration>,
    timer_b: Option<JoinHandle<()>>,
    timer_d: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ClientInviteLogic;

impl ClientInviteTransaction {
    /// Creates the transaction and spawns its event loop. The INVITE is
    /// transmitted when [`ClientInviteTransaction::start`] runs.
    pub async fn spawn(
        id: TransactionKey,
        request: Message,
        channel: Arc<dyn Channel>,
        events_tx: mpsc::Sender<TransactionEvent>,
        timer_manager: Arc<TimerManager>,
        settings: TimerSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        timer_manager
            .register_transaction(id.clone(), cmd_tx.clone())
            .await;

        let data = Arc::new(ClientTransactionData {
            id,
            state: Arc::new(AtomicTransactionState::new(TransactionState::Initial)),
            request: Arc::new(Mutex::new(request)),
            last_response: Arc::new(Mutex::new(None)),
            ack: Arc::new(Mutex::new(None)),
            channel,
            events_tx,
            cmd_tx,
            timer_manager,
            settings,
        });

        tokio::spawn(run_transaction_loop::<_, ClientInviteTimerHandles, _>(
            data.clone(),
            Arc::new(ClientInviteLogic),
            cmd_rx,
        ));

        Self { data }
    }

    /// Sends the INVITE and arms the Calling-state timers.
    pub async fn start(&self) {
        let _ = self
            .data
            .cmd_tx
            .send(InternalTransactionCommand::TransitionTo(
                TransactionState::Calling,
            ))
            .await;
    }

    /// The transaction identifier.
    pub fn id(&self) -> &TransactionKey {
        &self.data.id
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.data.state.get()
    }

    /// The command channel driving this transaction.
    pub fn command_sender(&self) -> CommandSender {
        self.data.cmd_tx.clone()
    }

    /// The request this transaction carries.
    pub async fn original_request(&self) -> Message {
        self.data.request.lock().await.clone()
    }

    /// The last response received, if any.
    pub async fn last_response(&self) -> Option<Message> {
        self.data.last_response.lock().await.clone()
    }
}

/// Builds the ACK for a non-2xx final response (RFC 3261 Section
/// 17.1.1.3): same Request-URI, Call-ID, From, Route set and top Via
/// (including the branch) as the INVITE; To from the response (it carries
/// the tag); CSeq with the INVITE's sequence and method ACK.
fn build_ack(invite: &Message, response: &Message) -> Result<Message> {
    let uri = invite
        .request_uri()
        .ok_or_else(|| Error::NoNextHop("INVITE without Request-URI".to_string()))?;
    let cseq = invite
        .cseq()
        .ok_or_else(|| Error::NoNextHop("INVITE without CSeq".to_string()))?;

    let mut raw = format!("ACK {} SIP/2.0\0", uri);
    if let Some(via) = invite.header_values("via").next() {
        raw.push_str("Via: ");
        raw.push_str(via);
        raw.push('\0');
    }
    for (name, value) in invite.header_lines() {
        let copied = name.eq_ignore_ascii_case("route")
            || name.eq_ignore_ascii_case("from")
            || name.eq_ignore_ascii_case("call-id")
            || name.eq_ignore_ascii_case("max-forwards");
        if copied {
            raw.push_str(name);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push('\0');
        }
    }
    for (name, value) in response.header_lines() {
        if name.eq_ignore_ascii_case("to") {
            raw.push_str(name);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push('\0');
        }
    }
    raw.push_str(&format!("CSeq: {} ACK\0", cseq.sequence));
    raw.push('\0');
    Ok(Message::parse(&raw)?)
}

impl ClientInviteLogic {
    async fn start_timer_a(
        &self,
        data: &Arc<ClientTransactionData>,
        timer_handles: &mut ClientInviteTimerHandles,
        interval: std::time::Duration,
    ) {
        timer_handles.current_interval_a = Some(interval);
        let handle = data
            .timer_manager
            .start_timer(data.id.clone(), TimerType::A, interval)
            .await;
        timer_handles.timer_a = Some(handle);
        trace!(id = %data.id, ?interval, "started Timer A");
    }

    fn cancel_timer_a(timer_handles: &mut ClientInviteTimerHandles) {
        if let Some(handle) = timer_handles.timer_a.take() {
            handle.abort();
        }
        timer_handles.current_interval_a = None;
    }

    fn cancel_timer_b(timer_handles: &mut ClientInviteTimerHandles) {
        if let Some(handle) = timer_handles.timer_b.take() {
            handle.abort();
        }
    }

    // Generates (or replays) the ACK for a non-2xx final on the same
    // channel the INVITE used.
    async fn acknowledge(
        &self,
        data: &Arc<ClientTransactionData>,
        response: &Message,
    ) -> Result<()> {
        let mut ack_guard = data.ack.lock().await;
        let ack = match ack_guard.as_ref() {
            Some(ack) => ack.clone(),
            None => {
                let invite = data.request.lock().await;
                let ack = build_ack(&invite, response)?;
                *ack_guard = Some(ack.clone());
                ack
            }
        };
        drop(ack_guard);
        data.channel.send(&ack).await.map_err(Error::Transport)
    }
}

#[async_trait::async_trait]
impl TransactionLogic<ClientTransactionData, ClientInviteTimerHandles> for ClientInviteLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteClient
    }

    async fn process_message(
        &self,
        data: &Arc<ClientTransactionData>,
        message: Message,
        current_state: TransactionState,
        timer_handles: &mut ClientInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        let Some(code) = message.response_code() else {
            warn!(id = %data.id, "client transaction matched a non-response, dropping");
            return Ok(None);
        };

        match current_state {
            TransactionState::Calling | TransactionState::Proceeding => {
                if code < 200 {
                    Self::cancel_timer_a(timer_handles);
                    data.pass_up_response(message).await;
                    if current_state == TransactionState::Calling {
                        Ok(Some(TransactionState::Proceeding))
                    } else {
                        Ok(None)
                    }
                } else if code < 300 {
                    // The ACK for 2xx is generated by the TU, outside the
                    // transaction.
                    Self::cancel_timer_a(timer_handles);
                    Self::cancel_timer_b(timer_handles);
                    *data.last_response.lock().await = Some(message.clone());
                    data.pass_up_response(message).await;
                    Ok(Some(TransactionState::Terminated))
                } else {
                    Self::cancel_timer_a(timer_handles);
                    Self::cancel_timer_b(timer_handles);
                    *data.last_response.lock().await = Some(message.clone());
                    if let Err(e) = self.acknowledge(data, &message).await {
                        warn!(id = %data.id, error = %e, "failed to ACK final response");
                    }
                    data.pass_up_response(message).await;
                    Ok(Some(TransactionState::Completed))
                }
            }
            TransactionState::Completed => {
                // Retransmitted final: replay the ACK, nothing goes up.
                if code >= 300 {
                    debug!(id = %data.id, "final response retransmitted, replaying ACK");
                    if let Err(e) = self.acknowledge(data, &message).await {
                        warn!(id = %data.id, error = %e, "failed to replay ACK");
                    }
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<ClientTransactionData>,
        timer_name: &str,
        current_state: TransactionState,
        timer_handles: &mut ClientInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (timer_name, current_state) {
            ("A", TransactionState::Calling) => {
                debug!(id = %data.id, "Timer A fired, retransmitting INVITE");
                if let Err(e) = data.transmit_request().await {
                    data.report_transport_error(&e.to_string()).await;
                    return Ok(Some(TransactionState::Terminated));
                }
                let current = timer_handles
                    .current_interval_a
                    .unwrap_or(data.settings.t1);
                let next = data.settings.next_backoff(current, false);
                self.start_timer_a(data, timer_handles, next).await;
                Ok(None)
            }
            ("B", TransactionState::Calling) | ("B", TransactionState::Proceeding) => {
                warn!(id = %data.id, "Timer B fired, INVITE timed out");
                data.report_timeout().await;
                Ok(Some(TransactionState::Terminated))
            }
            ("D", TransactionState::Completed) => {
                debug!(id = %data.id, "Timer D fired, terminating");
                Ok(Some(TransactionState::Terminated))
            }
            _ => {
                trace!(id = %data.id, timer = timer_name, state = ?current_state,
                       "timer fired in inapplicable state, ignoring");
                Ok(None)
            }
        }
    }

    async fn on_enter_state(
        &self,
        data: &Arc<ClientTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timer_handles: &mut ClientInviteTimerHandles,
        command_tx: CommandSender,
    ) -> Result<()> {
        match new_state {
            TransactionState::Calling => {
                debug!(id = %data.id, "sending INVITE");
                if let Err(e) = data.transmit_request().await {
                    data.report_transport_error(&e.to_string()).await;
                    let _ = command_tx
                        .send(InternalTransactionCommand::TransitionTo(
                            TransactionState::Terminated,
                        ))
                        .await;
                    return Ok(());
                }
                if !data.reliable() {
                    self.start_timer_a(data, timer_handles, data.settings.t1)
                        .await;
                }
                let handle = data
                    .timer_manager
                    .start_timer(
                        data.id.clone(),
                        TimerType::B,
                        data.settings.transaction_timeout,
                    )
                    .await;
                timer_handles.timer_b = Some(handle);
            }
            TransactionState::Completed => {
                let duration = data.settings.wait_time_d_for(data.reliable());
                let handle = data
                    .timer_manager
                    .start_timer(data.id.clone(), TimerType::D, duration)
                    .await;
                timer_handles.timer_d = Some(handle);
            }
            TransactionState::Terminated => {
                data.timer_manager.unregister_transaction(&data.id).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_transport_error(&self, data: &Arc<ClientTransactionData>) {
        data.report_transport_error("channel failed").await;
    }

    fn cancel_all_timers(&self, timer_handles: &mut ClientInviteTimerHandles) {
        Self::cancel_timer_a(timer_handles);
        Self::cancel_timer_b(timer_handles);
        if let Some(handle) = timer_handles.timer_d.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipline_sip_message::Method;

    #[test]
    fn ack_mirrors_invite_and_response() {
        let invite = Message::parse(
            "INVITE sip:bob@biloxi.com SIP/2.0\0Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776\0Max-Forwards: 70\0Route: <sip:proxy.example;lr>\0From: <sip:alice@atlanta.com>;tag=88\0To: <sip:bob@biloxi.com>\0Call-ID: cid9\0CSeq: 7 INVITE\0\0",
        )
        .unwrap();
        let response = Message::parse(
            "SIP/2.0 486 Busy Here\0Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776\0From: <sip:alice@atlanta.com>;tag=88\0To: <sip:bob@biloxi.com>;tag=99\0Call-ID: cid9\0CSeq: 7 INVITE\0\0",
        )
        .unwrap();

        let ack = build_ack(&invite, &response).unwrap();
        assert_eq!(ack.method(), Some(&Method::Ack));
        assert_eq!(ack.request_uri().unwrap().host(), "biloxi.com");
        // Same branch as the INVITE.
        assert_eq!(ack.top_via().unwrap().branch(), Some("z9hG4bK776"));
        // To carries the response tag.
        assert_eq!(ack.to_header().unwrap().tag(), Some("99"));
        // CSeq keeps the sequence with method ACK.
        let cseq = ack.cseq().unwrap();
        assert_eq!(cseq.sequence, 7);
        assert_eq!(cseq.method, "ACK");
        // Route set is preserved.
        assert_eq!(ack.routes().count(), 1);
        assert_eq!(ack.call_id(), Some("cid9"));
    }
}
