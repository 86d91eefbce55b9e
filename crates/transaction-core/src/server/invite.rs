//! Server INVITE transaction (RFC 3261 Section 17.2.1).
//!
//! `Proceeding → Completed → Confirmed → Terminated`. On creation a
//! provisional-response timer is armed: if the TU has not produced any
//! response when it fires, the transaction synthesizes a `100 Trying`
//! itself. A 2xx from the TU terminates the transaction directly (2xx
//! retransmission is the TU's job); a 3xx–6xx enters Completed where
//! Timer G retransmits the final (unreliable transports) until the ACK
//! arrives or Timer H gives up.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sipline_sip_message::{Message, Method};
use sipline_sip_transport::Channel;

use crate::error::Result;
use crate::event::{CommandSender, InternalTransactionCommand, TransactionEvent};
use crate::key::TransactionKey;
use crate::logic::TransactionLogic;
use crate::runner::run_transaction_loop;
use crate::server::data::ServerTransactionData;
use crate::state::{AtomicTransactionState, TransactionKind, TransactionState};
use crate::timer::{TimerManager, TimerSettings, TimerType};

/// Server INVITE transaction handle.
#[derive(Debug, Clone)]
pub struct ServerInviteTransaction {
    data: Arc<ServerTransactionData>,
}

/// Timer handles for the INVITE server machine.
#[derive(Default)]
pub(crate) struct ServerInviteTimerHandles {
    provisional: Option<JoinHandle<()>>,
    timer_g: Option<JoinHandle<()>>,
    current_interval_g: Option<std::time::Duration>,
    timer_h: Option<JoinHandle<()>>,
    timer_i: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ServerInviteLogic;

impl ServerInviteTransaction {
    /// Creates the transaction for a just-received INVITE and spawns its
    /// event loop.
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

        let data = Arc::new(ServerTransactionData {
            id,
            state: Arc::new(AtomicTransactionState::new(TransactionState::Initial)),
            request: Arc::new(Mutex::new(request)),
            last_response: Arc::new(Mutex::new(None)),
            channel,
            events_tx,
            cmd_tx,
            timer_manager,
            settings,
        });

        tokio::spawn(run_transaction_loop::<_, ServerInviteTimerHandles, _>(
            data.clone(),
            Arc::new(ServerInviteLogic),
            cmd_rx,
        ));

        Self { data }
    }

    /// Enters the Proceeding state and arms the automatic 100 Trying.
    pub async fn start(&self) {
        let _ = self
            .data
            .cmd_tx
            .send(InternalTransactionCommand::TransitionTo(
                TransactionState::Proceeding,
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

    /// The INVITE that created this transaction.
    pub async fn original_request(&self) -> Message {
        self.data.request.lock().await.clone()
    }

    /// The last response sent, if any.
    pub async fn last_response(&self) -> Option<Message> {
        self.data.last_response.lock().await.clone()
    }
}

impl ServerInviteLogic {
    fn cancel_provisional(timer_handles: &mut ServerInviteTimerHandles) {
        if let Some(handle) = timer_handles.provisional.take() {
            handle.abort();
        }
    }

    fn cancel_completed_timers(timer_handles: &mut ServerInviteTimerHandles) {
        if let Some(handle) = timer_handles.timer_g.take() {
            handle.abort();
        }
        timer_handles.current_interval_g = None;
        if let Some(handle) = timer_handles.timer_h.take() {
            handle.abort();
        }
    }

    async fn start_timer_g(
        &self,
        data: &Arc<ServerTransactionData>,
        timer_handles: &mut ServerInviteTimerHandles,
        interval: std::time::Duration,
    ) {
        timer_handles.current_interval_g = Some(interval);
        let handle = data
            .timer_manager
            .start_timer(data.id.clone(), TimerType::G, interval)
            .await;
        timer_handles.timer_g = Some(handle);
        trace!(id = %data.id, ?interval, "started Timer G");
    }
}

#[async_trait::async_trait]
impl TransactionLogic<ServerTransactionData, ServerInviteTimerHandles> for ServerInviteLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteServer
    }

    async fn process_message(
        &self,
        data: &Arc<ServerTransactionData>,
        message: Message,
        current_state: TransactionState,
        timer_handles: &mut ServerInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        if !message.is_request() {
            warn!(id = %data.id, "server transaction matched a response, dropping");
            return Ok(None);
        }

        if message.method() == Some(&Method::Ack) {
            return match current_state {
                TransactionState::Completed => {
                    debug!(id = %data.id, "ACK received, confirming");
                    Self::cancel_completed_timers(timer_handles);
                    Ok(Some(TransactionState::Confirmed))
                }
                _ => {
                    trace!(id = %data.id, state = ?current_state, "absorbing ACK retransmission");
                    Ok(None)
                }
            };
        }

        // A retransmitted INVITE.
        match current_state {
            TransactionState::Proceeding | TransactionState::Completed => {
                debug!(id = %data.id, state = ?current_state,
                       "INVITE retransmitted, replaying last response");
                if let Err(e) = data.retransmit_last_response().await {
                    data.report_transport_error(&e.to_string()).await;
                    return Ok(Some(TransactionState::Terminated));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn send_response(
        &self,
        data: &Arc<ServerTransactionData>,
        response: Message,
        current_state: TransactionState,
        timer_handles: &mut ServerInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        let Some(code) = response.response_code() else {
            warn!(id = %data.id, "TU handed a non-response to a server transaction");
            return Ok(None);
        };

        // Any TU response makes the automatic 100 Trying unnecessary.
        Self::cancel_provisional(timer_handles);

        match current_state {
            TransactionState::Proceeding => {
                if let Err(e) = data.transmit_response(&response).await {
                    data.report_transport_error(&e.to_string()).await;
                    return Ok(Some(TransactionState::Terminated));
                }
                if code < 200 {
                    Ok(None)
                } else if code < 300 {
                    // 2xx retransmission is the TU's responsibility.
                    Ok(Some(TransactionState::Terminated))
                } else {
                    Ok(Some(TransactionState::Completed))
                }
            }
            _ => {
                trace!(id = %data.id, state = ?current_state, "ignoring TU response");
                Ok(None)
            }
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<ServerTransactionData>,
        timer_name: &str,
        current_state: TransactionState,
        timer_handles: &mut ServerInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (timer_name, current_state) {
            ("Provisional", TransactionState::Proceeding) => {
                if data.last_response.lock().await.is_some() {
                    return Ok(None);
                }
                debug!(id = %data.id, "sending automatic 100 Trying");
                let request = data.request.lock().await.clone();
                let trying = Message::response_for(&request, 100, "Trying")?;
                if let Err(e) = data.transmit_response(&trying).await {
                    data.report_transport_error(&e.to_string()).await;
                    return Ok(Some(TransactionState::Terminated));
                }
                Ok(None)
            }
            ("G", TransactionState::Completed) => {
                debug!(id = %data.id, "Timer G fired, retransmitting final response");
                if let Err(e) = data.retransmit_last_response().await {
                    data.report_transport_error(&e.to_string()).await;
                    return Ok(Some(TransactionState::Terminated));
                }
                let current = timer_handles
                    .current_interval_g
                    .unwrap_or(data.settings.t1);
                let next = data.settings.next_backoff(current, true);
                self.start_timer_g(data, timer_handles, next).await;
                Ok(None)
            }
            ("H", TransactionState::Completed) => {
                warn!(id = %data.id, "Timer H fired, no ACK received");
                data.report_transport_error("no ACK received for final response")
                    .await;
                Ok(Some(TransactionState::Terminated))
            }
            ("I", TransactionState::Confirmed) => {
                debug!(id = %data.id, "Timer I fired, terminating");
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
        data: &Arc<ServerTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timer_handles: &mut ServerInviteTimerHandles,
        _command_tx: CommandSender,
    ) -> Result<()> {
        match new_state {
            TransactionState::Proceeding => {
                let handle = data
                    .timer_manager
                    .start_timer(
                        data.id.clone(),
                        TimerType::Provisional,
                        data.settings.provisional_delay,
                    )
                    .await;
                timer_handles.provisional = Some(handle);
            }
            TransactionState::Completed => {
                if !data.reliable() {
                    self.start_timer_g(data, timer_handles, data.settings.t1)
                        .await;
                }
                let handle = data
                    .timer_manager
                    .start_timer(data.id.clone(), TimerType::H, data.settings.wait_time_h)
                    .await;
                timer_handles.timer_h = Some(handle);
            }
            TransactionState::Confirmed => {
                let duration = data.settings.wait_time_i_for(data.reliable());
                let handle = data
                    .timer_manager
                    .start_timer(data.id.clone(), TimerType::I, duration)
                    .await;
                timer_handles.timer_i = Some(handle);
            }
            TransactionState::Terminated => {
                data.timer_manager.unregister_transaction(&data.id).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_transport_error(&self, data: &Arc<ServerTransactionData>) {
        data.report_transport_error("channel failed").await;
    }

    fn cancel_all_timers(&self, timer_handles: &mut ServerInviteTimerHandles) {
        Self::cancel_provisional(timer_handles);
        Self::cancel_completed_timers(timer_handles);
        if let Some(handle) = timer_handles.timer_i.take() {
            handle.abort();
        }
    }
}
