//! Client non-INVITE transaction (RFC 3261 Section 17.1.2).
//!
//! `Trying → Proceeding → Completed → Terminated`. Timer E retransmits the
//! request over unreliable transports with its interval doubling up to T2;
//! a provisional response cancels the retransmit timer. Timer F bounds the
//! whole transaction, Timer K absorbs response retransmissions after the
//! final.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sipline_sip_message::Message;
use sipline_sip_transport::Channel;

use crate::client::data::ClientTransactionData;
use crate::error::Result;
use crate::event::{CommandSender, InternalTransactionCommand, TransactionEvent};
use crate::key::TransactionKey;
use crate::logic::TransactionLogic;
use crate::runner::run_transaction_loop;
use crate::state::{AtomicTransactionState, TransactionKind, TransactionState};
use crate::timer::{TimerManager, TimerSettings, TimerType};

/// Client non-INVITE transaction handle.
#[derive(Debug, Clone)]
pub struct ClientNonInviteTransaction {
    data: Arc<ClientTransactionData>,
}

/// Timer handles for the non-INVITE client machine.
#[derive(Default)]
pub(crate) struct ClientNonInviteTimerHandles {
    timer_e: Option<JoinHandle<()>>,
    current_interval_e: Option<std::time::Duration>,
    timer_f: Option<JoinHandle<()>>,
    timer_k: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ClientNonInviteLogic;

impl ClientNonInviteTransaction {
    /// Creates the transaction and spawns its event loop. The request is
    /// transmitted when [`ClientNonInviteTransaction::start`] runs.
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

        tokio::spawn(run_transaction_loop::<_, ClientNonInviteTimerHandles, _>(
            data.clone(),
            Arc::new(ClientNonInviteLogic),
            cmd_rx,
        ));

        Self { data }
    }

    /// Sends the request and arms the Trying-state timers.
    pub async fn start(&self) {
        let _ = self
            .data
            .cmd_tx
            .send(InternalTransactionCommand::TransitionTo(
                TransactionState::Trying,
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

impl ClientNonInviteLogic {
    async fn start_timer_e(
        &self,
        data: &Arc<ClientTransactionData>,
        timer_handles: &mut ClientNonInviteTimerHandles,
        interval: std::time::Duration,
    ) {
        timer_handles.current_interval_e = Some(interval);
        let handle = data
            .timer_manager
            .start_timer(data.id.clone(), TimerType::E, interval)
            .await;
        timer_handles.timer_e = Some(handle);
        trace!(id = %data.id, ?interval, "started Timer E");
    }

    async fn start_timer_f(
        &self,
        data: &Arc<ClientTransactionData>,
        timer_handles: &mut ClientNonInviteTimerHandles,
    ) {
        let handle = data
            .timer_manager
            .start_timer(
                data.id.clone(),
                TimerType::F,
                data.settings.transaction_timeout,
            )
            .await;
        timer_handles.timer_f = Some(handle);
    }

    fn cancel_timer_e(timer_handles: &mut ClientNonInviteTimerHandles) {
        if let Some(handle) = timer_handles.timer_e.take() {
            handle.abort();
        }
        timer_handles.current_interval_e = None;
    }
}

#[async_trait::async_trait]
impl TransactionLogic<ClientTransactionData, ClientNonInviteTimerHandles> for ClientNonInviteLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteClient
    }

    async fn process_message(
        &self,
        data: &Arc<ClientTransactionData>,
        message: Message,
        current_state: TransactionState,
        timer_handles: &mut ClientNonInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        let Some(code) = message.response_code() else {
            warn!(id = %data.id, "client transaction matched a non-response, dropping");
            return Ok(None);
        };

        match current_state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if code < 200 {
                    // A provisional response stops request retransmission.
                    Self::cancel_timer_e(timer_handles);
                    data.pass_up_response(message).await;
                    if current_state == TransactionState::Trying {
                        Ok(Some(TransactionState::Proceeding))
                    } else {
                        Ok(None)
                    }
                } else {
                    Self::cancel_timer_e(timer_handles);
                    if let Some(handle) = timer_handles.timer_f.take() {
                        handle.abort();
                    }
                    *data.last_response.lock().await = Some(message.clone());
                    data.pass_up_response(message).await;
                    Ok(Some(TransactionState::Completed))
                }
            }
            _ => {
                // Response retransmissions in Completed are absorbed.
                trace!(id = %data.id, state = ?current_state, "absorbing response retransmission");
                Ok(None)
            }
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<ClientTransactionData>,
        timer_name: &str,
        current_state: TransactionState,
        timer_handles: &mut ClientNonInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (timer_name, current_state) {
            ("E", TransactionState::Trying) => {
                debug!(id = %data.id, "Timer E fired, retransmitting request");
                if let Err(e) = data.transmit_request().await {
                    data.report_transport_error(&e.to_string()).await;
                    return Ok(Some(TransactionState::Terminated));
                }
                let current = timer_handles
                    .current_interval_e
                    .unwrap_or(data.settings.t1);
                let next = data.settings.next_backoff(current, true);
                self.start_timer_e(data, timer_handles, next).await;
                Ok(None)
            }
            ("F", TransactionState::Trying) | ("F", TransactionState::Proceeding) => {
                warn!(id = %data.id, "Timer F fired, transaction timed out");
                data.report_timeout().await;
                Ok(Some(TransactionState::Terminated))
            }
            ("K", TransactionState::Completed) => {
                debug!(id = %data.id, "Timer K fired, terminating");
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
        timer_handles: &mut ClientNonInviteTimerHandles,
        command_tx: CommandSender,
    ) -> Result<()> {
        match new_state {
            TransactionState::Trying => {
                debug!(id = %data.id, "sending initial request");
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
                    self.start_timer_e(data, timer_handles, data.settings.t1)
                        .await;
                }
                self.start_timer_f(data, timer_handles).await;
            }
            TransactionState::Completed => {
                let duration = data.settings.wait_time_k_for(data.reliable());
                let handle = data
                    .timer_manager
                    .start_timer(data.id.clone(), TimerType::K, duration)
                    .await;
                timer_handles.timer_k = Some(handle);
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

    fn cancel_all_timers(&self, timer_handles: &mut ClientNonInviteTimerHandles) {
        Self::cancel_timer_e(timer_handles);
        if let Some(handle) = timer_handles.timer_f.take() {
            handle.abort();
        }
        if let Some(handle) = timer_handles.timer_k.take() {
            handle.abort();
        }
    }
}
