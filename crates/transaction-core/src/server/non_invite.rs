//! Server non-INVITE transaction (RFC 3261 Section 17.2.2).
//!
//! `Trying → Proceeding → Completed → Terminated`. Request
//! retransmissions never reach the TU: in Trying they are absorbed, later
//! they replay the last response. Timer J keeps the transaction around in
//! Completed long enough to absorb straggling retransmissions.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sipline_sip_message::Message;
use sipline_sip_transport::Channel;

use crate::error::Result;
use crate::event::{CommandSender, InternalTransactionCommand, TransactionEvent};
use crate::key::TransactionKey;
use crate::logic::TransactionLogic;
use crate::runner::run_transaction_loop;
use crate::server::data::ServerTransactionData;
use crate::state::{AtomicTransactionState, TransactionKind, TransactionState};
use crate::timer::{TimerManager, TimerSettings, TimerType};

/// Server non-INVITE transaction handle.
#[derive(Debug, Clone)]
pub struct ServerNonInviteTransaction {
    data: Arc<ServerTransactionData>,
}

/// Timer handles for the non-INVITE server machine.
#[derive(Default)]
pub(crate) struct ServerNonInviteTimerHandles {
    timer_j: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ServerNonInviteLogic;

impl ServerNonInviteTransaction {
    /// Creates the transaction for a just-received request and spawns its
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

        tokio::spawn(run_transaction_loop::<_, ServerNonInviteTimerHandles, _>(
            data.clone(),
            Arc::new(ServerNonInviteLogic),
            cmd_rx,
        ));

        Self { data }
    }

    /// Enters the Trying state. The network layer has already delivered
    /// the request to the TU.
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

    /// The request that created this transaction.
    pub async fn original_request(&self) -> Message {
        self.data.request.lock().await.clone()
    }

    /// The last response sent, if any.
    pub async fn last_response(&self) -> Option<Message> {
        self.data.last_response.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl TransactionLogic<ServerTransactionData, ServerNonInviteTimerHandles> for ServerNonInviteLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteServer
    }

    async fn process_message(
        &self,
        data: &Arc<ServerTransactionData>,
        message: Message,
        current_state: TransactionState,
        _timer_handles: &mut ServerNonInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        if !message.is_request() {
            warn!(id = %data.id, "server transaction matched a response, dropping");
            return Ok(None);
        }

        match current_state {
            TransactionState::Trying => {
                // Nothing sent yet; the retransmission is absorbed.
                trace!(id = %data.id, "absorbing request retransmission in Trying");
                Ok(None)
            }
            TransactionState::Proceeding | TransactionState::Completed => {
                debug!(id = %data.id, "request retransmitted, replaying last response");
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
        _timer_handles: &mut ServerNonInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        let Some(code) = response.response_code() else {
            warn!(id = %data.id, "TU handed a non-response to a server transaction");
            return Ok(None);
        };

        match current_state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if let Err(e) = data.transmit_response(&response).await {
                    data.report_transport_error(&e.to_string()).await;
                    return Ok(Some(TransactionState::Terminated));
                }
                if code < 200 {
                    if current_state == TransactionState::Trying {
                        Ok(Some(TransactionState::Proceeding))
                    } else {
                        Ok(None)
                    }
                } else {
                    Ok(Some(TransactionState::Completed))
                }
            }
            _ => {
                trace!(id = %data.id, state = ?current_state,
                       "ignoring TU response in terminal-bound state");
                Ok(None)
            }
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<ServerTransactionData>,
        timer_name: &str,
        current_state: TransactionState,
        _timer_handles: &mut ServerNonInviteTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (timer_name, current_state) {
            ("J", TransactionState::Completed) => {
                debug!(id = %data.id, "Timer J fired, terminating");
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
        timer_handles: &mut ServerNonInviteTimerHandles,
        _command_tx: CommandSender,
    ) -> Result<()> {
        match new_state {
            TransactionState::Completed => {
                let duration = data.settings.wait_time_j_for(data.reliable());
                let handle = data
                    .timer_manager
                    .start_timer(data.id.clone(), TimerType::J, duration)
                    .await;
                timer_handles.timer_j = Some(handle);
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

    fn cancel_all_timers(&self, timer_handles: &mut ServerNonInviteTimerHandles) {
        if let Some(handle) = timer_handles.timer_j.take() {
            handle.abort();
        }
    }
}
