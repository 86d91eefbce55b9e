use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use sipline_sip_message::Message;
use sipline_sip_transport::Channel;

use crate::error::{Error, Result};
use crate::event::{CommandSender, TransactionEvent};
use crate::key::TransactionKey;
use crate::runner::TransactionContext;
use crate::state::AtomicTransactionState;
use crate::timer::{TimerManager, TimerSettings};

/// Shared state of a client transaction (INVITE or non-INVITE).
#[derive(Debug)]
pub struct ClientTransactionData {
    /// Transaction identifier
    pub id: TransactionKey,
    /// Current state
    pub state: Arc<AtomicTransactionState>,
    /// The request this transaction is carrying
    pub request: Arc<Mutex<Message>>,
    /// Last response received, if any
    pub last_response: Arc<Mutex<Option<Message>>>,
    /// The ACK generated for a non-2xx final response (INVITE only),
    /// kept for retransmission
    pub ack: Arc<Mutex<Option<Message>>>,
    /// The channel this transaction is bound to
    pub channel: Arc<dyn Channel>,
    /// Event channel towards the network layer
    pub events_tx: mpsc::Sender<TransactionEvent>,
    /// This transaction's own command channel
    pub cmd_tx: CommandSender,
    /// Timer scheduling
    pub timer_manager: Arc<TimerManager>,
    /// Timer durations
    pub settings: TimerSettings,
}

impl ClientTransactionData {
    /// Whether the underlying transport is reliable (no retransmissions).
    pub fn reliable(&self) -> bool {
        self.channel.destination().protocol().is_reliable()
    }

    /// (Re)transmits the request on the bound channel.
    pub async fn transmit_request(&self) -> Result<()> {
        let request = self.request.lock().await;
        self.channel.send(&request).await.map_err(Error::Transport)
    }

    /// Passes a response up to the TU.
    pub async fn pass_up_response(&self, response: Message) {
        let event = TransactionEvent::IncomingResponse {
            transaction_id: self.id.clone(),
            response,
        };
        if self.events_tx.send(event).await.is_err() {
            warn!(id = %self.id, "event channel gone, dropping response");
        }
    }

    /// Reports that the timeout timer fired before a final response.
    pub async fn report_timeout(&self) {
        let request = self.request.lock().await.clone();
        let _ = self
            .events_tx
            .send(TransactionEvent::TimedOut {
                transaction_id: self.id.clone(),
                request,
            })
            .await;
    }

    /// Reports a transport failure for the carried request.
    pub async fn report_transport_error(&self, error: &str) {
        let request = self.request.lock().await.clone();
        let _ = self
            .events_tx
            .send(TransactionEvent::TransportError {
                transaction_id: self.id.clone(),
                request,
                error: error.to_string(),
            })
            .await;
    }
}

impl TransactionContext for ClientTransactionData {
    fn key(&self) -> &TransactionKey {
        &self.id
    }

    fn state(&self) -> &AtomicTransactionState {
        &self.state
    }

    fn events(&self) -> &mpsc::Sender<TransactionEvent> {
        &self.events_tx
    }

    fn command_sender(&self) -> CommandSender {
        self.cmd_tx.clone()
    }
}
