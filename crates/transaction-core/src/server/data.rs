use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use sipline_sip_message::Message;
use sipline_sip_transport::Channel;

use crate::error::{Error, Result};
use crate::event::{CommandSender, TransactionEvent};
use crate::key::TransactionKey;
use crate::runner::TransactionContext;
use crate::state::AtomicTransactionState;
use crate::timer::{TimerManager, TimerSettings};

/// Shared state of a server transaction (INVITE or non-INVITE).
#[derive(Debug)]
pub struct ServerTransactionData {
    /// Transaction identifier
    pub id: TransactionKey,
    /// Current state
    pub state: Arc<AtomicTransactionState>,
    /// The request that created this transaction
    pub request: Arc<Mutex<Message>>,
    /// The last response sent, replayed for request retransmissions
    pub last_response: Arc<Mutex<Option<Message>>>,
    /// The channel responses are sent on
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

impl ServerTransactionData {
    /// Whether the underlying transport is reliable (no retransmissions).
    pub fn reliable(&self) -> bool {
        self.channel.destination().protocol().is_reliable()
    }

    /// Sends a response on the bound channel and remembers it for
    /// retransmission handling.
    pub async fn transmit_response(&self, response: &Message) -> Result<()> {
        self.channel.send(response).await.map_err(Error::Transport)?;
        *self.last_response.lock().await = Some(response.clone());
        Ok(())
    }

    /// Replays the last response, if one was sent.
    pub async fn retransmit_last_response(&self) -> Result<bool> {
        let guard = self.last_response.lock().await;
        match guard.as_ref() {
            Some(response) => {
                self.channel.send(response).await.map_err(Error::Transport)?;
                Ok(true)
            }
            None => Ok(false),
        }
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

impl TransactionContext for ServerTransactionData {
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
