//! The trait powering the four transaction state machines.
//!
//! Each of the RFC 3261 Section 17 machines supplies an implementation of
//! [`TransactionLogic`]; one generic event loop in `runner` drives any of
//! them. The logic owns timer policy: timers are started in
//! `on_enter_state` and by `handle_timer` (for doubling retransmission
//! intervals), and cancelled explicitly when the machine no longer wants
//! them. The runner only cancels everything on termination.

use std::sync::Arc;

use crate::error::Result;
use crate::event::CommandSender;
use crate::state::{TransactionKind, TransactionState};

use sipline_sip_message::Message;

/// State machine behavior for one transaction kind.
///
/// `D` is the shared transaction data (client or server); `TH` holds the
/// `JoinHandle`s of the timers this kind uses.
#[async_trait::async_trait]
pub trait TransactionLogic<D, TH>
where
    D: Send + Sync + 'static,
    TH: Default + Send + 'static,
{
    /// The kind of machine this implements.
    fn kind(&self) -> TransactionKind;

    /// Processes an inbound message matched to this transaction: responses
    /// for client transactions, request retransmissions and ACK for server
    /// transactions.
    ///
    /// Returns the state to transition to, or `None` to stay.
    async fn process_message(
        &self,
        data: &Arc<D>,
        message: Message,
        current_state: TransactionState,
        timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>>;

    /// Processes a response handed down by the TU. Only meaningful for
    /// server transactions; the default ignores it.
    async fn send_response(
        &self,
        _data: &Arc<D>,
        _response: Message,
        _current_state: TransactionState,
        _timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>> {
        Ok(None)
    }

    /// Handles a named timer firing in the current state.
    async fn handle_timer(
        &self,
        data: &Arc<D>,
        timer_name: &str,
        current_state: TransactionState,
        timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>>;

    /// Runs the entry actions of a state: sending the initial request,
    /// starting the timers the state needs.
    async fn on_enter_state(
        &self,
        data: &Arc<D>,
        new_state: TransactionState,
        previous_state: TransactionState,
        timer_handles: &mut TH,
        command_tx: CommandSender,
    ) -> Result<()>;

    /// Reports a transport failure on the transaction's channel upward.
    /// Always followed by termination.
    async fn on_transport_error(&self, data: &Arc<D>);

    /// Aborts every timer this transaction has running.
    fn cancel_all_timers(&self, timer_handles: &mut TH);
}
