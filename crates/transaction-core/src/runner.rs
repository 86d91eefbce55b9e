//! The generic per-transaction event loop.
//!
//! Every transaction spawns one of these loops. All inputs — inbound
//! messages, TU responses, timer firings, transport errors — arrive as
//! [`InternalTransactionCommand`]s on a single mpsc channel, so no two
//! events for the same transaction ever run concurrently. The loop ends
//! when the transaction enters `Terminated`, after emitting one
//! `TransactionTerminated` event for the network layer to clean up on.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::event::{CommandSender, InternalTransactionCommand, TransactionEvent};
use crate::key::TransactionKey;
use crate::logic::TransactionLogic;
use crate::state::{validate_transition, AtomicTransactionState, TransactionState};

/// Access the runner needs into a transaction's shared data.
pub trait TransactionContext {
    /// The transaction's identifier.
    fn key(&self) -> &TransactionKey;
    /// The shared state holder.
    fn state(&self) -> &AtomicTransactionState;
    /// The event channel towards the network layer.
    fn events(&self) -> &mpsc::Sender<TransactionEvent>;
    /// The transaction's own command channel.
    fn command_sender(&self) -> CommandSender;
}

/// Runs a transaction until it terminates.
pub(crate) async fn run_transaction_loop<D, TH, L>(
    data: Arc<D>,
    logic: Arc<L>,
    mut cmd_rx: mpsc::Receiver<InternalTransactionCommand>,
) where
    D: TransactionContext + Send + Sync + 'static,
    TH: Default + Send + 'static,
    L: TransactionLogic<D, TH> + Send + Sync + 'static,
{
    let mut timer_handles = TH::default();
    let tx_id = data.key().clone();
    debug!(id = %tx_id, kind = %logic.kind(), "transaction loop starting");

    while let Some(command) = cmd_rx.recv().await {
        let current_state = data.state().get();
        trace!(id = %tx_id, state = ?current_state, ?command, "transaction command");

        match command {
            InternalTransactionCommand::TransitionTo(new_state) => {
                if current_state == new_state {
                    continue;
                }
                if let Err(e) = validate_transition(logic.kind(), current_state, new_state) {
                    error!(id = %tx_id, error = %e, "rejected state transition");
                    continue;
                }

                let previous = data.state().set(new_state);
                debug!(id = %tx_id, "state {:?} -> {:?}", previous, new_state);

                if new_state == TransactionState::Terminated {
                    logic.cancel_all_timers(&mut timer_handles);
                }
                if let Err(e) = logic
                    .on_enter_state(
                        &data,
                        new_state,
                        previous,
                        &mut timer_handles,
                        data.command_sender(),
                    )
                    .await
                {
                    warn!(id = %tx_id, error = %e, "state entry actions failed");
                }
                if new_state == TransactionState::Terminated {
                    break;
                }
            }

            InternalTransactionCommand::ProcessMessage(message) => {
                match logic
                    .process_message(&data, message, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next_state)) => {
                        let _ = data
                            .command_sender()
                            .send(InternalTransactionCommand::TransitionTo(next_state))
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(id = %tx_id, error = %e, state = ?current_state,
                              "error processing message");
                    }
                }
            }

            InternalTransactionCommand::SendResponse(response) => {
                match logic
                    .send_response(&data, response, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next_state)) => {
                        let _ = data
                            .command_sender()
                            .send(InternalTransactionCommand::TransitionTo(next_state))
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(id = %tx_id, error = %e, "error sending response");
                    }
                }
            }

            InternalTransactionCommand::Timer(timer_name) => {
                match logic
                    .handle_timer(&data, &timer_name, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next_state)) => {
                        let _ = data
                            .command_sender()
                            .send(InternalTransactionCommand::TransitionTo(next_state))
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(id = %tx_id, error = %e, timer = %timer_name,
                              "error handling timer");
                    }
                }
            }

            InternalTransactionCommand::TransportError => {
                error!(id = %tx_id, "transport error, terminating transaction");
                logic.on_transport_error(&data).await;
                logic.cancel_all_timers(&mut timer_handles);
                data.state().set(TransactionState::Terminated);
                break;
            }

            InternalTransactionCommand::Terminate => {
                debug!(id = %tx_id, "terminate command");
                logic.cancel_all_timers(&mut timer_handles);
                data.state().set(TransactionState::Terminated);
                break;
            }
        }
    }

    logic.cancel_all_timers(&mut timer_handles);
    let _ = data
        .events()
        .send(TransactionEvent::TransactionTerminated {
            transaction_id: tx_id.clone(),
        })
        .await;
    debug!(id = %tx_id, "transaction loop ended");
}
