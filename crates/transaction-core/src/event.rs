//! Events delivered to the Transaction User and commands driving the
//! per-transaction event loops.

use tokio::sync::mpsc;

use sipline_sip_message::Message;
use sipline_sip_transport::EndPoint;

use crate::key::TransactionKey;
use crate::state::TransactionState;

/// Command sender for a transaction event loop.
pub type CommandSender = mpsc::Sender<InternalTransactionCommand>;

/// Command receiver for a transaction event loop.
pub type CommandReceiver = mpsc::Receiver<InternalTransactionCommand>;

/// Events the network layer delivers to its delegate (the TU).
///
/// All events are emitted from the network layer's event loop; re-entrant
/// `send` calls from an event handler are permitted.
#[derive(Debug)]
pub enum TransactionEvent {
    /// A channel finished connecting. `result` is `Ok` on success and
    /// carries the error text otherwise.
    ChannelConnected {
        /// Destination endpoint of the channel
        destination: EndPoint,
        /// Connect outcome
        result: std::result::Result<(), String>,
    },

    /// A channel was torn down (peer close, transport failure or idle
    /// release).
    ChannelClosed {
        /// Destination endpoint of the channel
        destination: EndPoint,
    },

    /// A request arrived that did not match an existing server
    /// transaction. Delivered exactly once per transaction; request
    /// retransmissions are absorbed by the transaction.
    IncomingRequest {
        /// The server transaction created for the request, when one was
        /// (ACKs to 2xx responses have none)
        transaction_id: Option<TransactionKey>,
        /// The incoming request, top Via already stamped with
        /// `received`/`rport`
        request: Message,
    },

    /// A response matched a client transaction and was passed up.
    IncomingResponse {
        /// The matching client transaction
        transaction_id: TransactionKey,
        /// The incoming response
        response: Message,
    },

    /// A client transaction's timeout timer (B or F) fired before a final
    /// response arrived.
    TimedOut {
        /// The transaction that timed out
        transaction_id: TransactionKey,
        /// The request that went unanswered
        request: Message,
    },

    /// A transport-level failure terminated a transaction.
    TransportError {
        /// The failed transaction
        transaction_id: TransactionKey,
        /// The request the transaction was carrying
        request: Message,
        /// Failure description
        error: String,
    },

    /// A transaction reached its terminal state and was removed.
    TransactionTerminated {
        /// The terminated transaction
        transaction_id: TransactionKey,
    },
}

/// Commands processed by a transaction's event loop.
///
/// The network layer and the transaction's own timers drive the state
/// machine exclusively through these, so all events for one transaction
/// are serialized.
#[derive(Debug)]
pub enum InternalTransactionCommand {
    /// Transition to the given state, validating the edge first.
    TransitionTo(TransactionState),
    /// An inbound message matched this transaction.
    ProcessMessage(Message),
    /// The TU produced a response for this server transaction.
    SendResponse(Message),
    /// A timer fired; the payload names it (e.g. `"A"`, `"F"`).
    Timer(String),
    /// The channel under this transaction failed.
    TransportError,
    /// Terminate immediately, cancelling all timers.
    Terminate,
}
