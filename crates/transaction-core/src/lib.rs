//! RFC 3261 transaction layer and the SIP network layer.
//!
//! The transaction layer implements the four Section 17 state machines —
//! INVITE and non-INVITE, client and server — each running as one
//! spawned event loop fed by a command channel, so all events for a
//! transaction are serialized. The [`NetworkLayer`] on top owns channels
//! (created lazily per destination endpoint and reference counted),
//! matches inbound messages to transactions by their string identifiers,
//! creates server transactions for unmatched requests, and surfaces
//! everything to the Transaction User as [`TransactionEvent`]s.
//!
//! ```text
//!   Transaction User
//!        ↑   ↓ send()
//!   NetworkLayer  —  channel map, alias map, transaction maps
//!        ↑   ↓
//!   Client/Server transactions  —  timers, retransmissions
//!        ↑   ↓
//!   Channels (UDP, TCP, TLS, WS, WSS)
//! ```

mod client;
mod error;
mod event;
mod key;
mod logic;
mod network;
mod runner;
mod server;
mod state;
mod timer;

pub use client::{ClientInviteTransaction, ClientNonInviteTransaction, ClientTransactionData};
pub use error::{Error, Result};
pub use event::{CommandReceiver, CommandSender, InternalTransactionCommand, TransactionEvent};
pub use key::TransactionKey;
pub use logic::TransactionLogic;
pub use network::{
    default_branch_factory, BranchFactory, CertErrorDecision, NetworkConfig, NetworkLayer,
    SslCertErrorHandler,
};
pub use runner::TransactionContext;
pub use server::{ServerInviteTransaction, ServerNonInviteTransaction, ServerTransactionData};
pub use state::{validate_transition, AtomicTransactionState, TransactionKind, TransactionState};
pub use timer::{TimerManager, TimerSettings, TimerType};
