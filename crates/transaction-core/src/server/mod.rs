//! Server transactions (RFC 3261 Section 17.2).
//!
//! Both machines share [`ServerTransactionData`]. They absorb request
//! retransmissions by replaying the last response; the INVITE machine
//! additionally emits an automatic `100 Trying` when the TU stays silent
//! and runs the Completed/Confirmed ACK handshake.

mod data;
mod invite;
mod non_invite;

pub use data::ServerTransactionData;
pub use invite::ServerInviteTransaction;
pub use non_invite::ServerNonInviteTransaction;
