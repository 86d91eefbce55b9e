//! Client transactions (RFC 3261 Section 17.1).
//!
//! Both machines share [`ClientTransactionData`] and differ in their
//! timer set and final-response handling: the INVITE machine generates
//! the ACK for non-2xx finals itself, the non-INVITE machine caps its
//! retransmit backoff at T2.

mod data;
mod invite;
mod non_invite;

pub use data::ClientTransactionData;
pub use invite::ClientInviteTransaction;
pub use non_invite::ClientNonInviteTransaction;
