//! SIP message layer: parsing, normalization and structured access.
//!
//! A [`Message`] is either a request or a response, parsed from the wire or
//! constructed by an upper layer. Internally every message keeps a single
//! canonical raw-headers buffer in which the start line and each logical
//! header are separated by `\0` bytes, terminated by a double `\0`:
//!
//! ```text
//! <start-line>\0<name>: <value>\0<name>: <value>\0\0
//! ```
//!
//! A span index over that buffer provides cheap, allocation-free header
//! lookup; coalescing headers are split on unquoted commas into
//! continuation entries that share the preceding entry's name. Compact
//! header forms are expanded and contact-like values (Contact, From, To,
//! Route, Record-Route, Reply-To) are normalized to the
//! `"display" <uri>;params` shape during parsing, so downstream layers can
//! rely on a single value grammar.
//!
//! Mutation operations rebuild the canonical buffer and re-parse; a failed
//! re-parse leaves the message unchanged.

mod error;
mod header;
mod message;
mod method;
mod uri;
mod version;
mod wire;

pub mod headers;

pub use error::{Error, Result};
pub use header::{expand_compact_form, is_contact_like_header, is_non_coalescing_header};
pub use message::{Direction, Message};
pub use method::Method;
pub use uri::Uri;
pub use version::SipVersion;

/// Fixed prefix of an RFC 3261-compliant branch parameter.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Commonly used imports for working with SIP messages.
pub mod prelude {
    pub use crate::headers::{CSeq, NameAddr, Via};
    pub use crate::{Direction, Error, Message, Method, Result, SipVersion, Uri, MAGIC_COOKIE};
}
