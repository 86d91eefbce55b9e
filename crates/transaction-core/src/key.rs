//! Transaction identification.
//!
//! Transaction identifiers are strings chosen so that a single hash lookup
//! matches an inbound message to its transaction. Client identifiers are
//! prefixed `c:`, server identifiers `s:`, protecting the two spaces from
//! clashing in one map.
//!
//! A server identifier uses the RFC 3261 rule when the topmost Via branch
//! carries the `z9hG4bK` magic cookie (branch + sent-by + method, with ACK
//! folded into INVITE so the ACK for a non-2xx final matches the INVITE
//! transaction). Requests from ancient RFC 2543 peers fall back to a
//! composite of To/From tags, Call-ID, CSeq, method and Via sent-by.

use std::fmt;

use sipline_sip_message::{Message, Method, MAGIC_COOKIE};

/// Uniquely identifies a transaction within one network layer.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey(String);

impl TransactionKey {
    /// Builds the client transaction identifier for an outgoing request.
    ///
    /// Requires a topmost Via with a non-empty branch; the network layer
    /// stamps one before creating the transaction.
    pub fn client_for_request(request: &Message) -> Option<TransactionKey> {
        let via = request.top_via()?;
        let branch = via.branch()?;
        let method = request.method()?;
        Some(TransactionKey(format!("c:{}:{}", branch, method)))
    }

    /// Builds the client transaction identifier an incoming response
    /// matches: the Via branch plus the CSeq method (a CANCEL shares the
    /// branch of the INVITE it cancels but is a different transaction).
    pub fn client_for_response(response: &Message) -> Option<TransactionKey> {
        let via = response.top_via()?;
        let branch = via.branch()?;
        let cseq = response.cseq()?;
        Some(TransactionKey(format!("c:{}:{}", branch, cseq.method)))
    }

    /// Builds the server transaction identifier an incoming request
    /// matches.
    pub fn server_for_request(request: &Message) -> Option<TransactionKey> {
        let method = request.method()?;
        let matching_method = fold_ack(method.as_str());

        if let Some(via) = request.top_via() {
            if let Some(branch) = via.branch() {
                if branch.starts_with(MAGIC_COOKIE) {
                    return Some(TransactionKey(format!(
                        "s:{}:{}:{}",
                        branch,
                        via.sent_by(),
                        matching_method
                    )));
                }
            }
        }

        Self::server_fallback(request, matching_method)
    }

    /// Builds the server transaction identifier an outgoing response
    /// matches, so the network layer can route a TU response to the
    /// transaction that owns it. The method comes from CSeq.
    pub fn server_for_response(response: &Message) -> Option<TransactionKey> {
        let cseq = response.cseq()?;

        if let Some(via) = response.top_via() {
            if let Some(branch) = via.branch() {
                if branch.starts_with(MAGIC_COOKIE) {
                    // ACK is not folded here: ACKs do not get answered.
                    return Some(TransactionKey(format!(
                        "s:{}:{}:{}",
                        branch,
                        via.sent_by(),
                        cseq.method
                    )));
                }
            }
        }

        Self::server_fallback(response, fold_ack(&cseq.method))
    }

    // RFC 2543 compatibility identifier. The Request-URI is left out as
    // responses could not be related to the transaction otherwise; clashes
    // are possible but rare in practice.
    fn server_fallback(message: &Message, matching_method: &str) -> Option<TransactionKey> {
        let to = message.to_header()?;
        let from = message.from_header()?;
        let call_id = message.call_id()?;
        let cseq = message.cseq()?;

        let mut id = String::from("s:");
        if let Some(tag) = to.tag() {
            id.push_str(tag);
        }
        id.push(':');
        if let Some(tag) = from.tag() {
            id.push_str(tag);
        }
        id.push(':');
        id.push_str(call_id);
        id.push(':');
        id.push_str(&cseq.sequence.to_string());
        id.push(':');
        id.push_str(matching_method);
        id.push(':');
        if let Some(via) = message.top_via() {
            id.push_str(&via.sent_by());
            id.push(':');
            if let Some(branch) = via.branch() {
                id.push_str(branch);
            }
        }
        Some(TransactionKey(id))
    }

    /// Whether this is a server transaction identifier.
    pub fn is_server(&self) -> bool {
        self.0.starts_with("s:")
    }

    /// Whether this is a client transaction identifier.
    pub fn is_client(&self) -> bool {
        self.0.starts_with("c:")
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn fold_ack(method: &str) -> &str {
    if method == Method::Ack.as_str() {
        Method::Invite.as_str()
    } else {
        method
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, branch: Option<&str>) -> Message {
        let via = match branch {
            Some(b) => format!("Via: SIP/2.0/UDP client.example.com:5060;branch={}\0", b),
            None => "Via: SIP/2.0/UDP client.example.com:5060\0".to_string(),
        };
        Message::parse(&format!(
            "{} sip:test@example.com SIP/2.0\0{}From: <sip:alice@h>;tag=ft\0To: <sip:bob@h>;tag=tt\0Call-ID: cid-1\0CSeq: 1 {}\0\0",
            method, via, method
        ))
        .unwrap()
    }

    fn response(code: u16, cseq_method: &str, branch: &str) -> Message {
        Message::parse(&format!(
            "SIP/2.0 {} Reason\0Via: SIP/2.0/UDP client.example.com:5060;branch={}\0From: <sip:alice@h>;tag=ft\0To: <sip:bob@h>;tag=tt\0Call-ID: cid-1\0CSeq: 1 {}\0\0",
            code, branch, cseq_method
        ))
        .unwrap()
    }

    #[test]
    fn client_key_format() {
        let req = request("INVITE", Some("z9hG4bK74bf9"));
        let key = TransactionKey::client_for_request(&req).unwrap();
        assert_eq!(key.as_str(), "c:z9hG4bK74bf9:INVITE");
        assert!(key.is_client());
        assert!(!key.is_server());
    }

    #[test]
    fn client_key_matches_response_via_cseq() {
        let req = request("OPTIONS", Some("z9hG4bKabc"));
        let resp = response(200, "OPTIONS", "z9hG4bKabc");
        assert_eq!(
            TransactionKey::client_for_request(&req).unwrap(),
            TransactionKey::client_for_response(&resp).unwrap()
        );
    }

    #[test]
    fn client_key_requires_branch() {
        let req = request("OPTIONS", None);
        assert!(TransactionKey::client_for_request(&req).is_none());
    }

    #[test]
    fn server_key_rfc3261_format() {
        let req = request("INVITE", Some("z9hG4bK74bf9"));
        let key = TransactionKey::server_for_request(&req).unwrap();
        assert_eq!(
            key.as_str(),
            "s:z9hG4bK74bf9:client.example.com:5060:INVITE"
        );
        assert!(key.is_server());
    }

    #[test]
    fn ack_folds_into_invite_transaction() {
        let invite = request("INVITE", Some("z9hG4bK74bf9"));
        let ack = request("ACK", Some("z9hG4bK74bf9"));
        assert_eq!(
            TransactionKey::server_for_request(&invite).unwrap(),
            TransactionKey::server_for_request(&ack).unwrap()
        );
    }

    #[test]
    fn server_key_matches_own_response() {
        let invite = request("INVITE", Some("z9hG4bK74bf9"));
        let resp = response(486, "INVITE", "z9hG4bK74bf9");
        assert_eq!(
            TransactionKey::server_for_request(&invite).unwrap(),
            TransactionKey::server_for_response(&resp).unwrap()
        );
    }

    #[test]
    fn rfc2543_fallback_without_magic_cookie() {
        let req = request("BYE", Some("1234"));
        let key = TransactionKey::server_for_request(&req).unwrap();
        assert_eq!(
            key.as_str(),
            "s:tt:ft:cid-1:1:BYE:client.example.com:5060:1234"
        );
    }

    #[test]
    fn rfc2543_fallback_folds_ack() {
        let invite = request("INVITE", None);
        let ack = request("ACK", None);
        assert_eq!(
            TransactionKey::server_for_request(&invite).unwrap(),
            TransactionKey::server_for_request(&ack).unwrap()
        );
    }

    #[test]
    fn cancel_is_a_distinct_client_transaction() {
        let invite = request("INVITE", Some("z9hG4bKx"));
        let cancel = request("CANCEL", Some("z9hG4bKx"));
        assert_ne!(
            TransactionKey::client_for_request(&invite).unwrap(),
            TransactionKey::client_for_request(&cancel).unwrap()
        );
    }
}
