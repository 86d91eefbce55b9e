//! Wire-format translation.
//!
//! On the wire a SIP message is `start-line CRLF *(header CRLF) CRLF body`
//! with the body spanning exactly `Content-Length` octets. The decoder
//! accepts bare-LF line endings as a tolerance, unfolds RFC 3261 Section
//! 7.3.1 continuation lines, and hands the `\0`-translated header section
//! to the canonical parser. The encoder always emits CRLF.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{Direction, Message};

impl Message {
    /// Parses a complete wire-format message. The resulting message is
    /// tagged [`Direction::Incoming`].
    pub fn from_wire(bytes: &[u8]) -> Result<Message> {
        let (head, body_bytes) = split_head_body(bytes);
        let head_text = std::str::from_utf8(head).map_err(|_| Error::NotUtf8)?;

        let mut logical: Vec<String> = Vec::new();
        for raw_line in head_text.split('\n') {
            let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the preceding header line.
                if let Some(previous) = logical.last_mut() {
                    previous.push(' ');
                    previous.push_str(line.trim_start_matches([' ', '\t']));
                    continue;
                }
            }
            logical.push(line.to_string());
        }
        if logical.is_empty() {
            return Err(Error::InvalidHeader("empty message".to_string()));
        }

        let mut canonical = logical.join("\0");
        canonical.push('\0');
        canonical.push('\0');

        let mut message = Message::parse_with(&canonical, Direction::Incoming, None)?;

        let body = match message.content_length() {
            n if n >= 0 => {
                let expected = n as usize;
                if body_bytes.len() < expected {
                    return Err(Error::TruncatedBody {
                        expected,
                        actual: body_bytes.len(),
                    });
                }
                (expected > 0).then(|| Bytes::copy_from_slice(&body_bytes[..expected]))
            }
            _ => (!body_bytes.is_empty()).then(|| Bytes::copy_from_slice(body_bytes)),
        };
        message.attach_body(body);
        Ok(message)
    }

    /// Serializes to wire format: CRLF line endings, blank line, body.
    pub fn to_wire(&self) -> Vec<u8> {
        let body_len = self.body().map(|b| b.len()).unwrap_or(0);
        let mut out = Vec::with_capacity(self.raw_headers().len() + body_len + 64);
        out.extend_from_slice(self.start_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.header_lines() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = self.body() {
            out.extend_from_slice(body);
        }
        out
    }
}

// Splits at the first blank line; returns (header section, body bytes).
fn split_head_body(bytes: &[u8]) -> (&[u8], &[u8]) {
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let rest = &bytes[i + 1..];
            if rest.starts_with(b"\r\n") {
                return (&bytes[..=i], &bytes[i + 3..]);
            }
            if rest.starts_with(b"\n") {
                return (&bytes[..=i], &bytes[i + 2..]);
            }
        }
        i += 1;
    }
    (bytes, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    #[test]
    fn decodes_crlf_message_with_body() {
        let wire = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776\r\n\
                     From: Alice <sip:alice@atlanta.com>;tag=1928\r\n\
                     To: <sip:bob@biloxi.com>\r\n\
                     Call-ID: a84b4c76e66710\r\n\
                     CSeq: 314159 INVITE\r\n\
                     Content-Length: 4\r\n\
                     \r\nv=0\n";
        let m = Message::from_wire(wire).unwrap();
        assert_eq!(m.direction(), Direction::Incoming);
        assert_eq!(m.method(), Some(&Method::Invite));
        assert_eq!(m.body().unwrap().as_ref(), b"v=0\n");
        assert_eq!(m.cseq().unwrap().sequence, 314159);
    }

    #[test]
    fn accepts_bare_lf_line_endings() {
        let wire = b"SIP/2.0 200 OK\nCSeq: 1 OPTIONS\nVia: SIP/2.0/UDP h:5060;branch=z9hG4bKa\n\n";
        let m = Message::from_wire(wire).unwrap();
        assert_eq!(m.response_code(), Some(200));
        assert_eq!(m.top_via().unwrap().branch(), Some("z9hG4bKa"));
    }

    #[test]
    fn unfolds_continuation_lines() {
        let wire = b"OPTIONS sip:h SIP/2.0\r\n\
                     Subject: first part\r\n\
                     \tsecond part\r\n\
                     \r\n";
        let m = Message::from_wire(wire).unwrap();
        assert_eq!(
            m.header_values("subject").next().unwrap(),
            "first part second part"
        );
    }

    #[test]
    fn rejects_truncated_body() {
        let wire = b"OPTIONS sip:h SIP/2.0\r\nContent-Length: 10\r\n\r\nshort";
        assert!(matches!(
            Message::from_wire(wire),
            Err(Error::TruncatedBody {
                expected: 10,
                actual: 5
            })
        ));
    }

    #[test]
    fn body_without_content_length_spans_remainder() {
        let wire = b"OPTIONS sip:h SIP/2.0\r\n\r\npayload";
        let m = Message::from_wire(wire).unwrap();
        assert_eq!(m.body().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn emits_crlf_and_roundtrips() {
        let wire = b"REGISTER sip:registrar.example SIP/2.0\r\n\
                     Via: SIP/2.0/TCP client.example:5060;branch=z9hG4bKnashds7\r\n\
                     m: <sip:u@client.example>\r\n\
                     CSeq: 1 REGISTER\r\n\
                     \r\n";
        let m = Message::from_wire(wire).unwrap();
        let encoded = m.to_wire();
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.starts_with("REGISTER sip:registrar.example SIP/2.0\r\n"));
        // Compact form was expanded during normalization.
        assert!(text.contains("Contact: <sip:u@client.example>\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        // Fixed point: decoding what we encoded reproduces the canonical form.
        let again = Message::from_wire(&encoded).unwrap();
        assert_eq!(again.raw_headers(), m.raw_headers());
    }
}
