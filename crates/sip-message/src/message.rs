//! The `Message` type and its canonical raw-headers representation.
//!
//! # Canonical form
//!
//! Every message owns a single `String` in which the normalized start line
//! and each logical header are terminated by `\0`, with a second `\0`
//! closing the buffer:
//!
//! ```text
//! INVITE sip:a@b SIP/2.0\0Via: SIP/2.0/UDP h:5060;branch=z9hG4bKx\0\0
//! ```
//!
//! Normalization happens once, at parse time: compact header names are
//! expanded, contact-like values are rewritten to the
//! `"display" <uri>;params` shape, and coalescing headers are split on
//! unquoted commas into continuation entries. A span index (`parsed`)
//! records `(name, value)` ranges into the buffer; continuation entries
//! have an empty name span and share the name of the preceding entry.
//!
//! Mutations never edit the buffer in place: they build a replacement
//! buffer, parse it into a fresh message, and swap on success, so a failed
//! re-parse leaves the message untouched.

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, Result};
use crate::header::{expand_compact_form, is_contact_like_header, is_non_coalescing_header};
use crate::headers::{CSeq, NameAddr, Via};
use crate::method::Method;
use crate::uri::Uri;
use crate::version::SipVersion;

/// Whether a message was parsed off the wire or built locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from a channel.
    Incoming,
    /// Constructed by an upper layer for transmission.
    Outgoing,
}

/// Byte range into the canonical raw-headers buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    const EMPTY: Span = Span { start: 0, end: 0 };

    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// One entry of the span index. A continuation carries only a subsequent
/// value for the preceding header (header values are comma separated).
#[derive(Debug, Clone, Copy)]
struct ParsedHeader {
    name: Span,
    value: Span,
}

impl ParsedHeader {
    fn is_continuation(&self) -> bool {
        self.name.start == self.name.end
    }
}

/// A parsed SIP request or response.
#[derive(Debug, Clone)]
pub struct Message {
    direction: Direction,
    version: SipVersion,
    request_method: Option<Method>,
    request_uri: Option<Uri>,
    response_code: Option<u16>,
    raw_headers: String,
    parsed: Vec<ParsedHeader>,
    body: Option<Bytes>,
}

impl Message {
    /// Parses a message from its canonical `\0`-delimited form. The caller
    /// is responsible for translating wire line endings beforehand (see
    /// [`Message::from_wire`]). The resulting message is tagged
    /// [`Direction::Outgoing`]; the wire entry point tags its results
    /// [`Direction::Incoming`].
    pub fn parse(raw_input: &str) -> Result<Message> {
        Self::parse_with(raw_input, Direction::Outgoing, None)
    }

    pub(crate) fn parse_with(
        raw_input: &str,
        direction: Direction,
        body: Option<Bytes>,
    ) -> Result<Message> {
        let mut message = Message {
            direction,
            version: SipVersion::V2_0,
            request_method: None,
            request_uri: None,
            response_code: None,
            raw_headers: String::with_capacity(raw_input.len()),
            parsed: Vec::new(),
            body,
        };
        message.parse_internal(raw_input)?;
        Ok(message)
    }

    /// Builds an outgoing request with an empty header section.
    pub fn new_request(method: Method, uri: &Uri) -> Result<Message> {
        Self::parse(&format!("{} {} SIP/2.0", method, uri))
    }

    /// Builds an outgoing response with an empty header section.
    pub fn new_response(code: u16, reason: &str) -> Result<Message> {
        let start = if reason.is_empty() {
            format!("SIP/2.0 {}", code)
        } else {
            format!("SIP/2.0 {} {}", code, reason)
        };
        Self::parse(&start)
    }

    /// Builds a response to `request`, copying the headers a response must
    /// mirror: every Via, then From, To, Call-ID and CSeq.
    pub fn response_for(request: &Message, code: u16, reason: &str) -> Result<Message> {
        let mut raw = if reason.is_empty() {
            format!("SIP/2.0 {}", code)
        } else {
            format!("SIP/2.0 {} {}", code, reason)
        };
        raw.push('\0');
        for (name, value) in request.header_lines() {
            let copied = ["via", "from", "to", "call-id", "cseq"]
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name));
            if copied {
                raw.push_str(name);
                raw.push_str(": ");
                raw.push_str(value);
                raw.push('\0');
            }
        }
        raw.push('\0');
        Self::parse(&raw)
    }

    // ---- Start line ----------------------------------------------------

    /// The normalized start line (everything before the first `\0`).
    pub fn start_line(&self) -> &str {
        match self.raw_headers.find('\0') {
            Some(end) => &self.raw_headers[..end],
            None => &self.raw_headers,
        }
    }

    /// Whether this message is a request.
    pub fn is_request(&self) -> bool {
        self.request_method.is_some()
    }

    /// Whether this message is a response.
    pub fn is_response(&self) -> bool {
        self.response_code.is_some()
    }

    /// Direction tag.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// SIP version (always 2.0 for successfully parsed messages).
    pub fn version(&self) -> SipVersion {
        self.version
    }

    /// Request method, for requests.
    pub fn method(&self) -> Option<&Method> {
        self.request_method.as_ref()
    }

    /// Request-URI, for requests.
    pub fn request_uri(&self) -> Option<&Uri> {
        self.request_uri.as_ref()
    }

    /// Response code (100..=699), for responses.
    pub fn response_code(&self) -> Option<u16> {
        self.response_code
    }

    /// The reason phrase of a response, or the empty string when absent.
    pub fn reason_phrase(&self) -> &str {
        if !self.is_response() {
            return "";
        }
        // The status line is normalized:
        // '<version> SP <code>' or '<version> SP <code> SP <reason>'.
        let line = self.start_line();
        let mut spaces = line.match_indices(' ');
        let _ = spaces.next();
        match spaces.next() {
            Some((idx, _)) => &line[idx + 1..],
            None => "",
        }
    }

    /// The message body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Replaces the body and restates the Content-Length header to match.
    pub fn set_body(&mut self, body: Option<Bytes>) -> Result<()> {
        self.remove_header("content-length")?;
        if let Some(bytes) = &body {
            self.add_header(&format!("Content-Length: {}", bytes.len()))?;
        }
        self.body = body;
        Ok(())
    }

    /// The canonical raw-headers buffer, double-`\0` terminated.
    pub fn raw_headers(&self) -> &str {
        &self.raw_headers
    }

    // Attaches a body without restating Content-Length; used by the wire
    // decoder, which validated the length itself.
    pub(crate) fn attach_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }

    // ---- Header access -------------------------------------------------

    /// Whether any header with the given name exists.
    pub fn has_header(&self, name: &str) -> bool {
        self.find_header(0, name).is_some()
    }

    /// Yields every value of the named header, including continuation
    /// entries produced by comma splitting.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let mut index = 0;
        let mut yielding = false;
        std::iter::from_fn(move || {
            while index < self.parsed.len() {
                let entry = &self.parsed[index];
                index += 1;
                if entry.is_continuation() {
                    if yielding {
                        return Some(self.slice(entry.value));
                    }
                } else {
                    yielding = self.slice(entry.name).eq_ignore_ascii_case(name);
                    if yielding {
                        return Some(self.slice(entry.value));
                    }
                }
            }
            None
        })
    }

    /// Yields every logical header line as `(name, value)`, with
    /// continuation values joined back into the full comma-separated value.
    pub fn header_lines(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        let mut index = 0;
        std::iter::from_fn(move || {
            if index >= self.parsed.len() {
                return None;
            }
            let entry = &self.parsed[index];
            debug_assert!(!entry.is_continuation());
            let name = self.slice(entry.name);
            let value_start = entry.value.start;
            let mut value_end = entry.value.end;
            index += 1;
            while index < self.parsed.len() && self.parsed[index].is_continuation() {
                value_end = self.parsed[index].value.end;
                index += 1;
            }
            Some((
                name,
                &self.raw_headers[value_start..value_end],
            ))
        })
    }

    /// Returns all values of the named header joined by `", "`, or `None`
    /// when the header is absent. Must not be used for non-coalescing
    /// headers; use [`Message::header_values`] for those.
    pub fn get_normalized_header(&self, name: &str) -> Option<String> {
        debug_assert!(!is_non_coalescing_header(name));

        let mut value = String::new();
        let mut found = false;
        let mut i = 0;
        while let Some(at) = self.find_header(i, name) {
            found = true;
            if !value.is_empty() {
                value.push_str(", ");
            }
            let start = self.parsed[at].value.start;
            let mut end = self.parsed[at].value.end;
            i = at + 1;
            while i < self.parsed.len() && self.parsed[i].is_continuation() {
                end = self.parsed[i].value.end;
                i += 1;
            }
            value.push_str(&self.raw_headers[start..end]);
        }
        found.then_some(value)
    }

    /// Case-insensitive exact match of any enumerated value of the named
    /// header. The match is exact per value: `no-cache` does not match
    /// `no-cache="foo"`.
    pub fn has_header_value(&self, name: &str, value: &str) -> bool {
        self.header_values(name)
            .any(|v| v.eq_ignore_ascii_case(value))
    }

    // ---- Typed accessors -----------------------------------------------

    /// Content-Length as a non-negative integer, or -1 when absent,
    /// signed, negative or unparsable.
    pub fn content_length(&self) -> i64 {
        self.int64_header_value("content-length")
    }

    /// Max-Forwards under the same rules as [`Message::content_length`].
    pub fn max_forwards(&self) -> i64 {
        self.int64_header_value("max-forwards")
    }

    fn int64_header_value(&self, name: &str) -> i64 {
        let Some(value) = self.header_values(name).next() else {
            return -1;
        };
        if value.is_empty() || value.starts_with('+') {
            return -1;
        }
        match value.parse::<i64>() {
            Ok(n) if n >= 0 => n,
            _ => -1,
        }
    }

    /// The Expires value in seconds. Overflowing values saturate to
    /// `u32::MAX`; non-numeric values yield `None`.
    pub fn expires(&self) -> Option<Duration> {
        let value = self.header_values("expires").next()?;
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let seconds = value.parse::<u32>().unwrap_or(u32::MAX);
        Some(Duration::from_secs(u64::from(seconds)))
    }

    /// The parsed CSeq header, if present and well-formed.
    pub fn cseq(&self) -> Option<CSeq> {
        let value = self.header_values("cseq").next()?;
        CSeq::parse(value).ok()
    }

    /// The topmost Via header, if present and well-formed.
    pub fn top_via(&self) -> Option<Via> {
        let value = self.header_values("via").next()?;
        Via::parse(value).ok()
    }

    /// Yields every Via entry in order.
    pub fn vias(&self) -> impl Iterator<Item = Via> + '_ {
        self.header_values("via").filter_map(|v| Via::parse(v).ok())
    }

    /// The From header as a name-addr view.
    pub fn from_header(&self) -> Option<NameAddr> {
        self.contact_like_value("from")
    }

    /// The To header as a name-addr view.
    pub fn to_header(&self) -> Option<NameAddr> {
        self.contact_like_value("to")
    }

    /// The Reply-To header as a name-addr view.
    pub fn reply_to(&self) -> Option<NameAddr> {
        self.contact_like_value("reply-to")
    }

    /// The Call-ID value.
    pub fn call_id(&self) -> Option<&str> {
        self.header_values("call-id").next()
    }

    /// Yields every Contact entry that parses as a name-addr (the `*`
    /// wildcard form is skipped).
    pub fn contacts(&self) -> impl Iterator<Item = NameAddr> + '_ {
        self.header_values("contact")
            .filter_map(|v| NameAddr::parse(v).ok())
    }

    /// Yields every Route entry.
    pub fn routes(&self) -> impl Iterator<Item = NameAddr> + '_ {
        self.header_values("route")
            .filter_map(|v| NameAddr::parse(v).ok())
    }

    /// Yields every Record-Route entry.
    pub fn record_routes(&self) -> impl Iterator<Item = NameAddr> + '_ {
        self.header_values("record-route")
            .filter_map(|v| NameAddr::parse(v).ok())
    }

    fn contact_like_value(&self, name: &str) -> Option<NameAddr> {
        let value = self.header_values(name).next()?;
        NameAddr::parse(value).ok()
    }

    // ---- Mutations -----------------------------------------------------

    /// Appends one logical header (`"Name: value"`). The value is
    /// normalized exactly as at parse time.
    pub fn add_header(&mut self, header: &str) -> Result<()> {
        if header.contains('\0') {
            return Err(Error::EmbeddedNull);
        }
        debug_assert!(self.raw_headers.ends_with("\0\0"));
        // Drop the closing null, keep the one terminating the last line.
        let mut new_raw = self.raw_headers[..self.raw_headers.len() - 1].to_string();
        new_raw.push_str(header);
        new_raw.push('\0');
        new_raw.push('\0');
        self.rebuild(&new_raw)
    }

    /// Removes every header with the given name.
    pub fn remove_header(&mut self, name: &str) -> Result<()> {
        self.remove_headers(&[name])
    }

    /// Removes every header whose name appears in `names`.
    pub fn remove_headers(&mut self, names: &[&str]) -> Result<()> {
        let new_raw = self.rebuild_lines(|line_name, _| {
            !names.iter().any(|n| n.eq_ignore_ascii_case(line_name))
        });
        self.rebuild(&new_raw)
    }

    /// Removes the logical header lines matching both name
    /// (case-insensitive) and value (exact).
    pub fn remove_header_line(&mut self, name: &str, value: &str) -> Result<()> {
        let new_raw = self
            .rebuild_lines(|line_name, line_value| {
                !(line_name.eq_ignore_ascii_case(name) && line_value == value)
            });
        self.rebuild(&new_raw)
    }

    /// Replaces the start line, keeping every header.
    pub fn replace_start_line(&mut self, new_start: &str) -> Result<()> {
        if new_start.contains('\0') {
            return Err(Error::EmbeddedNull);
        }
        let mut new_raw = String::with_capacity(self.raw_headers.len());
        new_raw.push_str(new_start);
        new_raw.push('\0');
        for (name, value) in self.header_lines() {
            new_raw.push_str(name);
            new_raw.push_str(": ");
            new_raw.push_str(value);
            new_raw.push('\0');
        }
        new_raw.push('\0');
        self.rebuild(&new_raw)
    }

    /// Appends `;received=<addr>` to the topmost Via. Subsequent Via
    /// headers are preserved verbatim.
    pub fn set_via_received(&mut self, received: &str) -> Result<()> {
        self.amend_top_via(&format!(";received={}", received))
    }

    /// Appends `;rport=<port>` to the topmost Via.
    pub fn set_via_rport(&mut self, rport: u16) -> Result<()> {
        self.amend_top_via(&format!(";rport={}", rport))
    }

    /// Appends `;branch=<branch>` to the topmost Via.
    pub fn set_via_branch(&mut self, branch: &str) -> Result<()> {
        self.amend_top_via(&format!(";branch={}", branch))
    }

    /// Rewrites individual values of the named header in place. `f`
    /// receives each entry (including continuations) and returns the
    /// replacement, or `None` to keep the entry unchanged. Header order is
    /// preserved.
    pub fn map_header_values(
        &mut self,
        name: &str,
        mut f: impl FnMut(&str) -> Option<String>,
    ) -> Result<()> {
        let mut new_raw = String::with_capacity(self.raw_headers.len());
        new_raw.push_str(self.start_line());
        new_raw.push('\0');

        let mut index = 0;
        while index < self.parsed.len() {
            let entry = self.parsed[index];
            let line_name = self.slice(entry.name).to_string();
            let mut values = vec![self.slice(entry.value).to_string()];
            index += 1;
            while index < self.parsed.len() && self.parsed[index].is_continuation() {
                values.push(self.slice(self.parsed[index].value).to_string());
                index += 1;
            }

            new_raw.push_str(&line_name);
            new_raw.push_str(": ");
            if line_name.eq_ignore_ascii_case(name) {
                let mapped: Vec<String> = values
                    .iter()
                    .map(|v| f(v).unwrap_or_else(|| v.clone()))
                    .collect();
                new_raw.push_str(&mapped.join(", "));
            } else {
                new_raw.push_str(&values.join(", "));
            }
            new_raw.push('\0');
        }
        new_raw.push('\0');
        self.rebuild(&new_raw)
    }

    fn amend_top_via(&mut self, suffix: &str) -> Result<()> {
        debug_assert!(self.raw_headers.ends_with("\0\0"));
        let mut first = true;
        let mut new_raw = String::with_capacity(self.raw_headers.len() + suffix.len());
        new_raw.push_str(self.start_line());
        new_raw.push('\0');
        for (name, value) in self.header_lines() {
            new_raw.push_str(name);
            new_raw.push_str(": ");
            new_raw.push_str(value);
            if first && name.eq_ignore_ascii_case("via") {
                new_raw.push_str(suffix);
                first = false;
            }
            new_raw.push('\0');
        }
        new_raw.push('\0');
        self.rebuild(&new_raw)
    }

    fn rebuild_lines(&self, mut keep: impl FnMut(&str, &str) -> bool) -> String {
        let mut new_raw = String::with_capacity(self.raw_headers.len());
        new_raw.push_str(self.start_line());
        new_raw.push('\0');
        for (name, value) in self.header_lines() {
            if keep(name, value) {
                new_raw.push_str(name);
                new_raw.push_str(": ");
                new_raw.push_str(value);
                new_raw.push('\0');
            }
        }
        new_raw.push('\0');
        new_raw
    }

    // Build-first, swap-on-success: a failed re-parse must leave the
    // message unchanged.
    fn rebuild(&mut self, new_raw: &str) -> Result<()> {
        let fresh = Message::parse_with(new_raw, self.direction, self.body.clone())?;
        *self = fresh;
        Ok(())
    }

    // ---- Parsing -------------------------------------------------------

    fn slice(&self, span: Span) -> &str {
        &self.raw_headers[span.start..span.end]
    }

    fn find_header(&self, from: usize, name: &str) -> Option<usize> {
        (from..self.parsed.len()).find(|&i| {
            !self.parsed[i].is_continuation() && self.slice(self.parsed[i].name).eq_ignore_ascii_case(name)
        })
    }

    fn parse_internal(&mut self, raw_input: &str) -> Result<()> {
        let line_end = raw_input.find('\0').unwrap_or(raw_input.len());
        self.parse_start_line(&raw_input[..line_end])?;
        self.raw_headers.push('\0');

        if line_end == raw_input.len() {
            self.raw_headers.push('\0');
            return Ok(());
        }

        // Length including the null terminating the start line.
        let start_line_len = self.raw_headers.len();

        self.normalize_headers(&raw_input[line_end + 1..])?;
        self.index_headers(start_line_len);

        debug_assert!(self.raw_headers.ends_with("\0\0"));
        Ok(())
    }

    fn parse_start_line(&mut self, line: &str) -> Result<()> {
        if line.len() > 4 && line[..4].eq_ignore_ascii_case("sip/") {
            self.parse_status_line(line)
        } else {
            self.parse_request_line(line)
        }
    }

    // SIP-Version = "SIP" "/" 1*DIGIT "." 1*DIGIT, clamped to 2.0.
    fn parse_version(text: &str) -> Option<SipVersion> {
        if text.len() < 4 || !text[..3].eq_ignore_ascii_case("sip") {
            return None;
        }
        let rest = &text[3..];
        if !rest.starts_with('/') {
            return None;
        }
        let dot = rest.find('.')?;
        let major = rest.as_bytes().get(1).copied().filter(u8::is_ascii_digit)?;
        let minor = rest
            .as_bytes()
            .get(dot + 1)
            .copied()
            .filter(u8::is_ascii_digit)?;
        Some(SipVersion::new(
            u16::from(major - b'0'),
            u16::from(minor - b'0'),
        ))
    }

    fn parse_request_line(&mut self, line: &str) -> Result<()> {
        let method_end = line.find(' ').ok_or(Error::MissingMethod)?;
        if method_end == 0 {
            return Err(Error::MissingMethod);
        }
        let method: Method = line[..method_end].parse()?;
        self.raw_headers.push_str(method.as_str());

        let rest = line[method_end..].trim_start_matches(' ');
        let uri_end = rest.find(' ').ok_or(Error::MissingRequestUri)?;
        if uri_end == 0 {
            return Err(Error::MissingRequestUri);
        }
        let uri = Uri::parse(&rest[..uri_end])?;
        self.raw_headers.push(' ');
        self.raw_headers.push_str(&uri.to_string());

        let version_text = rest[uri_end..].trim_start_matches(' ');
        match Self::parse_version(version_text) {
            Some(v) if v == SipVersion::V2_0 => {
                self.version = SipVersion::V2_0;
                self.raw_headers.push_str(" SIP/2.0");
            }
            Some(v) => {
                debug!("rejecting SIP/{}.{}", v.major(), v.minor());
                return Err(Error::UnsupportedVersion);
            }
            None => return Err(Error::UnsupportedVersion),
        }

        self.request_method = Some(method);
        self.request_uri = Some(uri);
        Ok(())
    }

    fn parse_status_line(&mut self, line: &str) -> Result<()> {
        match Self::parse_version(line) {
            Some(v) if v == SipVersion::V2_0 => {
                self.version = SipVersion::V2_0;
                self.raw_headers.push_str("SIP/2.0");
            }
            Some(v) => {
                debug!("rejecting SIP/{}.{}", v.major(), v.minor());
                return Err(Error::UnsupportedVersion);
            }
            None => return Err(Error::UnsupportedVersion),
        }

        let after_version = line
            .find(' ')
            .ok_or_else(|| Error::InvalidStatusCode(line.to_string()))?;
        let rest = line[after_version..].trim_start_matches(' ');

        let digits_end = rest
            .bytes()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(Error::InvalidStatusCode(line.to_string()));
        }
        let digits = &rest[..digits_end];
        let code: u32 = digits
            .parse()
            .map_err(|_| Error::InvalidStatusCode(line.to_string()))?;
        if !(100..=699).contains(&code) {
            return Err(Error::InvalidStatusCode(line.to_string()));
        }
        self.raw_headers.push(' ');
        self.raw_headers.push_str(digits);
        self.response_code = Some(code as u16);

        let reason = rest[digits_end..]
            .trim_start_matches(' ')
            .trim_end_matches(' ');
        if !reason.is_empty() {
            self.raw_headers.push(' ');
            self.raw_headers.push_str(reason);
        }
        Ok(())
    }

    // Expands compact names and normalizes contact-like values while
    // copying header lines into the canonical buffer.
    fn normalize_headers(&mut self, rest: &str) -> Result<()> {
        for segment in rest.split('\0') {
            if segment.is_empty() {
                continue;
            }
            let colon = segment
                .find(':')
                .ok_or_else(|| Error::InvalidHeader(segment.to_string()))?;
            let name = segment[..colon].trim();
            if name.is_empty() {
                return Err(Error::InvalidHeader(segment.to_string()));
            }
            let value = segment[colon + 1..].trim();

            let mut name_chars = name.chars();
            let expanded = match (name_chars.next(), name_chars.next()) {
                (Some(letter), None) => expand_compact_form(letter),
                _ => None,
            };
            let name = expanded.unwrap_or(name);

            self.raw_headers.push_str(name);
            self.raw_headers.push_str(": ");
            if name.eq_ignore_ascii_case("contact") && value == "*" {
                self.raw_headers.push('*');
            } else if is_contact_like_header(name) {
                normalize_contact_like(value, &mut self.raw_headers)?;
            } else {
                self.raw_headers.push_str(value);
            }
            self.raw_headers.push('\0');
        }
        self.raw_headers.push('\0');
        Ok(())
    }

    // Re-walks the normalized buffer building the span index.
    fn index_headers(&mut self, start_line_len: usize) {
        let buf_len = self.raw_headers.len();
        let mut pos = start_line_len;
        while pos < buf_len {
            let end = self.raw_headers[pos..]
                .find('\0')
                .map(|i| pos + i)
                .unwrap_or(buf_len);
            if end == pos {
                break;
            }

            // Lines were written as "Name: value"; both parts exist.
            let segment = &self.raw_headers[pos..end];
            let Some(colon) = segment.find(':') else {
                pos = end + 1;
                continue;
            };
            let name = Span {
                start: pos,
                end: pos + colon,
            };
            let mut value_start = pos + colon + 1;
            while value_start < end && self.raw_headers.as_bytes()[value_start] == b' ' {
                value_start += 1;
            }
            let value = Span {
                start: value_start,
                end,
            };

            let name_text = &self.raw_headers[name.start..name.end];
            if value.len() == 0 || is_non_coalescing_header(name_text) {
                self.parsed.push(ParsedHeader { name, value });
            } else {
                let mut first = true;
                for piece in split_unquoted_commas(&self.raw_headers[value.start..value.end]) {
                    let piece_span = Span {
                        start: value.start + piece.0,
                        end: value.start + piece.1,
                    };
                    self.parsed.push(ParsedHeader {
                        name: if first { name } else { Span::EMPTY },
                        value: piece_span,
                    });
                    first = false;
                }
                if first {
                    // Value was only commas and whitespace; keep one entry.
                    self.parsed.push(ParsedHeader { name, value });
                }
            }

            pos = end + 1;
        }
    }
}

/// Splits a value on commas outside double quotes, returning trimmed
/// `(start, end)` offsets relative to the input. Empty pieces are skipped.
fn split_unquoted_commas(value: &str) -> Vec<(usize, usize)> {
    let bytes = value.as_bytes();
    let mut pieces = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                push_trimmed(value, start, i, &mut pieces);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_trimmed(value, start, value.len(), &mut pieces);
    pieces
}

fn push_trimmed(value: &str, start: usize, end: usize, pieces: &mut Vec<(usize, usize)>) {
    let mut s = start;
    let mut e = end;
    let bytes = value.as_bytes();
    while s < e && (bytes[s] == b' ' || bytes[s] == b'\t') {
        s += 1;
    }
    while e > s && (bytes[e - 1] == b' ' || bytes[e - 1] == b'\t') {
        e -= 1;
    }
    if s < e {
        pieces.push((s, e));
    }
}

/// Rewrites a contact-like value to the canonical
/// `"display" <uri>;params` shape, preserving comma-separated entries.
///
/// Structural errors (a second quoted display name, a second addr-spec, or
/// display tokens after the address) reject the whole message.
fn normalize_contact_like(value: &str, out: &mut String) -> Result<()> {
    let mut next_is_param = false;
    let mut had_quoted_string = false;
    let mut had_address = false;
    let mut had_token = false;

    for token in tokenize(value, b"; ,") {
        match token {
            Token::Delim(b';') => next_is_param = true,
            Token::Delim(b',') => {
                next_is_param = false;
                had_quoted_string = false;
                had_address = false;
                had_token = false;
                out.push_str(", ");
            }
            Token::Delim(_) => {}
            Token::Text(text) => {
                if text.is_empty() {
                    continue;
                }
                if next_is_param {
                    out.push(';');
                    out.push_str(text);
                } else if text.starts_with('"') {
                    if had_quoted_string {
                        return Err(Error::MalformedContactLike("repeated display name"));
                    }
                    // Empty quoted strings are dropped.
                    if text.as_bytes().get(1) != Some(&b'"') {
                        out.push_str(text);
                    }
                    had_quoted_string = true;
                } else if text.starts_with('<') {
                    if had_address {
                        return Err(Error::MalformedContactLike("repeated addr-spec"));
                    }
                    if had_token {
                        out.push_str("\" ");
                    } else if had_quoted_string {
                        out.push(' ');
                    }
                    out.push_str(text);
                    had_address = true;
                } else {
                    if had_quoted_string || had_address {
                        return Err(Error::MalformedContactLike(
                            "token after display name or addr-spec",
                        ));
                    }
                    if text.starts_with("sip:") || text.starts_with("sips:") {
                        out.push('<');
                        out.push_str(text);
                        out.push('>');
                        had_address = true;
                    } else {
                        if had_token {
                            out.push(' ');
                        } else {
                            out.push('"');
                        }
                        out.push_str(text);
                        had_token = true;
                    }
                }
            }
        }
    }
    // A display name with no following address gets its quote closed; the
    // value still fails typed access later for lack of an addr-spec.
    if had_token && !had_address {
        out.push('"');
    }
    Ok(())
}

enum Token<'a> {
    Delim(u8),
    Text(&'a str),
}

// Splits on the given single-byte delimiters, returning them as tokens.
// Double quotes suspend delimiter recognition.
fn tokenize<'a>(input: &'a str, delims: &[u8]) -> Vec<Token<'a>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if delims.contains(&bytes[i]) {
            tokens.push(Token::Delim(bytes[i]));
            i += 1;
            continue;
        }
        let start = i;
        let mut in_quotes = false;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'"' {
                in_quotes = !in_quotes;
            } else if !in_quotes && delims.contains(&b) {
                break;
            }
            i += 1;
        }
        tokens.push(Token::Text(&input[start..i]));
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Message {
        Message::parse(raw).expect("message should parse")
    }

    #[test]
    fn parses_status_line() {
        let m = parse("SIP/2.0 200 OK\0\0");
        assert!(m.is_response());
        assert_eq!(m.response_code(), Some(200));
        assert_eq!(m.reason_phrase(), "OK");
        assert_eq!(m.version(), SipVersion::V2_0);
        assert_eq!(m.start_line(), "SIP/2.0 200 OK");
    }

    #[test]
    fn normalizes_request_line() {
        let m = parse("invite sip:a@b SIP/2.0\0CSeq: 1 INVITE\0\0");
        assert_eq!(m.start_line(), "INVITE sip:a@b SIP/2.0");
        assert_eq!(m.method(), Some(&Method::Invite));
        assert_eq!(m.request_uri().unwrap().host(), "b");
    }

    #[test]
    fn status_without_reason() {
        let m = parse("SIP/2.0 100\0\0");
        assert_eq!(m.response_code(), Some(100));
        assert_eq!(m.reason_phrase(), "");
        assert_eq!(m.start_line(), "SIP/2.0 100");
    }

    #[test]
    fn trims_trailing_reason_spaces() {
        let m = parse("SIP/2.0 486 Busy Here   \0\0");
        assert_eq!(m.reason_phrase(), "Busy Here");
    }

    #[test]
    fn rejects_bad_start_lines() {
        assert!(matches!(
            Message::parse("SIP/1.0 200 OK\0\0"),
            Err(Error::UnsupportedVersion)
        ));
        assert!(matches!(
            Message::parse("SIP/2.0 99 Too Low\0\0"),
            Err(Error::InvalidStatusCode(_))
        ));
        assert!(matches!(
            Message::parse("SIP/2.0 700 Too High\0\0"),
            Err(Error::InvalidStatusCode(_))
        ));
        assert!(matches!(
            Message::parse("INVITE\0\0"),
            Err(Error::MissingMethod)
        ));
        assert!(matches!(
            Message::parse("OPTIONS sip:a@b\0\0"),
            Err(Error::MissingRequestUri)
        ));
        assert!(matches!(
            Message::parse("OPTIONS sip:a@b SIP/3.0\0\0"),
            Err(Error::UnsupportedVersion)
        ));
    }

    #[test]
    fn expands_compact_contact() {
        let m = parse("REGISTER sip:h SIP/2.0\0m: <sip:u@h>\0\0");
        let contacts: Vec<_> = m.contacts().collect();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].address.to_string(), "sip:u@h");
        assert!(m.has_header("Contact"));
        assert!(!m.has_header("m"));
    }

    #[test]
    fn normalizes_bare_addr_spec() {
        let m = parse("INVITE sip:b SIP/2.0\0From: sip:alice@atlanta.com;tag=9\0\0");
        let from = m.from_header().unwrap();
        assert_eq!(from.address.host(), "atlanta.com");
        assert_eq!(from.tag(), Some("9"));
        assert_eq!(
            m.header_values("from").next().unwrap(),
            "<sip:alice@atlanta.com>;tag=9"
        );
    }

    #[test]
    fn normalizes_display_name_words() {
        let m = parse("INVITE sip:b SIP/2.0\0To: Big Bob <sip:bob@h>\0\0");
        let to = m.to_header().unwrap();
        assert_eq!(to.display_name.as_deref(), Some("Big Bob"));
        assert_eq!(
            m.header_values("to").next().unwrap(),
            "\"Big Bob\" <sip:bob@h>"
        );
    }

    #[test]
    fn preserves_quoted_display_name() {
        let m = parse("INVITE sip:b SIP/2.0\0To: \"Mr. Magoo\" <sip:magoo@h>;tag=a\0\0");
        assert_eq!(
            m.header_values("to").next().unwrap(),
            "\"Mr. Magoo\" <sip:magoo@h>;tag=a"
        );
    }

    #[test]
    fn contact_wildcard_is_preserved() {
        let m = parse("REGISTER sip:h SIP/2.0\0Contact: *\0\0");
        assert!(m.has_header_value("contact", "*"));
        assert_eq!(m.contacts().count(), 0);
    }

    #[test]
    fn rejects_repeated_addr_spec() {
        let err = Message::parse("INVITE sip:b SIP/2.0\0To: <sip:a@h> <sip:b@h>\0\0");
        assert!(matches!(err, Err(Error::MalformedContactLike(_))));
    }

    #[test]
    fn rejects_repeated_display_name() {
        let err = Message::parse("INVITE sip:b SIP/2.0\0To: \"a\" \"b\" <sip:a@h>\0\0");
        assert!(matches!(err, Err(Error::MalformedContactLike(_))));
    }

    #[test]
    fn splits_coalescing_headers_on_commas() {
        let m = parse("OPTIONS sip:h SIP/2.0\0Allow: INVITE, ACK, BYE\0\0");
        let values: Vec<_> = m.header_values("allow").collect();
        assert_eq!(values, vec!["INVITE", "ACK", "BYE"]);

        // One logical line with the full value.
        let lines: Vec<_> = m.header_lines().collect();
        assert_eq!(lines, vec![("Allow", "INVITE, ACK, BYE")]);
    }

    #[test]
    fn quoted_commas_are_not_split() {
        let m = parse("OPTIONS sip:h SIP/2.0\0Warning: 370 h \"a, b\"\0\0");
        let values: Vec<_> = m.header_values("warning").collect();
        assert_eq!(values, vec!["370 h \"a, b\""]);
    }

    #[test]
    fn non_coalescing_header_stays_whole() {
        let m = parse(
            "SIP/2.0 401 Unauthorized\0WWW-Authenticate: Digest realm=\"r\", nonce=\"n\", qop=\"auth\"\0\0",
        );
        let values: Vec<_> = m.header_values("www-authenticate").collect();
        assert_eq!(values.len(), 1);
        assert!(values[0].starts_with("Digest realm"));
    }

    #[test]
    fn multiple_header_instances_enumerate_in_order() {
        let m = parse("OPTIONS sip:h SIP/2.0\0Route: <sip:p1>\0Route: <sip:p2>, <sip:p3>\0\0");
        let routes: Vec<_> = m.routes().map(|r| r.address.host().to_string()).collect();
        assert_eq!(routes, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn continuation_spans_have_empty_names() {
        let m = parse("OPTIONS sip:h SIP/2.0\0Supported: path, outbound\0\0");
        assert_eq!(m.parsed.len(), 2);
        assert!(m.parsed[0].name.len() > 0);
        assert!(m.parsed[1].is_continuation());
    }

    #[test]
    fn normalized_header_joins_all_values() {
        let m = parse("OPTIONS sip:h SIP/2.0\0Allow: INVITE, ACK\0Allow: BYE\0\0");
        assert_eq!(
            m.get_normalized_header("allow").unwrap(),
            "INVITE, ACK, BYE"
        );
        assert_eq!(m.get_normalized_header("nope"), None);
    }

    #[test]
    fn has_header_value_is_case_insensitive_exact() {
        let m = parse("OPTIONS sip:h SIP/2.0\0Supported: path, outbound\0\0");
        assert!(m.has_header_value("supported", "OUTBOUND"));
        assert!(!m.has_header_value("supported", "out"));
    }

    #[test]
    fn integer_accessors() {
        let m = parse("OPTIONS sip:h SIP/2.0\0Content-Length: 42\0Max-Forwards: 70\0\0");
        assert_eq!(m.content_length(), 42);
        assert_eq!(m.max_forwards(), 70);

        let m = parse("OPTIONS sip:h SIP/2.0\0Content-Length: +5\0\0");
        assert_eq!(m.content_length(), -1);

        let m = parse("OPTIONS sip:h SIP/2.0\0Content-Length: -5\0\0");
        assert_eq!(m.content_length(), -1);

        let m = parse("OPTIONS sip:h SIP/2.0\0\0");
        assert_eq!(m.content_length(), -1);

        let m = parse("OPTIONS sip:h SIP/2.0\0Content-Length: 99999999999999999999\0\0");
        assert_eq!(m.content_length(), -1);
    }

    #[test]
    fn expires_saturates_on_overflow() {
        let m = parse("REGISTER sip:h SIP/2.0\0Expires: 3600\0\0");
        assert_eq!(m.expires(), Some(Duration::from_secs(3600)));

        let m = parse("REGISTER sip:h SIP/2.0\0Expires: 99999999999\0\0");
        assert_eq!(m.expires(), Some(Duration::from_secs(u64::from(u32::MAX))));

        let m = parse("REGISTER sip:h SIP/2.0\0Expires: soon\0\0");
        assert_eq!(m.expires(), None);
    }

    #[test]
    fn cseq_accessor() {
        let m = parse("OPTIONS sip:h SIP/2.0\0CSeq: 7 options\0\0");
        let cseq = m.cseq().unwrap();
        assert_eq!(cseq.sequence, 7);
        assert_eq!(cseq.method, "OPTIONS");
    }

    #[test]
    fn add_and_remove_header_roundtrip() {
        let mut m = parse("OPTIONS sip:h SIP/2.0\0CSeq: 1 OPTIONS\0\0");
        let before = m.raw_headers().to_string();

        m.add_header("Subject: lunch").unwrap();
        assert!(m.has_header("subject"));

        m.remove_header("subject").unwrap();
        assert_eq!(m.raw_headers(), before);
    }

    #[test]
    fn failed_mutation_leaves_message_unchanged() {
        let mut m = parse("OPTIONS sip:h SIP/2.0\0CSeq: 1 OPTIONS\0\0");
        let before = m.raw_headers().to_string();

        // Malformed contact-like value fails the rebuild parse.
        let err = m.add_header("To: <sip:a@h> <sip:b@h>");
        assert!(err.is_err());
        assert_eq!(m.raw_headers(), before);

        assert_eq!(m.add_header("X-Nul: a\0b"), Err(Error::EmbeddedNull));
        assert_eq!(m.raw_headers(), before);
    }

    #[test]
    fn remove_header_line_matches_value_exactly() {
        let mut m = parse("OPTIONS sip:h SIP/2.0\0X-Tag: one\0X-Tag: two\0\0");
        m.remove_header_line("x-tag", "one").unwrap();
        let values: Vec<_> = m.header_values("x-tag").collect();
        assert_eq!(values, vec!["two"]);
    }

    #[test]
    fn replace_start_line_keeps_headers() {
        let mut m = parse("OPTIONS sip:h SIP/2.0\0CSeq: 1 OPTIONS\0\0");
        m.replace_start_line("SIP/2.0 200 OK").unwrap();
        assert!(m.is_response());
        assert_eq!(m.cseq().unwrap().sequence, 1);
    }

    #[test]
    fn set_via_received_touches_only_top_via() {
        let mut m = parse(
            "SIP/2.0 200 OK\0Via: SIP/2.0/UDP a:5060;branch=z9hG4bK1\0Via: SIP/2.0/UDP b:5060;branch=z9hG4bK2\0\0",
        );
        m.set_via_received("1.2.3.4").unwrap();
        let vias: Vec<_> = m.header_values("via").collect();
        assert_eq!(vias[0], "SIP/2.0/UDP a:5060;branch=z9hG4bK1;received=1.2.3.4");
        assert_eq!(vias[1], "SIP/2.0/UDP b:5060;branch=z9hG4bK2");

        m.set_via_rport(5070).unwrap();
        assert_eq!(m.top_via().unwrap().rport(), Some(5070));
    }

    #[test]
    fn set_via_branch_amends_top_via() {
        let mut m = parse("INVITE sip:b SIP/2.0\0Via: SIP/2.0/UDP a:5060\0\0");
        m.set_via_branch("z9hG4bKnew").unwrap();
        assert_eq!(m.top_via().unwrap().branch(), Some("z9hG4bKnew"));
    }

    #[test]
    fn map_header_values_rewrites_in_place() {
        let mut m = parse(
            "REGISTER sip:h SIP/2.0\0Contact: <sip:a@domain.invalid>, <sip:b@real.example>\0CSeq: 1 REGISTER\0\0",
        );
        m.map_header_values("contact", |value| {
            value
                .contains("domain.invalid")
                .then(|| value.replace("a@domain.invalid", "a@10.0.0.1:5060"))
        })
        .unwrap();

        let contacts: Vec<_> = m.header_values("contact").collect();
        assert_eq!(contacts[0], "<sip:a@10.0.0.1:5060>");
        assert_eq!(contacts[1], "<sip:b@real.example>");
        // Header order preserved: Contact still before CSeq.
        let names: Vec<_> = m.header_lines().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["Contact", "CSeq"]);
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        let m = parse(
            "INVITE sip:bob@biloxi.com SIP/2.0\0v: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776\0f: Alice <sip:alice@atlanta.com>;tag=1928\0t: sip:bob@biloxi.com\0i: a84b4c76e66710\0CSeq: 314159 INVITE\0m: <sip:alice@pc33.atlanta.com>\0\0",
        );
        let reparsed = Message::parse(m.raw_headers()).unwrap();
        assert_eq!(reparsed.raw_headers(), m.raw_headers());
    }

    #[test]
    fn response_for_copies_mirror_headers() {
        let req = parse(
            "INVITE sip:b SIP/2.0\0Via: SIP/2.0/UDP a:5060;branch=z9hG4bKx\0From: <sip:a@h>;tag=1\0To: <sip:b@h>\0Call-ID: c1\0CSeq: 1 INVITE\0Contact: <sip:a@pc>\0\0",
        );
        let resp = Message::response_for(&req, 180, "Ringing").unwrap();
        assert_eq!(resp.response_code(), Some(180));
        assert_eq!(resp.top_via().unwrap().branch(), Some("z9hG4bKx"));
        assert_eq!(resp.cseq().unwrap().method, "INVITE");
        assert!(resp.call_id().is_some());
        assert!(!resp.has_header("contact"));
    }

    #[test]
    fn set_body_restates_content_length() {
        let mut m = parse("INVITE sip:b SIP/2.0\0CSeq: 1 INVITE\0\0");
        m.set_body(Some(Bytes::from_static(b"v=0"))).unwrap();
        assert_eq!(m.content_length(), 3);
        assert_eq!(m.body().unwrap().as_ref(), b"v=0");

        m.set_body(None).unwrap();
        assert_eq!(m.content_length(), -1);
        assert!(m.body().is_none());
    }
}
