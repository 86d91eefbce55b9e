//! Stream reassembly for connection-oriented transports.
//!
//! TCP and TLS deliver a byte stream; message boundaries are recovered by
//! locating the blank line ending the header section and then consuming
//! exactly `Content-Length` body octets.

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

use sipline_sip_message::Message;

use crate::error::{Error, Result};

const INITIAL_BUFFER_SIZE: usize = 8192;
const MAX_MESSAGE_SIZE: usize = 65535;

/// Accumulates stream bytes and yields complete SIP messages.
pub struct MessageAssembler {
    buffer: BytesMut,
}

impl MessageAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Appends stream data, bounding the amount of unframed input.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if self.buffer.len() + data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(self.buffer.len() + data.len()));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Tries to extract the next complete message.
    ///
    /// Returns `Ok(None)` when more data is needed. A message that frames
    /// correctly but fails to parse is skipped and reported as an error so
    /// the stream does not get stuck on it.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let Some(header_len) = find_header_end(&self.buffer) else {
            return Ok(None);
        };

        let content_length = extract_content_length(&self.buffer[..header_len]);
        let total_length = header_len + content_length;
        if self.buffer.len() < total_length {
            return Ok(None);
        }

        let frame = &self.buffer[..total_length];
        match Message::from_wire(frame) {
            Ok(message) => {
                trace!("reassembled complete SIP message ({} bytes)", total_length);
                self.buffer.advance(total_length);
                Ok(Some(message))
            }
            Err(e) => {
                warn!("dropping unparsable framed message: {}", e);
                self.buffer.advance(total_length);
                Err(Error::ParseError(e.to_string()))
            }
        }
    }

    /// Whether unconsumed bytes remain (a partial message at EOF).
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

// Returns the length of the header section including the blank line, for
// CRLF and bare-LF line endings.
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] == b'\n' {
            let rest = &buffer[i + 1..];
            if rest.starts_with(b"\r\n") {
                return Some(i + 3);
            }
            if rest.starts_with(b"\n") {
                return Some(i + 2);
            }
        }
        i += 1;
    }
    None
}

// Scans the header section for Content-Length (long or compact form)
// without a full parse; defaults to 0 when absent or unparsable.
fn extract_content_length(header: &[u8]) -> usize {
    let text = String::from_utf8_lossy(header);
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            if let Ok(length) = value.trim().parse::<usize>() {
                return length;
            }
        }
    }
    0
}

/// Feeds stream data through an assembler, posting every complete message
/// on `events`. Parse failures skip the frame; framing overflow and a
/// dropped event queue are fatal.
pub(crate) async fn pump(
    destination: &crate::endpoint::EndPoint,
    events: &tokio::sync::mpsc::Sender<crate::channel::ChannelEvent>,
    assembler: &mut MessageAssembler,
    data: &[u8],
) -> Result<()> {
    assembler.push(data)?;
    loop {
        match assembler.next_message() {
            Ok(Some(message)) => {
                let event = crate::channel::ChannelEvent::MessageReceived {
                    destination: destination.clone(),
                    message,
                };
                if events.send(event).await.is_err() {
                    return Err(Error::ChannelClosed);
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(destination = %destination, error = %e,
                      "dropping unparsable framed message");
            }
        }
    }
}

/// Maps stream I/O errors to transport errors, folding peer resets.
pub(crate) fn map_stream_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
            Error::ConnectionReset
        }
        _ => Error::ReceiveFailed(e),
    }
}
