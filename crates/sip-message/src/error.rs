use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or mutating SIP messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request line carries no method
    #[error("missing method in request line")]
    MissingMethod,

    /// The request line carries no Request-URI
    #[error("missing Request-URI in request line")]
    MissingRequestUri,

    /// SIP-Version is absent or not SIP/2.0
    #[error("unsupported SIP version")]
    UnsupportedVersion,

    /// Status code outside 100..=699 or not numeric
    #[error("invalid response code: {0}")]
    InvalidStatusCode(String),

    /// A contact-like header value failed normalization
    #[error("malformed contact-like header: {0}")]
    MalformedContactLike(&'static str),

    /// A user-supplied header contains a `\0` byte
    #[error("embedded null in header")]
    EmbeddedNull,

    /// A header line has no name
    #[error("invalid header line: {0}")]
    InvalidHeader(String),

    /// Invalid SIP or SIPS URI
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// Header section is not valid UTF-8
    #[error("message is not valid UTF-8")]
    NotUtf8,

    /// Fewer body octets than Content-Length announced
    #[error("body truncated: expected {expected} octets, got {actual}")]
    TruncatedBody {
        /// Octets announced by Content-Length
        expected: usize,
        /// Octets actually present
        actual: usize,
    },

    /// Malformed header sub-value (Via, CSeq, name-addr)
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::TruncatedBody {
            expected: 10,
            actual: 4,
        };
        assert_eq!(err.to_string(), "body truncated: expected 10 octets, got 4");
        assert_eq!(
            Error::MalformedContactLike("repeated addr-spec").to_string(),
            "malformed contact-like header: repeated addr-spec"
        );
    }
}
