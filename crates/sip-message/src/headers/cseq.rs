// CSeq = 1*DIGIT LWS Method (RFC 3261 Section 20.16)

use crate::error::{Error, Result};

/// Parsed value of a CSeq header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    /// Sequence number. Non-negative; values that do not fit in an `i64`
    /// are rejected at parse time.
    pub sequence: i64,
    /// Request method token, upper-cased.
    pub method: String,
}

impl CSeq {
    /// Parses a CSeq header value.
    ///
    /// The sequence must be plain digits (no sign); the method token is
    /// upper-cased, matching the comparison form used everywhere else in
    /// the stack.
    pub fn parse(value: &str) -> Result<CSeq> {
        let invalid = || Error::InvalidHeaderValue(format!("CSeq: {value}"));

        let mut parts = value.split_ascii_whitespace();
        let digits = parts.next().ok_or_else(invalid)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let sequence: i64 = digits.parse().map_err(|_| invalid())?;

        let method = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(CSeq {
            sequence,
            method: method.to_ascii_uppercase(),
        })
    }
}
