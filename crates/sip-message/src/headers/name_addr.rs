// Reader for normalized contact-like header values. The message parser
// guarantees the shape `["display" SP] "<" addr-spec ">" *( ";" param )`,
// so this scanner never has to deal with the bare addr-spec form.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::uri::Uri;

/// Parsed value of a contact-like header entry (Contact, From, To, Route,
/// Record-Route, Reply-To).
#[derive(Debug, Clone, PartialEq)]
pub struct NameAddr {
    /// Display name without the surrounding quotes, if present.
    pub display_name: Option<String>,
    /// The address inside the angle brackets.
    pub address: Uri,
    /// Header parameters after the closing bracket. Valueless parameters
    /// map to the empty string; quoted values are unquoted.
    pub parameters: HashMap<String, String>,
}

impl NameAddr {
    /// Parses a normalized contact-like value.
    pub fn parse(value: &str) -> Result<NameAddr> {
        let invalid = || Error::InvalidHeaderValue(format!("name-addr: {value}"));
        let mut rest = value.trim();

        let display_name = if let Some(after_quote) = rest.strip_prefix('"') {
            let end = after_quote.find('"').ok_or_else(invalid)?;
            let name = after_quote[..end].to_string();
            rest = after_quote[end + 1..].trim_start();
            Some(name)
        } else {
            None
        };

        let after_open = rest.strip_prefix('<').ok_or_else(invalid)?;
        let close = after_open.find('>').ok_or_else(invalid)?;
        let address = Uri::parse(&after_open[..close])?;
        rest = after_open[close + 1..].trim_start();

        let mut parameters = HashMap::new();
        for raw in split_params(rest) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.split_once('=') {
                Some((name, v)) => {
                    let v = v.trim();
                    let v = v
                        .strip_prefix('"')
                        .and_then(|inner| inner.strip_suffix('"'))
                        .unwrap_or(v);
                    parameters.insert(name.trim().to_string(), v.to_string());
                }
                None => {
                    parameters.insert(raw.to_string(), String::new());
                }
            }
        }

        Ok(NameAddr {
            display_name,
            address,
            parameters,
        })
    }

    /// The `tag` parameter, if present.
    pub fn tag(&self) -> Option<&str> {
        self.parameters.get("tag").map(|s| s.as_str())
    }
}

// Splits `;a=1;b="x;y";c` on semicolons outside double quotes.
fn split_params(rest: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = None;
    let mut in_quotes = false;
    for (i, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                if let Some(s) = start.take() {
                    parts.push(&rest[s..i]);
                }
                start = Some(i + 1);
            }
            _ => {
                if start.is_none() && i == 0 {
                    // Value without a leading ';' (tolerated)
                    start = Some(0);
                }
            }
        }
    }
    if let Some(s) = start {
        if s <= rest.len() {
            parts.push(&rest[s..]);
        }
    }
    parts
}
