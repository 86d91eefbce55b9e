use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::{Error, Result};

/// A pragmatic SIP/SIPS URI.
///
/// This model captures what the transport and transaction layers need from
/// a URI: the scheme, optional userinfo, host, optional port and the URI
/// parameters (notably `transport=`). The headers part after `?` is kept
/// opaque. It is not a full RFC 3261 Section 19.1 implementation; in
/// particular, equality is scheme + case-insensitive host + port +
/// userinfo, which is what endpoint resolution requires.
#[derive(Debug, Clone)]
pub struct Uri {
    scheme: String,
    userinfo: Option<String>,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
    headers: Option<String>,
}

fn scheme_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))(input)
}

fn bracketed_host(input: &str) -> IResult<&str, &str> {
    let (rest, _) = char('[')(input)?;
    let (rest, inner) = take_while1(|c: char| c != ']')(rest)?;
    let (rest, _) = char(']')(rest)?;
    Ok((rest, inner))
}

fn plain_host(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !matches!(c, ':' | ';' | '?' | '@'))(input)
}

fn port_number(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c: char| c.is_ascii_digit()))(input)
}

fn param_pair(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (rest, _) = char(';')(input)?;
    let (rest, name) = take_while1(|c: char| !matches!(c, ';' | '=' | '?'))(rest)?;
    let (rest, value) = opt(preceded(
        char('='),
        take_while(|c: char| !matches!(c, ';' | '?')),
    ))(rest)?;
    Ok((rest, (name, value)))
}

impl Uri {
    /// Parses a URI from its textual form.
    pub fn parse(input: &str) -> Result<Uri> {
        let invalid = || Error::InvalidUri(input.to_string());

        let (rest, scheme) = scheme_token(input).map_err(|_| invalid())?;
        let (rest, _) = tag::<_, _, nom::error::Error<&str>>(":")(rest).map_err(|_| invalid())?;

        // Userinfo is only present when an '@' occurs before the first
        // parameter or header separator.
        let authority_end = rest
            .find(|c: char| matches!(c, ';' | '?'))
            .unwrap_or(rest.len());
        let (rest, userinfo) = match rest[..authority_end].find('@') {
            Some(at) => {
                let info = &rest[..at];
                if info.is_empty() {
                    return Err(invalid());
                }
                (&rest[at + 1..], Some(info.to_string()))
            }
            None => (rest, None),
        };

        let (rest, host) = bracketed_host(rest)
            .or_else(|_: nom::Err<nom::error::Error<&str>>| plain_host(rest))
            .map_err(|_| invalid())?;

        let (mut rest, port_digits) = opt(port_number)(rest).map_err(|_| invalid())?;
        let port = match port_digits {
            Some(digits) => Some(digits.parse::<u16>().map_err(|_| invalid())?),
            None => None,
        };

        let mut params = Vec::new();
        while let Ok((next, (name, value))) = param_pair(rest) {
            params.push((name.to_string(), value.map(|v| v.to_string())));
            rest = next;
        }

        let headers = match rest.strip_prefix('?') {
            Some(h) => Some(h.to_string()),
            None if rest.is_empty() => None,
            None => return Err(invalid()),
        };

        Ok(Uri {
            scheme: scheme.to_ascii_lowercase(),
            userinfo,
            host: host.to_string(),
            port,
            params,
            headers,
        })
    }

    /// Builds a plain `sip:` URI for a host and optional port.
    pub fn sip(host: &str, port: Option<u16>) -> Uri {
        Uri {
            scheme: "sip".to_string(),
            userinfo: None,
            host: host.to_string(),
            port,
            params: Vec::new(),
            headers: None,
        }
    }

    /// URI scheme, lower-cased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Whether the scheme is `sip` or `sips`.
    pub fn is_sip(&self) -> bool {
        self.scheme == "sip" || self.scheme == "sips"
    }

    /// Whether the scheme is `sips`.
    pub fn is_sips(&self) -> bool {
        self.scheme == "sips"
    }

    /// The userinfo part before `@`, if any.
    pub fn userinfo(&self) -> Option<&str> {
        self.userinfo.as_deref()
    }

    /// Host, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Looks up a URI parameter by case-insensitive name. Returns the empty
    /// string for valueless parameters.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// Appends a URI parameter.
    pub fn push_parameter(&mut self, name: &str, value: Option<&str>) {
        self.params
            .push((name.to_string(), value.map(|v| v.to_string())));
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(info) = &self.userinfo {
            write!(f, "{}@", info)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uri::parse(s)
    }
}

impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.userinfo == other.userinfo
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme.hash(state);
        self.userinfo.hash(state);
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_uri() {
        let uri = Uri::parse("sip:alice@atlanta.com:5070;transport=tcp;lr?subject=project").unwrap();
        assert_eq!(uri.scheme(), "sip");
        assert_eq!(uri.userinfo(), Some("alice"));
        assert_eq!(uri.host(), "atlanta.com");
        assert_eq!(uri.port(), Some(5070));
        assert_eq!(uri.parameter("transport"), Some("tcp"));
        assert_eq!(uri.parameter("lr"), Some(""));
        assert_eq!(uri.parameter("nope"), None);
    }

    #[test]
    fn parse_minimal_uri() {
        let uri = Uri::parse("sips:b.example").unwrap();
        assert!(uri.is_sips());
        assert_eq!(uri.host(), "b.example");
        assert_eq!(uri.port(), None);
        assert_eq!(uri.userinfo(), None);
    }

    #[test]
    fn parse_ipv6_host() {
        let uri = Uri::parse("sip:[2001:db8::1]:5060").unwrap();
        assert_eq!(uri.host(), "2001:db8::1");
        assert_eq!(uri.port(), Some(5060));
        assert_eq!(uri.to_string(), "sip:[2001:db8::1]:5060");
    }

    #[test]
    fn display_roundtrip() {
        let text = "sip:bob@biloxi.com;transport=ws";
        let uri = Uri::parse(text).unwrap();
        assert_eq!(uri.to_string(), text);
    }

    #[test]
    fn equality_ignores_host_case_and_params() {
        let a = Uri::parse("sip:alice@Atlanta.COM:5060;transport=tcp").unwrap();
        let b = Uri::parse("sip:alice@atlanta.com:5060").unwrap();
        assert_eq!(a, b);

        let c = Uri::parse("sip:alice@atlanta.com:5061").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Uri::parse("").is_err());
        assert!(Uri::parse("sip:").is_err());
        assert!(Uri::parse("sip:@host").is_err());
        assert!(Uri::parse("sip:host:notaport").is_err());
    }
}
