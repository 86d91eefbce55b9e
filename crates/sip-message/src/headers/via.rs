// Via = SIP-Version "/" transport LWS sent-by *( SEMI via-params )
// (RFC 3261 Section 20.42, single value after comma-splitting)

use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char, multispace0, multispace1, one_of},
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::{Error, Result};

/// Parsed value of a single Via entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// Transport token, upper-cased (UDP, TCP, TLS, WS, WSS)
    pub protocol: String,
    /// sent-by host, without IPv6 brackets
    pub host: String,
    /// sent-by port, if present
    pub port: Option<u16>,
    /// Via parameters in order of appearance
    pub params: Vec<(String, Option<String>)>,
}

fn version(input: &str) -> IResult<&str, ()> {
    let (rest, _) = nom::bytes::complete::tag_no_case("sip")(input)?;
    let (rest, _) = char('/')(rest)?;
    let (rest, _) = one_of("0123456789")(rest)?;
    let (rest, _) = char('.')(rest)?;
    let (rest, _) = one_of("0123456789")(rest)?;
    Ok((rest, ()))
}

fn transport(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-')(input)
}

fn host(input: &str) -> IResult<&str, &str> {
    if input.starts_with('[') {
        let (rest, _) = char('[')(input)?;
        let (rest, inner) = take_while1(|c: char| c != ']')(rest)?;
        let (rest, _) = char(']')(rest)?;
        Ok((rest, inner))
    } else {
        take_while1(|c: char| !matches!(c, ':' | ';' | ',' | ' ' | '\t'))(input)
    }
}

fn param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let (rest, _) = multispace0(input)?;
    let (rest, _) = char(';')(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, name) = take_while1(|c: char| !matches!(c, ';' | '=' | ' ' | '\t'))(rest)?;
    let (rest, value) = opt(preceded(
        char('='),
        take_while(|c: char| !matches!(c, ';' | ' ' | '\t')),
    ))(rest)?;
    Ok((rest, (name, value)))
}

impl Via {
    /// Parses a single Via header value.
    pub fn parse(value: &str) -> Result<Via> {
        let invalid = || Error::InvalidHeaderValue(format!("Via: {value}"));

        let (rest, _) = version(value).map_err(|_| invalid())?;
        let (rest, _) = char::<_, nom::error::Error<&str>>('/')(rest).map_err(|_| invalid())?;
        let (rest, proto) = transport(rest).map_err(|_| invalid())?;
        let (rest, _) = multispace1::<_, nom::error::Error<&str>>(rest).map_err(|_| invalid())?;
        let (rest, host) = host(rest).map_err(|_| invalid())?;
        let (mut rest, port_digits) = opt(preceded(
            char::<_, nom::error::Error<&str>>(':'),
            take_while1(|c: char| c.is_ascii_digit()),
        ))(rest)
        .map_err(|_| invalid())?;
        let port = match port_digits {
            Some(digits) => Some(digits.parse::<u16>().map_err(|_| invalid())?),
            None => None,
        };

        let mut params = Vec::new();
        while let Ok((next, (name, value))) = param(rest) {
            params.push((name.to_string(), value.map(|v| v.to_string())));
            rest = next;
        }
        if !rest.trim().is_empty() {
            return Err(invalid());
        }

        Ok(Via {
            protocol: proto.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        })
    }

    /// Looks up a Via parameter by case-insensitive name; valueless
    /// parameters yield the empty string.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// The branch parameter, if present and non-empty.
    pub fn branch(&self) -> Option<&str> {
        self.parameter("branch").filter(|b| !b.is_empty())
    }

    /// The received parameter, if present.
    pub fn received(&self) -> Option<&str> {
        self.parameter("received")
    }

    /// The rport parameter as a port number, if present with a value.
    pub fn rport(&self) -> Option<u16> {
        self.parameter("rport").and_then(|v| v.parse().ok())
    }

    /// The sent-by value as `host:port`, or just the host when no port was
    /// given. Used verbatim inside server transaction identifiers.
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_via() {
        let via = Via::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776asdhds").unwrap();
        assert_eq!(via.protocol, "UDP");
        assert_eq!(via.host, "10.0.0.1");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(via.sent_by(), "10.0.0.1:5060");
    }

    #[test]
    fn parse_via_without_port() {
        let via = Via::parse("SIP/2.0/TCP proxy.example.com;branch=z9hG4bKabc").unwrap();
        assert_eq!(via.port, None);
        assert_eq!(via.sent_by(), "proxy.example.com");
    }

    #[test]
    fn parse_via_received_and_rport() {
        let via =
            Via::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKx;received=10.0.0.2;rport=5070")
                .unwrap();
        assert_eq!(via.received(), Some("10.0.0.2"));
        assert_eq!(via.rport(), Some(5070));
    }

    #[test]
    fn parse_via_ipv6_sent_by() {
        let via = Via::parse("SIP/2.0/WSS [2001:db8::7]:443;branch=z9hG4bKy").unwrap();
        assert_eq!(via.host, "2001:db8::7");
        assert_eq!(via.port, Some(443));
        assert_eq!(via.protocol, "WSS");
    }

    #[test]
    fn empty_branch_is_none() {
        let via = Via::parse("SIP/2.0/UDP h:5060;branch=").unwrap();
        assert_eq!(via.branch(), None);
    }

    #[test]
    fn rejects_malformed_via() {
        assert!(Via::parse("").is_err());
        assert!(Via::parse("HTTP/1.1/TCP h:80").is_err());
        assert!(Via::parse("SIP/2.0/UDP").is_err());
    }
}
