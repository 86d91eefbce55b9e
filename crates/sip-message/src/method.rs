use std::fmt;
use std::str::FromStr;

/// SIP request methods.
///
/// The set covers the methods of RFC 3261 plus the extension methods this
/// stack routes through transactions (SUBSCRIBE/NOTIFY, REFER, MESSAGE,
/// INFO, PRACK, UPDATE, PUBLISH). Unknown tokens are preserved through
/// [`Method::Extension`] so they can still be matched by transaction
/// identifiers. Methods are canonically upper-case; parsing upper-cases
/// the input token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// Session setup (RFC 3261)
    Invite,
    /// Final-response acknowledgement for INVITE (RFC 3261)
    Ack,
    /// Session teardown (RFC 3261)
    Bye,
    /// Cancellation of a pending request (RFC 3261)
    Cancel,
    /// Capability query (RFC 3261)
    Options,
    /// Binding registration (RFC 3261)
    Register,
    /// Event subscription (RFC 6665)
    Subscribe,
    /// Event notification (RFC 6665)
    Notify,
    /// Call transfer (RFC 3515)
    Refer,
    /// Instant message (RFC 3428)
    Message,
    /// Mid-session information (RFC 6086)
    Info,
    /// Provisional-response acknowledgement (RFC 3262)
    Prack,
    /// Session modification (RFC 3311)
    Update,
    /// Event state publication (RFC 3903)
    Publish,
    /// Any other method token, stored upper-cased
    Extension(String),
}

impl Method {
    /// Returns the canonical upper-case token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Register => "REGISTER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Publish => "PUBLISH",
            Method::Extension(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::Error::MissingMethod);
        }
        let token = s.to_ascii_uppercase();
        Ok(match token.as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "REGISTER" => Method::Register,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "MESSAGE" => Method::Message,
            "INFO" => Method::Info,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            "PUBLISH" => Method::Publish,
            _ => Method::Extension(token),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_methods() {
        assert_eq!("INVITE".parse::<Method>().unwrap(), Method::Invite);
        assert_eq!("invite".parse::<Method>().unwrap(), Method::Invite);
        assert_eq!("Register".parse::<Method>().unwrap(), Method::Register);
    }

    #[test]
    fn parse_extension_method_uppercases() {
        let m = "snoop".parse::<Method>().unwrap();
        assert_eq!(m, Method::Extension("SNOOP".to_string()));
        assert_eq!(m.as_str(), "SNOOP");
    }

    #[test]
    fn empty_method_rejected() {
        assert!("".parse::<Method>().is_err());
    }

    #[test]
    fn display_roundtrip() {
        assert_eq!(Method::Options.to_string(), "OPTIONS");
        assert_eq!(
            Method::Options.to_string().parse::<Method>().unwrap(),
            Method::Options
        );
    }
}
