use std::fmt;

/// A SIP protocol version pair, as in `SIP/2.0`.
///
/// The parser clamps accepted versions to 2.0 and rejects everything else,
/// so in practice only [`SipVersion::V2_0`] flows through the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SipVersion {
    major: u16,
    minor: u16,
}

impl SipVersion {
    /// SIP/2.0, the only version this stack speaks.
    pub const V2_0: SipVersion = SipVersion { major: 2, minor: 0 };

    /// Creates a version pair.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Major version number.
    pub fn major(&self) -> u16 {
        self.major
    }

    /// Minor version number.
    pub fn minor(&self) -> u16 {
        self.minor
    }
}

impl fmt::Display for SipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        assert_eq!(SipVersion::V2_0.to_string(), "SIP/2.0");
        assert_eq!(SipVersion::new(1, 0).to_string(), "SIP/1.0");
    }

    #[test]
    fn equality() {
        assert_eq!(SipVersion::new(2, 0), SipVersion::V2_0);
        assert_ne!(SipVersion::new(2, 1), SipVersion::V2_0);
    }
}
