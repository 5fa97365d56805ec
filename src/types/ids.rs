//! Newtype wrappers for queue identifiers.
//!
//! These types keep the allocator-assigned report ID apart from the
//! store-assigned delivery handle, which are both "IDs" but mean very
//! different things: the former is the report's identity, the latter only
//! names one entry in one stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// A report ID produced by the allocator.
///
/// Unique per node, trends with wall-clock time, and never changes once it
/// has been written into a stream entry. Rendered in decimal on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub u64);

impl ReportId {
    /// Returns the raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReportId {
    fn from(n: u64) -> Self {
        ReportId(n)
    }
}

impl FromStr for ReportId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ReportId)
    }
}

/// Store-assigned ID of one stream entry.
///
/// Required to acknowledge a delivery or to query its attempt count. A
/// redelivered entry keeps the same token, so this is not a per-attempt
/// handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckToken(pub String);

impl AckToken {
    pub fn new(s: impl Into<String>) -> Self {
        AckToken(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AckToken {
    fn from(s: String) -> Self {
        AckToken(s)
    }
}

impl From<&str> for AckToken {
    fn from(s: &str) -> Self {
        AckToken(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    mod report_id {
        use super::*;

        proptest! {
            #[test]
            fn display_parses_back(n in any::<u64>()) {
                let id = ReportId(n);
                let parsed: ReportId = id.to_string().parse().unwrap();
                prop_assert_eq!(id, parsed);
            }
        }

        #[test]
        fn serializes_as_bare_number() {
            let json = serde_json::to_string(&ReportId(42)).unwrap();
            assert_eq!(json, "42");
        }

        #[test]
        fn rejects_non_decimal() {
            assert!("0x2a".parse::<ReportId>().is_err());
            assert!("".parse::<ReportId>().is_err());
            assert!("-1".parse::<ReportId>().is_err());
        }
    }

    mod ack_token {
        use super::*;

        #[test]
        fn display_is_raw_value() {
            let token = AckToken::new("1700000000000-0");
            assert_eq!(token.to_string(), "1700000000000-0");
            assert_eq!(token.as_str(), "1700000000000-0");
        }

        #[test]
        fn conversions_agree() {
            assert_eq!(AckToken::from("a-1"), AckToken::from("a-1".to_string()));
        }
    }
}
