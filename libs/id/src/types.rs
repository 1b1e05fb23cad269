//! Typed identity definitions for the mobility platform.
//!
//! Agent and container identities are validated names; request correlation
//! ids are ULID-based for sortability and uniqueness.

use crate::define_name;

pub use crate::macros::MAX_NAME_LEN;

// =============================================================================
// Names
// =============================================================================

define_name!(AgentName);
define_name!(ContainerName);

// =============================================================================
// Request Correlation
// =============================================================================

/// Correlation id for a single wire request/response exchange.
///
/// Format: `req_{ulid}`. Minted fresh for every outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(ulid::Ulid);

impl RequestId {
    /// The prefix for request ids.
    pub const PREFIX: &'static str = "req";

    /// Creates a new id with a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Returns the timestamp portion of the ULID in milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Parses a request id from its `req_{ulid}` form.
    pub fn parse(s: &str) -> Result<Self, crate::IdError> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }

        let Some((prefix, ulid_str)) = s.split_once('_') else {
            return Err(crate::IdError::MissingSeparator);
        };

        if prefix != Self::PREFIX {
            return Err(crate::IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }

        let ulid = ulid_str
            .parse::<ulid::Ulid>()
            .map_err(|e| crate::IdError::InvalidUlid(e.to_string()))?;

        Ok(Self(ulid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_agent_name_roundtrip() {
        let name = AgentName::parse("trader-7").unwrap();
        let s = name.to_string();
        let parsed: AgentName = s.parse().unwrap();
        assert_eq!(name, parsed);
    }

    #[test]
    fn test_agent_name_empty() {
        let result = AgentName::parse("");
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_agent_name_too_long() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        let result = AgentName::parse(&long);
        assert!(matches!(result.unwrap_err(), crate::IdError::TooLong { .. }));
    }

    #[test]
    fn test_agent_name_invalid_char() {
        let result = AgentName::parse("trader 7");
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidChar { found: ' ', .. }
        ));
    }

    #[test]
    fn test_container_name_dots_allowed() {
        let name = ContainerName::parse("container.eu-west.2").unwrap();
        assert_eq!(name.as_str(), "container.eu-west.2");
    }

    #[test]
    fn test_name_json_roundtrip() {
        let name = AgentName::parse("probe_12").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        let parsed: AgentName = serde_json::from_str(&json).unwrap();
        assert_eq!(name, parsed);
    }

    #[test]
    fn test_name_json_rejects_invalid() {
        let result: Result<AgentName, _> = serde_json::from_str("\"not valid!\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_request_id_roundtrip() {
        let id = RequestId::new();
        let s = id.to_string();
        let parsed: RequestId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_request_id_prefix() {
        let id = RequestId::new();
        assert!(id.to_string().starts_with("req_"));
    }

    #[test]
    fn test_request_id_invalid_prefix() {
        let result = RequestId::parse("node_01HV4Z2WQXKJNM8GPQY6VBKC3D");
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_request_id_sortable() {
        let id1 = RequestId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = RequestId::new();
        assert!(id1 < id2);
    }

    proptest! {
        #[test]
        fn prop_valid_names_roundtrip(s in "[A-Za-z0-9._-]{1,64}") {
            let name = AgentName::parse(&s).unwrap();
            let reparsed: AgentName = name.to_string().parse().unwrap();
            prop_assert_eq!(name, reparsed);
        }

        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = AgentName::parse(&s);
        }
    }
}
