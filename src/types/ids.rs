//! Newtype wrappers for engine identifiers.
//!
//! These types keep strategy ids and timer handles from being mixed with
//! plain strings and integers, and make log fields self-describing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a strategy instance (usually a UUID chosen by the owner).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(pub String);

impl StrategyId {
    /// Creates a new strategy id.
    pub fn new(id: impl Into<String>) -> Self {
        StrategyId(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StrategyId {
    fn from(s: &str) -> Self {
        StrategyId(s.to_string())
    }
}

/// Handle returned by a timer service.
///
/// Handles are never reused by a service instance, so a handle that no longer
/// matches any armed timer can be recognised as stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_id_serializes_transparently() {
        let id = StrategyId::new("sw-upgrade-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sw-upgrade-1\"");
        let parsed: StrategyId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn timer_id_display() {
        assert_eq!(TimerId(7).to_string(), "timer-7");
    }
}
