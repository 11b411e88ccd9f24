//! Shared value types for the store contract.

use serde::{Deserialize, Serialize};

/// Queue priority. Determines which ready stream a job lives on and the
/// order in which workers poll the streams.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities in strict polling order (HIGH before MEDIUM before LOW).
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry delivered from a ready stream to a consumer.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    /// Which priority stream the entry came from.
    pub priority: Priority,
    /// Stream entry ID (e.g., "1234567890123-0").
    pub entry_id: String,
    /// The serialized job payload.
    pub payload: String,
}

/// A delivered-but-unacknowledged entry, as reported by the pending list.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub priority: Priority,
    pub entry_id: String,
    /// Consumer the entry is currently assigned to.
    pub consumer: String,
    /// Milliseconds since the last delivery to that consumer.
    pub idle_ms: u64,
    /// Total number of deliveries (1 = never redelivered).
    pub delivery_count: u64,
}

/// Observed state of a provider rate bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketState {
    /// Current token count (fractional; refill is continuous).
    pub tokens: f64,
    /// Epoch milliseconds of the last refill computation.
    pub last_refill_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert_eq!(
            Priority::ALL,
            [Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn test_priority_serde_round_trip() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "\"high\"");
        let back: Priority = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Priority::High);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("medium"), Some(Priority::Medium));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_priority_default_is_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
    }
}
