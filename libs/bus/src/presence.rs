//! Collector presence announcements
//!
//! A collector starts with no demand. It announces itself on the presence
//! channel once it consumes commands, and every gateway answers with a
//! resync (`reset` then a `start` per demanded key) so the new process
//! learns what is still wanted.

use serde::{Deserialize, Serialize};

/// Pub/sub channel carrying [`CollectorAnnouncement`]s.
pub const PRESENCE_CHANNEL: &str = "collector.presence";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorAnnouncement {
    /// Identifies one collector process.
    pub instance: String,
    /// Unix milliseconds at which it started consuming commands.
    pub started_at: i64,
}

impl CollectorAnnouncement {
    pub fn new(instance: impl Into<String>, started_at: i64) -> Self {
        Self {
            instance: instance.into(),
            started_at,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let announcement = CollectorAnnouncement::new("collector-1", 1_700_000_000_000);
        let json: serde_json::Value = serde_json::from_str(&announcement.to_json().unwrap()).unwrap();
        assert_eq!(json["instance"], "collector-1");
        assert_eq!(json["started_at"], 1_700_000_000_000i64);
        assert!(CollectorAnnouncement::from_json("{\"instance\":1}").is_err());
    }
}
