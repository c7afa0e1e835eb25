//! Reply-delivery targets: where a run's final output should be sent.
//!
//! Transport-agnostic; a target can describe a webhook, a chat thread, or
//! an internal console. Targets ride in run metadata and are normalized on
//! the way in so downstream consumers never see whitespace-only routing.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key under which a run's delivery target is stored.
pub const METADATA_KEY: &str = "delivery";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub metadata: FxHashMap<String, String>,
}

impl DeliveryTarget {
    /// Trim all values and collapse an effectively empty target to `None`.
    #[must_use]
    pub fn normalize(&self) -> Option<DeliveryTarget> {
        let mut out = DeliveryTarget {
            channel: self.channel.trim().to_string(),
            destination: self.destination.trim().to_string(),
            thread_id: self.thread_id.trim().to_string(),
            user_id: self.user_id.trim().to_string(),
            metadata: FxHashMap::default(),
        };
        for (k, v) in &self.metadata {
            let key = k.trim();
            if key.is_empty() {
                continue;
            }
            out.metadata.insert(key.to_string(), v.trim().to_string());
        }
        if out.channel.is_empty()
            && out.destination.is_empty()
            && out.thread_id.is_empty()
            && out.user_id.is_empty()
            && out.metadata.is_empty()
        {
            return None;
        }
        Some(out)
    }

    /// Read a target back out of run metadata.
    #[must_use]
    pub fn from_metadata(metadata: &FxHashMap<String, Value>) -> Option<DeliveryTarget> {
        let value = metadata.get(METADATA_KEY)?;
        serde_json::from_value::<DeliveryTarget>(value.clone())
            .ok()
            .and_then(|t| t.normalize())
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_collapses() {
        let target = DeliveryTarget {
            channel: "  slack  ".to_string(),
            destination: String::new(),
            thread_id: "  ".to_string(),
            user_id: String::new(),
            metadata: FxHashMap::from_iter([("  ".to_string(), "x".to_string())]),
        };
        let normalized = target.normalize().unwrap();
        assert_eq!(normalized.channel, "slack");
        assert!(normalized.thread_id.is_empty());
        assert!(normalized.metadata.is_empty());

        let empty = DeliveryTarget {
            channel: "   ".to_string(),
            ..Default::default()
        };
        assert_eq!(empty.normalize(), None);
    }

    #[test]
    fn metadata_round_trip() {
        let target = DeliveryTarget {
            channel: "webhook".to_string(),
            destination: "https://example.test/hook".to_string(),
            ..Default::default()
        };
        let mut metadata = FxHashMap::default();
        metadata.insert(METADATA_KEY.to_string(), target.to_value());
        assert_eq!(DeliveryTarget::from_metadata(&metadata), Some(target));
    }
}
