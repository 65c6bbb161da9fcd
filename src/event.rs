//! Invalidation events broadcast between nodes

use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Tells every node to drop one key, or all keys, of a region from its local cache.
///
/// Encoded as JSON, the same codec used for values in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Region the event applies to
    pub region: String,
    /// Key to drop; absent means "drop everything in the region"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Node id of the publisher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl InvalidationEvent {
    /// Event dropping a single key
    pub fn key(region: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            key: Some(key.into()),
            origin: None,
        }
    }

    /// Event dropping every key of a region
    pub fn clear_all(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            key: None,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn is_clear_all(&self) -> bool {
        self.key.is_none()
    }

    pub fn encode(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_all_omits_key() {
        let event = InvalidationEvent::clear_all("orders");
        assert!(event.is_clear_all());
        assert_eq!(event.encode().unwrap(), r#"{"region":"orders"}"#);
    }

    #[test]
    fn test_decode_key_event() {
        let event =
            InvalidationEvent::decode(br#"{"region":"orders","key":"42","origin":"n1"}"#).unwrap();
        assert_eq!(event, InvalidationEvent::key("orders", "42").with_origin("n1"));
        assert!(!event.is_clear_all());
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        assert!(InvalidationEvent::decode(b"not json").is_err());
        assert!(InvalidationEvent::decode(br#"{"key":"42"}"#).is_err());
    }
}
