use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use labflow_core::ScopeRef;

/// A transient notification addressed to one scope.
///
/// Never persisted by this crate: delivery is best-effort to the sessions
/// connected at the time of publication. The serialized form is exactly the
/// outbound wire frame `{type, scope, payload, emitted_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub scope: ScopeRef,
    pub payload: JsonValue,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn new(scope: ScopeRef, event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            scope,
            payload,
            emitted_at: Utc::now(),
        }
    }

    /// Serialize once for fan-out.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_matches_wire_contract() {
        let event = Event::new(
            ScopeRef::device("dev-1"),
            "device.heartbeat",
            serde_json::json!({"battery": 87}),
        );
        let frame: JsonValue = serde_json::from_str(&event.to_frame().unwrap()).unwrap();

        assert_eq!(frame["type"], "device.heartbeat");
        assert_eq!(frame["scope"], serde_json::json!({"kind": "device", "id": "dev-1"}));
        assert_eq!(frame["payload"]["battery"], 87);
        assert!(frame["emitted_at"].is_string());
    }
}
