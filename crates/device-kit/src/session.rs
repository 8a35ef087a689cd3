//! Device sessions as seen by clients.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one connected device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSessionId(Uuid);

impl DeviceSessionId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeviceSessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a discovered device: the name of the reader holding it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps a reader name.
    #[must_use]
    pub fn new(reader: impl Into<String>) -> Self {
        Self(reader.into())
    }

    /// Returns the reader name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device yielded by the discovery feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Pass this to `connect`.
    pub id: DeviceId,
    /// Human readable name.
    pub name: String,
}

/// Coarse status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// Idle and reachable.
    Connected,
    /// An action is exchanging APDUs.
    Busy,
    /// The PIN is blocked.
    Locked,
    /// The card is gone or the session was closed.
    NotConnected,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "CONNECTED",
            Self::Busy => "BUSY",
            Self::Locked => "LOCKED",
            Self::NotConnected => "NOT CONNECTED",
        })
    }
}

/// One emission of the session state stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSessionState {
    /// The session this state belongs to.
    pub session_id: DeviceSessionId,
    /// Current status.
    pub device_status: DeviceStatus,
    /// The reader name, when the session is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_parse_back() {
        let a = DeviceSessionId::new();
        let b = DeviceSessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<DeviceSessionId>().unwrap(), a);
        assert!("not-a-uuid".parse::<DeviceSessionId>().is_err());
    }

    #[test]
    fn state_serializes_camel_case() {
        let state = DeviceSessionState {
            session_id: DeviceSessionId::new(),
            device_status: DeviceStatus::NotConnected,
            device_name: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["deviceStatus"], "NOT_CONNECTED");
        assert_eq!(json["sessionId"], state.session_id.to_string());
        assert!(json.get("deviceName").is_none());
    }
}
