//! Wire protocol between a session endpoint and the controller
//!
//! Every frame is a WebSocket text frame carrying JSON:
//! - controller → endpoint: `{"type": "run"}`
//! - endpoint → controller: `{"eventName": "...", "args": {"roots": [...], "nodes": [...]}}`
//!
//! The session identity travels as the WebSocket sub-protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::common::Error;

/// Header carrying the session identity during the handshake
pub const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Identity used when an endpoint does not choose one
pub const DEFAULT_IDENTITY: &str = "default";

/// Close code for a deliberate shutdown; suppresses reconnection
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when a connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported when a close frame carried no status
pub const NO_STATUS: u16 = 1005;

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Dropped without a close handshake
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}

/// Message from the controller to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Start a new run
    Run,
    /// Reserved for future message types; ignored by endpoints
    #[serde(other)]
    Unknown,
}

/// Event frame sent from an endpoint to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    /// Lifecycle event name, e.g. `"test end"`
    #[serde(rename = "eventName")]
    pub event_name: String,
    /// Cycle-safe encoded arguments
    pub args: serde_json::Value,
}

/// Test framework lifecycle events forwarded to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "end")]
    End,
    #[serde(rename = "suite")]
    Suite,
    #[serde(rename = "suite end")]
    SuiteEnd,
    #[serde(rename = "test")]
    Test,
    #[serde(rename = "test end")]
    TestEnd,
    #[serde(rename = "hook")]
    Hook,
    #[serde(rename = "hook end")]
    HookEnd,
    #[serde(rename = "pass")]
    Pass,
    #[serde(rename = "fail")]
    Fail,
    #[serde(rename = "pending")]
    Pending,
}

impl EventName {
    /// Every event name a reporter listens for
    pub const ALL: [EventName; 11] = [
        EventName::Start,
        EventName::End,
        EventName::Suite,
        EventName::SuiteEnd,
        EventName::Test,
        EventName::TestEnd,
        EventName::Hook,
        EventName::HookEnd,
        EventName::Pass,
        EventName::Fail,
        EventName::Pending,
    ];

    /// Name as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Suite => "suite",
            Self::SuiteEnd => "suite end",
            Self::Test => "test",
            Self::TestEnd => "test end",
            Self::Hook => "hook",
            Self::HookEnd => "hook end",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::UnknownEvent(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_message_format() {
        let json = serde_json::to_string(&ControlMessage::Run).unwrap();
        assert_eq!(json, r#"{"type":"run"}"#);
    }

    #[test]
    fn test_unknown_message_type_is_tolerated() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"options"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Unknown);
    }

    #[test]
    fn test_event_names_round_trip_through_strings() {
        for name in EventName::ALL {
            assert_eq!(name.as_str().parse::<EventName>().unwrap(), name);
            let json = serde_json::to_string(&name).unwrap();
            assert_eq!(json, format!("\"{}\"", name.as_str()));
        }
        assert!("suite_end".parse::<EventName>().is_err());
    }

    #[test]
    fn test_event_frame_uses_camel_case_name() {
        let frame = EventFrame {
            event_name: "test end".to_string(),
            args: serde_json::json!({"roots": [], "nodes": []}),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["eventName"], "test end");
    }
}
