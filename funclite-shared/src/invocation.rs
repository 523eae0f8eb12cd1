//! Invocation records crossing the engine boundary.
//!
//! The request snapshot is copied into the guest at setup; the response is
//! captured back through bridge calls. Field names follow the wire shape the
//! front door speaks, so these types serialize directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of the inbound HTTP-style request for one invocation.
///
/// Header keys are lowercased by the front door; the engine preserves that
/// convention when copying the snapshot into the guest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionRequest {
    pub method: String,
    pub url: String,
    pub original_url: String,
    pub path: String,
    pub protocol: String,
    pub hostname: String,
    pub secure: bool,
    pub ip: String,
    pub ips: Vec<String>,
    pub body: serde_json::Value,
    pub query: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl FunctionRequest {
    /// Case-insensitive header lookup (keys are stored lowercased).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// Body captured from the handler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    #[default]
    None,
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl ResponseData {
    pub fn is_none(&self) -> bool {
        matches!(self, ResponseData::None)
    }
}

/// Log verbosity of a captured console entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(LogLevel::Log),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(()),
        }
    }
}

/// One captured console line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Successful invocation result.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub data: ResponseData,
    pub logs: Vec<LogEntry>,
}

/// Failed invocation result (engine- or handler-originated).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionFailure {
    pub error: String,
    pub status_code: u16,
}

/// What `executeFunction` hands back to the front door.
pub type FunctionOutcome = Result<FunctionResponse, FunctionFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_lookup_is_case_insensitive() {
        let mut req = FunctionRequest::default();
        req.headers
            .insert("content-type".into(), "application/json".into());
        assert_eq!(req.header("Content-Type"), Some("application/json"));
        assert_eq!(req.header("x-missing"), None);
    }

    #[test]
    fn response_data_serializes_untagged() {
        let json = serde_json::to_value(ResponseData::Json(serde_json::json!({"m": "hi"}))).unwrap();
        assert_eq!(json, serde_json::json!({"m": "hi"}));
        let text = serde_json::to_value(ResponseData::Text("hello".into())).unwrap();
        assert_eq!(text, serde_json::json!("hello"));
    }

    #[test]
    fn request_deserializes_from_front_door_shape() {
        let req: FunctionRequest = serde_json::from_value(serde_json::json!({
            "method": "POST",
            "url": "/fn/echo",
            "body": {"m": "hi"},
            "headers": {"content-type": "application/json"}
        }))
        .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.body["m"], "hi");
    }
}
