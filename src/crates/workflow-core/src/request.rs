//! The inbound request snapshot and uploaded-file metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub path: String,
    pub mime: String,
    pub size: u64,
}

/// An immutable snapshot of the inbound request, attached to the execution
/// context for the lifetime of one run. HTTP transport framing is external;
/// this struct is the boundary the engine depends on.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
    pub ip: String,
    pub id: String,
    /// Session id the caller supplied (header/query), resolved before the
    /// engine builds the execution context. `None` means the caller
    /// supplied no id and the engine must fall back to the workflow's
    /// explicit id or auto-generate one.
    pub session_id: Option<String>,
    #[serde(default)]
    pub files: Vec<UploadedFile>,
}

impl RequestSnapshot {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|v| v.as_str())
    }
}
