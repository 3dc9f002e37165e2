//! Application events fanned out to plugins.
//!
//! Payload field names are part of the plugin API; the structs here are the
//! single place they are spelled.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct OpenPayload {
    pub path: String,
    pub tab: i64,
    pub tab_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TabChangePayload {
    pub from: i64,
    pub to: i64,
    pub tab_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPayload {
    pub query: String,
    pub regex: bool,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CopyPayload {
    pub bytes: i64,
}

/// One event as delivered to every plugin's emit hook.
#[derive(Debug, Clone)]
pub enum Event {
    Open(OpenPayload),
    TabChange(TabChangePayload),
    Search(SearchPayload),
    Copy(CopyPayload),
    Quit,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Open(_) => "open",
            Event::TabChange(_) => "tab_change",
            Event::Search(_) => "search",
            Event::Copy(_) => "copy",
            Event::Quit => "quit",
        }
    }

    /// Payload as a JSON tree, `None` for payload-less events.
    pub fn payload(&self) -> Option<Value> {
        let value = match self {
            Event::Open(p) => serde_json::to_value(p),
            Event::TabChange(p) => serde_json::to_value(p),
            Event::Search(p) => serde_json::to_value(p),
            Event::Copy(p) => serde_json::to_value(p),
            Event::Quit => return None,
        };
        value.ok()
    }
}
