use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dispatcher::{Message, StatusSummary};

/// Requests a producer may send.
#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "send")]
    Send { mobile: String, message: String },
    #[serde(rename = "logs")]
    Logs {},
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "accepted")]
    Accepted { uuid: String },
    #[serde(rename = "logs")]
    Logs(LogsReport),
    #[serde(rename = "error")]
    Error { message: String },
}

/// Store overview returned for a `logs` request.
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct LogsReport {
    /// Message counts indexed by status: pending, sent, errored, canceled.
    pub summary: StatusSummary,
    /// Messages created per day over the last week.
    pub daycount: BTreeMap<String, usize>,
    pub messages: Vec<Message>,
}
