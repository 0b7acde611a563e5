//! Message definitions shared by the dispatcher, the modems and the store.
//!
//! `Message` is the unit of work. The dispatcher owns every status change;
//! a modem only gets a copy for the duration of one send attempt and hands
//! the (possibly updated) copy back on the result channel.
//!
//! Notes on fields:
//! - `uuid`: opaque identity supplied by the producer, never changes
//! - `retries`: only ever increases
//! - `device`: id of the modem that sent it, empty until sent
//! - `created_at` / `updated_at`: milliseconds since UNIX epoch, set by the
//!   store (`0` when unset)

use serde::{Deserialize, Serialize};

/// Lifecycle state of a message.
///
/// Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sent,
    Errored,
    Canceled,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Pending,
        MessageStatus::Sent,
        MessageStatus::Errored,
        MessageStatus::Canceled,
    ];

    /// Stable index of the status, used by [`StatusSummary`].
    pub fn index(self) -> usize {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Errored => 2,
            MessageStatus::Canceled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != MessageStatus::Pending
    }
}

/// Number of messages in each status, indexed by [`MessageStatus::index`].
pub type StatusSummary = [usize; 4];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub uuid: String,
    pub mobile: String,
    pub body: String,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Message {
    /// A fresh pending message with no retries.
    pub fn new(uuid: impl Into<String>, mobile: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            mobile: mobile.into(),
            body: body.into(),
            status: MessageStatus::Pending,
            retries: 0,
            device: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A destination address: digits with an optional leading `+`.
pub fn is_valid_mobile(mobile: &str) -> bool {
    let digits = mobile.strip_prefix('+').unwrap_or(mobile);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
