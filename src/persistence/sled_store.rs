//! Message store backed by `sled`
//!
//! Three trees are kept:
//! - `messages`: insertion sequence (big-endian u64) -> JSON `Message`
//! - `ids`: message uuid -> insertion sequence
//! - `pending`: insertion sequence -> empty, one entry per pending message
//!
//! Keying by sequence makes every scan come back in insertion order, which
//! gives `pending_messages` its stable ordering for free. Inserts and status
//! updates touch all three trees in one transaction.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sled::transaction::ConflictableTransactionError;
use sled::{Db, IVec, Transactional, Tree};
use tracing::debug;

use crate::dispatcher::message::{Message, MessageStatus, StatusSummary};
use crate::persistence::MessageStore;
use crate::utils::error::StoreError;

const MESSAGES_TREE: &str = "messages";
const IDS_TREE: &str = "ids";
const PENDING_TREE: &str = "pending";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    messages: Tree,
    ids: Tree,
    pending: Tree,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            messages: db.open_tree(MESSAGES_TREE)?,
            ids: db.open_tree(IDS_TREE)?,
            pending: db.open_tree(PENDING_TREE)?,
            db,
        })
    }

    /// Every stored message, oldest first.
    pub fn messages(&self) -> Result<Vec<Message>, StoreError> {
        self.messages
            .iter()
            .values()
            .map(|value| Ok(serde_json::from_slice(&value?)?))
            .collect()
    }

    /// Number of messages in each status.
    pub fn status_summary(&self) -> Result<StatusSummary, StoreError> {
        let mut summary = StatusSummary::default();
        for value in self.messages.iter().values() {
            let message: Message = serde_json::from_slice(&value?)?;
            summary[message.status.index()] += 1;
        }
        Ok(summary)
    }

    /// Messages created per UTC day (`YYYY-MM-DD`) over the last `days` days,
    /// today included. Days without messages are omitted.
    pub fn daily_counts(&self, days: u32) -> Result<BTreeMap<String, usize>, StoreError> {
        let cutoff: NaiveDate = (Utc::now() - Duration::days(i64::from(days))).date_naive();
        let mut counts = BTreeMap::new();
        for value in self.messages.iter().values() {
            let message: Message = serde_json::from_slice(&value?)?;
            let Some(created) = DateTime::from_timestamp_millis(message.created_at) else {
                continue;
            };
            let day = created.date_naive();
            if day > cutoff {
                *counts.entry(day.format("%Y-%m-%d").to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Flush dirty buffers to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn load(&self, seq: &IVec) -> Result<Option<Message>, StoreError> {
        match self.messages.get(seq)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

impl MessageStore for SledStore {
    fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let seq = self.db.generate_id()?.to_be_bytes().to_vec();
        let stored = Message {
            status: MessageStatus::Pending,
            retries: 0,
            device: String::new(),
            created_at: Utc::now().timestamp_millis(),
            updated_at: 0,
            ..message.clone()
        };
        let record = serde_json::to_vec(&stored)?;

        (&self.ids, &self.messages, &self.pending).transaction(|(ids, messages, pending)| {
            if ids.get(message.uuid.as_bytes())?.is_some() {
                return Err(abort(StoreError::Duplicate(message.uuid.clone())));
            }
            ids.insert(message.uuid.as_bytes(), seq.clone())?;
            messages.insert(seq.clone(), record.clone())?;
            pending.insert(seq.clone(), Vec::<u8>::new())?;
            Ok(())
        })?;
        Ok(())
    }

    fn update_message_status(&self, message: &Message) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        let found = (&self.ids, &self.messages, &self.pending).transaction(
            |(ids, messages, pending)| {
                let Some(seq) = ids.get(message.uuid.as_bytes())? else {
                    return Ok(false);
                };
                let Some(value) = messages.get(&seq)? else {
                    return Ok(false);
                };
                let mut stored: Message = serde_json::from_slice(&value).map_err(abort)?;
                stored.status = message.status;
                stored.retries = message.retries;
                stored.device = message.device.clone();
                stored.updated_at = now;
                messages.insert(seq.clone(), serde_json::to_vec(&stored).map_err(abort)?)?;

                if stored.is_terminal() {
                    pending.remove(seq)?;
                } else {
                    pending.insert(seq, Vec::<u8>::new())?;
                }
                Ok(true)
            },
        )?;
        if !found {
            debug!(uuid = %message.uuid, "update for unknown message ignored");
        }
        Ok(())
    }

    fn pending_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let mut pending = Vec::new();
        for key in self.pending.iter().keys() {
            if pending.len() >= limit {
                break;
            }
            let seq = key?;
            match self.load(&seq)? {
                Some(message) if !message.is_terminal() => pending.push(message),
                // index entry outlived its message
                _ => {
                    self.pending.remove(&seq)?;
                }
            }
        }
        Ok(pending)
    }
}

/// Abort a store transaction with `err`.
fn abort(err: impl Into<StoreError>) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err.into())
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
