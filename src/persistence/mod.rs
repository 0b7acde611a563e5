//! The `persistence` module is the durable record of every message and its
//! status.
//!
//! The dispatcher only depends on the [`MessageStore`] trait. The production
//! implementation, [`SledStore`], uses `sled` as an embedded key-value store
//! and also answers the read-side queries (logs, summaries, daily counts)
//! used by the producer API.

pub mod sled_store;

pub use sled_store::SledStore;

use crate::dispatcher::message::Message;
use crate::utils::error::StoreError;

/// Store operations the dispatcher needs.
///
/// Calls are synchronous; implementations are expected to be fast local
/// writes.
pub trait MessageStore: Send + 'static {
    /// Durably create a message as `Pending` with no retries.
    /// Fails with [`StoreError::Duplicate`] if the identity already exists.
    fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Update status, retries, device and the update timestamp by identity.
    /// Unknown identities are ignored.
    fn update_message_status(&self, message: &Message) -> Result<(), StoreError>;

    /// Up to `limit` pending messages, in a stable order.
    fn pending_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError>;
}
