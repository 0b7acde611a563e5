//! dispatcher
//!
//! The dispatch coordinator: the bounded pool of in-flight messages, the
//! channels shared with the modems, and the message types they exchange.

pub mod engine;
pub mod message;
pub mod pool;

pub use engine::{DispatchHandle, Dispatcher, Submitter};
pub use message::{Message, MessageStatus, StatusSummary};
