//! # smsgate
//!
//! `smsgate` is an SMS gateway. Producers submit messages over a WebSocket
//! API; a dispatcher keeps a bounded pool of pending messages in flight and
//! hands them to whichever attached modem is idle, retrying failures and
//! persisting every status change.
//!
//! ## Core Modules
//!
//! - `dispatcher`: the dispatch coordinator, its pool and the message types.
//! - `modem`: device traits, the per-device connection state machine and the
//!   AT-over-TCP back end.
//! - `persistence`: the store trait and its sled implementation.
//! - `transport`: the WebSocket producer API.
//! - `client`: a WebSocket client for that API.
//! - `config`: configuration loading.
//! - `utils`: error types and logging setup.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod modem;
pub mod persistence;
pub mod transport;
pub mod utils;
