//! The `transport` module is the network face of the gateway: a WebSocket
//! server through which producers submit messages and read the store.
//!
//! It defines the JSON protocol (`message`) and the server itself
//! (`websocket`), which forwards submissions to the dispatcher.

pub mod message;
pub mod websocket;
