//! The `modem` module drives the physical send-capable devices.
//!
//! A device back end implements [`Modem`] (how to open a link) and [`Link`]
//! (what an open link can do). [`connection::Connection`] wraps any such back
//! end in the connect / backoff / consume state machine and binds it to a
//! [`crate::dispatcher::DispatchHandle`].
//!
//! [`at::AtModem`] is the bundled back end: a text-mode AT command set over
//! TCP.

pub mod at;
pub mod backoff;
pub mod connection;

pub use connection::{Connection, ConnectionSettings, ConnectionState};

use async_trait::async_trait;

use crate::utils::error::DeviceError;

/// A device that can be (re)opened.
#[async_trait]
pub trait Modem: Send + Sync + 'static {
    type Link: Link;

    /// Open the physical transport. The link is not usable before
    /// [`Link::handshake`] succeeds.
    async fn open(&self) -> Result<Self::Link, DeviceError>;
}

/// An open link to a device.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Bring the device into a state where it can send.
    async fn handshake(&self) -> Result<(), DeviceError>;

    /// Send one message. [`DeviceError::Closed`] means the link is gone and
    /// the message itself is not at fault.
    async fn send(&self, mobile: &str, body: &str) -> Result<(), DeviceError>;

    /// Resolves once the link has been lost. Callable any number of times.
    async fn closed(&self);
}

#[cfg(test)]
mod tests;
