//! Connection state machine
//!
//! One `Connection` per device. Once started with [`Connection::connect`] it
//! runs on its own task:
//!
//! ```text
//! Disconnected -> Connecting --ok--> Connected --link lost--> Connecting
//!                     |  ^
//!                     +--+ failed: wait backoff, grow backoff
//! ```
//!
//! While connected it claims messages from the dispatcher one at a time,
//! sends them and reports each back. Sends on one link never overlap.
//!
//! Cancellation abandons a connect attempt or backoff wait immediately. A
//! send already in progress is not interrupted: it finishes or hits the send
//! timeout, and its result is reported to the draining dispatcher.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchHandle, Message, MessageStatus};
use crate::modem::backoff::{Backoff, BackoffSettings};
use crate::modem::{Link, Modem};
use crate::utils::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Bound on open + handshake.
    pub handshake_timeout: Duration,
    /// Bound on a single send.
    pub send_timeout: Duration,
    /// Failed attempts allowed before a message is marked errored.
    pub retry_limit: u32,
    pub backoff: BackoffSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(15),
            retry_limit: 3,
            backoff: BackoffSettings::default(),
        }
    }
}

/// Why the consume loop stopped.
enum Served {
    LinkLost,
    Canceled,
    ChannelClosed,
}

/// Result of one send attempt.
enum Attempt {
    /// Status, retries and device updated as appropriate.
    Done(Message),
    /// The link went away; the message is untouched.
    LinkClosed(Message),
}

pub struct Connection<M> {
    device_id: String,
    modem: M,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
}

impl<M: Modem> Connection<M> {
    pub fn new(device_id: impl Into<String>, modem: M, settings: ConnectionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            device_id: device_id.into(),
            modem,
            settings,
            state,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Watch connect / disconnect transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Start the monitor task. It runs until `cancel` fires or the
    /// dispatcher closes its distribution channel.
    pub fn connect(self, cancel: CancellationToken, dispatcher: DispatchHandle) -> JoinHandle<()> {
        tokio::spawn(self.monitor(cancel, dispatcher))
    }

    async fn monitor(self, cancel: CancellationToken, dispatcher: DispatchHandle) {
        let mut backoff = Backoff::new(&self.settings.backoff);
        let mut delay = Duration::ZERO;
        info!(device = %self.device_id, "modem created");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }

            self.set_state(ConnectionState::Connecting);
            let link = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.establish() => match result {
                    Ok(link) => link,
                    Err(e) => {
                        delay = backoff.next_delay();
                        warn!(device = %self.device_id, error = %e, retry_in = ?delay, "modem connect failed");
                        continue;
                    }
                },
            };

            backoff.reset();
            self.set_state(ConnectionState::Connected);
            info!(device = %self.device_id, "modem connected");

            match self.serve(&link, &cancel, &dispatcher).await {
                Served::LinkLost => {
                    delay = backoff.next_delay();
                    self.set_state(ConnectionState::Connecting);
                    info!(device = %self.device_id, retry_in = ?delay, "modem disconnected");
                }
                Served::Canceled | Served::ChannelClosed => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(device = %self.device_id, "modem stopped");
    }

    /// Open the transport and complete the handshake within the timeout.
    async fn establish(&self) -> Result<M::Link, DeviceError> {
        time::timeout(self.settings.handshake_timeout, async {
            let link = self.modem.open().await?;
            link.handshake().await?;
            Ok::<_, DeviceError>(link)
        })
        .await
        .map_err(|_| DeviceError::Timeout)?
    }

    /// Consume the distribution channel until the link, the dispatcher or
    /// the process goes away.
    async fn serve(
        &self,
        link: &M::Link,
        cancel: &CancellationToken,
        dispatcher: &DispatchHandle,
    ) -> Served {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Served::Canceled,
                _ = link.closed() => return Served::LinkLost,
                claimed = dispatcher.claim() => match claimed {
                    Some(message) => message,
                    None => return Served::ChannelClosed,
                },
            };

            let (message, link_lost) = match self.attempt(link, message).await {
                Attempt::Done(message) => (message, false),
                Attempt::LinkClosed(message) => (message, true),
            };
            if let Err(message) = dispatcher.report(message).await {
                warn!(device = %self.device_id, uuid = %message.uuid, "dispatcher gone, result not reported");
                return Served::ChannelClosed;
            }
            if link_lost {
                return Served::LinkLost;
            }
        }
    }

    async fn attempt(&self, link: &M::Link, mut message: Message) -> Attempt {
        debug!(device = %self.device_id, uuid = %message.uuid, "sending");
        let outcome = time::timeout(
            self.settings.send_timeout,
            link.send(&message.mobile, &message.body),
        )
        .await
        .unwrap_or(Err(DeviceError::Timeout));

        match outcome {
            Ok(()) => {
                message.status = MessageStatus::Sent;
                message.device = self.device_id.clone();
                info!(device = %self.device_id, uuid = %message.uuid, "message sent");
            }
            Err(DeviceError::Closed) => return Attempt::LinkClosed(message),
            Err(e) if message.retries >= self.settings.retry_limit => {
                message.status = MessageStatus::Errored;
                warn!(
                    device = %self.device_id,
                    uuid = %message.uuid,
                    retries = message.retries,
                    error = %e,
                    "send failed, retry limit reached"
                );
            }
            Err(e) => {
                message.retries += 1;
                debug!(
                    device = %self.device_id,
                    uuid = %message.uuid,
                    retries = message.retries,
                    error = %e,
                    "send failed, will retry"
                );
            }
        }
        Attempt::Done(message)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}
