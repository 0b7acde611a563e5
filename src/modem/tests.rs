use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffSettings;
use super::{Connection, ConnectionSettings, ConnectionState, Link, Modem};
use crate::dispatcher::{DispatchHandle, Message, MessageStatus};
use crate::utils::error::DeviceError;

const LONG: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ok,
    Fail,
    Closed,
    Hang,
    /// Succeeds after a while.
    Slow,
}

/// Scripted modem. Opens and sends consume their scripts front to back and
/// succeed once a script runs out.
#[derive(Clone, Default)]
struct MockModem {
    opens: Arc<Mutex<VecDeque<bool>>>,
    sends: Arc<Mutex<VecDeque<Outcome>>>,
    open_count: Arc<AtomicUsize>,
    links: Arc<Mutex<Vec<CancellationToken>>>,
}

impl MockModem {
    fn failing_opens(self, count: usize) -> Self {
        self.opens.lock().unwrap().extend(std::iter::repeat_n(false, count));
        self
    }

    fn sends(self, outcomes: &[Outcome]) -> Self {
        self.sends.lock().unwrap().extend(outcomes.iter().copied());
        self
    }

    fn opened(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Drop the most recently opened link from the device side.
    fn hang_up(&self) {
        if let Some(link) = self.links.lock().unwrap().last() {
            link.cancel();
        }
    }
}

struct MockLink {
    sends: Arc<Mutex<VecDeque<Outcome>>>,
    closed: CancellationToken,
}

#[async_trait]
impl Modem for MockModem {
    type Link = MockLink;

    async fn open(&self) -> Result<MockLink, DeviceError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        if !self.opens.lock().unwrap().pop_front().unwrap_or(true) {
            return Err(DeviceError::Protocol("no carrier".to_string()));
        }
        let closed = CancellationToken::new();
        self.links.lock().unwrap().push(closed.clone());
        Ok(MockLink {
            sends: self.sends.clone(),
            closed,
        })
    }
}

#[async_trait]
impl Link for MockLink {
    async fn handshake(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn send(&self, _mobile: &str, _body: &str) -> Result<(), DeviceError> {
        let outcome = self.sends.lock().unwrap().pop_front().unwrap_or(Outcome::Ok);
        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Fail => Err(DeviceError::Protocol("+CMS ERROR: 500".to_string())),
            Outcome::Closed => {
                self.closed.cancel();
                Err(DeviceError::Closed)
            }
            Outcome::Hang => std::future::pending().await,
            Outcome::Slow => {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(())
            }
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        handshake_timeout: Duration::from_secs(1),
        send_timeout: Duration::from_millis(200),
        retry_limit: 3,
        backoff: BackoffSettings {
            min: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 2.0,
        },
    }
}

struct Harness {
    offers: mpsc::Sender<Message>,
    results: mpsc::Receiver<Message>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(modem: MockModem, settings: ConnectionSettings) -> Self {
        let (offers, offer_rx) = mpsc::channel(8);
        let (result_tx, results) = mpsc::channel(8);
        let handle = DispatchHandle::from_channels(offer_rx, result_tx);

        let connection = Connection::new("modem0", modem, settings);
        assert_eq!(connection.device_id(), "modem0");
        let state = connection.state();
        let cancel = CancellationToken::new();
        let task = connection.connect(cancel.clone(), handle);
        Self {
            offers,
            results,
            state,
            cancel,
            task,
        }
    }

    async fn next_result(&mut self) -> Message {
        timeout(LONG, self.results.recv())
            .await
            .expect("timed out waiting for a result")
            .expect("result channel closed")
    }

    async fn round_trip(&mut self, message: Message) -> Message {
        self.offers.send(message).await.unwrap();
        self.next_result().await
    }

    async fn wait_for(&mut self, state: ConnectionState) {
        timeout(LONG, self.state.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }
}

#[tokio::test]
async fn sent_message_carries_device() {
    let mut harness = Harness::start(MockModem::default(), settings());

    let result = harness.round_trip(Message::new("a", "+1", "hi")).await;
    assert_eq!(result.status, MessageStatus::Sent);
    assert_eq!(result.device, "modem0");
    assert_eq!(result.retries, 0);
}

#[tokio::test]
async fn retries_until_the_limit_then_errors() {
    let modem = MockModem::default().sends(&[Outcome::Fail, Outcome::Fail]);
    let mut harness = Harness::start(modem, settings());

    let mut message = Message::new("a", "+1", "hi");
    message.retries = 2;

    let first = harness.round_trip(message).await;
    assert_eq!(first.status, MessageStatus::Pending);
    assert_eq!(first.retries, 3);

    let second = harness.round_trip(first).await;
    assert_eq!(second.status, MessageStatus::Errored);
    assert_eq!(second.retries, 3);
    assert!(second.device.is_empty());
}

#[tokio::test]
async fn send_timeout_counts_as_a_failed_attempt() {
    let modem = MockModem::default().sends(&[Outcome::Hang]);
    let mut harness = Harness::start(modem, settings());

    let result = harness.round_trip(Message::new("a", "+1", "hi")).await;
    assert_eq!(result.status, MessageStatus::Pending);
    assert_eq!(result.retries, 1);
}

#[tokio::test]
async fn lost_link_reports_unchanged_and_reconnects() {
    let modem = MockModem::default().sends(&[Outcome::Closed]);
    let mut harness = Harness::start(modem.clone(), settings());

    let result = harness.round_trip(Message::new("a", "+1", "hi")).await;
    assert_eq!(result.status, MessageStatus::Pending);
    assert_eq!(result.retries, 0);
    assert!(result.device.is_empty());

    let result = harness.round_trip(result).await;
    assert_eq!(result.status, MessageStatus::Sent);
    assert_eq!(modem.opened(), 2);
}

#[tokio::test]
async fn failed_connects_back_off_then_succeed() {
    let modem = MockModem::default().failing_opens(2);
    let mut harness = Harness::start(modem.clone(), settings());

    harness.wait_for(ConnectionState::Connected).await;
    assert_eq!(modem.opened(), 3);

    let result = harness.round_trip(Message::new("a", "+1", "hi")).await;
    assert_eq!(result.status, MessageStatus::Sent);
}

#[tokio::test]
async fn cancellation_stops_the_connection() {
    let mut harness = Harness::start(MockModem::default(), settings());
    harness.wait_for(ConnectionState::Connected).await;

    harness.cancel.cancel();
    timeout(LONG, &mut harness.task).await.unwrap().unwrap();
    assert_eq!(*harness.state.borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let mut slow = settings();
    slow.backoff.min = Duration::from_secs(3600);
    slow.backoff.max = Duration::from_secs(3600);
    let modem = MockModem::default().failing_opens(1);
    let mut harness = Harness::start(modem.clone(), slow);

    // first attempt fails, the monitor is now waiting out the backoff
    harness.wait_for(ConnectionState::Connecting).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.cancel.cancel();
    timeout(LONG, &mut harness.task).await.unwrap().unwrap();
    assert_eq!(modem.opened(), 1);
}

#[tokio::test]
async fn closed_distribution_channel_ends_the_connection() {
    let mut harness = Harness::start(MockModem::default(), settings());
    harness.wait_for(ConnectionState::Connected).await;

    let Harness { offers, task, .. } = harness;
    drop(offers);
    timeout(LONG, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn idle_link_loss_reconnects() {
    let modem = MockModem::default();
    let mut harness = Harness::start(modem.clone(), settings());
    harness.wait_for(ConnectionState::Connected).await;
    assert_eq!(modem.opened(), 1);

    modem.hang_up();
    timeout(LONG, async {
        while modem.opened() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no reconnect after the link was lost");
    harness.wait_for(ConnectionState::Connected).await;

    let result = harness.round_trip(Message::new("a", "+1", "hi")).await;
    assert_eq!(result.status, MessageStatus::Sent);
}

#[tokio::test]
async fn cancellation_waits_for_a_send_in_progress() {
    let modem = MockModem::default().sends(&[Outcome::Slow]);
    let mut harness = Harness::start(modem, settings());
    harness.wait_for(ConnectionState::Connected).await;

    harness.offers.send(Message::new("a", "+1", "hi")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.cancel.cancel();

    let result = harness.next_result().await;
    assert_eq!(result.uuid, "a");
    assert_eq!(result.status, MessageStatus::Sent);
    timeout(LONG, &mut harness.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_reports_a_send_that_times_out() {
    let modem = MockModem::default().sends(&[Outcome::Hang]);
    let mut harness = Harness::start(modem, settings());
    harness.wait_for(ConnectionState::Connected).await;

    harness.offers.send(Message::new("a", "+1", "hi")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.cancel.cancel();

    let result = harness.next_result().await;
    assert_eq!(result.status, MessageStatus::Pending);
    assert_eq!(result.retries, 1);
    timeout(LONG, &mut harness.task).await.unwrap().unwrap();
}
