//! Dispatch coordinator
//!
//! The `Dispatcher` sits between the durable store and the modems. It owns a
//! bounded working set (the pool) of message identities and moves messages
//! through two channels:
//!
//! - the distribution channel, on which pooled messages are offered and from
//!   which any idle modem may claim one (first claim wins);
//! - the result channel, on which modems hand back every claimed message with
//!   its updated status.
//!
//! Producers reach the dispatcher through a [`Submitter`]; modems through a
//! [`DispatchHandle`]. Both are cheap to clone and are handed out by
//! [`Dispatcher::new`]; there is no global instance.
//!
//! Concurrency notes:
//! - Only the task running [`Dispatcher::run`] touches the pool and only it
//!   mutates message status in the store.
//! - Both channels are bounded at the pool capacity. Every pooled message is
//!   offered at most once at a time, so offering never waits.
//! - Backlog signals come from the store query, never from channel depth.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::message::{Message, MessageStatus};
use crate::dispatcher::pool::Pool;
use crate::persistence::MessageStore;
use crate::utils::error::{StoreError, SubmitError};

/// Submissions queued ahead of the dispatcher before producers wait.
const SUBMIT_QUEUE_DEPTH: usize = 64;

/// How long [`Dispatcher::run`] waits for in-flight results after
/// cancellation unless [`Dispatcher::with_drain_timeout`] says otherwise.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Submission {
    message: Message,
    reply: oneshot::Sender<Result<(), StoreError>>,
}

/// Producer side of the dispatcher.
#[derive(Debug, Clone)]
pub struct Submitter {
    tx: mpsc::Sender<Submission>,
}

impl Submitter {
    /// Accept a new message for delivery.
    ///
    /// Returns once the message is durably stored. Delivery itself is
    /// asynchronous; its outcome is visible through the store only.
    pub async fn submit(&self, message: Message) -> Result<(), SubmitError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Submission { message, reply })
            .await
            .map_err(|_| SubmitError::Stopped)?;
        response.await.map_err(|_| SubmitError::Stopped)??;
        Ok(())
    }
}

/// Modem side of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    offers: Arc<Mutex<mpsc::Receiver<Message>>>,
    results: mpsc::Sender<Message>,
}

impl DispatchHandle {
    #[cfg(test)]
    pub(crate) fn from_channels(
        offers: mpsc::Receiver<Message>,
        results: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            offers: Arc::new(Mutex::new(offers)),
            results,
        }
    }

    /// Claim the next offered message.
    ///
    /// Returns `None` once the dispatcher has closed the distribution
    /// channel; the caller must stop consuming.
    pub async fn claim(&self) -> Option<Message> {
        self.offers.lock().await.recv().await
    }

    /// Hand a claimed message back to the dispatcher.
    ///
    /// Fails, returning the message, if the dispatcher is gone.
    pub async fn report(&self, message: Message) -> Result<(), Message> {
        self.results.send(message).await.map_err(|err| err.0)
    }
}

pub struct Dispatcher<S> {
    store: S,
    pool: Pool,
    backlogged: bool,
    drain_timeout: Duration,
    submissions: mpsc::Receiver<Submission>,
    results: mpsc::Receiver<Message>,
    offer_tx: Option<mpsc::Sender<Message>>,
    offers: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl<S: MessageStore> Dispatcher<S> {
    /// Create a dispatcher holding at most `pool_size` messages, refilling
    /// early below `pool_low` while the store is backlogged.
    pub fn new(store: S, pool_size: usize, pool_low: usize) -> (Self, DispatchHandle, Submitter) {
        let pool = Pool::new(pool_size, pool_low);
        let (offer_tx, offer_rx) = mpsc::channel(pool.capacity());
        let (result_tx, result_rx) = mpsc::channel(pool.capacity());
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let offers = Arc::new(Mutex::new(offer_rx));

        let dispatcher = Self {
            store,
            pool,
            backlogged: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            submissions: submit_rx,
            results: result_rx,
            offer_tx: Some(offer_tx),
            offers: offers.clone(),
        };
        let handle = DispatchHandle {
            offers,
            results: result_tx,
        };
        (dispatcher, handle, Submitter { tx: submit_tx })
    }

    /// Upper bound on how long shutdown waits for in-flight results.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Run until `cancel` fires, then drain and return.
    ///
    /// The pool is refilled from the store at startup, every
    /// `poll_interval`, whenever it empties, and whenever it drops below the
    /// low-water mark while the store is backlogged.
    pub async fn run(mut self, cancel: CancellationToken, poll_interval: Duration) {
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let mut poll = time::interval_at(Instant::now() + poll_interval, poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(pool_size = self.pool.capacity(), "dispatcher running");
        self.refill();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(message) = self.results.recv() => self.handle_result(message),
                Some(submission) = self.submissions.recv() => self.handle_submission(submission),
                _ = poll.tick() => self.refill(),
            }
        }

        self.drain().await;
        info!("dispatcher stopped");
    }

    /// Pull up to a pool's worth of pending messages from the store and
    /// offer the ones not already pooled.
    ///
    /// Returns true when the store had at least a full pool of pending
    /// messages, i.e. there may be more than fit. Store errors skip the
    /// refill and report false.
    pub(crate) fn fill_pool(&mut self) -> bool {
        let capacity = self.pool.capacity();
        let pending = match self.store.pending_messages(capacity) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "refill skipped, pending query failed");
                return false;
            }
        };

        let backlogged = pending.len() >= capacity;
        let mut admitted = 0;
        for message in pending {
            if self.pool.is_full() {
                break;
            }
            if self.pool.admit(&message.uuid) {
                admitted += 1;
                self.offer(message);
            }
        }
        if admitted > 0 {
            debug!(admitted, pooled = self.pool.len(), backlogged, "pool refilled");
        }
        backlogged
    }

    fn refill(&mut self) {
        self.backlogged = self.fill_pool();
    }

    fn handle_submission(&mut self, submission: Submission) {
        let Submission { message, reply } = submission;
        let message = Message {
            status: MessageStatus::Pending,
            retries: 0,
            device: String::new(),
            ..message
        };

        let result = self.store.insert_message(&message);
        match &result {
            Ok(()) => {
                debug!(uuid = %message.uuid, "message stored");
                if !self.backlogged && self.pool.admit(&message.uuid) {
                    self.offer(message);
                }
            }
            Err(e) => warn!(uuid = %message.uuid, error = %e, "failed to store message"),
        }
        // the producer may have given up waiting
        let _ = reply.send(result);
    }

    fn handle_result(&mut self, message: Message) {
        debug!(
            uuid = %message.uuid,
            status = ?message.status,
            retries = message.retries,
            device = %message.device,
            "result received"
        );
        self.record(&message);

        if message.is_terminal() {
            self.pool.release(&message.uuid);
            if self.pool.needs_refill(self.backlogged) {
                self.refill();
            }
        } else if self.pool.contains(&message.uuid) {
            self.offer(message);
        }
    }

    fn record(&self, message: &Message) {
        if let Err(e) = self.store.update_message_status(message) {
            warn!(uuid = %message.uuid, error = %e, "failed to record message status");
        }
    }

    /// Put a pooled message on the distribution channel.
    fn offer(&mut self, message: Message) {
        let Some(tx) = &self.offer_tx else {
            self.pool.release(&message.uuid);
            return;
        };
        if let Err(err) = tx.try_send(message) {
            let message = err.into_inner();
            error!(uuid = %message.uuid, "offer refused, message left pending in store");
            self.pool.release(&message.uuid);
        }
    }

    async fn drain(&mut self) {
        info!(pooled = self.pool.len(), "dispatcher draining");

        // Dropping the only sender closes the channel: claimers get whatever
        // is still buffered and then None.
        self.offer_tx = None;
        {
            let mut offers = self.offers.lock().await;
            while let Ok(message) = offers.try_recv() {
                debug!(uuid = %message.uuid, "unclaimed offer withdrawn");
                self.pool.release(&message.uuid);
            }
        }

        let deadline = time::sleep(self.drain_timeout);
        tokio::pin!(deadline);
        while !self.pool.is_empty() {
            tokio::select! {
                result = self.results.recv() => match result {
                    Some(message) => {
                        self.record(&message);
                        self.pool.release(&message.uuid);
                    }
                    // every modem is gone
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        if !self.pool.is_empty() {
            warn!(
                unreported = self.pool.len(),
                "drain finished with unreported messages, they stay pending in the store"
            );
        }
    }
}
