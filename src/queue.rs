// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The bounded, timeout-aware channel between routers and producer workers.

use crate::message::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex, Notify};

/// How long `push` is willing to wait for a slot.
///
/// Mirrors the source's single signed-duration parameter (`0` blocks,
/// negative tries once, positive spins-then-times-out) as a closed enum so
/// the three behaviors can't be confused with one another at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushTimeout {
    /// Block until a slot opens or the queue closes.
    Block,
    /// Try once; if full, discard without waiting.
    NonBlocking,
    /// Try, then spin with cooperative back-off until a slot opens or the
    /// deadline passes.
    After(Duration),
}

/// The outcome of a [`MessageQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The message was enqueued.
    Ok,
    /// No slot opened before the deadline, or the queue is closed.
    Timeout,
    /// The queue was full and the caller asked not to wait.
    Discard,
}

/// A bounded FIFO of messages, closeable and pausable.
///
/// `close` is modeled explicitly (rather than by dropping the sender) so the
/// queue can keep serving pops of whatever was already buffered while all
/// future pushes observe `Timeout`, exactly as the spec describes.
pub struct MessageQueue {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    capacity: usize,
    paused: AtomicBool,
    resume: Notify,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl MessageQueue {
    /// Create a queue with the given bounded capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            paused: AtomicBool::new(false),
            resume: Notify::new(),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue `msg`, respecting `timeout`. See [`PushTimeout`] for the three
    /// behaviors.
    pub async fn push(&self, mut msg: Message, timeout: PushTimeout) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Timeout;
        }
        match timeout {
            PushTimeout::NonBlocking => {
                if self.paused.load(Ordering::Acquire) {
                    return PushOutcome::Discard;
                }
                match self.tx.try_send(msg) {
                    Ok(()) => PushOutcome::Ok,
                    Err(TrySendError::Full(_)) => PushOutcome::Discard,
                    Err(TrySendError::Closed(_)) => PushOutcome::Timeout,
                }
            }
            PushTimeout::Block => loop {
                if self.closed.load(Ordering::Acquire) {
                    return PushOutcome::Timeout;
                }
                // The wait future is created *before* the `paused` check, so
                // a `resume()` racing this check is not missed:
                // `Notify::notify_waiters` wakes only already-registered
                // waiters and stores no permit for latecomers.
                let resumed = self.resume.notified();
                if self.paused.load(Ordering::Acquire) {
                    tokio::select! {
                        _ = resumed => {},
                        _ = self.closed_notify.notified() => {},
                    }
                    continue;
                }
                tokio::select! {
                    result = self.tx.send(msg) => return match result {
                        Ok(()) => PushOutcome::Ok,
                        Err(_) => PushOutcome::Timeout,
                    },
                    _ = self.closed_notify.notified() => return PushOutcome::Timeout,
                }
            },
            PushTimeout::After(deadline) => {
                let start = Instant::now();
                loop {
                    if self.closed.load(Ordering::Acquire) {
                        return PushOutcome::Timeout;
                    }
                    if !self.paused.load(Ordering::Acquire) {
                        match self.tx.try_send(msg) {
                            Ok(()) => return PushOutcome::Ok,
                            Err(TrySendError::Closed(_)) => return PushOutcome::Timeout,
                            Err(TrySendError::Full(back)) => msg = back,
                        }
                    }
                    if start.elapsed() > deadline {
                        return PushOutcome::Timeout;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Blocking dequeue. Returns `(None, false)` once the queue is closed
    /// and fully drained.
    pub async fn pop(&self) -> (Option<Message>, bool) {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(msg) => return (Some(msg), true),
                Err(TryRecvError::Disconnected) => return (None, false),
                Err(TryRecvError::Empty) => {
                    if self.closed.load(Ordering::Acquire) {
                        return (None, false);
                    }
                    tokio::select! {
                        item = rx.recv() => return match item {
                            Some(msg) => (Some(msg), true),
                            None => (None, false),
                        },
                        _ = self.closed_notify.notified() => continue,
                    }
                }
            }
        }
    }

    /// Dequeue with a deadline; `(None, false)` if nothing arrives in time
    /// (this does not by itself mean the queue is closed).
    pub async fn pop_with_timeout(&self, d: Duration) -> (Option<Message>, bool) {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(d, rx.recv()).await {
            Ok(Some(msg)) => (Some(msg), true),
            Ok(None) => (None, false),
            Err(_) => (None, false),
        }
    }

    /// Advisory-only: whether the queue currently appears empty.
    pub fn is_empty(&self) -> bool {
        self.num_queued() == 0
    }

    /// Advisory-only snapshot of the number of queued messages.
    pub fn num_queued(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Stop accepting new pushes (they return `Timeout`); pops continue to
    /// drain whatever is already buffered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        self.resume.notify_waiters();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Suspend delivery: `push` behaves as though the queue were always
    /// full, without discarding anything already queued. `pop` is
    /// unaffected.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume delivery after [`MessageQueue::pause`], waking any pushers
    /// parked with [`PushTimeout::Block`].
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resume.notify_waiters();
    }

    /// Whether the queue is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}
