// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The core↔producer boundary: a capability a [`crate::router::Router`]
//! calls into to hand off a message, backed in-process by a
//! [`crate::queue::MessageQueue`].

use crate::message::Message;
use crate::queue::{MessageQueue, PushOutcome, PushTimeout};
use crate::stream_id::StreamId;
use async_trait::async_trait;
use std::sync::Arc;

/// What happened when a [`Producer`] was handed a message.
///
/// Mirrors [`PushOutcome`] except that a timed-out push hands the message
/// back: the router needs it to build the fallback (drop-to-`_DROPPED_`)
/// delivery, and threading it back here is cheaper than having every caller
/// pre-clone a copy it usually won't need.
pub enum EnqueueOutcome {
    /// The message was accepted.
    Delivered,
    /// The message was dropped (queue full, non-blocking policy).
    Discarded,
    /// The message could not be delivered before the producer's deadline;
    /// the message is returned so the caller can route it to fallback.
    TimedOut(Message),
}

/// A plugin that drains messages handed to it by routers and emits them
/// externally (to a file, a socket, a remote service, ...).
///
/// Concrete producers live outside this crate; this trait is the capability
/// a [`crate::router::Router`] needs in order to deliver to one.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Hand `msg` to this producer.
    async fn enqueue(&self, msg: Message) -> EnqueueOutcome;

    /// The streams this producer is subscribed to, for diagnostics.
    fn streams(&self) -> Vec<StreamId>;

    /// The stream this producer asks its own internally-timed-out messages
    /// be routed to, if different from the process-wide `_DROPPED_`
    /// convention. `None` means "use the default fallback stream".
    fn fallback_stream(&self) -> Option<StreamId> {
        None
    }
}

/// The common producer shape: a bounded [`MessageQueue`] a worker task
/// drains, reached from the router side through a fixed push policy.
pub struct QueueProducer {
    queue: Arc<MessageQueue>,
    push_timeout: PushTimeout,
    streams: Vec<StreamId>,
    fallback_stream: Option<StreamId>,
}

impl QueueProducer {
    /// Build a producer backed by `queue`, applying `push_timeout` to every
    /// delivery attempt and advertising subscription to `streams`.
    pub fn new(queue: Arc<MessageQueue>, push_timeout: PushTimeout, streams: Vec<StreamId>) -> Self {
        Self {
            queue,
            push_timeout,
            streams,
            fallback_stream: None,
        }
    }

    /// Override the stream this producer's own timeouts fall back to.
    pub fn with_fallback_stream(mut self, stream: StreamId) -> Self {
        self.fallback_stream = Some(stream);
        self
    }

    /// The underlying queue, e.g. so a worker task can `pop` from it.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }
}

#[async_trait]
impl Producer for QueueProducer {
    async fn enqueue(&self, msg: Message) -> EnqueueOutcome {
        let fallback_copy = msg.clone_message();
        match self.queue.push(msg, self.push_timeout).await {
            PushOutcome::Ok => EnqueueOutcome::Delivered,
            PushOutcome::Discard => EnqueueOutcome::Discarded,
            PushOutcome::Timeout => EnqueueOutcome::TimedOut(fallback_copy),
        }
    }

    fn streams(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    fn fallback_stream(&self) -> Option<StreamId> {
        self.fallback_stream
    }
}
