// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The message routing core of a multi-source, multi-sink log/event
//! shipper: bytes come in through consumer plugins, are turned into
//! [`Message`]s, pass through a per-stream modulation pipeline, and are
//! handed off to the producer plugins subscribed to their destination
//! stream — or, failing that, counted as discarded or sent to the
//! conventional `_DROPPED_` fallback stream.
//!
//! Concrete consumers, producers, and modulators live outside this crate;
//! it only defines the [`StreamId`]/[`StreamRegistry`]/[`Router`]/[`Message`]
//! plumbing that guarantees every accepted message is delivered exactly
//! once per subscribed producer, discarded under an explicit policy, or
//! routed to fallback — never silently lost, never duplicated, never stuck.

#![warn(missing_docs)]

pub mod consumer;
pub mod control;
pub mod counters;
pub mod error;
pub mod message;
pub mod metadata;
pub mod modulator;
pub mod pool;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod router;
pub mod source;
pub mod stream_id;
pub mod wire;

pub use consumer::{ConsumerCallbacks, ConsumerRoute, ConsumerState, NullConsumerHandle, SimpleConsumer};
pub use control::{control_channel, ControlSignal};
pub use counters::{AtomicCounters, NullCounters, RouteCounters};
pub use error::{RouteError, WireError};
pub use message::Message;
pub use metadata::Metadata;
pub use modulator::{Modulator, Verdict};
pub use pool::BufferPool;
pub use producer::{EnqueueOutcome, Producer, QueueProducer};
pub use queue::{MessageQueue, PushOutcome, PushTimeout};
pub use registry::StreamRegistry;
pub use router::{route, Router, RouterState};
pub use source::ConsumerHandle;
pub use stream_id::{stream_id, StreamId, DROPPED_NAME, WILDCARD_NAME};
