// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The ingest side of the core: turns raw bytes into [`Message`]s, runs the
//! consumer-side modulator chain, and fans the result out to the routers
//! configured for this consumer.

use crate::control::ControlSignal;
use crate::message::Message;
use crate::metadata::Metadata;
use crate::modulator::{Modulator, Verdict};
use crate::router::{route, Router};
use crate::source::ConsumerHandle;
use crate::stream_id::StreamId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// A [`ConsumerHandle`] that answers to nothing and keeps nothing alive.
/// Used where the crate needs *some* handle (tests, a message built outside
/// the context of a running consumer) but no real consumer is attached.
#[derive(Debug, Default)]
pub struct NullConsumerHandle;

impl ConsumerHandle for NullConsumerHandle {
    fn name(&self) -> &str {
        "null"
    }
}

/// Lifecycle states of a [`SimpleConsumer`].
///
/// `Active` and `Waiting` both count as "running" (`is_active`); `Waiting`
/// additionally marks the consumer as currently blocked on back-pressure
/// (`is_blocked`) without it having been asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    /// Constructed but not yet taking input.
    Initializing = 0,
    /// Normal operation.
    Active = 1,
    /// Temporarily unable to make progress (e.g. parked on a full queue).
    Waiting = 2,
    /// Asked to stop; draining in-flight work, no new input accepted.
    PrepareStop = 3,
    /// Finishing the stop callback; about to become `Dead`.
    Stopping = 4,
    /// Fully shut down.
    Dead = 5,
}

impl ConsumerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConsumerState::Initializing,
            1 => ConsumerState::Active,
            2 => ConsumerState::Waiting,
            3 => ConsumerState::PrepareStop,
            4 => ConsumerState::Stopping,
            _ => ConsumerState::Dead,
        }
    }
}

/// Overridable shutdown callbacks for a [`SimpleConsumer`].
///
/// Both hooks default to a no-op; a concrete consumer plugin overrides
/// whichever of them needs to flush state (e.g. fsync a file offset) before
/// the consumer is declared dead.
#[async_trait]
pub trait ConsumerCallbacks: Send + Sync {
    /// Invoked once, on entering `PrepareStop`. An error is logged and
    /// otherwise does not block the transition to `Stopping`.
    async fn on_prepare_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Invoked once, on entering `Stopping`. An error is logged and
    /// otherwise does not block the transition to `Dead`.
    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The default callback set: both hooks are no-ops.
#[derive(Debug, Default)]
pub struct NoopCallbacks;
impl ConsumerCallbacks for NoopCallbacks {}

/// One fan-out target configured for a [`SimpleConsumer`]: the router to
/// route through, and the stream id a cloned/handed-off message should be
/// retargeted to before entering it.
#[derive(Clone)]
pub struct ConsumerRoute {
    /// The stream id this route delivers to.
    pub stream_id: StreamId,
    /// The router bound to `stream_id`.
    pub router: Arc<Router>,
}

/// Ingest helper: builds messages from raw bytes, runs a consumer-side
/// modulator chain, and fans the result out to one or more configured
/// routes.
///
/// A `SimpleConsumer` is meant to be wrapped in an `Arc` so messages it
/// builds can carry a weak back-reference to it (see
/// [`crate::message::Message::source`]).
pub struct SimpleConsumer {
    name: String,
    default_stream: StreamId,
    modulators: Vec<Box<dyn Modulator>>,
    routes: Vec<ConsumerRoute>,
    callbacks: Arc<dyn ConsumerCallbacks>,
    state: AtomicU8,
    self_handle: std::sync::Mutex<Weak<SimpleConsumer>>,
}

impl ConsumerHandle for SimpleConsumer {
    fn name(&self) -> &str {
        &self.name
    }
}

impl SimpleConsumer {
    /// Build a consumer named `name`, defaulting new messages onto
    /// `default_stream`, fanning out to `routes` after running `modulators`.
    pub fn new(name: impl Into<String>, default_stream: StreamId, modulators: Vec<Box<dyn Modulator>>, routes: Vec<ConsumerRoute>) -> Arc<Self> {
        Self::with_callbacks(name, default_stream, modulators, routes, Arc::new(NoopCallbacks))
    }

    /// As [`SimpleConsumer::new`], with explicit shutdown callbacks.
    pub fn with_callbacks(
        name: impl Into<String>,
        default_stream: StreamId,
        modulators: Vec<Box<dyn Modulator>>,
        routes: Vec<ConsumerRoute>,
        callbacks: Arc<dyn ConsumerCallbacks>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| SimpleConsumer {
            name: name.into(),
            default_stream,
            modulators,
            routes,
            callbacks,
            state: AtomicU8::new(ConsumerState::Initializing as u8),
            self_handle: std::sync::Mutex::new(weak.clone()),
        })
    }

    fn set_state(&self, s: ConsumerState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while the consumer is accepting or draining work, i.e. has not
    /// yet been asked to stop (or gone past that point).
    pub fn is_active(&self) -> bool {
        (self.state.load(Ordering::Acquire)) <= ConsumerState::PrepareStop as u8
    }

    /// True while the consumer is parked waiting for back-pressure to clear.
    pub fn is_blocked(&self) -> bool {
        self.state() == ConsumerState::Waiting
    }

    fn weak_self(&self) -> Weak<SimpleConsumer> {
        self.self_handle.lock().unwrap().clone()
    }

    /// Ingest `data` with no metadata. Equivalent to
    /// `enqueue_with_metadata(data, Metadata::new())`.
    pub async fn enqueue(&self, data: &[u8]) -> Result<(), crate::error::RouteError> {
        self.enqueue_with_metadata(data, Metadata::new()).await
    }

    /// Ingest `data` with `metadata` attached, running the consumer-side
    /// modulator chain and fanning the result out to every configured route.
    pub async fn enqueue_with_metadata(&self, data: &[u8], metadata: Metadata) -> Result<(), crate::error::RouteError> {
        self.set_state(ConsumerState::Active);
        let source: Weak<dyn ConsumerHandle> = self.weak_self();
        let mut msg = Message::new(source, data, metadata, self.default_stream);
        msg.freeze_original();

        for modulator in &self.modulators {
            match modulator.modulate(&mut msg) {
                Verdict::Continue => continue,
                Verdict::Discard => return Ok(()),
                Verdict::Fallback => {
                    let target = msg.stream_id();
                    let mut fallback_msg = msg.clone_original();
                    fallback_msg.set_stream(target);
                    return match self.router_for(target) {
                        Some(router) => route(fallback_msg, router).await,
                        None => Ok(()),
                    };
                }
                Verdict::Redirect(target) => {
                    msg.set_stream(target);
                    return match self.router_for(target) {
                        Some(router) => route(msg, router).await,
                        None => Ok(()),
                    };
                }
            }
        }

        if self.routes.is_empty() {
            return Ok(());
        }
        let last = self.routes.len() - 1;
        for (i, r) in self.routes.iter().enumerate() {
            if i == last {
                let mut out = msg;
                out.set_stream(r.stream_id);
                return route(out, r.router.clone()).await;
            }
            let mut clone = msg.clone_message();
            clone.set_stream(r.stream_id);
            route(clone, r.router.clone()).await?;
        }
        Ok(())
    }

    fn router_for(&self, stream: StreamId) -> Option<Arc<Router>> {
        self.routes.iter().find(|r| r.stream_id == stream).map(|r| r.router.clone())
    }

    /// Run the graceful shutdown sequence: `PrepareStop` (bounded by
    /// `5 * shutdown_timeout`), then `Stopping` (same bound), then `Dead`.
    pub async fn shutdown(&self, shutdown_timeout: Duration) {
        let bound = shutdown_timeout * 5;
        self.set_state(ConsumerState::PrepareStop);
        match tokio::time::timeout(bound, self.callbacks.on_prepare_stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!("consumer {} on_prepare_stop failed: {:#}", self.name, err),
            Err(_) => log::warn!("consumer {} on_prepare_stop exceeded {:?}; proceeding", self.name, bound),
        }
        self.set_state(ConsumerState::Stopping);
        match tokio::time::timeout(bound, self.callbacks.on_stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!("consumer {} on_stop failed: {:#}", self.name, err),
            Err(_) => log::warn!("consumer {} on_stop exceeded {:?}; proceeding", self.name, bound),
        }
        self.set_state(ConsumerState::Dead);
    }

    /// Drive this consumer's lifecycle from `rx`: `StopConsumer` and
    /// `PrepareStop` both trigger [`SimpleConsumer::shutdown`] and end the
    /// loop; `Roll` is logged and left for the concrete plugin to act on
    /// (the core only forwards it); `StopProducer` does not apply to a
    /// consumer and is ignored.
    pub async fn run_control_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ControlSignal>, shutdown_timeout: Duration) {
        while let Some(signal) = rx.recv().await {
            match signal {
                ControlSignal::StopConsumer | ControlSignal::PrepareStop => {
                    self.shutdown(shutdown_timeout).await;
                    break;
                }
                ControlSignal::Roll => log::info!("consumer {} received Roll", self.name),
                ControlSignal::StopProducer => {}
            }
        }
    }
}
