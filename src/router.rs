// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-stream modulation pipeline and the top-level `route` entry point.
//!
//! A [`Router`] owns an ordered modulator chain and a producer set for
//! exactly one [`StreamId`]. [`route`] is the dispatcher that turns a
//! modulator [`Verdict`] into either an enqueue, a discard, or a recursive
//! re-route — detecting the one programmer error (a redirect loop) that is
//! allowed to surface as an [`crate::error::RouteError`].

use crate::control::ControlSignal;
use crate::counters::RouteCounters;
use crate::error::RouteError;
use crate::message::Message;
use crate::modulator::{Modulator, Verdict};
use crate::producer::{EnqueueOutcome, Producer};
use crate::registry::StreamRegistry;
use crate::stream_id::{stream_id, StreamId, DROPPED_NAME};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;

/// Lifecycle of a [`Router`].
///
/// `add_producer`/`add_modulator` are only honored in `Unstarted`; calling
/// them afterwards is a no-op (logged as a warning), matching the source's
/// "configure before start" contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouterState {
    /// Accepting producer/modulator registration.
    Unstarted = 0,
    /// Live: routing messages, registration is ignored.
    Running = 1,
    /// Draining; still routing, but about to go away.
    Stopping = 2,
    /// Fully retired.
    Dead = 3,
}

/// A plugin bound to exactly one [`StreamId`]: owns an ordered modulator
/// chain and a set of subscribed producers, and is the only entity that
/// calls [`Producer::enqueue`] for its stream.
pub struct Router {
    id: StreamId,
    modulators: RwLock<Vec<Box<dyn Modulator>>>,
    producers: RwLock<Vec<Arc<dyn Producer>>>,
    registry: Weak<StreamRegistry>,
    counters: Arc<dyn RouteCounters>,
    state: AtomicU8,
}

impl Router {
    /// Build an unstarted router bound to `id`, backed by `registry` for
    /// redirect/fallback resolution and reporting through `counters`.
    pub fn new(id: StreamId, registry: Weak<StreamRegistry>, counters: Arc<dyn RouteCounters>) -> Arc<Self> {
        Arc::new(Self {
            id,
            modulators: RwLock::new(Vec::new()),
            producers: RwLock::new(Vec::new()),
            registry,
            counters,
            state: AtomicU8::new(RouterState::Unstarted as u8),
        })
    }

    /// The stream this router is bound to.
    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RouterState {
        match self.state.load(Ordering::Acquire) {
            0 => RouterState::Unstarted,
            1 => RouterState::Running,
            2 => RouterState::Stopping,
            _ => RouterState::Dead,
        }
    }

    /// Begin routing. No-op if already started.
    pub fn start(&self) {
        let _ = self.state.compare_exchange(
            RouterState::Unstarted as u8,
            RouterState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stop routing, e.g. as part of process shutdown.
    pub fn stop(&self) {
        self.state.store(RouterState::Dead as u8, Ordering::Release);
    }

    /// Append a modulator to the chain. Ignored (with a warning) once the
    /// router has left `Unstarted`.
    pub fn add_modulator(&self, modulator: Box<dyn Modulator>) {
        if self.state() != RouterState::Unstarted {
            log::warn!("add_modulator on stream {} ignored: router already started", self.id);
            return;
        }
        self.modulators.write().unwrap().push(modulator);
    }

    /// Subscribe `producer`, de-duplicating by identity. Ignored (with a
    /// warning) once the router has left `Unstarted`.
    pub fn add_producer(&self, producer: Arc<dyn Producer>) {
        if self.state() != RouterState::Unstarted {
            log::warn!("add_producer on stream {} ignored: router already started", self.id);
            return;
        }
        let mut producers = self.producers.write().unwrap();
        if producers.iter().any(|p| Arc::ptr_eq(p, &producer)) {
            return;
        }
        producers.push(producer);
    }

    /// Number of currently subscribed producers. Diagnostics/tests only.
    pub fn producer_count(&self) -> usize {
        self.producers.read().unwrap().len()
    }

    /// Run every modulator in order over `msg`, stopping at the first
    /// non-`Continue` verdict. A modulator that returns `Redirect` has its
    /// target applied to `msg` via `set_stream` before the verdict is
    /// returned, so the caller always sees `msg.stream_id()` already
    /// reflecting the redirect.
    pub fn modulate(&self, msg: &mut Message) -> Verdict {
        let modulators = self.modulators.read().unwrap();
        for modulator in modulators.iter() {
            match modulator.modulate(msg) {
                Verdict::Continue => continue,
                Verdict::Redirect(target) => {
                    msg.set_stream(target);
                    return Verdict::Redirect(target);
                }
                other => return other,
            }
        }
        Verdict::Continue
    }

    /// Deliver `msg` to every subscribed producer: all but the last get a
    /// working clone, the last gets the message itself. A producer that
    /// reports a timeout has its (returned) message routed to fallback; one
    /// that reports a discard is counted and dropped.
    pub async fn enqueue(self: &Arc<Self>, msg: Message) -> Result<(), RouteError> {
        let producers = self.producers.read().unwrap().clone();
        if producers.is_empty() {
            self.counters.inc_delivered(self.id);
            return Ok(());
        }
        let last = producers.len() - 1;
        let mut current = Some(msg);
        let mut all_delivered = true;
        for (i, producer) in producers.iter().enumerate() {
            let this_msg = if i == last {
                current.take().expect("message retained for the last producer")
            } else {
                current.as_ref().expect("message retained while cloning for earlier producers").clone_message()
            };
            match producer.enqueue(this_msg).await {
                EnqueueOutcome::Delivered => {}
                EnqueueOutcome::Discarded => {
                    all_delivered = false;
                    self.counters.inc_discarded(self.id);
                    log::debug!("producer on stream {} discarded a message (queue full, non-blocking)", self.id);
                }
                EnqueueOutcome::TimedOut(returned) => {
                    all_delivered = false;
                    self.counters.inc_timeout_fallback(self.id);
                    log::warn!("producer on stream {} timed out; routing original to fallback", self.id);
                    self.route_to_fallback(returned, producer.fallback_stream()).await;
                }
            }
        }
        // Only count the message as delivered if every subscribed producer
        // actually got it: a discard or a timeout-fallback for even one
        // producer is already accounted for above and must not also be
        // double-counted as a delivery.
        if all_delivered {
            self.counters.inc_delivered(self.id);
        }
        Ok(())
    }

    /// Drive this router's lifecycle from `rx`, on behalf of the producers
    /// subscribed to it: `StopProducer` calls [`Router::stop`] and ends the
    /// loop, `Roll` is logged and left for the subscribed producer plugins
    /// to act on, `StopConsumer`/`PrepareStop` do not apply to a router and
    /// are ignored.
    pub async fn run_control_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ControlSignal>) {
        while let Some(signal) = rx.recv().await {
            match signal {
                ControlSignal::StopProducer => {
                    self.stop();
                    break;
                }
                ControlSignal::Roll => log::info!("router {} received Roll", self.id),
                ControlSignal::StopConsumer | ControlSignal::PrepareStop => {}
            }
        }
    }

    async fn route_to_fallback(self: &Arc<Self>, mut msg: Message, fallback_override: Option<StreamId>) {
        let target = fallback_override.unwrap_or_else(|| stream_id(DROPPED_NAME));
        if target == self.id {
            // This router *is* the fallback target (the common case: a
            // timed-out producer on `_DROPPED_` itself, with no loopback
            // consumer configured to drain it). Per spec §4.8, a message
            // that reaches `_DROPPED_` with nowhere further to go
            // terminates there and counts as a discard; re-routing would
            // just re-enter the same full/closed producer and recurse
            // forever.
            log::warn!("stream {} timed out falling back to itself; discarding", self.id);
            self.counters.inc_discarded(self.id);
            return;
        }
        let registry = match self.registry.upgrade() {
            Some(r) => r,
            None => {
                log::error!("stream registry dropped; cannot fall back a message from stream {}", self.id);
                return;
            }
        };
        let mut fallback_msg = msg.clone_original();
        fallback_msg.set_stream(target);
        let next = registry.get_router_or_fallback(target);
        if let Err(err) = Box::pin(route(fallback_msg, next)).await {
            log::error!("fallback routing from stream {} failed: {}", self.id, err);
        }
    }
}

/// The top-level routing entry: run `router`'s modulator chain over `msg`
/// and act on the verdict.
///
/// ```text
/// verdict = router.modulate(msg)
/// match verdict:
///   Discard:  count_discard(); return Ok(())
///   Continue: return router.enqueue(msg)
///   Redirect/Fallback: re-route, erroring only on a self-loop
/// ```
pub async fn route(mut msg: Message, router: Arc<Router>) -> Result<(), RouteError> {
    match router.modulate(&mut msg) {
        Verdict::Discard => {
            router.counters.inc_discarded(router.id);
            log::debug!("modulator discarded message on stream {}", router.id);
            Ok(())
        }
        Verdict::Redirect(_) => redirect(msg, &router).await,
        Verdict::Fallback => fallback(msg, &router).await,
        Verdict::Continue => {
            if msg.stream_id() != router.id {
                // A modulator returned `Continue` but mutated the stream in
                // place (the source's implicit redirect idiom).
                redirect(msg, &router).await
            } else {
                router.enqueue(msg).await
            }
        }
    }
}

/// Carry `msg` as-is (mutations kept) to the router for its current
/// `stream_id`. Errors if that stream is the router we just came from.
async fn redirect(msg: Message, router: &Arc<Router>) -> Result<(), RouteError> {
    let target = msg.stream_id();
    if target == router.id {
        router.counters.inc_discarded(router.id);
        log::warn!("routing loop: stream {} redirected to itself", router.id);
        return Err(RouteError::RoutingLoop { stream: target, router: router.id });
    }
    let registry = match router.registry.upgrade() {
        Some(r) => r,
        None => {
            log::error!("stream registry dropped while redirecting from stream {}", router.id);
            router.counters.inc_discarded(router.id);
            return Ok(());
        }
    };
    router.counters.inc_redirect(router.id, target);
    let next = registry.get_router_or_fallback(target);
    Box::pin(route(msg, next)).await
}

/// Restore `msg`'s as-ingested payload/metadata and carry that restored
/// form to the router for its current `stream_id`. Errors if that stream is
/// the router we just came from.
async fn fallback(mut msg: Message, router: &Arc<Router>) -> Result<(), RouteError> {
    let target = msg.stream_id();
    if target == router.id {
        router.counters.inc_discarded(router.id);
        log::warn!("routing loop: stream {} redirected to itself via fallback", router.id);
        return Err(RouteError::RoutingLoop { stream: target, router: router.id });
    }
    let registry = match router.registry.upgrade() {
        Some(r) => r,
        None => {
            log::error!("stream registry dropped while handling fallback from stream {}", router.id);
            router.counters.inc_discarded(router.id);
            return Ok(());
        }
    };
    let mut fallback_msg = msg.clone_original();
    fallback_msg.set_stream(target);
    router.counters.inc_redirect(router.id, target);
    let next = registry.get_router_or_fallback(target);
    Box::pin(route(fallback_msg, next)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::AtomicCounters;
    use crate::metadata::Metadata;
    use crate::queue::{MessageQueue, PushTimeout};
    use crate::producer::QueueProducer;
    use crate::registry::StreamRegistry;
    use std::sync::Weak as StdWeak;
    use std::time::Duration;

    fn msg(payload: &[u8], stream: StreamId) -> Message {
        Message::new(StdWeak::<crate::consumer::NullConsumerHandle>::new(), payload, Metadata::new(), stream)
    }

    struct SetStreamAndFallback(StreamId);
    impl Modulator for SetStreamAndFallback {
        fn modulate(&self, msg: &mut Message) -> Verdict {
            msg.set_stream(self.0);
            Verdict::Fallback
        }
    }

    struct AlwaysFallback;
    impl Modulator for AlwaysFallback {
        fn modulate(&self, _msg: &mut Message) -> Verdict {
            Verdict::Fallback
        }
    }

    #[tokio::test]
    async fn s1_simple_delivery() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let app = registry.stream_id("app");
        let router = Router::new(app, registry.downgrade(), counters);
        let queue = Arc::new(MessageQueue::new(1));
        router.add_producer(Arc::new(QueueProducer::new(queue.clone(), PushTimeout::Block, vec![app])));
        router.start();

        route(msg(b"hello", app), router).await.unwrap();

        let (popped, _) = queue.pop().await;
        let popped = popped.unwrap();
        assert_eq!(popped.payload(), b"hello");
        assert_eq!(popped.stream_id(), app);
        assert_eq!(popped.orig_stream_id(), app);
    }

    #[tokio::test]
    async fn s2_redirect_with_restore() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let b = registry.stream_id("b");

        let r1 = Router::new(a, registry.downgrade(), counters.clone());
        r1.add_modulator(Box::new(SetStreamAndFallback(b)));
        r1.start();
        registry.register_router("a", r1.clone());

        let r2 = Router::new(b, registry.downgrade(), counters.clone());
        let queue = Arc::new(MessageQueue::new(1));
        r2.add_producer(Arc::new(QueueProducer::new(queue.clone(), PushTimeout::Block, vec![b])));
        r2.start();
        registry.register_router("b", r2);

        route(msg(b"x", a), r1).await.unwrap();

        let (popped, _) = queue.pop().await;
        let popped = popped.unwrap();
        assert_eq!(popped.payload(), b"x");
        assert_eq!(popped.stream_id(), b);
        assert_eq!(popped.prev_stream_id(), a);
        assert_eq!(popped.orig_stream_id(), a);
    }

    #[tokio::test]
    async fn s3_self_redirect_is_a_routing_loop() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let router = Router::new(a, registry.downgrade(), counters.clone());
        router.add_modulator(Box::new(AlwaysFallback));
        router.start();

        let err = route(msg(b"x", a), router).await.unwrap_err();
        assert_eq!(err, RouteError::RoutingLoop { stream: a, router: a });
        assert_eq!(counters.discarded(a), 1);
    }

    #[tokio::test]
    async fn s4_producer_timeout_falls_back_to_dropped() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let dropped = registry.stream_id(crate::stream_id::DROPPED_NAME);

        let full_queue = Arc::new(MessageQueue::new(1));
        full_queue.push(msg(b"pre-existing", a), PushTimeout::NonBlocking).await;
        let router = Router::new(a, registry.downgrade(), counters.clone());
        router.add_producer(Arc::new(QueueProducer::new(full_queue.clone(), PushTimeout::After(Duration::from_millis(10)), vec![a])));
        router.start();
        registry.register_router("a", router.clone());

        let dropped_queue = Arc::new(MessageQueue::new(4));
        let dropped_router = registry.get_router_or_fallback(dropped);
        dropped_router.add_producer(Arc::new(QueueProducer::new(dropped_queue.clone(), PushTimeout::Block, vec![dropped])));
        dropped_router.start();

        route(msg(b"x", a), router).await.unwrap();

        let (fallen, _) = dropped_queue.pop().await;
        let fallen = fallen.unwrap();
        assert_eq!(fallen.payload(), b"x");
        assert_eq!(fallen.stream_id(), dropped);

        let (preexisting, _) = full_queue.pop().await;
        assert_eq!(preexisting.unwrap().payload(), b"pre-existing");
        assert!(full_queue.is_empty());
    }

    #[tokio::test]
    async fn s5_clone_isolation_across_producers() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let router = Router::new(a, registry.downgrade(), counters);
        let q1 = Arc::new(MessageQueue::new(1));
        let q2 = Arc::new(MessageQueue::new(1));
        let q3 = Arc::new(MessageQueue::new(1));
        router.add_producer(Arc::new(QueueProducer::new(q1.clone(), PushTimeout::Block, vec![a])));
        router.add_producer(Arc::new(QueueProducer::new(q2.clone(), PushTimeout::Block, vec![a])));
        router.add_producer(Arc::new(QueueProducer::new(q3.clone(), PushTimeout::Block, vec![a])));
        router.start();

        route(msg(b"same", a), router).await.unwrap();

        let (m1, _) = q1.pop().await;
        let (m2, _) = q2.pop().await;
        let (m3, _) = q3.pop().await;
        let mut m1 = m1.unwrap();
        let m2 = m2.unwrap();
        let m3 = m3.unwrap();
        m1.store(b"mutated");
        assert_eq!(m1.payload(), b"mutated");
        assert_eq!(m2.payload(), b"same");
        assert_eq!(m3.payload(), b"same");
    }

    #[tokio::test]
    async fn control_loop_stops_on_stop_producer() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let router = Router::new(a, registry.downgrade(), counters);
        router.start();
        let (tx, rx) = crate::control::control_channel(1);
        let handle = tokio::spawn(router.clone().run_control_loop(rx));
        tx.send(ControlSignal::StopProducer).await.unwrap();
        handle.await.unwrap();
        assert_eq!(router.state(), RouterState::Dead);
    }

    #[tokio::test]
    async fn add_producer_after_start_is_ignored() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let router = Router::new(a, registry.downgrade(), counters);
        router.start();
        let queue = Arc::new(MessageQueue::new(1));
        router.add_producer(Arc::new(QueueProducer::new(queue, PushTimeout::NonBlocking, vec![a])));
        assert_eq!(router.producer_count(), 0);
    }

    #[tokio::test]
    async fn delivered_is_not_counted_alongside_a_discard() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let router = Router::new(a, registry.downgrade(), counters.clone());
        let full_queue = Arc::new(MessageQueue::new(1));
        full_queue.push(msg(b"filler", a), PushTimeout::NonBlocking).await;
        router.add_producer(Arc::new(QueueProducer::new(full_queue, PushTimeout::NonBlocking, vec![a])));
        router.start();

        route(msg(b"x", a), router).await.unwrap();

        assert_eq!(counters.discarded(a), 1);
        assert_eq!(counters.delivered(a), 0);
    }

    #[tokio::test]
    async fn delivered_is_not_counted_alongside_a_timeout_fallback() {
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let a = registry.stream_id("a");
        let dropped = registry.stream_id(crate::stream_id::DROPPED_NAME);

        let full_queue = Arc::new(MessageQueue::new(1));
        full_queue.push(msg(b"filler", a), PushTimeout::NonBlocking).await;
        let router = Router::new(a, registry.downgrade(), counters.clone());
        router.add_producer(Arc::new(QueueProducer::new(full_queue, PushTimeout::After(Duration::from_millis(10)), vec![a])));
        router.start();
        registry.register_router("a", router.clone());

        let dropped_queue = Arc::new(MessageQueue::new(4));
        let dropped_router = registry.get_router_or_fallback(dropped);
        dropped_router.add_producer(Arc::new(QueueProducer::new(dropped_queue, PushTimeout::Block, vec![dropped])));
        dropped_router.start();

        route(msg(b"x", a), router).await.unwrap();

        assert_eq!(counters.timeout_fallback(a), 1);
        assert_eq!(counters.delivered(a), 0);
    }

    #[tokio::test]
    async fn timeout_on_dropped_stream_itself_discards_instead_of_recursing() {
        // No loopback consumer is configured for `_DROPPED_`, and its own
        // producer is both full and non-blocking-timeout: a message that
        // times out here must terminate as a discard, not recurse back into
        // the same full producer forever.
        let counters = Arc::new(AtomicCounters::new());
        let registry = StreamRegistry::new(counters.clone());
        let dropped = registry.stream_id(crate::stream_id::DROPPED_NAME);

        let full_queue = Arc::new(MessageQueue::new(1));
        full_queue.push(msg(b"filler", dropped), PushTimeout::NonBlocking).await;
        let dropped_router = registry.get_router_or_fallback(dropped);
        dropped_router.add_producer(Arc::new(QueueProducer::new(
            full_queue,
            PushTimeout::After(Duration::from_millis(10)),
            vec![dropped],
        )));
        dropped_router.start();

        route(msg(b"x", dropped), dropped_router).await.unwrap();

        assert_eq!(counters.discarded(dropped), 1);
        assert_eq!(counters.timeout_fallback(dropped), 1);
    }
}
