// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! End-to-end routing scenarios driven entirely through the public API.

use routecore::{
    route, AtomicCounters, ConsumerRoute, Message, Metadata, Modulator, PushTimeout, QueueProducer, Router,
    SimpleConsumer, StreamRegistry, Verdict,
};
use std::sync::{Arc, Weak};
use std::time::Duration;

fn registry() -> Arc<StreamRegistry> {
    StreamRegistry::new(Arc::new(AtomicCounters::new()))
}

#[tokio::test]
async fn simple_consumer_fans_out_to_two_routes() {
    let reg = registry();
    let access = reg.stream_id("access");
    let audit = reg.stream_id("audit");

    let access_router = Router::new(access, reg.downgrade(), Arc::new(AtomicCounters::new()));
    let access_queue = Arc::new(routecore::MessageQueue::new(4));
    access_router.add_producer(Arc::new(QueueProducer::new(access_queue.clone(), PushTimeout::Block, vec![access])));
    access_router.start();
    reg.register_router("access", access_router.clone());

    let audit_router = Router::new(audit, reg.downgrade(), Arc::new(AtomicCounters::new()));
    let audit_queue = Arc::new(routecore::MessageQueue::new(4));
    audit_router.add_producer(Arc::new(QueueProducer::new(audit_queue.clone(), PushTimeout::Block, vec![audit])));
    audit_router.start();
    reg.register_router("audit", audit_router.clone());

    let consumer = SimpleConsumer::new(
        "http-access-log",
        access,
        vec![],
        vec![
            ConsumerRoute { stream_id: access, router: access_router },
            ConsumerRoute { stream_id: audit, router: audit_router },
        ],
    );

    consumer.enqueue(b"GET /healthz 200").await.unwrap();

    let (a, _) = access_queue.pop().await;
    let (b, _) = audit_queue.pop().await;
    assert_eq!(a.unwrap().payload(), b"GET /healthz 200");
    assert_eq!(b.unwrap().payload(), b"GET /healthz 200");
}

struct DropIfTagged(&'static str);
impl Modulator for DropIfTagged {
    fn modulate(&self, msg: &mut Message) -> Verdict {
        if msg.metadata().get("drop") == self.0.as_bytes() {
            Verdict::Discard
        } else {
            Verdict::Continue
        }
    }
}

#[tokio::test]
async fn modulator_discard_stops_the_chain_before_enqueue() {
    let reg = registry();
    let counters = Arc::new(AtomicCounters::new());
    let app = reg.stream_id("app");
    let router = Router::new(app, reg.downgrade(), counters.clone());
    router.add_modulator(Box::new(DropIfTagged("yes")));
    let queue = Arc::new(routecore::MessageQueue::new(4));
    router.add_producer(Arc::new(QueueProducer::new(queue.clone(), PushTimeout::NonBlocking, vec![app])));
    router.start();

    let mut msg = Message::new(Weak::<routecore::NullConsumerHandle>::new(), b"noisy", Metadata::new(), app);
    msg.metadata_mut().set("drop", b"yes".to_vec());
    route(msg, router).await.unwrap();

    assert!(queue.is_empty());
    assert_eq!(counters.discarded(app), 1);
}

#[tokio::test]
async fn producer_timeout_falls_back_to_dropped_stream() {
    // `MessageQueue::push`'s `After` timeout is a real-time cooperative spin
    // (see `queue.rs`), not a tokio timer, so it is driven with a short
    // wall-clock deadline rather than `tokio::time::pause`.
    let reg = registry();
    let counters = Arc::new(AtomicCounters::new());
    let a = reg.stream_id("a");
    let dropped = reg.stream_id(routecore::DROPPED_NAME);

    let full_queue = Arc::new(routecore::MessageQueue::new(1));
    full_queue.push(
        Message::new(Weak::<routecore::NullConsumerHandle>::new(), b"filler", Metadata::new(), a),
        PushTimeout::NonBlocking,
    ).await;

    let router = Router::new(a, reg.downgrade(), counters.clone());
    router.add_producer(Arc::new(QueueProducer::new(
        full_queue.clone(),
        PushTimeout::After(Duration::from_millis(10)),
        vec![a],
    )));
    router.start();
    reg.register_router("a", router.clone());

    let dropped_queue = Arc::new(routecore::MessageQueue::new(4));
    let dropped_router = reg.get_router_or_fallback(dropped);
    dropped_router.add_producer(Arc::new(QueueProducer::new(dropped_queue.clone(), PushTimeout::Block, vec![dropped])));
    dropped_router.start();

    route(
        Message::new(Weak::<routecore::NullConsumerHandle>::new(), b"payload", Metadata::new(), a),
        router,
    )
    .await
    .unwrap();

    let (fallen, _) = dropped_queue.pop().await;
    let fallen = fallen.unwrap();
    assert_eq!(fallen.payload(), b"payload");
    assert_eq!(fallen.stream_id(), dropped);
    assert_eq!(counters.timeout_fallback(a), 1);
}

#[tokio::test(start_paused = true)]
async fn consumer_shutdown_bound_is_driven_by_virtual_time() {
    // `SimpleConsumer::shutdown` bounds its hooks with `tokio::time::timeout`,
    // which *does* respect the paused/advanced virtual clock.
    struct SlowStop;
    #[async_trait::async_trait]
    impl routecore::ConsumerCallbacks for SlowStop {
        async fn on_prepare_stop(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    let reg = registry();
    let app = reg.stream_id("app");
    let router = reg.get_router_or_fallback(app);
    let consumer = SimpleConsumer::with_callbacks(
        "slow",
        app,
        vec![],
        vec![ConsumerRoute { stream_id: app, router }],
        Arc::new(SlowStop),
    );

    let shutdown_timeout = Duration::from_millis(100);
    let handle = tokio::spawn(async move {
        consumer.shutdown(shutdown_timeout).await;
        consumer
    });

    // The hook sleeps for an hour; advancing virtual time past the
    // 5x shutdown-timeout bound lets the shutdown sequence proceed anyway,
    // with no real wall-clock wait.
    tokio::time::advance(shutdown_timeout * 5 + Duration::from_millis(1)).await;
    let consumer = handle.await.unwrap();
    assert_eq!(consumer.state(), routecore::ConsumerState::Dead);
}

#[tokio::test]
async fn wildcard_producer_is_present_on_every_subsequently_created_router() {
    let reg = registry();
    let sink_queue = Arc::new(routecore::MessageQueue::new(8));
    let sink = Arc::new(QueueProducer::new(sink_queue.clone(), PushTimeout::Block, vec![]));
    reg.register_wildcard_producer(sink);

    let one = reg.get_router_or_fallback(reg.stream_id("one"));
    let two = reg.get_router_or_fallback(reg.stream_id("two"));
    assert_eq!(one.producer_count(), 1);
    assert_eq!(two.producer_count(), 1);
}

#[tokio::test]
async fn wire_round_trip_survives_a_redirect_and_a_metadata_tag() {
    let mut msg = Message::new(
        Weak::<routecore::NullConsumerHandle>::new(),
        b"raw bytes",
        Metadata::new(),
        routecore::stream_id("in"),
    );
    msg.metadata_mut().set("source-ip", b"10.0.0.1".to_vec());
    msg.set_stream(routecore::stream_id("out"));

    let bytes = routecore::wire::serialize(&msg);
    let decoded = routecore::wire::deserialize(&bytes).unwrap();

    assert_eq!(decoded.stream_id(), msg.stream_id());
    assert_eq!(decoded.prev_stream_id(), msg.prev_stream_id());
    assert_eq!(decoded.payload(), msg.payload());
    assert_eq!(decoded.metadata().get("source-ip"), b"10.0.0.1");
}
