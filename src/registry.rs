// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The process-wide name↔id/id→router map, with on-demand fallback router
//! creation and wildcard-producer injection.

use crate::counters::RouteCounters;
use crate::producer::Producer;
use crate::router::Router;
use crate::stream_id::{stream_id, StreamId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

/// `name↔id` interning plus `id→router` resolution, shared by every router
/// and consumer in a process.
///
/// Held behind an `Arc` and handed to routers as a [`Weak`] back-reference
/// (a router never keeps the registry that owns it alive) and to consumers
/// as a strong reference. Two independent `RwLock`s guard the routers map
/// and the names map, matching the source's separation of those concerns.
pub struct StreamRegistry {
    routers: RwLock<HashMap<StreamId, Arc<Router>>>,
    names: RwLock<HashMap<StreamId, String>>,
    wildcard: RwLock<Vec<Arc<dyn Producer>>>,
    counters: Arc<dyn RouteCounters>,
}

impl StreamRegistry {
    /// An empty registry, ready to have routers registered into it.
    pub fn new(counters: Arc<dyn RouteCounters>) -> Arc<Self> {
        Arc::new(Self {
            routers: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(Vec::new()),
            counters,
        })
    }

    /// Hash `name` into its [`StreamId`]. A pure function of the name;
    /// does not by itself record anything in the registry (interning is
    /// one-way, via [`StreamRegistry::register_router`]).
    pub fn stream_id(&self, name: &str) -> StreamId {
        stream_id(name)
    }

    /// The name a router was registered under, if any. Diagnostics only.
    pub fn name_of(&self, id: StreamId) -> Option<String> {
        self.names.read().unwrap().get(&id).cloned()
    }

    /// Register `router` under `name`, interning the name, merging in any
    /// wildcard producers registered so far, and returning the resolved id.
    pub fn register_router(self: &Arc<Self>, name: &str, router: Arc<Router>) -> StreamId {
        let id = stream_id(name);
        self.add_wildcard_producers_to_router(&router);
        self.routers.write().unwrap().insert(id, router);
        self.names.write().unwrap().insert(id, name.to_string());
        id
    }

    /// Resolve `id` to its router, lazily creating a broadcast fallback
    /// router (no modulators, wildcard producers only) if none is
    /// registered yet. Double-checked: a concurrent caller racing the same
    /// miss will converge on the same router instance.
    pub fn get_router_or_fallback(self: &Arc<Self>, id: StreamId) -> Arc<Router> {
        if let Some(r) = self.routers.read().unwrap().get(&id) {
            return r.clone();
        }
        let mut routers = self.routers.write().unwrap();
        if let Some(r) = routers.get(&id) {
            return r.clone();
        }
        let router = Router::new(id, Arc::downgrade(self), self.counters.clone());
        self.add_wildcard_producers_to_router(&router);
        routers.insert(id, router.clone());
        router
    }

    /// Append `producer` to the wildcard list (subscribed to every stream),
    /// de-duplicating by identity. Does not retroactively touch routers
    /// already created — callers that need that should also call
    /// [`StreamRegistry::add_wildcard_producers_to_router`] themselves, or
    /// rely on [`StreamRegistry::for_each_router`].
    pub fn register_wildcard_producer(&self, producer: Arc<dyn Producer>) {
        let mut wildcard = self.wildcard.write().unwrap();
        if wildcard.iter().any(|p| Arc::ptr_eq(p, &producer)) {
            return;
        }
        wildcard.push(producer);
    }

    /// Merge the current wildcard producer list into `router`'s own
    /// producer set, filtering duplicates by identity.
    pub fn add_wildcard_producers_to_router(&self, router: &Arc<Router>) {
        let wildcard = self.wildcard.read().unwrap();
        for producer in wildcard.iter() {
            router.add_producer(producer.clone());
        }
    }

    /// Iterate a snapshot of the currently registered routers, taken under
    /// the read lock.
    pub fn for_each_router(&self, mut f: impl FnMut(StreamId, &Arc<Router>)) {
        let snapshot: Vec<(StreamId, Arc<Router>)> = self.routers.read().unwrap().iter().map(|(id, r)| (*id, r.clone())).collect();
        for (id, router) in &snapshot {
            f(*id, router);
        }
    }

    /// A weak handle to this registry, for embedding in a [`Router`].
    pub fn downgrade(self: &Arc<Self>) -> Weak<StreamRegistry> {
        Arc::downgrade(self)
    }
}
