// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The abstract metrics boundary.
//!
//! The core never talks to a concrete metrics aggregator; it calls a small
//! trait on every terminal or redirect decision. The host process supplies a
//! real implementation (e.g. a Prometheus registry). [`NullCounters`] and
//! [`AtomicCounters`] cover the "don't care" and "in-process/test" cases.

use crate::stream_id::StreamId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Abstract counters the routing core updates as it makes decisions.
///
/// Implementations must be `Send + Sync`: routers may be invoked
/// concurrently from many consumer tasks.
pub trait RouteCounters: Send + Sync {
    /// A message was handed off to every subscribed producer of `stream`.
    fn inc_delivered(&self, stream: StreamId);
    /// A message was dropped by a modulator's `Discard` verdict, or because
    /// a producer queue reported `Discard` (full, non-blocking push).
    fn inc_discarded(&self, stream: StreamId);
    /// A message was routed to the fallback stream because a producer queue
    /// timed out.
    fn inc_timeout_fallback(&self, stream: StreamId);
    /// A modulator redirected a message from `from` to `to`.
    fn inc_redirect(&self, from: StreamId, to: StreamId);
}

/// Discards every observation. The default when no metrics aggregator is
/// wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCounters;

impl RouteCounters for NullCounters {
    fn inc_delivered(&self, _stream: StreamId) {}
    fn inc_discarded(&self, _stream: StreamId) {}
    fn inc_timeout_fallback(&self, _stream: StreamId) {}
    fn inc_redirect(&self, _from: StreamId, _to: StreamId) {}
}

/// In-memory, per-stream counters. Useful for tests and for embedders that
/// want visibility without standing up a full metrics pipeline.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    delivered: Mutex<HashMap<StreamId, AtomicU64>>,
    discarded: Mutex<HashMap<StreamId, AtomicU64>>,
    timeout_fallback: Mutex<HashMap<StreamId, AtomicU64>>,
    redirects: Mutex<HashMap<(StreamId, StreamId), AtomicU64>>,
}

impl AtomicCounters {
    /// A fresh, all-zero counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current delivered count for `stream`.
    pub fn delivered(&self, stream: StreamId) -> u64 {
        Self::read(&self.delivered, stream)
    }

    /// Current discarded count for `stream`.
    pub fn discarded(&self, stream: StreamId) -> u64 {
        Self::read(&self.discarded, stream)
    }

    /// Current timeout-fallback count for `stream`.
    pub fn timeout_fallback(&self, stream: StreamId) -> u64 {
        Self::read(&self.timeout_fallback, stream)
    }

    /// Current redirect count for the `(from, to)` pair.
    pub fn redirects(&self, from: StreamId, to: StreamId) -> u64 {
        let map = self.redirects.lock().unwrap();
        map.get(&(from, to)).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn read(map: &Mutex<HashMap<StreamId, AtomicU64>>, stream: StreamId) -> u64 {
        let map = map.lock().unwrap();
        map.get(&stream).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn bump(map: &Mutex<HashMap<StreamId, AtomicU64>>, stream: StreamId) {
        let mut map = map.lock().unwrap();
        map.entry(stream).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }
}

impl RouteCounters for AtomicCounters {
    fn inc_delivered(&self, stream: StreamId) {
        Self::bump(&self.delivered, stream);
    }

    fn inc_discarded(&self, stream: StreamId) {
        Self::bump(&self.discarded, stream);
    }

    fn inc_timeout_fallback(&self, stream: StreamId) {
        Self::bump(&self.timeout_fallback, stream);
    }

    fn inc_redirect(&self, from: StreamId, to: StreamId) {
        let mut map = self.redirects.lock().unwrap();
        map.entry((from, to)).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }
}
