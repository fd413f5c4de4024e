// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The central entity the routing core moves around: payload plus routing
//! provenance plus a freezable "original" snapshot.

use crate::metadata::Metadata;
use crate::pool::BufferPool;
use crate::source::ConsumerHandle;
use crate::stream_id::StreamId;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// A write-once snapshot of a message's payload, metadata and original
/// stream, taken by [`Message::freeze_original`] and restored by
/// [`Message::clone_original`].
#[derive(Debug, Clone)]
struct Original {
    payload: Vec<u8>,
    metadata: Metadata,
}

/// The message type the routing core passes between consumers, routers and
/// producers.
///
/// `clone()` is a *working* copy: payload is deep-copied, metadata is shared
/// by reference (copy-on-write at the consumer/modulator boundary) unless the
/// caller explicitly deep-copies it first. `clone_original()` is a *pristine*
/// copy: it always deep-copies from the frozen snapshot, implicitly freezing
/// one first if none exists.
pub struct Message {
    payload: Vec<u8>,
    metadata: Arc<Metadata>,
    stream_id: StreamId,
    prev_stream_id: StreamId,
    orig_stream_id: StreamId,
    original: Option<Original>,
    source: Weak<dyn ConsumerHandle>,
    timestamp: SystemTime,
    pool: Option<Arc<BufferPool>>,
}

impl Message {
    /// Build a new message. `stream_id` becomes both the current and the
    /// original stream; `data` is always copied, never aliased.
    pub fn new(source: Weak<dyn ConsumerHandle>, data: &[u8], metadata: Metadata, stream_id: StreamId) -> Self {
        Self {
            payload: data.to_vec(),
            metadata: Arc::new(metadata),
            stream_id,
            prev_stream_id: stream_id,
            orig_stream_id: stream_id,
            original: None,
            source,
            timestamp: SystemTime::now(),
            pool: None,
        }
    }

    /// Attach a buffer pool so that `resize`/`extend`/`store` reuse recycled
    /// allocations and `Drop` releases the payload back to it.
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// The stream this message is currently being routed to.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// The stream held immediately before the last `set_stream`.
    pub fn prev_stream_id(&self) -> StreamId {
        self.prev_stream_id
    }

    /// The stream this message was created on (or last pinned via
    /// `set_stream_as_original`).
    pub fn orig_stream_id(&self) -> StreamId {
        self.orig_stream_id
    }

    /// Creation timestamp, second-resolution at the consumer.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The weak back-reference to the producing consumer.
    pub fn source(&self) -> &Weak<dyn ConsumerHandle> {
        &self.source
    }

    /// Read-only view of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Read-only view of the metadata. Created empty on first read if the
    /// message has none yet — callers never see a missing map, only an
    /// empty one.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable access to metadata, cloning it first if it is still shared
    /// (copy-on-write), so mutation never affects a sibling clone.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        Arc::make_mut(&mut self.metadata)
    }

    /// Overwrite the payload with `bytes`, resizing (and possibly
    /// reallocating) to fit.
    pub fn store(&mut self, bytes: &[u8]) {
        let mut buf = self.take_buffer(bytes.len());
        buf.clear();
        buf.extend_from_slice(bytes);
        self.payload = buf;
    }

    /// Set the payload length to `n`, reusing capacity when possible.
    /// Contents past the old length are *not* preserved.
    pub fn resize(&mut self, n: usize) -> &mut Vec<u8> {
        if n > self.payload.capacity() {
            let mut buf = self.take_buffer(n);
            buf.resize(n, 0);
            self.release_buffer(std::mem::replace(&mut self.payload, buf));
        } else {
            self.payload.clear();
            self.payload.resize(n, 0);
        }
        &mut self.payload
    }

    /// Set the payload length to `n`, reusing capacity when possible.
    /// Contents up to `min(old_len, n)` are preserved.
    pub fn extend(&mut self, n: usize) -> &mut Vec<u8> {
        if n > self.payload.capacity() {
            let mut buf = self.take_buffer(n);
            buf.extend_from_slice(&self.payload);
            buf.resize(n, 0);
            self.release_buffer(std::mem::replace(&mut self.payload, buf));
        } else {
            self.payload.resize(n, 0);
        }
        &mut self.payload
    }

    fn take_buffer(&self, capacity: usize) -> Vec<u8> {
        match &self.pool {
            Some(pool) => pool.take(capacity),
            None => Vec::with_capacity(capacity),
        }
    }

    fn release_buffer(&self, buf: Vec<u8>) {
        if let Some(pool) = &self.pool {
            pool.release(buf);
        }
    }

    /// Re-target the message: `prev_stream_id` becomes the current
    /// `stream_id`, then `stream_id` becomes `id`. `orig_stream_id` is
    /// untouched.
    pub fn set_stream(&mut self, id: StreamId) {
        self.prev_stream_id = self.stream_id;
        self.stream_id = id;
    }

    /// As `set_stream`, but also re-pins `orig_stream_id` to `id`. Used by
    /// consumers that re-target a message before its first routing pass.
    pub fn set_stream_as_original(&mut self, id: StreamId) {
        self.set_stream(id);
        self.orig_stream_id = id;
    }

    /// Take a snapshot of the current payload and metadata, if none has been
    /// taken yet. Idempotent: later calls are no-ops.
    pub fn freeze_original(&mut self) {
        if self.original.is_some() {
            return;
        }
        self.original = Some(Original {
            payload: self.payload.clone(),
            metadata: (*self.metadata).clone(),
        });
    }

    /// Whether a snapshot has been taken.
    pub fn has_original(&self) -> bool {
        self.original.is_some()
    }

    /// The frozen snapshot's payload, if one has been taken. Used by the
    /// wire format; ordinary callers want [`Message::clone_original`].
    pub fn original_payload(&self) -> Option<&[u8]> {
        self.original.as_ref().map(|o| o.payload.as_slice())
    }

    /// The frozen snapshot's metadata, if one has been taken.
    pub fn original_metadata(&self) -> Option<&Metadata> {
        self.original.as_ref().map(|o| &o.metadata)
    }

    /// Build a message from already-decoded parts, bypassing `new`'s
    /// "always hash the current instant" timestamp and
    /// "current == original" stream-id defaults. Used by the wire format to
    /// reconstruct a message exactly as it was serialized; the resulting
    /// message has no `source` (that back-reference is never serialized).
    pub fn from_parts(
        payload: Vec<u8>,
        metadata: Metadata,
        stream_id: StreamId,
        prev_stream_id: StreamId,
        orig_stream_id: StreamId,
        timestamp: SystemTime,
        original: Option<(Vec<u8>, Metadata)>,
    ) -> Self {
        Self {
            payload,
            metadata: Arc::new(metadata),
            stream_id,
            prev_stream_id,
            orig_stream_id,
            original: original.map(|(payload, metadata)| Original { payload, metadata }),
            source: Weak::new(),
            timestamp,
            pool: None,
        }
    }

    /// A working copy: payload deep-copied, metadata shared by reference,
    /// all stream ids and the source/timestamp preserved.
    pub fn clone_message(&self) -> Message {
        Message {
            payload: self.payload.clone(),
            metadata: Arc::clone(&self.metadata),
            stream_id: self.stream_id,
            prev_stream_id: self.prev_stream_id,
            orig_stream_id: self.orig_stream_id,
            original: self.original.clone(),
            source: self.source.clone(),
            timestamp: self.timestamp,
            pool: self.pool.clone(),
        }
    }

    /// Restore the as-ingested form: freezes a snapshot first if none
    /// exists, then returns a clone whose payload/metadata come from that
    /// snapshot and whose `stream_id` is reset to `orig_stream_id`.
    pub fn clone_original(&mut self) -> Message {
        self.freeze_original();
        let snapshot = self.original.as_ref().expect("freeze_original just ran");
        Message {
            payload: snapshot.payload.clone(),
            metadata: Arc::new(snapshot.metadata.clone()),
            stream_id: self.orig_stream_id,
            prev_stream_id: self.stream_id,
            orig_stream_id: self.orig_stream_id,
            original: self.original.clone(),
            source: self.source.clone(),
            timestamp: self.timestamp,
            pool: self.pool.clone(),
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.payload);
        self.release_buffer(buf);
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("stream_id", &self.stream_id)
            .field("prev_stream_id", &self.prev_stream_id)
            .field("orig_stream_id", &self.orig_stream_id)
            .field("payload_len", &self.payload.len())
            .field("has_original", &self.has_original())
            .finish()
    }
}
