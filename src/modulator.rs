// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The filter/formatter contract a [`crate::router::Router`] runs over every
//! message it sees, and the four-valued verdict that drives routing.

use crate::message::Message;
use crate::stream_id::StreamId;

/// The outcome of running one [`Modulator`] over a message.
///
/// `Redirect` is this crate's explicit spelling of what the source expressed
/// implicitly (a modulator mutating `msg.streamID` and the router noticing a
/// mismatch after the fact). The router still honors that implicit form from
/// a modulator that mutates the stream and returns `Continue` — see
/// [`crate::router::route`] — but new modulators should prefer `Redirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Accepted as-is; run the next modulator (if any), then enqueue.
    Continue,
    /// Drop the message silently. Later modulators in the chain do not run.
    Discard,
    /// Restore the message's as-ingested payload/metadata and route that
    /// restored form to the router for the message's current stream.
    /// Later modulators in the chain do not run.
    Fallback,
    /// Retarget the message to `StreamId` and route it there instead.
    /// Later modulators in the chain do not run.
    Redirect(StreamId),
}

/// A filter/formatter a [`crate::router::Router`] runs, in configured order,
/// over every message bound for it.
///
/// A modulator may mutate the message in place (payload, metadata, stream)
/// and/or steer it elsewhere via its returned [`Verdict`]. Implementations
/// must be safe to call concurrently: a router may be driven by many
/// consumer tasks at once.
pub trait Modulator: Send + Sync {
    /// Inspect and possibly mutate `msg`, returning how the router should
    /// proceed.
    fn modulate(&self, msg: &mut Message) -> Verdict;
}

impl<M: Modulator + ?Sized> Modulator for Box<M> {
    fn modulate(&self, msg: &mut Message) -> Verdict {
        (**self).modulate(msg)
    }
}
