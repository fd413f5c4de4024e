// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The non-owning back-reference from a [`crate::message::Message`] to the
//! consumer that produced it.

/// A handle a consumer exposes so messages can carry a weak reference back
/// to it, for response routing and diagnostics only.
///
/// A `Message` must never keep its source alive: it only ever holds a
/// `std::sync::Weak<dyn ConsumerHandle>`.
pub trait ConsumerHandle: Send + Sync {
    /// Human-readable name of the consumer, for logs and diagnostics.
    fn name(&self) -> &str;
}
