// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Control-channel signals shared by consumers and producers.

use num_derive::{FromPrimitive, ToPrimitive};
use tokio::sync::mpsc;

/// A signal sent over a plugin's control channel.
///
/// Ordinals are part of the external contract (e.g. wire or CLI encodings
/// that reference a signal by number) and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ControlSignal {
    /// Ask a consumer to stop ingesting and shut down.
    StopConsumer = 0,
    /// Ask a producer to stop draining and shut down.
    StopProducer = 1,
    /// Ask a plugin to rotate whatever external resource it owns (e.g. an
    /// output file). Not a shutdown signal; the core only forwards it.
    Roll = 2,
    /// First phase of a graceful shutdown: stop accepting new work but keep
    /// draining in-flight messages.
    PrepareStop = 3,
}

/// Build a bounded control channel: the sender side is handed to whatever
/// issues shutdown/roll commands (a CLI, a supervisor), the receiver is
/// consumed by [`crate::consumer::SimpleConsumer::run_control_loop`] or
/// [`crate::router::Router::run_control_loop`].
pub fn control_channel(capacity: usize) -> (mpsc::Sender<ControlSignal>, mpsc::Receiver<ControlSignal>) {
    mpsc::channel(capacity)
}
