// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The core's error taxonomy.
//!
//! Only deterministic, programmer-facing failures surface as [`RouteError`].
//! Transient failures (full queue, closed queue, timeout) are absorbed by the
//! fallback mechanism and only ever show up as counters and log lines; see
//! `RouteCounters` in `counters.rs`.

use crate::stream_id::StreamId;
use thiserror::Error;

/// Errors that can escape [`crate::router::route`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// A modulator chain asked to redirect a message back to the router it
    /// came from, which would recurse indefinitely.
    #[error("routing loop: stream {stream} redirected to itself via router {router}")]
    RoutingLoop {
        /// The stream id the loop was detected on.
        stream: StreamId,
        /// The router that detected the loop (same id as `stream`).
        router: StreamId,
    },
}

/// Errors from the wire format in `wire.rs`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before a complete field could be read.
    #[error("truncated message while reading field {field}")]
    Truncated {
        /// Name of the field being read when the buffer ran out.
        field: &'static str,
    },
    /// A length-prefixed field declared a length larger than the remaining
    /// buffer.
    #[error("field {field} declares length {declared} but only {remaining} bytes remain")]
    LengthOutOfBounds {
        /// Name of the offending field.
        field: &'static str,
        /// The length the frame claimed.
        declared: usize,
        /// The bytes actually left in the buffer.
        remaining: usize,
    },
    /// A metadata key was not valid UTF-8.
    #[error("metadata key is not valid utf-8")]
    InvalidMetadataKey,
}
