// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A flat, unordered string-keyed byte-value side channel carried by every
//! [`crate::message::Message`].

use std::collections::HashMap;

/// String→bytes key-value map with deep-copy clone semantics.
///
/// Missing keys read as empty bytes rather than an error or `None`; this
/// mirrors the source behavior and keeps modulator code free of Option
/// handling for the common "tag not set yet" case.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    entries: HashMap<String, Vec<u8>>,
}

impl Metadata {
    /// An empty metadata map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, overwriting any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Read `key`. Missing keys yield an empty slice, never an error.
    pub fn get(&self, key: &str) -> &[u8] {
        self.entries.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Remove `key` if present, returning its prior value.
    pub fn delete(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    /// Whether `key` is present (note: a key set to empty bytes still
    /// answers `true`, distinguishing it from a missing key).
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries. No ordering is guaranteed.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Build a `Metadata` from an iterator of owned key/value pairs.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let mut m = Self::new();
        for (k, v) in entries {
            m.set(k, v);
        }
        m
    }
}
