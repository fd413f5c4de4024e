// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The persisted message format: a length-delimited, tagged binary record
//! that survives process restarts and tolerates fields it doesn't know
//! about, matching the encode-by-hand, big-endian-length-prefixed idiom the
//! rest of this codebase's ancestry uses for wire framing.

use crate::message::Message;
use crate::metadata::Metadata;
use crate::stream_id::StreamId;
use crate::error::WireError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TAG_STREAM_ID: u8 = 1;
const TAG_PREV_STREAM_ID: u8 = 2;
const TAG_ORIG_STREAM_ID: u8 = 3;
const TAG_TIMESTAMP_NS: u8 = 4;
const TAG_DATA: u8 = 5;
const TAG_ORIGINAL: u8 = 6;

/// Encode `msg` into the tagged binary record described in the module docs.
///
/// Field 6 (`original`) is omitted entirely when no snapshot was ever taken,
/// per the spec's tolerance for that field's absence.
pub fn serialize(msg: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    write_u64_field(&mut out, TAG_STREAM_ID, msg.stream_id().raw());
    write_u64_field(&mut out, TAG_PREV_STREAM_ID, msg.prev_stream_id().raw());
    write_u64_field(&mut out, TAG_ORIG_STREAM_ID, msg.orig_stream_id().raw());
    write_i64_field(&mut out, TAG_TIMESTAMP_NS, timestamp_ns(msg));
    write_block_field(&mut out, TAG_DATA, msg.payload(), msg.metadata());
    if let (Some(payload), Some(metadata)) = (msg.original_payload(), msg.original_metadata()) {
        write_block_field(&mut out, TAG_ORIGINAL, payload, metadata);
    }
    out
}

/// Decode a record produced by [`serialize`]. Unknown tag numbers are
/// skipped rather than rejected, so old readers tolerate new writers.
pub fn deserialize(bytes: &[u8]) -> Result<Message, WireError> {
    let mut stream_id = None;
    let mut prev_stream_id = None;
    let mut orig_stream_id = None;
    let mut timestamp_ns = None;
    let mut data: Option<(Vec<u8>, Metadata)> = None;
    let mut original: Option<(Vec<u8>, Metadata)> = None;

    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let tag = read_u8(bytes, &mut cursor, "tag")?;
        let len = read_u32(bytes, &mut cursor, "length")? as usize;
        let field = read_slice(bytes, &mut cursor, len, "field body")?;
        match tag {
            TAG_STREAM_ID => stream_id = Some(StreamId::from_raw(decode_u64(field, "streamID")?)),
            TAG_PREV_STREAM_ID => prev_stream_id = Some(StreamId::from_raw(decode_u64(field, "prevStreamID")?)),
            TAG_ORIG_STREAM_ID => orig_stream_id = Some(StreamId::from_raw(decode_u64(field, "origStreamID")?)),
            TAG_TIMESTAMP_NS => timestamp_ns = Some(decode_u64(field, "timestampNs")? as i64),
            TAG_DATA => data = Some(decode_block(field)?),
            TAG_ORIGINAL => original = Some(decode_block(field)?),
            _ => {} // unknown field: skip, forward-compatible
        }
    }

    let stream_id = stream_id.ok_or(WireError::Truncated { field: "streamID" })?;
    let prev_stream_id = prev_stream_id.ok_or(WireError::Truncated { field: "prevStreamID" })?;
    let orig_stream_id = orig_stream_id.ok_or(WireError::Truncated { field: "origStreamID" })?;
    let timestamp_ns = timestamp_ns.ok_or(WireError::Truncated { field: "timestampNs" })?;
    let (payload, metadata) = data.ok_or(WireError::Truncated { field: "data" })?;

    Ok(Message::from_parts(
        payload,
        metadata,
        stream_id,
        prev_stream_id,
        orig_stream_id,
        nanos_to_system_time(timestamp_ns),
        original,
    ))
}

fn timestamp_ns(msg: &Message) -> i64 {
    match msg.timestamp().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

fn nanos_to_system_time(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos((-nanos) as u64)
    }
}

fn write_u64_field(out: &mut Vec<u8>, tag: u8, value: u64) {
    out.push(tag);
    out.extend_from_slice(&(8u32).to_be_bytes());
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i64_field(out: &mut Vec<u8>, tag: u8, value: i64) {
    out.push(tag);
    out.extend_from_slice(&(8u32).to_be_bytes());
    out.extend_from_slice(&value.to_be_bytes());
}

/// `data`/`original` share the same inner shape: `[data_len][data][count][(key_len][key][val_len][val)*]`.
fn write_block_field(out: &mut Vec<u8>, tag: u8, payload: &[u8], metadata: &Metadata) {
    let mut body = Vec::new();
    body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    body.extend_from_slice(payload);
    body.extend_from_slice(&(metadata.len() as u32).to_be_bytes());
    for (key, value) in metadata.iter() {
        body.extend_from_slice(&(key.len() as u16).to_be_bytes());
        body.extend_from_slice(key.as_bytes());
        body.extend_from_slice(&(value.len() as u32).to_be_bytes());
        body.extend_from_slice(value);
    }
    out.push(tag);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
}

fn decode_block(field: &[u8]) -> Result<(Vec<u8>, Metadata), WireError> {
    let mut cursor = 0usize;
    let data_len = read_u32(field, &mut cursor, "data.len")? as usize;
    let payload = read_slice(field, &mut cursor, data_len, "data.bytes")?.to_vec();
    let count = read_u32(field, &mut cursor, "data.metadata.count")?;
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key_len = read_u16(field, &mut cursor, "data.metadata.key.len")? as usize;
        let key_bytes = read_slice(field, &mut cursor, key_len, "data.metadata.key.bytes")?;
        let key = std::str::from_utf8(key_bytes).map_err(|_| WireError::InvalidMetadataKey)?.to_string();
        let val_len = read_u32(field, &mut cursor, "data.metadata.value.len")? as usize;
        let value = read_slice(field, &mut cursor, val_len, "data.metadata.value.bytes")?.to_vec();
        metadata.set(key, value);
    }
    Ok((payload, metadata))
}

fn decode_u64(field: &[u8], name: &'static str) -> Result<u64, WireError> {
    let arr: [u8; 8] = field.try_into().map_err(|_| WireError::LengthOutOfBounds {
        field: name,
        declared: 8,
        remaining: field.len(),
    })?;
    Ok(u64::from_be_bytes(arr))
}

fn read_u8(bytes: &[u8], cursor: &mut usize, field: &'static str) -> Result<u8, WireError> {
    let b = *bytes.get(*cursor).ok_or(WireError::Truncated { field })?;
    *cursor += 1;
    Ok(b)
}

fn read_u16(bytes: &[u8], cursor: &mut usize, field: &'static str) -> Result<u16, WireError> {
    let slice = read_slice(bytes, cursor, 2, field)?;
    Ok(u16::from_be_bytes(slice.try_into().unwrap()))
}

fn read_u32(bytes: &[u8], cursor: &mut usize, field: &'static str) -> Result<u32, WireError> {
    let slice = read_slice(bytes, cursor, 4, field)?;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize, field: &'static str) -> Result<&'a [u8], WireError> {
    let remaining = bytes.len().saturating_sub(*cursor);
    if len > remaining {
        return Err(WireError::LengthOutOfBounds { field, declared: len, remaining });
    }
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}
