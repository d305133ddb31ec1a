//! QPACK decoder (RFC 9204 §4.4, §4.5 decode side).
//!
//! Sections whose Required Insert Count exceeds the current insert count
//! are parked on a bounded queue and retried after encoder-stream
//! instructions arrive. Every processed insert is signalled back with an
//! Insert Count Increment so the peer's known-received count tracks the
//! table exactly.

use bytes::Bytes;
use tracing::trace;

use crate::error::H3Error;

use super::static_table::static_entry;
use super::table::DynamicTable;
use super::{decode_prefix_int, decode_string, encode_prefix_int};

/// Outcome of a section decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Decoded fields plus bytes to send on our decoder stream
    /// (Section Acknowledgment), empty when none is required.
    Fields { fields: Vec<(String, String)>, ack: Vec<u8> },
    /// The section references entries not yet inserted.
    Blocked,
}

/// Field-section decoder for one connection.
pub struct Decoder {
    table: DynamicTable,
    /// Capacity bound we advertised in SETTINGS.
    max_capacity: u64,
    max_blocked: usize,
    blocked: Vec<(u64, Bytes)>,
}

impl Decoder {
    pub fn new(max_capacity: u64, max_blocked: usize) -> Self {
        Decoder {
            table: DynamicTable::default(),
            max_capacity,
            max_blocked,
            blocked: Vec::new(),
        }
    }

    pub fn insert_count(&self) -> u64 {
        self.table.insert_count()
    }

    /// Consume instructions from the peer's encoder stream.
    ///
    /// Returns `(consumed, decoder_stream_bytes)`; the bytes carry an
    /// Insert Count Increment when entries were added.
    pub fn on_encoder_instructions(
        &mut self,
        buf: &[u8],
    ) -> Result<(usize, Vec<u8>), H3Error> {
        let mut consumed = 0;
        let mut inserted = 0u64;
        loop {
            let rest = &buf[consumed..];
            let Some(&first) = rest.first() else { break };
            if first & 0x80 != 0 {
                // Insert With Name Reference: 1 T idx(6), value string.
                let Some((fb, index, used)) = decode_prefix_int(rest, 6)? else { break };
                let Some((value, vused)) = decode_string(&rest[used..], 7)? else { break };
                let name = if fb & 0x40 != 0 {
                    static_entry(index)
                        .ok_or(H3Error::QpackEncoderStream("static index out of range"))?
                        .0
                        .to_string()
                } else {
                    // Relative to the current insert count.
                    let abs = self
                        .table
                        .insert_count()
                        .checked_sub(index + 1)
                        .ok_or(H3Error::QpackEncoderStream("dynamic name index"))?;
                    self.table
                        .get(abs)
                        .ok_or(H3Error::QpackEncoderStream("evicted name reference"))?
                        .0
                        .to_string()
                };
                self.table.insert(&name, &value)?;
                inserted += 1;
                consumed += used + vused;
            } else if first & 0x40 != 0 {
                // Insert Without Name Reference: 01 H namelen(5)...
                let Some((name, nused)) = decode_string(rest, 5)? else { break };
                let Some((value, vused)) = decode_string(&rest[nused..], 7)? else { break };
                self.table.insert(&name, &value)?;
                inserted += 1;
                consumed += nused + vused;
            } else if first & 0x20 != 0 {
                // Set Dynamic Table Capacity: 001 cap(5).
                let Some((_, capacity, used)) = decode_prefix_int(rest, 5)? else { break };
                if capacity > self.max_capacity {
                    return Err(H3Error::QpackEncoderStream("capacity beyond our limit"));
                }
                self.table.set_capacity(capacity);
                consumed += used;
            } else {
                // Duplicate: 000 idx(5).
                let Some((_, index, used)) = decode_prefix_int(rest, 5)? else { break };
                let abs = self
                    .table
                    .insert_count()
                    .checked_sub(index + 1)
                    .ok_or(H3Error::QpackEncoderStream("duplicate index"))?;
                let (name, value) = self
                    .table
                    .get(abs)
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .ok_or(H3Error::QpackEncoderStream("duplicate of evicted entry"))?;
                self.table.insert(&name, &value)?;
                inserted += 1;
                consumed += used;
            }
        }

        let mut out = Vec::new();
        if inserted > 0 {
            // Insert Count Increment: 00 increment(6).
            encode_prefix_int(&mut out, inserted, 6, 0);
            trace!(inserted, total = self.table.insert_count(), "qpack inserts applied");
        }
        Ok((consumed, out))
    }

    /// Attempt to decode a field section received on `stream_id`.
    pub fn decode_section(
        &mut self,
        stream_id: u64,
        data: &[u8],
    ) -> Result<DecodeOutcome, H3Error> {
        let Some((_, ric_encoded, used)) = decode_prefix_int(data, 8)? else {
            return Err(H3Error::QpackDecompression("truncated section prefix"));
        };
        let ric = self.reconstruct_ric(ric_encoded)?;
        if ric > self.table.insert_count() {
            if self.blocked.len() >= self.max_blocked {
                return Err(H3Error::QpackDecompression("too many blocked streams"));
            }
            trace!(stream_id, ric, "section blocked on inserts");
            self.blocked.push((stream_id, Bytes::copy_from_slice(data)));
            return Ok(DecodeOutcome::Blocked);
        }

        let rest = &data[used..];
        let Some((sign_byte, delta, dused)) = decode_prefix_int(rest, 7)? else {
            return Err(H3Error::QpackDecompression("truncated base"));
        };
        let base = if sign_byte & 0x80 == 0 {
            ric + delta
        } else {
            ric.checked_sub(delta + 1)
                .ok_or(H3Error::QpackDecompression("negative base"))?
        };

        let mut fields = Vec::new();
        let mut cursor = &rest[dused..];
        while !cursor.is_empty() {
            let first = cursor[0];
            if first & 0x80 != 0 {
                // Indexed Field Line: 1 T idx(6).
                let Some((fb, index, used)) = decode_prefix_int(cursor, 6)? else {
                    return Err(H3Error::QpackDecompression("truncated field line"));
                };
                let (name, value) = if fb & 0x40 != 0 {
                    let (n, v) = static_entry(index)
                        .ok_or(H3Error::QpackDecompression("static index"))?;
                    (n.to_string(), v.to_string())
                } else {
                    let abs = base
                        .checked_sub(index + 1)
                        .ok_or(H3Error::QpackDecompression("relative index"))?;
                    let (n, v) = self
                        .table
                        .get(abs)
                        .ok_or(H3Error::QpackDecompression("missing dynamic entry"))?;
                    (n.to_string(), v.to_string())
                };
                fields.push((name, value));
                cursor = &cursor[used..];
            } else if first & 0x40 != 0 {
                // Literal With Name Reference: 01 N T idx(4).
                let Some((fb, index, used)) = decode_prefix_int(cursor, 4)? else {
                    return Err(H3Error::QpackDecompression("truncated field line"));
                };
                let name = if fb & 0x10 != 0 {
                    static_entry(index)
                        .ok_or(H3Error::QpackDecompression("static name index"))?
                        .0
                        .to_string()
                } else {
                    let abs = base
                        .checked_sub(index + 1)
                        .ok_or(H3Error::QpackDecompression("relative name index"))?;
                    self.table
                        .get(abs)
                        .ok_or(H3Error::QpackDecompression("missing dynamic name"))?
                        .0
                        .to_string()
                };
                let Some((value, vused)) = decode_string(&cursor[used..], 7)? else {
                    return Err(H3Error::QpackDecompression("truncated literal value"));
                };
                fields.push((name, value));
                cursor = &cursor[used + vused..];
            } else if first & 0x20 != 0 {
                // Literal With Literal Name: 001 N H namelen(3).
                let Some((name, nused)) = decode_string(cursor, 3)? else {
                    return Err(H3Error::QpackDecompression("truncated literal name"));
                };
                let Some((value, vused)) = decode_string(&cursor[nused..], 7)? else {
                    return Err(H3Error::QpackDecompression("truncated literal value"));
                };
                fields.push((name, value));
                cursor = &cursor[nused + vused..];
            } else if first & 0x10 != 0 {
                // Indexed Field Line With Post-Base Index: 0001 idx(4).
                let Some((_, index, used)) = decode_prefix_int(cursor, 4)? else {
                    return Err(H3Error::QpackDecompression("truncated field line"));
                };
                let (n, v) = self
                    .table
                    .get(base + index)
                    .ok_or(H3Error::QpackDecompression("post-base entry missing"))?;
                fields.push((n.to_string(), v.to_string()));
                cursor = &cursor[used..];
            } else {
                // Literal With Post-Base Name Reference: 0000 N idx(3).
                let Some((_, index, used)) = decode_prefix_int(cursor, 3)? else {
                    return Err(H3Error::QpackDecompression("truncated field line"));
                };
                let name = self
                    .table
                    .get(base + index)
                    .ok_or(H3Error::QpackDecompression("post-base name missing"))?
                    .0
                    .to_string();
                let Some((value, vused)) = decode_string(&cursor[used..], 7)? else {
                    return Err(H3Error::QpackDecompression("truncated literal value"));
                };
                fields.push((name, value));
                cursor = &cursor[used + vused..];
            }
        }

        let mut ack = Vec::new();
        if ric > 0 {
            // Section Acknowledgment: 1 streamid(7).
            encode_prefix_int(&mut ack, stream_id, 7, 0b1000_0000);
        }
        Ok(DecodeOutcome::Fields { fields, ack })
    }

    /// Sections that may have become decodable after new inserts.
    pub fn take_unblocked(&mut self) -> Vec<(u64, Bytes)> {
        let insert_count = self.table.insert_count();
        let mut ready = Vec::new();
        let mut still_blocked = Vec::new();
        for (stream_id, data) in std::mem::take(&mut self.blocked) {
            let blocked = match decode_prefix_int(&data, 8) {
                Ok(Some((_, encoded, _))) => self
                    .reconstruct_ric_with(encoded, insert_count)
                    .map(|ric| ric > insert_count)
                    .unwrap_or(false),
                _ => false,
            };
            if blocked {
                still_blocked.push((stream_id, data));
            } else {
                ready.push((stream_id, data));
            }
        }
        self.blocked = still_blocked;
        ready
    }

    /// Drop any parked section for a cancelled stream; returns the Stream
    /// Cancellation instruction to emit.
    pub fn cancel_stream(&mut self, stream_id: u64) -> Vec<u8> {
        self.blocked.retain(|(id, _)| *id != stream_id);
        let mut out = Vec::new();
        // Stream Cancellation: 01 streamid(6).
        encode_prefix_int(&mut out, stream_id, 6, 0b0100_0000);
        out
    }

    fn reconstruct_ric(&self, encoded: u64) -> Result<u64, H3Error> {
        self.reconstruct_ric_with(encoded, self.table.insert_count())
    }

    /// RFC 9204 §4.5.1.1 Required Insert Count reconstruction.
    fn reconstruct_ric_with(&self, encoded: u64, total_inserts: u64) -> Result<u64, H3Error> {
        if encoded == 0 {
            return Ok(0);
        }
        let max_entries = self.max_capacity / super::ENTRY_OVERHEAD;
        let full_range = 2 * max_entries;
        if full_range == 0 || encoded > full_range {
            return Err(H3Error::QpackDecompression("required insert count range"));
        }
        let max_value = total_inserts + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut ric = max_wrapped + encoded - 1;
        if ric > max_value {
            if ric <= full_range {
                return Err(H3Error::QpackDecompression("required insert count wrap"));
            }
            ric -= full_range;
        }
        if ric == 0 {
            return Err(H3Error::QpackDecompression("zero required insert count"));
        }
        Ok(ric)
    }
}
