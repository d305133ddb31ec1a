//! QPACK encoder (RFC 9204 §4.3, §4.5 encode side).
//!
//! Encoding policy: static-table matches are used directly; repeatable
//! custom fields are inserted into the dynamic table for later sections,
//! but a section only ever references entries the peer has acknowledged.
//! Sections therefore never block, which trivially respects any
//! `SETTINGS_QPACK_BLOCKED_STREAMS` value.

use std::collections::HashMap;
use std::collections::VecDeque;

use tracing::trace;

use crate::error::H3Error;

use super::static_table::{static_lookup, StaticMatch};
use super::table::DynamicTable;
use super::{decode_prefix_int, encode_prefix_int, encode_string, ENTRY_OVERHEAD};

/// Dynamic table capacity this encoder will use at most.
const DEFAULT_CAPACITY: u64 = 4096;

/// Values longer than this are not worth a table slot.
const MAX_INDEXED_VALUE_LEN: usize = 128;

enum Rep {
    StaticIndexed(u64),
    DynamicIndexed(u64),
    LiteralStaticName(u64, String),
    LiteralLiteral(String, String),
}

/// Field-section encoder for one connection.
pub struct Encoder {
    table: DynamicTable,
    peer_max_capacity: u64,
    peer_blocked_streams: u64,
    capacity_pending: bool,
    known_received: u64,
    /// Required-insert-counts of unacknowledged sections, per stream.
    unacked: HashMap<u64, VecDeque<u64>>,
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            table: DynamicTable::default(),
            peer_max_capacity: 0,
            peer_blocked_streams: 0,
            capacity_pending: false,
            known_received: 0,
            unacked: HashMap::new(),
        }
    }

    /// Apply the peer's SETTINGS once they arrive on the control stream.
    pub fn apply_settings(&mut self, max_table_capacity: u64, blocked_streams: u64) {
        self.peer_max_capacity = max_table_capacity;
        self.peer_blocked_streams = blocked_streams;
        if max_table_capacity > 0 {
            self.capacity_pending = true;
        }
    }

    pub fn known_received_count(&self) -> u64 {
        self.known_received
    }

    pub fn insert_count(&self) -> u64 {
        self.table.insert_count()
    }

    /// Encode one field section.
    ///
    /// Returns `(field_section, encoder_stream_bytes)`; the encoder stream
    /// bytes must be written to the encoder stream before or with the
    /// packet carrying the section.
    pub fn encode(
        &mut self,
        stream_id: u64,
        fields: &[(String, String)],
    ) -> (Vec<u8>, Vec<u8>) {
        let mut instructions = Vec::new();

        if self.capacity_pending {
            let capacity = self.peer_max_capacity.min(DEFAULT_CAPACITY);
            self.table.set_capacity(capacity);
            // Set Dynamic Table Capacity: 001xxxxx.
            encode_prefix_int(&mut instructions, capacity, 5, 0b0010_0000);
            self.capacity_pending = false;
            trace!(capacity, "qpack dynamic table capacity set");
        }

        let mut reps = Vec::with_capacity(fields.len());
        let mut max_ref: Option<u64> = None;
        for (name, value) in fields {
            let rep = self.represent(name, value, &mut instructions);
            if let Rep::DynamicIndexed(abs) = rep {
                max_ref = Some(max_ref.map_or(abs, |m| m.max(abs)));
            }
            reps.push(rep);
        }

        let ric = max_ref.map_or(0, |m| m + 1);
        let base = ric;

        let mut section = Vec::with_capacity(64);
        let ric_encoded = if ric == 0 {
            0
        } else {
            ric % (2 * self.table.max_entries()) + 1
        };
        encode_prefix_int(&mut section, ric_encoded, 8, 0);
        // Delta Base with S=0: base == ric.
        encode_prefix_int(&mut section, 0, 7, 0);

        for rep in reps {
            match rep {
                Rep::StaticIndexed(i) => {
                    // Indexed Field Line, T=1.
                    encode_prefix_int(&mut section, i, 6, 0b1100_0000);
                }
                Rep::DynamicIndexed(abs) => {
                    // Indexed Field Line, T=0, base-relative.
                    encode_prefix_int(&mut section, base - abs - 1, 6, 0b1000_0000);
                }
                Rep::LiteralStaticName(i, value) => {
                    // Literal Field Line With Name Reference, N=0, T=1.
                    encode_prefix_int(&mut section, i, 4, 0b0101_0000);
                    encode_string(&mut section, &value, 7, 0);
                }
                Rep::LiteralLiteral(name, value) => {
                    // Literal Field Line With Literal Name.
                    encode_string(&mut section, &name, 3, 0b0010_0000);
                    encode_string(&mut section, &value, 7, 0);
                }
            }
        }

        if ric > 0 {
            self.unacked.entry(stream_id).or_default().push_back(ric);
        }
        (section, instructions)
    }

    fn represent(&mut self, name: &str, value: &str, instructions: &mut Vec<u8>) -> Rep {
        match static_lookup(name, value) {
            StaticMatch::Full(i) => Rep::StaticIndexed(i),
            StaticMatch::Name(i) => {
                if let Some(abs) = self.usable_dynamic(name, value) {
                    return Rep::DynamicIndexed(abs);
                }
                if self.should_index(name, value) && self.table.find(name, value).is_none() {
                    // Insert With Name Reference: 1 T=1 nameidx(6), value.
                    encode_prefix_int(instructions, i, 6, 0b1100_0000);
                    encode_string(instructions, value, 7, 0);
                    let _ = self.table.insert(name, value);
                }
                Rep::LiteralStaticName(i, value.to_string())
            }
            StaticMatch::None => {
                if let Some(abs) = self.usable_dynamic(name, value) {
                    return Rep::DynamicIndexed(abs);
                }
                if self.should_index(name, value) && self.table.find(name, value).is_none() {
                    // Insert Without Name Reference: 01 H namelen(5)...
                    encode_string(instructions, name, 5, 0b0100_0000);
                    encode_string(instructions, value, 7, 0);
                    let _ = self.table.insert(name, value);
                }
                Rep::LiteralLiteral(name.to_string(), value.to_string())
            }
        }
    }

    /// A dynamic entry is referenced only once the peer acknowledged it.
    fn usable_dynamic(&self, name: &str, value: &str) -> Option<u64> {
        let abs = self.table.find(name, value)?;
        (abs < self.known_received).then_some(abs)
    }

    fn should_index(&self, name: &str, value: &str) -> bool {
        if self.table.capacity() == 0 || value.len() > MAX_INDEXED_VALUE_LEN {
            return false;
        }
        // Credentials never enter the table.
        if name == "authorization" || name == "proxy-authorization" {
            return false;
        }
        name.len() as u64 + value.len() as u64 + ENTRY_OVERHEAD <= self.table.capacity()
    }

    /// Consume instructions from the peer's decoder stream.
    ///
    /// Returns how many bytes were consumed; the caller retains the rest
    /// until more data arrives.
    pub fn on_decoder_instructions(&mut self, buf: &[u8]) -> Result<usize, H3Error> {
        let mut consumed = 0;
        loop {
            let rest = &buf[consumed..];
            let Some(&first) = rest.first() else { return Ok(consumed) };
            if first & 0x80 != 0 {
                // Section Acknowledgment: stream id, 7-bit prefix.
                let Some((_, stream_id, used)) = decode_prefix_int(rest, 7)? else {
                    return Ok(consumed);
                };
                let ric = self
                    .unacked
                    .get_mut(&stream_id)
                    .and_then(|q| q.pop_front())
                    .ok_or(H3Error::QpackDecoderStream("ack without pending section"))?;
                self.known_received = self.known_received.max(ric);
                consumed += used;
            } else if first & 0x40 != 0 {
                // Stream Cancellation.
                let Some((_, stream_id, used)) = decode_prefix_int(rest, 6)? else {
                    return Ok(consumed);
                };
                self.unacked.remove(&stream_id);
                consumed += used;
            } else {
                // Insert Count Increment.
                let Some((_, increment, used)) = decode_prefix_int(rest, 6)? else {
                    return Ok(consumed);
                };
                if increment == 0 {
                    return Err(H3Error::QpackDecoderStream("zero increment"));
                }
                let next = self.known_received + increment;
                if next > self.table.insert_count() {
                    return Err(H3Error::QpackDecoderStream("increment beyond inserts"));
                }
                self.known_received = next;
                consumed += used;
            }
        }
    }
}
