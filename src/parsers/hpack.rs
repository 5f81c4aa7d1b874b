// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::{HashMap, VecDeque};

use once_cell::sync::Lazy;

use crate::models::error::{Error, Result};

/// RFC 7541 Appendix A static table, 1-indexed.
static STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// RFC 7541 Appendix B code lengths per symbol (0..=256). The code values
/// follow from canonical assignment: codes increase with symbol order
/// within a length, shifting left when the length grows.
#[rustfmt::skip]
static HUFFMAN_LENGTHS: [u8; 257] = [
    13, 23, 28, 28, 28, 28, 28, 28, 28, 24, 30, 28, 28, 30, 28, 28,
    28, 28, 28, 28, 28, 28, 30, 28, 28, 28, 28, 28, 28, 28, 28, 28,
     6, 10, 10, 12, 13,  6,  8, 11, 10, 10,  8, 11,  8,  6,  6,  6,
     5,  5,  5,  6,  6,  6,  6,  6,  6,  6,  7,  8, 15,  6, 12, 10,
    13,  6,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,
     7,  7,  7,  7,  7,  7,  7,  7,  8,  7,  8, 13, 19, 13, 14,  6,
    15,  5,  6,  5,  6,  5,  6,  6,  6,  5,  7,  7,  6,  6,  6,  5,
     6,  7,  6,  5,  5,  6,  7,  7,  7,  7,  7, 15, 11, 14, 13, 28,
    20, 22, 20, 20, 22, 22, 22, 23, 22, 23, 23, 23, 23, 23, 24, 23,
    24, 24, 22, 23, 24, 23, 23, 23, 23, 21, 22, 23, 22, 23, 23, 24,
    22, 21, 20, 22, 22, 23, 23, 21, 23, 22, 22, 24, 21, 22, 23, 23,
    21, 21, 22, 21, 23, 22, 23, 23, 20, 22, 22, 22, 23, 22, 22, 23,
    26, 26, 20, 19, 22, 23, 22, 25, 26, 26, 26, 27, 27, 26, 24, 25,
    19, 21, 26, 27, 27, 26, 27, 24, 21, 21, 26, 26, 28, 27, 27, 27,
    20, 24, 20, 21, 22, 21, 21, 23, 22, 22, 25, 25, 24, 24, 26, 23,
    27, 26, 26, 26, 27, 27, 27, 27, 27, 28, 27, 27, 27, 27, 27, 26,
    30,
];

/// (code, length) -> symbol decode map, built canonically from the length
/// table.
static HUFFMAN_DECODE: Lazy<HashMap<(u32, u8), u16>> = Lazy::new(|| {
    let mut symbols: Vec<(u16, u8)> = HUFFMAN_LENGTHS
        .iter()
        .enumerate()
        .map(|(sym, &len)| (sym as u16, len))
        .collect();
    symbols.sort_by_key(|&(sym, len)| (len, sym));

    let mut map = HashMap::with_capacity(257);
    let mut code = 0u32;
    let mut prev_len = 0u8;
    for (sym, len) in symbols {
        code <<= len - prev_len;
        prev_len = len;
        map.insert((code, len), sym);
        code += 1;
    }
    map
});

const EOS: u16 = 256;

/// Maximum accepted value for an HPACK variable-length integer.
const MAX_INTEGER: u64 = 1 << 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHeader {
    pub name: String,
    pub value: String,
}

/// HPACK decoder (RFC 7541): static + dynamic tables, N-bit-prefix
/// integers, Huffman strings, and the four representation families.
///
/// The dynamic table belongs to one sending direction of one connection.
#[derive(Debug)]
pub struct HpackDecoder {
    dynamic_table: VecDeque<(String, String)>,
    dynamic_table_size: usize,
    max_dynamic_table_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self {
            dynamic_table: VecDeque::new(),
            dynamic_table_size: 0,
            // RFC 7540 SETTINGS_HEADER_TABLE_SIZE default.
            max_dynamic_table_size: 4096,
        }
    }

    pub fn set_max_dynamic_table_size(&mut self, size: usize) {
        self.max_dynamic_table_size = size;
        self.evict();
    }

    pub fn dynamic_table_len(&self) -> usize {
        self.dynamic_table.len()
    }

    pub fn reset(&mut self) {
        self.dynamic_table.clear();
        self.dynamic_table_size = 0;
    }

    /// Decodes a complete header block.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<DecodedHeader>> {
        let mut headers = Vec::new();
        let mut cursor = data;

        while !cursor.is_empty() {
            let first = cursor[0];

            if first & 0x80 != 0 {
                // Indexed header field.
                let (index, rest) = decode_integer(cursor, 7)?;
                cursor = rest;
                let (name, value) = self.table_entry(index)?;
                headers.push(DecodedHeader { name, value });
            } else if first & 0xC0 == 0x40 {
                // Literal with incremental indexing.
                let (header, rest) = self.decode_literal(cursor, 6)?;
                cursor = rest;
                self.insert(header.name.clone(), header.value.clone());
                headers.push(header);
            } else if first & 0xE0 == 0x20 {
                // Dynamic table size update.
                let (size, rest) = decode_integer(cursor, 5)?;
                cursor = rest;
                let size = usize::try_from(size)
                    .map_err(|_| Error::malformed("HPACK", "table size overflow"))?;
                self.set_max_dynamic_table_size(size);
            } else {
                // Literal without indexing (0000) or never indexed (0001);
                // both use a 4-bit prefix and skip the table insert.
                let (header, rest) = self.decode_literal(cursor, 4)?;
                cursor = rest;
                headers.push(header);
            }
        }

        Ok(headers)
    }

    fn decode_literal<'a>(
        &self,
        data: &'a [u8],
        prefix_bits: u8,
    ) -> Result<(DecodedHeader, &'a [u8])> {
        let (name_index, rest) = decode_integer(data, prefix_bits)?;

        let (name, rest) = if name_index == 0 {
            decode_string(rest)?
        } else {
            let (name, _) = self.table_entry(name_index)?;
            (name, rest)
        };

        let (value, rest) = decode_string(rest)?;
        Ok((DecodedHeader { name, value }, rest))
    }

    fn table_entry(&self, index: u64) -> Result<(String, String)> {
        if index == 0 {
            return Err(Error::malformed("HPACK", "index 0"));
        }
        let index = index as usize;
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }
        let dyn_index = index - STATIC_TABLE.len() - 1;
        self.dynamic_table
            .get(dyn_index)
            .cloned()
            .ok_or_else(|| {
                Error::malformed("HPACK", format!("index {index} out of table"))
            })
    }

    fn insert(&mut self, name: String, value: String) {
        let entry_size = name.len() + value.len() + 32;
        self.dynamic_table_size += entry_size;
        self.dynamic_table.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.dynamic_table_size > self.max_dynamic_table_size {
            match self.dynamic_table.pop_back() {
                Some((name, value)) => {
                    self.dynamic_table_size -= name.len() + value.len() + 32;
                },
                None => {
                    self.dynamic_table_size = 0;
                    break;
                },
            }
        }
    }
}

/// N-bit-prefix integer (RFC 7541 §5.1).
fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(u64, &[u8])> {
    if data.is_empty() {
        return Err(Error::truncated(1, 0));
    }

    let mask = (1u16 << prefix_bits) - 1;
    let mut value = u64::from(data[0]) & u64::from(mask);
    if value < u64::from(mask) {
        return Ok((value, &data[1..]));
    }

    let mut shift = 0u32;
    for (i, &byte) in data[1..].iter().enumerate() {
        value += u64::from(byte & 0x7F) << shift;
        if value > MAX_INTEGER {
            return Err(Error::Sanity("hpack integer too large"));
        }
        if byte & 0x80 == 0 {
            return Ok((value, &data[i + 2..]));
        }
        shift += 7;
    }

    Err(Error::truncated(data.len() + 1, data.len()))
}

/// Length-prefixed string, Huffman bit in the high position.
fn decode_string(data: &[u8]) -> Result<(String, &[u8])> {
    if data.is_empty() {
        return Err(Error::truncated(1, 0));
    }
    let huffman = data[0] & 0x80 != 0;
    let (len, rest) = decode_integer(data, 7)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::truncated(len, rest.len()));
    }
    let raw = &rest[..len];
    let remainder = &rest[len..];

    let decoded = if huffman {
        decode_huffman(raw)?
    } else {
        String::from_utf8_lossy(raw).into_owned()
    };
    Ok((decoded, remainder))
}

/// Bit-serial Huffman decode. Trailing padding must be the EOS prefix
/// (all ones) and shorter than 8 bits.
fn decode_huffman(data: &[u8]) -> Result<String> {
    let mut out = Vec::new();
    let mut code = 0u32;
    let mut len = 0u8;

    for &byte in data {
        for bit in (0..8).rev() {
            code = (code << 1) | u32::from((byte >> bit) & 1);
            len += 1;
            if len > 30 {
                return Err(Error::malformed("HPACK", "huffman code too long"));
            }
            if let Some(&sym) = HUFFMAN_DECODE.get(&(code, len)) {
                if sym == EOS {
                    return Err(Error::malformed("HPACK", "EOS inside string"));
                }
                out.push(sym as u8);
                code = 0;
                len = 0;
            }
        }
    }

    // Padding check: what remains must be a prefix of EOS, i.e. all ones,
    // and strictly shorter than a byte.
    if len >= 8 || (len > 0 && code != (1 << len) - 1) {
        return Err(Error::malformed("HPACK", "bad huffman padding"));
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}
