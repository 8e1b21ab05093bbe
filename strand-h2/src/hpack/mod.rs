//! HPACK header compression (RFC 7541).
//!
//! The decoder is complete: static and dynamic tables, size updates and
//! Huffman strings. The encoder never adds to the peer's dynamic table; it
//! emits static-table references and literals without indexing, Huffman
//! coded when that is shorter. Request headers rarely repeat enough for
//! indexing to pay off, and a stateless encoder cannot desynchronize.

mod huffman;
mod table;

use bytes::{BufMut, Bytes};

use crate::error::H2Error;
use table::{DynamicTable, StaticMatch, find_static};

/// A header name/value pair as carried in a header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// Name as UTF-8, lossy.
    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Value as UTF-8, lossy.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Headers whose values must not be indexed by intermediaries either
/// (RFC 7541 Section 7.1.3).
const SENSITIVE: [&[u8]; 3] = [b"authorization", b"proxy-authorization", b"cookie"];

/// Header block encoder.
#[derive(Debug, Clone)]
pub struct Encoder {
    huffman: bool,
}

impl Default for Encoder {
    fn default() -> Self {
        Self { huffman: true }
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoder that always writes raw string literals.
    pub fn without_huffman() -> Self {
        Self { huffman: false }
    }

    /// Append the header block for `fields` to `dst`.
    pub fn encode<B: BufMut>(&self, fields: &[HeaderField], dst: &mut B) {
        for field in fields {
            self.encode_field(field, dst);
        }
    }

    fn encode_field<B: BufMut>(&self, field: &HeaderField, dst: &mut B) {
        // Literal without indexing is 0000xxxx; never indexed is 0001xxxx.
        let pattern = if SENSITIVE.contains(&&field.name[..]) {
            0x10
        } else {
            0x00
        };
        match find_static(&field.name, &field.value) {
            StaticMatch::Full(index) => encode_int(dst, index, 7, 0x80),
            StaticMatch::Name(index) => {
                encode_int(dst, index, 4, pattern);
                self.encode_string(&field.value, dst);
            }
            StaticMatch::None => {
                encode_int(dst, 0, 4, pattern);
                self.encode_string(&field.name, dst);
                self.encode_string(&field.value, dst);
            }
        }
    }

    fn encode_string<B: BufMut>(&self, data: &[u8], dst: &mut B) {
        let coded_len = huffman::encoded_len(data);
        if self.huffman && coded_len < data.len() {
            encode_int(dst, coded_len, 7, 0x80);
            huffman::encode(data, dst);
        } else {
            encode_int(dst, data.len(), 7, 0x00);
            dst.put_slice(data);
        }
    }
}

/// Header block decoder.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Upper bound for size updates: our advertised SETTINGS_HEADER_TABLE_SIZE.
    max_size: usize,
}

impl Decoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_size),
            max_size,
        }
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, H2Error> {
        let mut src = block;
        let mut fields = Vec::new();
        while let Some(&first) = src.first() {
            if first & 0x80 != 0 {
                // Indexed field.
                let index = decode_int(&mut src, 7)?;
                let field = self
                    .table
                    .get(index)
                    .ok_or(H2Error::Compression("index out of range"))?;
                fields.push(field);
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing.
                let field = self.decode_literal(&mut src, 6)?;
                self.table.insert(field.clone());
                fields.push(field);
            } else if first & 0x20 != 0 {
                // Dynamic table size update; only legal before the first field.
                if !fields.is_empty() {
                    return Err(H2Error::Compression("table size update after field"));
                }
                let size = decode_int(&mut src, 5)?;
                if size > self.max_size {
                    return Err(H2Error::Compression("table size update above limit"));
                }
                self.table.resize(size);
            } else {
                // Literal without indexing (0000) or never indexed (0001).
                let field = self.decode_literal(&mut src, 4)?;
                fields.push(field);
            }
        }
        Ok(fields)
    }

    fn decode_literal(&self, src: &mut &[u8], prefix: u8) -> Result<HeaderField, H2Error> {
        let index = decode_int(src, prefix)?;
        let name = if index == 0 {
            decode_string(src)?
        } else {
            self.table
                .get(index)
                .ok_or(H2Error::Compression("name index out of range"))?
                .name
        };
        let value = decode_string(src)?;
        Ok(HeaderField { name, value })
    }
}

/// Prefix-coded integer (RFC 7541 Section 5.1).
fn encode_int<B: BufMut>(dst: &mut B, value: usize, prefix: u8, pattern: u8) {
    let max = (1usize << prefix) - 1;
    if value < max {
        dst.put_u8(pattern | value as u8);
        return;
    }
    dst.put_u8(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        dst.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

fn decode_int(src: &mut &[u8], prefix: u8) -> Result<usize, H2Error> {
    const TRUNCATED: H2Error = H2Error::Compression("truncated integer");

    let max = (1usize << prefix) - 1;
    let (&first, rest) = src.split_first().ok_or(TRUNCATED)?;
    *src = rest;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok(value);
    }
    let mut shift = 0;
    loop {
        let (&byte, rest) = src.split_first().ok_or(TRUNCATED)?;
        *src = rest;
        if shift > 28 {
            return Err(H2Error::Compression("integer overflow"));
        }
        value += usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn decode_string(src: &mut &[u8]) -> Result<Bytes, H2Error> {
    let huffman_coded = src.first().is_some_and(|b| b & 0x80 != 0);
    let len = decode_int(src, 7)?;
    if len > src.len() {
        return Err(H2Error::Compression("truncated string"));
    }
    let (raw, rest) = src.split_at(len);
    *src = rest;
    if huffman_coded {
        Ok(Bytes::from(huffman::decode(raw)?))
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}
