//! HPACK header compression (RFC 7541 subset).
//!
//! One [`HPackContext`] per direction: the encoder context compresses our
//! request headers, the decoder context expands the peer's header blocks. Both
//! keep a bounded dynamic table that must evolve identically on each side of
//! the wire.
//!
//! Strings are always emitted as raw literals. Huffman-coded strings from a
//! peer are a known gap: decoding them fails with
//! [`HpackError::HuffmanUnsupported`] instead of producing garbage.

use crate::base::neterror::NetError;
use std::collections::VecDeque;
use thiserror::Error;

/// Default dynamic table budget (SETTINGS_HEADER_TABLE_SIZE initial value).
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Per-entry overhead counted against the table budget (RFC 7541 §4.1).
pub const ENTRY_OVERHEAD: usize = 32;

/// Continuation bytes beyond this shift are rejected as malicious.
const MAX_INTEGER_SHIFT: u32 = 28;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HpackError {
    #[error("header block truncated")]
    Truncated,
    #[error("integer exceeds the supported range")]
    IntegerOverflow,
    #[error("table index {0} out of range")]
    InvalidIndex(usize),
    #[error("huffman-coded strings are not supported")]
    HuffmanUnsupported,
    #[error("header string is not valid UTF-8")]
    InvalidString,
    #[error("table size update to {0} exceeds the allowed maximum")]
    InvalidTableSizeUpdate(usize),
    #[error("decoded header list exceeds {0} bytes")]
    HeaderListTooLarge(usize),
}

impl From<HpackError> for NetError {
    fn from(err: HpackError) -> Self {
        tracing::warn!(error = %err, "HPACK decode failed");
        NetError::Http2CompressionError
    }
}

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Cost of this field in the dynamic table.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// RFC 7541 Appendix A. Index 1 is the first element.
pub const STATIC_TABLE: [(&str, &str); 61] = [
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

// -- Prefix integer codec (RFC 7541 §5.1) --

/// Encode `value` into an N-bit prefix whose high bits are `pattern`.
pub fn encode_integer(buf: &mut Vec<u8>, value: usize, prefix_bits: u8, pattern: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        buf.push(pattern | value as u8);
        return;
    }
    buf.push(pattern | max as u8);
    let mut remaining = value - max;
    while remaining >= 0x80 {
        buf.push(0x80 | (remaining & 0x7f) as u8);
        remaining >>= 7;
    }
    buf.push(remaining as u8);
}

/// Decode an N-bit prefix integer. Returns the value and bytes consumed.
pub fn decode_integer(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    let max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        if shift > MAX_INTEGER_SHIFT {
            return Err(HpackError::IntegerOverflow);
        }
        value += usize::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
    }
    Err(HpackError::Truncated)
}

// -- String literals (RFC 7541 §5.2), raw only --

fn encode_string(buf: &mut Vec<u8>, s: &str) {
    encode_integer(buf, s.len(), 7, 0x00);
    buf.extend_from_slice(s.as_bytes());
}

fn decode_string(buf: &[u8]) -> Result<(String, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    if first & 0x80 != 0 {
        return Err(HpackError::HuffmanUnsupported);
    }
    let (len, n) = decode_integer(buf, 7)?;
    let end = n.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
    if buf.len() < end {
        return Err(HpackError::Truncated);
    }
    let s = std::str::from_utf8(&buf[n..end]).map_err(|_| HpackError::InvalidString)?;
    Ok((s.to_string(), end))
}

/// One side of an HPACK exchange: static table lookups plus a bounded
/// dynamic table, newest entry first.
#[derive(Debug, Clone)]
pub struct HPackContext {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
    /// Upper bound a peer may raise the table to with a size update.
    size_limit: usize,
    /// Encoder side: a size change not yet announced to the peer.
    pending_size_update: Option<usize>,
    max_header_list_size: usize,
}

impl Default for HPackContext {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl HPackContext {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
            size_limit: max_size,
            pending_size_update: None,
            max_header_list_size: usize::MAX,
        }
    }

    /// Bound the total decoded size of one header block.
    pub fn set_max_header_list_size(&mut self, limit: usize) {
        self.max_header_list_size = limit;
    }

    /// Current byte cost of the dynamic table.
    pub fn table_size(&self) -> usize {
        self.size
    }

    pub fn max_table_size(&self) -> usize {
        self.max_size
    }

    pub fn table_len(&self) -> usize {
        self.entries.len()
    }

    /// Dynamic table contents, newest first.
    pub fn entries(&self) -> impl Iterator<Item = &HeaderField> {
        self.entries.iter()
    }

    /// Apply a new table budget, evicting oldest entries until within it.
    ///
    /// On an encoder context the change is announced at the start of the next
    /// encoded block so the peer's decoder stays in step.
    pub fn update_max_size(&mut self, max_size: usize) {
        if max_size == self.max_size {
            return;
        }
        self.max_size = max_size;
        self.size_limit = self.size_limit.max(max_size);
        self.evict_to(max_size);
        self.pending_size_update = Some(max_size);
    }

    fn evict_to(&mut self, budget: usize) {
        while self.size > budget {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => break,
            }
        }
    }

    fn insert(&mut self, field: HeaderField) {
        let cost = field.size();
        if cost > self.max_size {
            // An oversized entry empties the table and is not stored.
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - cost);
        self.size += cost;
        self.entries.push_front(field);
    }

    /// Resolve a 1-based HPACK index across the static and dynamic tables.
    fn lookup(&self, index: usize) -> Result<HeaderField, HpackError> {
        match index {
            0 => Err(HpackError::InvalidIndex(0)),
            i if i <= STATIC_TABLE.len() => {
                let (name, value) = STATIC_TABLE[i - 1];
                Ok(HeaderField::new(name, value))
            }
            i => self
                .entries
                .get(i - STATIC_TABLE.len() - 1)
                .cloned()
                .ok_or(HpackError::InvalidIndex(i)),
        }
    }

    fn find_exact(&self, field: &HeaderField) -> Option<usize> {
        STATIC_TABLE
            .iter()
            .position(|(n, v)| *n == field.name && *v == field.value)
            .map(|i| i + 1)
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| e == field)
                    .map(|i| i + STATIC_TABLE.len() + 1)
            })
    }

    fn find_name(&self, name: &str) -> Option<usize> {
        STATIC_TABLE
            .iter()
            .position(|(n, _)| *n == name)
            .map(|i| i + 1)
            .or_else(|| {
                self.entries
                    .iter()
                    .position(|e| e.name == name)
                    .map(|i| i + STATIC_TABLE.len() + 1)
            })
    }

    /// Encode a header list into a header block.
    pub fn encode(&mut self, headers: &[HeaderField]) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(headers, &mut buf);
        buf
    }

    pub fn encode_into(&mut self, headers: &[HeaderField], buf: &mut Vec<u8>) {
        if let Some(size) = self.pending_size_update.take() {
            // Dynamic table size update: 001xxxxx
            encode_integer(buf, size, 5, 0x20);
        }

        for field in headers {
            if let Some(index) = self.find_exact(field) {
                // Indexed header field: 1xxxxxxx
                encode_integer(buf, index, 7, 0x80);
            } else if let Some(index) = self.find_name(&field.name) {
                // Literal with incremental indexing, indexed name: 01xxxxxx
                encode_integer(buf, index, 6, 0x40);
                encode_string(buf, &field.value);
                self.insert(field.clone());
            } else {
                // Literal without indexing, new name: 0000 0000
                buf.push(0x00);
                encode_string(buf, &field.name);
                encode_string(buf, &field.value);
            }
        }
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut headers = Vec::new();
        let mut list_size = 0usize;
        let mut pos = 0;

        while pos < block.len() {
            let first = block[pos];
            let field = if first & 0x80 != 0 {
                // Indexed header field
                let (index, n) = decode_integer(&block[pos..], 7)?;
                pos += n;
                self.lookup(index)?
            } else if first & 0xc0 == 0x40 {
                // Literal with incremental indexing
                let (field, n) = self.decode_literal(&block[pos..], 6)?;
                pos += n;
                self.insert(field.clone());
                field
            } else if first & 0xe0 == 0x20 {
                // Dynamic table size update
                let (size, n) = decode_integer(&block[pos..], 5)?;
                pos += n;
                if size > self.size_limit {
                    return Err(HpackError::InvalidTableSizeUpdate(size));
                }
                self.max_size = size;
                self.evict_to(size);
                continue;
            } else {
                // Literal without indexing (0000) or never indexed (0001)
                let (field, n) = self.decode_literal(&block[pos..], 4)?;
                pos += n;
                field
            };

            list_size += field.size();
            if list_size > self.max_header_list_size {
                return Err(HpackError::HeaderListTooLarge(self.max_header_list_size));
            }
            headers.push(field);
        }

        Ok(headers)
    }

    fn decode_literal(
        &self,
        buf: &[u8],
        prefix_bits: u8,
    ) -> Result<(HeaderField, usize), HpackError> {
        let (index, mut pos) = decode_integer(buf, prefix_bits)?;
        let name = if index == 0 {
            let (name, n) = decode_string(&buf[pos..])?;
            pos += n;
            name
        } else {
            self.lookup(index)?.name
        };
        let (value, n) = decode_string(&buf[pos..])?;
        pos += n;
        Ok((HeaderField { name, value }, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<HeaderField> {
        pairs.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
    }

    #[test]
    fn test_integer_fits_prefix() {
        let mut buf = Vec::new();
        encode_integer(&mut buf, 10, 5, 0);
        assert_eq!(buf, [0x0a]);
        assert_eq!(decode_integer(&buf, 5).unwrap(), (10, 1));
    }

    #[test]
    fn test_integer_continuation() {
        // RFC 7541 C.1.2: 1337 with a 5-bit prefix.
        let mut buf = Vec::new();
        encode_integer(&mut buf, 1337, 5, 0);
        assert_eq!(buf, [0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_integer(&buf, 5).unwrap(), (1337, 3));
    }

    #[test]
    fn test_integer_equal_to_prefix_max() {
        let mut buf = Vec::new();
        encode_integer(&mut buf, 31, 5, 0);
        assert_eq!(buf, [0x1f, 0x00]);
        assert_eq!(decode_integer(&buf, 5).unwrap(), (31, 2));
    }

    #[test]
    fn test_integer_endless_continuation_rejected() {
        let buf = [0x1f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(decode_integer(&buf, 5), Err(HpackError::IntegerOverflow));
    }

    #[test]
    fn test_integer_truncated() {
        assert_eq!(decode_integer(&[0x1f, 0x80], 5), Err(HpackError::Truncated));
        assert_eq!(decode_integer(&[], 5), Err(HpackError::Truncated));
    }

    #[test]
    fn test_static_exact_match_is_single_byte() {
        let mut ctx = HPackContext::default();
        assert_eq!(ctx.encode(&fields(&[(":method", "GET")])), [0x82]);
        assert_eq!(ctx.encode(&fields(&[(":status", "200")])), [0x88]);
        assert_eq!(ctx.table_len(), 0);
    }

    #[test]
    fn test_name_match_indexes_and_reuses() {
        let mut enc = HPackContext::default();
        let headers = fields(&[(":authority", "www.example.com")]);

        // RFC 7541 C.3.1 (first request, authority part)
        let first = enc.encode(&headers);
        assert_eq!(first[0], 0x41);
        assert_eq!(first[1] as usize, "www.example.com".len());
        assert_eq!(enc.table_len(), 1);
        assert_eq!(enc.table_size(), 57);

        // Second time it is an indexed reference to dynamic entry 62.
        assert_eq!(enc.encode(&headers), [0xbe]);
    }

    #[test]
    fn test_new_name_is_not_indexed() {
        let mut enc = HPackContext::default();
        let block = enc.encode(&fields(&[("x-custom", "hello")]));
        assert_eq!(block[0], 0x00);
        assert_eq!(enc.table_len(), 0);
    }

    #[test]
    fn test_roundtrip_keeps_tables_in_sync() {
        let mut enc = HPackContext::default();
        let mut dec = HPackContext::default();
        let requests = [
            fields(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/"),
                (":authority", "example.com"),
                ("accept", "text/html"),
                ("x-trace", "abc"),
            ]),
            fields(&[
                (":method", "POST"),
                (":scheme", "https"),
                (":path", "/submit"),
                (":authority", "example.com"),
                ("content-type", "application/json"),
            ]),
        ];

        for headers in &requests {
            let block = enc.encode(headers);
            assert_eq!(&dec.decode(&block).unwrap(), headers);
            assert_eq!(
                enc.entries().collect::<Vec<_>>(),
                dec.entries().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_eviction_keeps_table_within_budget() {
        let mut ctx = HPackContext::new(100);
        for i in 0..10 {
            // name "accept" (6) + value (2) + 32 = 40 per entry
            ctx.encode(&fields(&[("accept", &format!("v{}", i))]));
            assert!(ctx.table_size() <= 100);
        }
        assert_eq!(ctx.table_len(), 2);
        let newest: Vec<_> = ctx.entries().map(|e| e.value.as_str()).collect();
        assert_eq!(newest, ["v9", "v8"]);
    }

    #[test]
    fn test_update_max_size_evicts_and_announces() {
        let mut enc = HPackContext::default();
        let mut dec = HPackContext::default();
        let block = enc.encode(&fields(&[("accept", "a"), ("user-agent", "b")]));
        dec.decode(&block).unwrap();
        assert_eq!(enc.table_len(), 2);

        // accept (39) is evicted, user-agent (43) survives.
        enc.update_max_size(45);
        assert_eq!(enc.table_len(), 1);
        assert!(enc.table_size() <= 45);

        let block = enc.encode(&fields(&[(":method", "GET")]));
        assert_eq!(block[0] & 0xe0, 0x20);
        dec.decode(&block).unwrap();
        assert_eq!(dec.max_table_size(), 45);
        assert_eq!(dec.table_len(), 1);
    }

    #[test]
    fn test_oversized_entry_clears_table() {
        let mut ctx = HPackContext::new(64);
        ctx.encode(&fields(&[("accept", "a")]));
        assert_eq!(ctx.table_len(), 1);
        ctx.encode(&fields(&[("accept", &"x".repeat(100))]));
        assert_eq!(ctx.table_len(), 0);
        assert_eq!(ctx.table_size(), 0);
    }

    #[test]
    fn test_decode_rfc_literal_without_indexing() {
        // RFC 7541 C.2.2: :path /sample/path, literal without indexing
        let block = [
            0x04, 0x0c, b'/', b's', b'a', b'm', b'p', b'l', b'e', b'/', b'p', b'a', b't', b'h',
        ];
        let mut dec = HPackContext::default();
        let headers = dec.decode(&block).unwrap();
        assert_eq!(headers, fields(&[(":path", "/sample/path")]));
        assert_eq!(dec.table_len(), 0);
    }

    #[test]
    fn test_decode_rejects_out_of_range_index() {
        let mut dec = HPackContext::default();
        assert_eq!(dec.decode(&[0x80 | 62]), Err(HpackError::InvalidIndex(62)));
        assert_eq!(dec.decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
    }

    #[test]
    fn test_decode_rejects_truncated_string() {
        let mut dec = HPackContext::default();
        // Literal new name claiming 10 bytes but carrying 3.
        assert_eq!(dec.decode(&[0x00, 0x0a, b'a', b'b', b'c']), Err(HpackError::Truncated));
    }

    #[test]
    fn test_decode_rejects_huffman() {
        let mut dec = HPackContext::default();
        // :authority with an H-flagged value
        assert_eq!(
            dec.decode(&[0x41, 0x83, 0xf1, 0xe3, 0xc2]),
            Err(HpackError::HuffmanUnsupported)
        );
    }

    #[test]
    fn test_decode_rejects_size_update_above_limit() {
        let mut dec = HPackContext::new(4096);
        let mut block = Vec::new();
        encode_integer(&mut block, 8192, 5, 0x20);
        assert_eq!(dec.decode(&block), Err(HpackError::InvalidTableSizeUpdate(8192)));
    }

    #[test]
    fn test_decode_enforces_header_list_size() {
        let mut enc = HPackContext::default();
        let mut dec = HPackContext::default();
        dec.set_max_header_list_size(64);
        let block = enc.encode(&fields(&[("x-a", &"v".repeat(40))]));
        assert_eq!(dec.decode(&block), Err(HpackError::HeaderListTooLarge(64)));
    }
}
