use std::collections::VecDeque;

use bytes::Bytes;

use super::HeaderField;

/// Static table (RFC 7541 Appendix A). HPACK index `i` is `STATIC[i - 1]`.
pub(crate) const STATIC: [(&str, &str); 61] = [
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

/// Result of searching the static table for a field.
pub(crate) enum StaticMatch {
    /// Name and value both match.
    Full(usize),
    /// Only the name matches.
    Name(usize),
    None,
}

pub(crate) fn find_static(name: &[u8], value: &[u8]) -> StaticMatch {
    let mut name_hit = None;
    for (i, (n, v)) in STATIC.iter().enumerate() {
        if n.as_bytes() != name {
            continue;
        }
        if v.as_bytes() == value {
            return StaticMatch::Full(i + 1);
        }
        name_hit.get_or_insert(i + 1);
    }
    match name_hit {
        Some(i) => StaticMatch::Name(i),
        None => StaticMatch::None,
    }
}

/// Per-entry overhead in table size accounting (RFC 7541 Section 4.1).
const ENTRY_OVERHEAD: usize = 32;

/// Decoder-side dynamic table, newest entry first.
#[derive(Debug)]
pub(crate) struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    capacity: usize,
}

impl DynamicTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            capacity,
        }
    }

    /// Look up an HPACK index across the static and dynamic tables.
    pub fn get(&self, index: usize) -> Option<HeaderField> {
        match index {
            0 => None,
            i if i <= STATIC.len() => {
                let (name, value) = STATIC[i - 1];
                Some(HeaderField::new(
                    Bytes::from_static(name.as_bytes()),
                    Bytes::from_static(value.as_bytes()),
                ))
            }
            i => self.entries.get(i - STATIC.len() - 1).cloned(),
        }
    }

    pub fn insert(&mut self, field: HeaderField) {
        let size = entry_size(&field);
        if size > self.capacity {
            // An entry larger than the table empties it (RFC 7541 Section 4.4).
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.size += size;
        self.entries.push_front(field);
        self.evict();
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict(&mut self) {
        while self.size > self.capacity {
            match self.entries.pop_back() {
                Some(old) => self.size -= entry_size(&old),
                None => break,
            }
        }
    }
}

fn entry_size(field: &HeaderField) -> usize {
    field.name.len() + field.value.len() + ENTRY_OVERHEAD
}
