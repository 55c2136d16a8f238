use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// One key/value pair kept as byte slices, which saves the
/// `[u8] -> String` conversion cost on the codec fast path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytesKv {
    pub key: Bytes,
    pub value: Bytes,
}

/// Ordered multi-map of byte key/value pairs. Insertion order and
/// duplicate keys are preserved; lookups are ASCII case-insensitive.
/// Every protocol frame exposes one of these for uniform metadata
/// access across codecs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    kvs: Vec<BytesKv>,
}

impl Header {
    pub fn new() -> Header {
        Header::default()
    }

    pub fn with_capacity(capacity: usize) -> Header {
        Header {
            kvs: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kvs.is_empty()
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.kvs
            .iter()
            .find(|kv| kv.key.eq_ignore_ascii_case(key))
            .map(|kv| kv.value.as_ref())
    }

    /// Replace every entry stored under `key` with a single one. The
    /// replacement keeps the position of the first occurrence.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        match self
            .kvs
            .iter()
            .position(|kv| kv.key.eq_ignore_ascii_case(key))
        {
            Some(pos) => {
                self.kvs[pos].value = Bytes::copy_from_slice(value);
                let mut i = pos + 1;
                while i < self.kvs.len() {
                    if self.kvs[i].key.eq_ignore_ascii_case(key) {
                        self.kvs.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.add(key, value),
        }
    }

    /// Append an entry without touching existing ones with the same key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.kvs.push(BytesKv {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        });
    }

    /// Remove every entry stored under `key`.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let before = self.kvs.len();
        self.kvs.retain(|kv| !kv.key.eq_ignore_ascii_case(key));
        before != self.kvs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.kvs.iter().map(|kv| (kv.key.as_ref(), kv.value.as_ref()))
    }
}

impl FromIterator<(Bytes, Bytes)> for Header {
    fn from_iter<T: IntoIterator<Item = (Bytes, Bytes)>>(iter: T) -> Self {
        Header {
            kvs: iter
                .into_iter()
                .map(|(key, value)| BytesKv { key, value })
                .collect(),
        }
    }
}

/// Wire size of the encoded block: zero for an empty map, otherwise the
/// `u32` length prefix plus length-prefixed pairs.
pub fn header_block_len(header: &Header) -> usize {
    if header.is_empty() {
        return 0;
    }
    4 + pairs_len(header)
}

fn pairs_len(header: &Header) -> usize {
    header.iter().map(|(k, v)| 8 + k.len() + v.len()).sum()
}

/// Write the block as `u32 total_len` followed by repeated
/// `{u32 klen, key, u32 vlen, value}`. Empty maps write nothing, which
/// keeps heartbeat frames at zero header length.
pub fn encode_header_block(buf: &mut BytesMut, header: &Header) {
    if header.is_empty() {
        return;
    }
    buf.put_u32(pairs_len(header) as u32);
    for (key, value) in header.iter() {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
}

/// Inverse of `encode_header_block`; order and duplicates preserved.
pub fn decode_header_block(mut data: Bytes) -> AppResult<Header> {
    if data.is_empty() {
        return Ok(Header::new());
    }
    if data.len() < 4 {
        return Err(AppError::MalformedProtocol(
            "header block shorter than its length prefix".to_string(),
        ));
    }
    let total = data.get_u32() as usize;
    if data.len() != total {
        return Err(AppError::MalformedProtocol(format!(
            "header block length mismatch: prefix {} but {} bytes follow",
            total,
            data.len()
        )));
    }
    let mut header = Header::new();
    while data.has_remaining() {
        let key = read_chunk(&mut data)?;
        let value = read_chunk(&mut data)?;
        header.kvs.push(BytesKv { key, value });
    }
    Ok(header)
}

fn read_chunk(data: &mut Bytes) -> AppResult<Bytes> {
    if data.len() < 4 {
        return Err(AppError::MalformedProtocol(
            "truncated header block entry".to_string(),
        ));
    }
    let len = data.get_u32() as usize;
    if data.len() < len {
        return Err(AppError::MalformedProtocol(format!(
            "header block entry of {} bytes exceeds remaining {}",
            len,
            data.len()
        )));
    }
    Ok(data.split_to(len))
}
