/*! Name-value pairs of the FCGI_PARAMS stream.

Each pair is `nameLength | valueLength | nameData | valueData`.
A length is one byte (0..=127) or four bytes big endian with the high bit set.
*/
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use std::collections::HashMap;

/// Longest length a 4 byte length field can express
pub const MAX_PAIR_LEN: usize = 0x7fff_ffff;

/// A single parameter as it appears in the stream
pub struct NameValuePair {
    pub name_data: Bytes,
    pub value_data: Bytes,
}

/// Collects the content of FCGI_PARAMS records until the stream ends.
///
/// Pairs can be split at any byte across records. Bytes of an incomplete
/// pair stay buffered until the next record completes it.
#[derive(Debug, Default)]
pub struct ParamDecoder {
    buf: BytesMut,
    params: HashMap<String, String>,
}

impl NameValuePair {
    pub fn new(name_data: Bytes, value_data: Bytes) -> NameValuePair {
        NameValuePair {
            name_data,
            value_data,
        }
    }
    /// Decode one pair from the start of `data`.
    /// Returns the pair and the number of bytes it occupies,
    /// or `None` if `data` does not hold the whole pair yet
    pub fn parse(data: &[u8]) -> Option<(NameValuePair, usize)> {
        let mut pos: usize = 0;
        let name_length = NameValuePair::param_length(data, &mut pos)?;
        let value_length = NameValuePair::param_length(data, &mut pos)?;
        let end = pos.checked_add(name_length)?.checked_add(value_length)?;
        if data.len() < end {
            return None;
        }
        let name = Bytes::copy_from_slice(&data[pos..pos + name_length]);
        pos += name_length;
        let value = Bytes::copy_from_slice(&data[pos..end]);
        Some((NameValuePair::new(name, value), end))
    }

    fn param_length(data: &[u8], pos: &mut usize) -> Option<usize> {
        let first = *data.get(*pos)?;
        if first >> 7 == 0 {
            *pos += 1;
            return Some(first as usize);
        }
        let mut field = data.get(*pos..*pos + 4)?;
        *pos += 4;
        Some((field.get_u32() & 0x7FFF_FFFF) as usize)
    }

    fn put_length(data: &mut BytesMut, len: usize) {
        if len > 0x7f {
            data.put_u32(len as u32 | 0x8000_0000);
        } else {
            data.put_u8(len as u8);
        }
    }

    /// Number of bytes `append` produces
    pub fn len(&self) -> usize {
        let ln = self.name_data.len();
        let lv = self.value_data.len();
        let mut lf: usize = ln + lv + 2;
        if ln > 0x7f {
            lf += 3;
        }
        if lv > 0x7f {
            lf += 3;
        }
        lf
    }
    pub fn is_empty(&self) -> bool {
        self.name_data.is_empty() && self.value_data.is_empty()
    }

    /// serialize this pair to `data`.
    /// `false` if name or value is longer than [`MAX_PAIR_LEN`]
    pub fn append(&self, data: &mut BytesMut) -> bool {
        let ln = self.name_data.len();
        let lv = self.value_data.len();
        if ln > MAX_PAIR_LEN || lv > MAX_PAIR_LEN {
            return false;
        }
        data.reserve(self.len());
        NameValuePair::put_length(data, ln);
        NameValuePair::put_length(data, lv);
        data.put_slice(&self.name_data);
        data.put_slice(&self.value_data);
        true
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name_data).into_owned()
    }
    pub fn value(&self) -> String {
        String::from_utf8_lossy(&self.value_data).into_owned()
    }
}

impl ParamDecoder {
    pub fn new() -> ParamDecoder {
        ParamDecoder::default()
    }

    /// Append the content of one FCGI_PARAMS record and decode every pair
    /// that is complete now. Returns the number of pairs decoded.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        self.buf.extend_from_slice(data);
        let mut decoded = 0;
        while let Some((pair, nread)) = NameValuePair::parse(&self.buf) {
            self.buf.advance(nread);
            trace!("param({:?}): {:?}", pair.name_data, pair.value_data);
            // a repeated name replaces the earlier value
            self.params.insert(pair.name(), pair.value());
            decoded += 1;
        }
        decoded
    }
    /// bytes of a pair that is not complete yet
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
    pub fn into_params(self) -> HashMap<String, String> {
        self.params
    }
}

impl std::fmt::Debug for NameValuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} = {:?}", self.name_data, self.value_data)
    }
}

/// encode `name` and `value` as one pair
#[cfg(test)]
pub(crate) fn encode_param(name: &str, value: &str) -> BytesMut {
    let mut b = BytesMut::new();
    assert!(NameValuePair::new(
        Bytes::copy_from_slice(name.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes())
    )
    .append(&mut b));
    b
}
