//! Bencode values and their codec.
//!
//! Integers are `i<decimal>e`, byte strings `<length>:<bytes>`, lists
//! `l<items>e` and dictionaries `d<key><value>...e`. Keys are always byte
//! strings and are written in ascending raw byte order, which makes the
//! encoding canonical and safe to hash.

use std::collections::HashMap;
use std::fmt;

use crate::error::ApplicationError;

const MAX_DEPTH: usize = 64;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    /// Raw bytes, not necessarily UTF-8
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dictionary),
}

/// Dictionary that remembers the order keys were inserted (or seen on the wire).
///
/// Equality ignores ordering: two dictionaries holding the same pairs are
/// equal, since the encoder sorts keys anyway.
#[derive(Clone, Default)]
pub struct Dictionary {
    entries: Vec<(Vec<u8>, Value)>,
    /// Key to position in `entries`
    index:   HashMap<Vec<u8>, usize>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pair, replacing and returning the old value if the key exists.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: Value) -> Option<Value> {
        let key = key.into();
        if let Some(&at) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.entries[at].1, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.index.get(key).map(|&at| &self.entries[at].1)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    /// Pairs in ascending raw key order.
    pub fn sorted(&self) -> Vec<(&[u8], &Value)> {
        let mut pairs: Vec<_> = self.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl PartialEq for Dictionary {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.sorted() == other.sorted()
    }
}

impl Eq for Dictionary {}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
            .finish()
    }
}

impl<K: Into<Vec<u8>>> FromIterator<(K, Value)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as UTF-8 text if it is a byte string holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dictionary> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<Dictionary> for Value {
    fn from(d: Dictionary) -> Self {
        Value::Dict(d)
    }
}

/// Decodes the first value in `data`, returning it together with the number
/// of bytes it occupied. Bytes after the value are left untouched.
pub fn decode(data: &[u8]) -> Result<(Value, usize), ApplicationError> {
    let mut reader = Reader { data, pos: 0 };
    let value = reader.value(0)?;
    Ok((value, reader.pos))
}

/// Like [`decode`], but the value must span the whole input.
pub fn decode_exact(data: &[u8]) -> Result<Value, ApplicationError> {
    let (value, consumed) = decode(data)?;
    if consumed != data.len() {
        return Err(malformed(format!(
            "{} trailing bytes after value",
            data.len() - consumed
        )));
    }
    Ok(value)
}

/// Encodes a value canonically (dictionary keys sorted by raw bytes).
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(dict) => {
            buf.push(b'd');
            for (key, val) in dict.sorted() {
                encode_bytes(key, buf);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

fn malformed(msg: impl Into<String>) -> ApplicationError {
    ApplicationError::MalformedEncoding(msg.into())
}

/// Byte cursor with single-byte pushback.
struct Reader<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl Reader<'_> {
    fn next_byte(&mut self) -> Result<u8, ApplicationError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| malformed(format!("unexpected end of input at byte {}", self.pos)))?;
        self.pos += 1;
        Ok(b)
    }

    fn unread(&mut self) {
        self.pos -= 1;
    }

    /// Consumes bytes up to and including `delim`, returning what came before it.
    fn read_until(&mut self, delim: u8) -> Result<&[u8], ApplicationError> {
        let start = self.pos;
        let rest = &self.data[start..];
        let offset = rest
            .iter()
            .position(|&b| b == delim)
            .ok_or_else(|| malformed(format!("missing '{}' after byte {}", delim as char, start)))?;
        self.pos = start + offset + 1;
        Ok(&self.data[start..start + offset])
    }

    fn value(&mut self, depth: usize) -> Result<Value, ApplicationError> {
        if depth > MAX_DEPTH {
            return Err(malformed("nesting too deep"));
        }

        match self.next_byte()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => {
                self.unread();
                self.bytes().map(Value::Bytes)
            }
            other => Err(malformed(format!(
                "unexpected byte {:#04x} at {}",
                other,
                self.pos - 1
            ))),
        }
    }

    /// Returns true and consumes the byte if the next one is `e`.
    fn at_terminator(&mut self) -> Result<bool, ApplicationError> {
        if self.next_byte()? == b'e' {
            return Ok(true);
        }
        self.unread();
        Ok(false)
    }

    fn integer(&mut self) -> Result<Value, ApplicationError> {
        let digits = self.read_until(b'e')?;
        let text = std::str::from_utf8(digits).map_err(|_| malformed("integer is not ascii"))?;

        let unsigned = text.strip_prefix('-').unwrap_or(text);
        if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed(format!("invalid integer {:?}", text)));
        }
        if unsigned.len() > 1 && unsigned.starts_with('0') {
            return Err(malformed(format!("leading zero in integer {:?}", text)));
        }
        if text == "-0" {
            return Err(malformed("negative zero"));
        }

        text.parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| malformed(format!("integer {:?} out of range", text)))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ApplicationError> {
        let prefix = self.read_until(b':')?;
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return Err(malformed("string length is not numeric"));
        }
        let len: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed("string length out of range"))?;

        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(malformed(format!(
                "string declares {} bytes but only {} remain",
                len, remaining
            )));
        }

        let out = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn list(&mut self, depth: usize) -> Result<Value, ApplicationError> {
        let mut items = Vec::new();
        while !self.at_terminator()? {
            items.push(self.value(depth + 1)?);
        }
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, ApplicationError> {
        let mut dict = Dictionary::new();
        while !self.at_terminator()? {
            let key = match self.value(depth + 1)? {
                Value::Bytes(key) => key,
                _ => return Err(malformed("dictionary key is not a byte string")),
            };
            if dict.contains_key(&key) {
                return Err(malformed(format!(
                    "duplicate dictionary key {:?}",
                    String::from_utf8_lossy(&key)
                )));
            }
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }
        Ok(Value::Dict(dict))
    }
}
