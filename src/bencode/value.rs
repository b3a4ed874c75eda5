//! Bencode values
//!
//! In-memory representation of decoded bencode data.

use std::fmt;

/// A single bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Signed integer (`i<digits>e`)
    Integer(i64),
    /// Byte string (`<length>:<bytes>`)
    Bytes(Vec<u8>),
    /// Ordered list (`l...e`)
    List(Vec<BencodeValue>),
    /// Insertion-ordered dictionary (`d...e`)
    Dict(BencodeDict),
}

impl BencodeValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string interpreted as UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BencodeDict> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Consume the value, returning the dictionary if it is one
    pub fn into_dict(self) -> Option<BencodeDict> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Encode this value to its wire form
    pub fn encode(&self) -> Vec<u8> {
        super::encode(self)
    }

    /// Short name of the value kind, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            BencodeValue::Integer(_) => "integer",
            BencodeValue::Bytes(_) => "bytes",
            BencodeValue::List(_) => "list",
            BencodeValue::Dict(_) => "dict",
        }
    }
}

impl From<i64> for BencodeValue {
    fn from(value: i64) -> Self {
        BencodeValue::Integer(value)
    }
}

impl From<u32> for BencodeValue {
    fn from(value: u32) -> Self {
        BencodeValue::Integer(value as i64)
    }
}

impl From<u16> for BencodeValue {
    fn from(value: u16) -> Self {
        BencodeValue::Integer(value as i64)
    }
}

impl From<&str> for BencodeValue {
    fn from(value: &str) -> Self {
        BencodeValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for BencodeValue {
    fn from(value: String) -> Self {
        BencodeValue::Bytes(value.into_bytes())
    }
}

impl From<&[u8]> for BencodeValue {
    fn from(value: &[u8]) -> Self {
        BencodeValue::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(value: Vec<u8>) -> Self {
        BencodeValue::Bytes(value)
    }
}

impl From<Vec<BencodeValue>> for BencodeValue {
    fn from(value: Vec<BencodeValue>) -> Self {
        BencodeValue::List(value)
    }
}

impl From<BencodeDict> for BencodeValue {
    fn from(value: BencodeDict) -> Self {
        BencodeValue::Dict(value)
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BencodeValue::Integer(i) => write!(f, "{}", i),
            BencodeValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            BencodeValue::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            BencodeValue::Dict(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", String::from_utf8_lossy(k), v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Dictionary that preserves the order in which keys were inserted
///
/// The wire format is order-significant for hashing (the info-hash is the
/// SHA-1 of the `info` dictionary as it appears on the wire), so keys are
/// never re-sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BencodeDict {
    entries: Vec<(Vec<u8>, BencodeValue)>,
}

impl BencodeDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value; replacing an existing key keeps its original position
    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl Into<BencodeValue>) {
        let key = key.as_ref();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k.as_slice() == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_vec(), value)),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl AsRef<[u8]>, value: impl Into<BencodeValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&BencodeValue> {
        let key = key.as_ref();
        self.entries.iter().find(|(k, _)| k.as_slice() == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: impl AsRef<[u8]>) -> Option<BencodeValue> {
        let key = key.as_ref();
        let index = self.entries.iter().position(|(k, _)| k.as_slice() == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> bool {
        self.get(key).is_some()
    }

    pub fn get_integer(&self, key: impl AsRef<[u8]>) -> Option<i64> {
        self.get(key).and_then(BencodeValue::as_integer)
    }

    pub fn get_bytes(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        self.get(key).and_then(BencodeValue::as_bytes)
    }

    pub fn get_str(&self, key: impl AsRef<[u8]>) -> Option<&str> {
        self.get(key).and_then(BencodeValue::as_str)
    }

    pub fn get_list(&self, key: impl AsRef<[u8]>) -> Option<&[BencodeValue]> {
        self.get(key).and_then(BencodeValue::as_list)
    }

    pub fn get_dict(&self, key: impl AsRef<[u8]>) -> Option<&BencodeDict> {
        self.get(key).and_then(BencodeValue::as_dict)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &BencodeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|(k, _)| k.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_order() {
        let dict = BencodeDict::new().with("zeta", 1i64).with("alpha", 2i64).with("mid", 3i64);
        let keys: Vec<&[u8]> = dict.keys().collect();
        assert_eq!(keys, vec![b"zeta".as_ref(), b"alpha".as_ref(), b"mid".as_ref()]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut dict = BencodeDict::new().with("a", 1i64).with("b", 2i64);
        dict.insert("a", 10i64);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.keys().next(), Some(b"a".as_ref()));
        assert_eq!(dict.get_integer("a"), Some(10));
    }

    #[test]
    fn test_typed_getters() {
        let inner = BencodeDict::new().with("x", 1i64);
        let dict = BencodeDict::new()
            .with("n", 42i64)
            .with("s", "spam")
            .with("l", vec![BencodeValue::from(1i64)])
            .with("d", inner);

        assert_eq!(dict.get_integer("n"), Some(42));
        assert_eq!(dict.get_str("s"), Some("spam"));
        assert_eq!(dict.get_list("l").map(|l| l.len()), Some(1));
        assert_eq!(dict.get_dict("d").and_then(|d| d.get_integer("x")), Some(1));
        assert_eq!(dict.get_integer("s"), None);
    }

    #[test]
    fn test_remove() {
        let mut dict = BencodeDict::new().with("a", 1i64).with("b", 2i64);
        assert_eq!(dict.remove("a"), Some(BencodeValue::Integer(1)));
        assert!(!dict.contains_key("a"));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_display() {
        let value = BencodeValue::from(BencodeDict::new().with("foo", 42i64));
        assert_eq!(value.to_string(), "{foo: 42}");
    }
}
