//! Bencode decoder
//!
//! Strict recursive-descent decoder. Every structural error is reported as
//! `TorrentError::MalformedEncoding`.

use anyhow::Result;
use tracing::trace;

use super::value::{BencodeDict, BencodeValue};
use crate::error::TorrentError;

/// Maximum nesting depth accepted from the network
const MAX_DEPTH: usize = 64;

/// Decode exactly one value; trailing bytes are an error
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(TorrentError::malformed(format!(
            "Trailing data after value: {} of {} bytes consumed",
            consumed,
            data.len()
        ))
        .into());
    }
    Ok(value)
}

/// Decode one value from the start of `data`, returning it with the number
/// of bytes consumed
///
/// Used where a bencoded header is followed by raw payload, such as
/// ut_metadata data messages.
pub fn decode_prefix(data: &[u8]) -> Result<(BencodeValue, usize)> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.parse_value(0)?;
    trace!("Decoded bencode {} from {} bytes", value.kind(), decoder.pos);
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| TorrentError::malformed(format!("Unexpected end of data at offset {}", self.pos)).into())
    }

    fn parse_value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(TorrentError::malformed(format!("Nesting deeper than {}", MAX_DEPTH)).into());
        }

        match self.peek()? {
            b'i' => self.parse_integer().map(BencodeValue::Integer),
            b'l' => self.parse_list(depth),
            b'd' => self.parse_dict(depth),
            b'0'..=b'9' => self.parse_bytes().map(BencodeValue::Bytes),
            other => Err(TorrentError::malformed(format!(
                "Unknown bencode type 0x{:02x} at offset {}",
                other, self.pos
            ))
            .into()),
        }
    }

    fn parse_integer(&mut self) -> Result<i64> {
        let start = self.pos;
        self.pos += 1; // 'i'
        let end = self.data[self.pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|p| p + self.pos)
            .ok_or_else(|| TorrentError::malformed(format!("Unterminated integer at offset {}", start)))?;

        let digits = &self.data[self.pos..end];
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(TorrentError::malformed(format!("Invalid integer at offset {}", start)).into());
        }
        if unsigned.len() > 1 && unsigned[0] == b'0' {
            return Err(TorrentError::malformed(format!("Integer with leading zero at offset {}", start)).into());
        }
        if digits[0] == b'-' && unsigned == b"0" {
            return Err(TorrentError::malformed(format!("Negative zero at offset {}", start)).into());
        }

        // Digits were validated as ASCII above
        let text = std::str::from_utf8(digits).map_err(|e| TorrentError::malformed_with_source("Invalid integer", e.to_string()))?;
        let value = text
            .parse::<i64>()
            .map_err(|e| TorrentError::malformed_with_source(format!("Integer out of range at offset {}", start), e.to_string()))?;

        self.pos = end + 1;
        Ok(value)
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let colon = self.data[self.pos..]
            .iter()
            .position(|&b| b == b':')
            .map(|p| p + self.pos)
            .ok_or_else(|| TorrentError::malformed(format!("Unterminated string length at offset {}", start)))?;

        let prefix = &self.data[self.pos..colon];
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return Err(TorrentError::malformed(format!("Non-digit string length at offset {}", start)).into());
        }
        let length: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TorrentError::malformed(format!("String length overflow at offset {}", start)))?;

        let body_start = colon + 1;
        let remaining = self.data.len() - body_start;
        if length > remaining {
            return Err(TorrentError::malformed(format!(
                "String length {} exceeds remaining {} bytes at offset {}",
                length, remaining, start
            ))
            .into());
        }

        self.pos = body_start + length;
        Ok(self.data[body_start..self.pos].to_vec())
    }

    fn parse_list(&mut self, depth: usize) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1; // 'l'
        let mut list = Vec::new();
        loop {
            match self.data.get(self.pos) {
                None => return Err(TorrentError::malformed(format!("Unterminated list at offset {}", start)).into()),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::List(list));
                }
                Some(_) => list.push(self.parse_value(depth + 1)?),
            }
        }
    }

    fn parse_dict(&mut self, depth: usize) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1; // 'd'
        let mut dict = BencodeDict::new();
        loop {
            match self.data.get(self.pos) {
                None => return Err(TorrentError::malformed(format!("Unterminated dictionary at offset {}", start)).into()),
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::Dict(dict));
                }
                Some(b'0'..=b'9') => {
                    let key = self.parse_bytes()?;
                    let value = self.parse_value(depth + 1)?;
                    dict.insert(key, value);
                }
                Some(_) => {
                    return Err(TorrentError::malformed(format!(
                        "Dictionary key is not a byte string at offset {}",
                        self.pos
                    ))
                    .into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    fn assert_malformed(data: &[u8]) {
        let err = decode(data).unwrap_err();
        assert!(
            matches!(kind_of(&err), Some(TorrentError::MalformedEncoding { .. })),
            "expected malformed encoding for {:?}, got {}",
            String::from_utf8_lossy(data),
            err
        );
    }

    #[test]
    fn test_decode_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), BencodeValue::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
        assert_eq!(
            decode(b"i9223372036854775807e").unwrap(),
            BencodeValue::Integer(i64::MAX)
        );
    }

    #[test]
    fn test_decode_string() {
        assert_eq!(decode(b"4:spam").unwrap(), BencodeValue::Bytes(b"spam".to_vec()));
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::Bytes(Vec::new()));
    }

    #[test]
    fn test_decode_dict_keeps_wire_order() {
        let value = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get_str("bar"), Some("spam"));
        assert_eq!(dict.get_integer("foo"), Some(42));
        let keys: Vec<&[u8]> = dict.keys().collect();
        assert_eq!(keys, vec![b"bar".as_ref(), b"foo".as_ref()]);
    }

    #[test]
    fn test_decode_unsorted_dict_is_accepted() {
        let value = decode(b"d1:zi1e1:ai2ee").unwrap();
        let keys: Vec<&[u8]> = value.as_dict().unwrap().keys().collect();
        assert_eq!(keys, vec![b"z".as_ref(), b"a".as_ref()]);
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d4:listl1:ai1eee").unwrap();
        let list = value.as_dict().unwrap().get_list("list").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_str(), Some("a"));
    }

    #[test]
    fn test_decode_errors() {
        assert_malformed(b"");
        assert_malformed(b"x");
        assert_malformed(b"i42");
        assert_malformed(b"ie");
        assert_malformed(b"i03e");
        assert_malformed(b"i-0e");
        assert_malformed(b"i4a2e");
        assert_malformed(b"5:spam");
        assert_malformed(b"a:spam");
        assert_malformed(b"l4:spam");
        assert_malformed(b"d3:foo");
        assert_malformed(b"di1e3:fooe");
        assert_malformed(b"i1ei2e");
    }

    #[test]
    fn test_depth_limit() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert_malformed(&data);
    }

    #[test]
    fn test_decode_prefix() {
        let data = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        let (value, consumed) = decode_prefix(data).unwrap();
        assert_eq!(value.as_dict().unwrap().get_integer("msg_type"), Some(1));
        assert_eq!(&data[consumed..], b"RAWDATA");
    }
}
