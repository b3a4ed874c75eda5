//! Bencode encoder

use super::value::BencodeValue;

/// Encode a value to a new buffer
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Append the encoding of `value` to `out`
///
/// Dictionary keys are written in insertion order.
pub fn encode_into(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BencodeValue::Bytes(bytes) => write_bytes(bytes, out),
        BencodeValue::List(list) => {
            out.push(b'l');
            for item in list {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        BencodeValue::Dict(dict) => {
            out.push(b'd');
            for (key, item) in dict.iter() {
                write_bytes(key, out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
