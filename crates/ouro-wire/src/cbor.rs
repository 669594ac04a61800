//! Definite-length CBOR encoding and a dynamic-value decoder.
//!
//! Handshake proposals are framing-sensitive: public relays reset the
//! connection when a proposal arrives with indefinite-length containers.
//! The encoder therefore emits an explicit length header for every
//! container and the smallest integer head the value permits; there is no
//! API path that produces an indefinite form.
//!
//! The decoder is more liberal. Relays may answer with either framing, so
//! it accepts definite and indefinite containers and chunked strings, and
//! materializes whatever arrives as a [`Value`] for the mini-protocol
//! state machines to pattern-match.

use crate::WireError;

/// Nesting ceiling for decoded structures.
const MAX_NESTING: usize = 128;

/// A dynamically typed CBOR value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Major types 0 and 1. Covers the full unsigned 64-bit range.
    Integer(i128),
    /// Simple values 20 and 21.
    Bool(bool),
    /// Major type 2.
    Bytes(Vec<u8>),
    /// Major type 3.
    Text(String),
    /// Major type 4.
    Array(Vec<Value>),
    /// Major type 5, entry order preserved.
    Map(Vec<(Value, Value)>),
    /// Major type 6.
    Tag(u64, Box<Value>),
    /// Simple values 22 (null) and 23 (undefined).
    Null,
}

impl Value {
    /// Unsigned view of an integer value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(n) if *n >= 0 && *n <= u64::MAX as i128 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Render the value in RFC 8949 diagnostic notation.
    pub fn to_diagnostic(&self) -> String {
        match self {
            Value::Integer(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Bytes(b) => format!("h'{}'", hex::encode(b)),
            Value::Text(t) => format!("{t:?}"),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(Value::to_diagnostic).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.to_diagnostic(), v.to_diagnostic()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Tag(tag, inner) => format!("{}({})", tag, inner.to_diagnostic()),
            Value::Null => "null".to_string(),
        }
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Integer(n as i128)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encode a value in definite-length form.
pub fn encode(value: &Value) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(64);
    encode_into(value, &mut buf)?;
    Ok(buf)
}

/// Encode a value in definite-length form, appending to `buf`.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) -> Result<(), WireError> {
    match value {
        Value::Integer(n) if *n >= 0 => {
            let n = u64::try_from(*n)
                .map_err(|_| WireError::Cbor(format!("Integer out of range: {n}")))?;
            write_head(buf, 0, n);
        }
        Value::Integer(n) => {
            let m = u64::try_from(-1 - *n)
                .map_err(|_| WireError::Cbor(format!("Integer out of range: {n}")))?;
            write_head(buf, 1, m);
        }
        Value::Bool(b) => buf.push(if *b { 0xF5 } else { 0xF4 }),
        Value::Null => buf.push(0xF6),
        Value::Bytes(bytes) => {
            write_head(buf, 2, bytes.len() as u64);
            buf.extend_from_slice(bytes);
        }
        Value::Text(text) => {
            write_head(buf, 3, text.len() as u64);
            buf.extend_from_slice(text.as_bytes());
        }
        Value::Array(items) => {
            write_head(buf, 4, items.len() as u64);
            for item in items {
                encode_into(item, buf)?;
            }
        }
        Value::Map(entries) => {
            write_head(buf, 5, entries.len() as u64);
            for (key, val) in entries {
                encode_into(key, buf)?;
                encode_into(val, buf)?;
            }
        }
        Value::Tag(tag, inner) => {
            write_head(buf, 6, *tag);
            encode_into(inner, buf)?;
        }
    }
    Ok(())
}

/// Write an item head with the smallest argument width the value permits.
fn write_head(buf: &mut Vec<u8>, major: u8, arg: u64) {
    let major = major << 5;
    if arg < 24 {
        buf.push(major | arg as u8);
    } else if arg <= 0xFF {
        buf.push(major | 24);
        buf.push(arg as u8);
    } else if arg <= 0xFFFF {
        buf.push(major | 25);
        buf.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= 0xFFFF_FFFF {
        buf.push(major | 26);
        buf.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        buf.push(major | 27);
        buf.extend_from_slice(&arg.to_be_bytes());
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Decode a single CBOR item covering the whole input.
pub fn decode(data: &[u8]) -> Result<Value, WireError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.decode_value(0)?;
    if decoder.pos != data.len() {
        return Err(WireError::Cbor(format!(
            "Trailing bytes after CBOR item: {} of {}",
            data.len() - decoder.pos,
            data.len()
        )));
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn read_u8(&mut self) -> Result<u8, WireError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| WireError::Cbor("Truncated CBOR item".into()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Cbor("Truncated CBOR item".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read the argument for additional info `ai`. Indefinite is invalid here.
    fn read_arg(&mut self, ai: u8) -> Result<u64, WireError> {
        match ai {
            0..=23 => Ok(ai as u64),
            24 => Ok(self.read_u8()? as u64),
            25 => {
                let bytes = self.take(2)?;
                Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as u64)
            }
            26 => {
                let bytes = self.take(4)?;
                Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
            }
            27 => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(u64::from_be_bytes(raw))
            }
            31 => Err(WireError::Cbor("Unexpected indefinite length".into())),
            _ => Err(WireError::Cbor(format!("Reserved additional info {ai}"))),
        }
    }

    fn read_len(&mut self, ai: u8) -> Result<usize, WireError> {
        let arg = self.read_arg(ai)?;
        usize::try_from(arg).map_err(|_| WireError::Cbor(format!("Length too large: {arg}")))
    }

    fn decode_value(&mut self, depth: usize) -> Result<Value, WireError> {
        if depth > MAX_NESTING {
            return Err(WireError::Cbor("Nesting too deep".into()));
        }

        let initial = self.read_u8()?;
        let major = initial >> 5;
        let ai = initial & 0x1F;

        match major {
            0 => Ok(Value::Integer(self.read_arg(ai)? as i128)),
            1 => Ok(Value::Integer(-1 - self.read_arg(ai)? as i128)),
            2 => {
                if ai == 31 {
                    Ok(Value::Bytes(self.decode_chunks(2)?))
                } else {
                    let len = self.read_len(ai)?;
                    Ok(Value::Bytes(self.take(len)?.to_vec()))
                }
            }
            3 => {
                let raw = if ai == 31 {
                    self.decode_chunks(3)?
                } else {
                    let len = self.read_len(ai)?;
                    self.take(len)?.to_vec()
                };
                let text = String::from_utf8(raw)
                    .map_err(|e| WireError::Cbor(format!("Invalid UTF-8 text: {e}")))?;
                Ok(Value::Text(text))
            }
            4 => {
                if ai == 31 {
                    let mut items = Vec::new();
                    while !self.consume_break()? {
                        items.push(self.decode_value(depth + 1)?);
                    }
                    Ok(Value::Array(items))
                } else {
                    let len = self.read_len(ai)?;
                    let mut items = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        items.push(self.decode_value(depth + 1)?);
                    }
                    Ok(Value::Array(items))
                }
            }
            5 => {
                if ai == 31 {
                    let mut entries = Vec::new();
                    while !self.consume_break()? {
                        let key = self.decode_value(depth + 1)?;
                        let val = self.decode_value(depth + 1)?;
                        entries.push((key, val));
                    }
                    Ok(Value::Map(entries))
                } else {
                    let len = self.read_len(ai)?;
                    let mut entries = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        let key = self.decode_value(depth + 1)?;
                        let val = self.decode_value(depth + 1)?;
                        entries.push((key, val));
                    }
                    Ok(Value::Map(entries))
                }
            }
            6 => {
                let tag = self.read_arg(ai)?;
                let inner = self.decode_value(depth + 1)?;
                Ok(Value::Tag(tag, Box::new(inner)))
            }
            7 => match ai {
                20 => Ok(Value::Bool(false)),
                21 => Ok(Value::Bool(true)),
                22 | 23 => Ok(Value::Null),
                24 => {
                    let simple = self.read_u8()?;
                    Err(WireError::Cbor(format!("Unsupported simple value {simple}")))
                }
                25 | 26 | 27 => Err(WireError::Cbor("Floating point not supported".into())),
                31 => Err(WireError::Cbor("Unexpected break code".into())),
                _ => Err(WireError::Cbor(format!("Unsupported simple value {ai}"))),
            },
            _ => unreachable!("major type is 3 bits"),
        }
    }

    /// Concatenate the chunks of an indefinite-length string.
    fn decode_chunks(&mut self, expected_major: u8) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        while !self.consume_break()? {
            let initial = self.read_u8()?;
            let major = initial >> 5;
            let ai = initial & 0x1F;
            if major != expected_major || ai == 31 {
                return Err(WireError::Cbor(
                    "Invalid chunk in indefinite-length string".into(),
                ));
            }
            let len = self.read_len(ai)?;
            out.extend_from_slice(self.take(len)?);
        }
        Ok(out)
    }

    /// Consume a break code if one is next.
    fn consume_break(&mut self) -> Result<bool, WireError> {
        match self.peek() {
            Some(0xFF) => {
                self.pos += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(WireError::Cbor("Truncated CBOR item".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = encode(&value).unwrap();
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_find_intersect_bytes_exact() {
        // [4, []]
        let msg = Value::Array(vec![Value::from(4u64), Value::Array(vec![])]);
        assert_eq!(encode(&msg).unwrap(), vec![0x82, 0x04, 0x80]);
    }

    #[test]
    fn test_version_data_bytes_exact() {
        // Mainnet version data: [magic, false, 0, false]
        let data = Value::Array(vec![
            Value::from(764_824_073u64),
            Value::from(false),
            Value::from(0u64),
            Value::from(false),
        ]);
        assert_eq!(
            encode(&data).unwrap(),
            vec![0x84, 0x1A, 0x2D, 0x96, 0x4A, 0x09, 0xF4, 0x00, 0xF4]
        );
    }

    #[test]
    fn test_smallest_integer_heads() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (23, &[0x17]),
            (24, &[0x18, 0x18]),
            (255, &[0x18, 0xFF]),
            (256, &[0x19, 0x01, 0x00]),
            (65_535, &[0x19, 0xFF, 0xFF]),
            (65_536, &[0x1A, 0x00, 0x01, 0x00, 0x00]),
            (u32::MAX as u64, &[0x1A, 0xFF, 0xFF, 0xFF, 0xFF]),
            (u32::MAX as u64 + 1, &[0x1B, 0, 0, 0, 1, 0, 0, 0, 0]),
        ];
        for (n, expected) in cases {
            assert_eq!(&encode(&Value::from(*n)).unwrap(), expected, "value {n}");
        }
    }

    #[test]
    fn test_booleans() {
        assert_eq!(encode(&Value::Bool(false)).unwrap(), vec![0xF4]);
        assert_eq!(encode(&Value::Bool(true)).unwrap(), vec![0xF5]);
    }

    #[test]
    fn test_no_indefinite_markers_in_proposal() {
        // Shape of a version proposal: [0, {14: [...], 15: [...]}]
        let version_data = Value::Array(vec![
            Value::from(764_824_073u64),
            Value::from(false),
            Value::from(1u64),
            Value::from(false),
        ]);
        let proposal = Value::Array(vec![
            Value::from(0u64),
            Value::Map(vec![
                (Value::from(14u64), version_data.clone()),
                (Value::from(15u64), version_data),
            ]),
        ]);

        let encoded = encode(&proposal).unwrap();
        for marker in [0x9F, 0xBF, 0x7F, 0x5F] {
            assert!(
                !encoded.contains(&marker),
                "indefinite marker {marker:#04x} in output"
            );
        }
    }

    #[test]
    fn test_roundtrip_shapes() {
        roundtrip(Value::Integer(0));
        roundtrip(Value::Integer(u64::MAX as i128));
        roundtrip(Value::Integer(-1));
        roundtrip(Value::Integer(-500));
        roundtrip(Value::Bytes(vec![0u8; 32]));
        roundtrip(Value::Text("VersionMismatch".into()));
        roundtrip(Value::Null);
        roundtrip(Value::Array(vec![
            Value::from(5u64),
            Value::Array(vec![Value::from(1u64), Value::Bytes(vec![0xAB; 32])]),
            Value::Array(vec![
                Value::from(142_857_142u64),
                Value::Bytes(vec![0; 32]),
                Value::from(9_999_999u64),
            ]),
        ]));
        roundtrip(Value::Map(vec![(
            Value::from(14u64),
            Value::Array(vec![Value::Bool(true)]),
        )]));
        roundtrip(Value::Tag(24, Box::new(Value::Bytes(vec![1, 2, 3]))));
    }

    #[test]
    fn test_decode_indefinite_array() {
        // 9F 01 02 FF
        let value = decode(&[0x9F, 0x01, 0x02, 0xFF]).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![Value::from(1u64), Value::from(2u64)])
        );
    }

    #[test]
    fn test_decode_indefinite_map() {
        // BF 00 61 61 FF => {0: "a"}
        let value = decode(&[0xBF, 0x00, 0x61, 0x61, 0xFF]).unwrap();
        assert_eq!(
            value,
            Value::Map(vec![(Value::from(0u64), Value::Text("a".into()))])
        );
    }

    #[test]
    fn test_decode_chunked_text() {
        // 7F 62 "he" 63 "llo" FF
        let value = decode(&[0x7F, 0x62, b'h', b'e', 0x63, b'l', b'l', b'o', 0xFF]).unwrap();
        assert_eq!(value, Value::Text("hello".into()));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(decode(&[0x82, 0x04]).is_err());
        assert!(decode(&[0x19, 0x01]).is_err());
        assert!(decode(&[0x5A]).is_err());
    }

    #[test]
    fn test_decode_trailing_bytes() {
        assert!(decode(&[0x04, 0x04]).is_err());
    }

    #[test]
    fn test_decode_reserved_info() {
        assert!(decode(&[0x1C]).is_err());
        assert!(decode(&[0xFF]).is_err());
    }

    #[test]
    fn test_diagnostic_notation() {
        let value = Value::Array(vec![
            Value::from(6u64),
            Value::Array(vec![
                Value::from(1u64),
                Value::Bytes(vec![0xDE, 0xAD]),
                Value::Bool(true),
            ]),
        ]);
        assert_eq!(value.to_diagnostic(), "[6, [1, h'dead', true]]");
    }
}
