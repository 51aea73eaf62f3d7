//! A small, self-contained bencode codec for the free-form dictionaries the
//! private tracker dialect exchanges (§6). Metainfo files use `serde_bencode`
//! instead (see `metainfo.rs`) since their shape is fixed; this codec exists
//! for values whose key set varies by request kind.

use std::collections::BTreeMap;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Keys are byte strings; stored sorted so encoding is always
    /// deterministic regardless of insertion order.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn bytes(s: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(s.into())
    }

    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Bytes(s.as_ref().as_bytes().to_vec())
    }

    pub fn dict(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.as_bytes().to_vec(), v);
        }
        Value::Dict(map)
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(b'i');
                out.extend_from_slice(v.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(v) => {
                out.extend_from_slice(v.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(v);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                // BTreeMap already iterates keys in sorted (byte-lexical) order.
                for (k, v) in map {
                    Value::Bytes(k.clone()).encode_into(out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn decode(input: &[u8]) -> Result<Value, EngineError> {
        let mut cursor = Cursor { buf: input, pos: 0 };
        let value = cursor.parse_value()?;
        Ok(value)
    }

    /// Decode a single value and return it along with the number of bytes
    /// consumed, leaving any trailing bytes unexamined (tracker responses
    /// arrive over a stream and may be read in one chunk with nothing
    /// after them, but callers that frame multiple values need this).
    pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), EngineError> {
        let mut cursor = Cursor { buf: input, pos: 0 };
        let value = cursor.parse_value()?;
        Ok((value, cursor.pos))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, EngineError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| EngineError::MalformedInput("unexpected end of input".into()))
    }

    fn take(&mut self) -> Result<u8, EngineError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, b: u8) -> Result<(), EngineError> {
        let got = self.take()?;
        if got != b {
            return Err(EngineError::MalformedInput(format!(
                "expected '{}', got '{}'",
                b as char, got as char
            )));
        }
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Value, EngineError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            other => Err(EngineError::MalformedInput(format!(
                "unknown bencode tag '{}'",
                other as char
            ))),
        }
    }

    fn parse_int(&mut self) -> Result<Value, EngineError> {
        self.expect(b'i')?;
        let start = self.pos;
        if self.peek()? == b'-' {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(EngineError::MalformedInput("non-digit in integer".into()));
            }
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(EngineError::MalformedInput("empty integer".into()));
        }
        let s = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| EngineError::MalformedInput("non-utf8 integer".into()))?;
        let value: i64 = s
            .parse()
            .map_err(|_| EngineError::MalformedInput(format!("bad integer literal {:?}", s)))?;
        self.expect(b'e')?;
        Ok(Value::Int(value))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, EngineError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(EngineError::MalformedInput(
                    "non-digit in byte-string length".into(),
                ));
            }
            self.pos += 1;
        }
        let len_str = std::str::from_utf8(&self.buf[start..self.pos]).unwrap();
        let len: usize = len_str
            .parse()
            .map_err(|_| EngineError::MalformedInput(format!("bad length {:?}", len_str)))?;
        self.expect(b':')?;
        if self.pos + len > self.buf.len() {
            return Err(EngineError::MalformedInput(
                "byte-string length exceeds input".into(),
            ));
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value, EngineError> {
        self.expect(b'l')?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.expect(b'e')?;
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value, EngineError> {
        self.expect(b'd')?;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.parse_bytes()?;
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.expect(b'e')?;
        Ok(Value::Dict(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_atoms() {
        assert_eq!(Value::decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(Value::decode(b"i-3e").unwrap(), Value::Int(-3));
        assert_eq!(
            Value::decode(b"4:spam").unwrap(),
            Value::Bytes(b"spam".to_vec())
        );
        assert_eq!(
            Value::decode(b"l4:spam4:eggse").unwrap(),
            Value::List(vec![Value::bytes(*b"spam"), Value::bytes(*b"eggs")])
        );
    }

    #[test]
    fn dict_keys_sorted_on_encode_regardless_of_insertion_order() {
        let mut map = BTreeMap::new();
        map.insert(b"zzz".to_vec(), Value::Int(1));
        map.insert(b"aaa".to_vec(), Value::Int(2));
        let value = Value::Dict(map);
        assert_eq!(value.encode(), b"d3:aaai2e3:zzzi1ee");
    }

    #[test]
    fn round_trip_is_byte_identical_for_sorted_dict() {
        let raw = b"d3:cow3:moo4:spam4:eggse";
        let value = Value::decode(raw).unwrap();
        assert_eq!(value.encode(), raw.to_vec());
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(Value::decode(b"i4.2e").is_err());
        assert!(Value::decode(b"5:abc").is_err());
        assert!(Value::decode(b"x").is_err());
        assert!(Value::decode(b"di1ee").is_err()); // key must be a byte string
    }

    #[test]
    fn decode_prefix_leaves_trailing_bytes() {
        let (value, used) = Value::decode_prefix(b"i1eTRAILING").unwrap();
        assert_eq!(value, Value::Int(1));
        assert_eq!(used, 4);
    }
}
