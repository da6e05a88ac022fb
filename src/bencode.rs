//! Bencode, the encoding used by metainfo files and tracker responses.
//!
//! Decoding is strict about canonical form: leading zeros, `-0`, unsorted or
//! duplicated dictionary keys and truncated input are all rejected, and the
//! error carries the byte offset of the first offending byte. Because
//! dictionaries are stored sorted, re-encoding a decoded value reproduces
//! the source bytes exactly, which keeps info-hashes stable.

use std::collections::BTreeMap;

use crate::error::Error;

/// A bencoded value.
///
/// Keys of a dictionary are raw byte strings, not necessarily UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    ByteString(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ByteString(b) => Some(b),
            _ => None,
        }
    }

    /// The byte string interpreted as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::ByteString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Lookup of `key` when the value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

/// Decode one value from the front of `buf`.
///
/// Returns the value and how many bytes it consumed, trailing bytes are left
/// alone.
pub fn decode(buf: &[u8]) -> Result<(Value, usize), Error> {
    let mut parser = Parser { buf, pos: 0 };
    let value = parser.parse_value()?;
    Ok((value, parser.pos))
}

/// Decode a value that must span the entire input.
pub fn decode_strict(buf: &[u8]) -> Result<Value, Error> {
    let (value, consumed) = decode(buf)?;
    if consumed != buf.len() {
        return Err(Error::Bencode {
            offset: consumed,
            reason: "trailing bytes after value",
        });
    }
    Ok(value)
}

/// Encode a value. Dictionary keys are emitted in sorted order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::ByteString(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::Integer(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dictionary(entries) => {
            out.push(b'd');
            for (key, item) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

/// The exact byte range occupied by the value under `key` in a top-level
/// dictionary, as it appears in the source.
///
/// This is how the metainfo layer hashes the `info` dictionary: the hash must
/// cover the bytes from the file, never a re-encoding.
pub fn raw_entry<'a>(
    buf: &'a [u8],
    key: &[u8],
) -> Result<Option<&'a [u8]>, Error> {
    let mut parser = Parser { buf, pos: 0 };

    if parser.next()? != b'd' {
        return Err(Error::Bencode {
            offset: 0,
            reason: "top-level value is not a dictionary",
        });
    }

    while parser.peek()? != b'e' {
        let entry_key = parser.parse_byte_string()?;
        let start = parser.pos;
        parser.skip_value()?;

        if entry_key == key {
            return Ok(Some(&buf[start..parser.pos]));
        }
    }

    Ok(None)
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn err(&self, offset: usize, reason: &'static str) -> Error {
        Error::Bencode { offset, reason }
    }

    fn peek(&self) -> Result<u8, Error> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(self.err(self.pos, "unexpected end of input"))
    }

    fn next(&mut self) -> Result<u8, Error> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn parse_value(&mut self) -> Result<Value, Error> {
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let n = self.parse_integer_body()?;
                Ok(Value::Integer(n))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse_value()?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                let mut previous: Option<Vec<u8>> = None;

                while self.peek()? != b'e' {
                    let key_offset = self.pos;
                    let key = self.parse_byte_string()?;

                    // keys must be strictly increasing, which also rules
                    // out duplicates
                    if let Some(prev) = &previous {
                        if key <= *prev {
                            return Err(self
                                .err(key_offset, "dictionary keys not sorted"));
                        }
                    }

                    let item = self.parse_value()?;
                    previous = Some(key.clone());
                    entries.insert(key, item);
                }
                self.pos += 1;
                Ok(Value::Dictionary(entries))
            }
            b'0'..=b'9' => Ok(Value::ByteString(self.parse_byte_string()?)),
            b'-' => Err(self.err(self.pos, "negative byte string length")),
            _ => Err(self.err(self.pos, "unknown type byte")),
        }
    }

    /// Body of an integer, after the `i` and up to the `e`.
    fn parse_integer_body(&mut self) -> Result<i64, Error> {
        let start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }

        let digits_start = self.pos;
        let mut n: i64 = 0;

        while self.peek()? != b'e' {
            let byte = self.next()?;
            if !byte.is_ascii_digit() {
                return Err(self.err(self.pos - 1, "invalid integer digit"));
            }
            n = n
                .checked_mul(10)
                .and_then(|n| {
                    let digit = i64::from(byte - b'0');
                    if negative {
                        n.checked_sub(digit)
                    } else {
                        n.checked_add(digit)
                    }
                })
                .ok_or(self.err(start, "integer overflows 64 bits"))?;
        }

        let digits = self.pos - digits_start;
        if digits == 0 {
            return Err(self.err(digits_start, "integer with no digits"));
        }
        if digits > 1 && self.buf[digits_start] == b'0' {
            return Err(self.err(digits_start, "integer with leading zero"));
        }
        if negative && n == 0 {
            return Err(self.err(start, "negative zero"));
        }

        // consume the 'e'
        self.pos += 1;
        Ok(n)
    }

    fn parse_byte_string(&mut self) -> Result<Vec<u8>, Error> {
        let start = self.pos;

        if self.peek()? == b'-' {
            return Err(self.err(start, "negative byte string length"));
        }

        let mut len: usize = 0;
        while self.peek()? != b':' {
            let byte = self.next()?;
            if !byte.is_ascii_digit() {
                return Err(self.err(self.pos - 1, "invalid length digit"));
            }
            len = len
                .checked_mul(10)
                .and_then(|len| len.checked_add(usize::from(byte - b'0')))
                .ok_or(self.err(start, "byte string length overflows"))?;
        }

        let digits = self.pos - start;
        if digits == 0 {
            return Err(self.err(start, "byte string with no length"));
        }
        if digits > 1 && self.buf[start] == b'0' {
            return Err(self.err(start, "length with leading zero"));
        }

        // consume the ':'
        self.pos += 1;

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(self.err(self.buf.len(), "unexpected end of input"))?;

        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    /// Advance past one value without building it.
    fn skip_value(&mut self) -> Result<(), Error> {
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                self.parse_integer_body()?;
            }
            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.parse_byte_string()?;
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            b'0'..=b'9' => {
                self.parse_byte_string()?;
            }
            _ => return Err(self.err(self.pos, "unknown type byte")),
        }
        Ok(())
    }
}
