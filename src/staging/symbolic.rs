//! Symbolic stage: a tagged binary encoding of the canonical JSON tree.
//!
//! Every value is prefixed by one tag byte. Short strings, containers and
//! small integers carry their length or value inside the tag; numbers keep
//! their exact numeral text, nibble-packed, so decoding writes back the
//! stage 0 bytes verbatim.
//!
//! ```text
//! 0x00..=0x1F  string, length 0..=31
//! 0x20..=0x3F  array, 0..=31 items
//! 0x40..=0x5F  object, 0..=31 entries
//! 0x60..=0x6F  integer 0..=15
//! 0x70 null    0x71 false    0x72 true
//! 0x73 array, u16 count      0x74 object, u16 count
//! 0x75 symbol, u8 id (compact stage only)
//! 0x80..=0x9F  numeral text, nibble-packed, length in low 5 bits (2..=31)
//! 0xA0         string, length 32..=287 (one length byte)
//! 0xC0..=0xFF  string, length 288..=16671 (14-bit length)
//! ```
//!
//! No value encodes larger than its JSON text, which is what keeps stage 1
//! no larger than stage 0.

use serde_json::{Map, Number, Value};

use crate::staging::{Record, Stage, StagingError};

const SHORT_STR_LIMIT: usize = 32;
const ARRAY_BASE: u8 = 0x20;
const OBJECT_BASE: u8 = 0x40;
const SMALL_INT_BASE: u8 = 0x60;
const SMALL_INT_MAX: u64 = 15;
const NULL: u8 = 0x70;
const FALSE: u8 = 0x71;
const TRUE: u8 = 0x72;
const ARRAY_WIDE: u8 = 0x73;
const OBJECT_WIDE: u8 = 0x74;
pub(crate) const SYMBOL: u8 = 0x75;
const NUMBER_BASE: u8 = 0x80;
const NUMBER_MAX_LEN: usize = 31;
const MEDIUM_STR: u8 = 0xA0;
const MEDIUM_STR_LIMIT: usize = SHORT_STR_LIMIT + 256;
const LONG_STR_BASE: u8 = 0xC0;
const LONG_STR_LIMIT: usize = MEDIUM_STR_LIMIT + (1 << 14);

/// Numeral alphabet; index is the nibble value. 0xF pads odd lengths.
const NUMERAL_DIGITS: &[u8; 15] = b"0123456789-+.eE";
const NIBBLE_PAD: u8 = 0x0F;

/// One decoded symbolic token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Token<'a> {
    Null,
    Bool(bool),
    SmallInt(u8),
    Number { len: usize, packed: &'a [u8] },
    Str(&'a str),
    Symbol(u8),
    Array(usize),
    Object(usize),
}

/// Cursor over an encoded stream that reports failures against a stage.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    stage: Stage,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8], stage: Stage) -> Self {
        Self {
            bytes,
            pos: 0,
            stage,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// Raw bytes consumed since `start`.
    pub(crate) fn since(&self, start: usize) -> &'a [u8] {
        &self.bytes[start..self.pos]
    }

    pub(crate) fn corrupt(&self, reason: &'static str) -> StagingError {
        StagingError::Corrupt {
            stage: self.stage,
            offset: self.pos,
            reason,
        }
    }

    pub(crate) fn byte(&mut self) -> Result<u8, StagingError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| self.corrupt("unexpected end of stream"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StagingError> {
        if self.bytes.len() - self.pos < n {
            return Err(self.corrupt("unexpected end of stream"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<usize, StagingError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
    }

    fn string(&mut self, len: usize) -> Result<&'a str, StagingError> {
        let raw = self.take(len)?;
        std::str::from_utf8(raw).map_err(|_| self.corrupt("string is not valid UTF-8"))
    }

    pub(crate) fn next_token(&mut self) -> Result<Token<'a>, StagingError> {
        let tag = self.byte()?;
        let token = match tag {
            0x00..=0x1F => Token::Str(self.string(tag as usize)?),
            0x20..=0x3F => Token::Array((tag - ARRAY_BASE) as usize),
            0x40..=0x5F => Token::Object((tag - OBJECT_BASE) as usize),
            0x60..=0x6F => Token::SmallInt(tag - SMALL_INT_BASE),
            NULL => Token::Null,
            FALSE => Token::Bool(false),
            TRUE => Token::Bool(true),
            ARRAY_WIDE => Token::Array(self.u16()?),
            OBJECT_WIDE => Token::Object(self.u16()?),
            SYMBOL => Token::Symbol(self.byte()?),
            0x80..=0x9F => {
                let len = (tag - NUMBER_BASE) as usize;
                if len < 2 {
                    return Err(self.corrupt("numeral shorter than two characters"));
                }
                Token::Number {
                    len,
                    packed: self.take(len.div_ceil(2))?,
                }
            }
            MEDIUM_STR => {
                let len = SHORT_STR_LIMIT + self.byte()? as usize;
                Token::Str(self.string(len)?)
            }
            0xC0..=0xFF => {
                let high = ((tag - LONG_STR_BASE) as usize) << 8;
                let len = MEDIUM_STR_LIMIT + (high | self.byte()? as usize);
                Token::Str(self.string(len)?)
            }
            _ => return Err(self.corrupt("unassigned tag")),
        };
        Ok(token)
    }

    pub(crate) fn finish(&self) -> Result<(), StagingError> {
        if self.pos != self.bytes.len() {
            return Err(self.corrupt("trailing bytes after record"));
        }
        Ok(())
    }
}

fn oversized(size: usize, limit: usize) -> StagingError {
    StagingError::Oversized { size, limit }
}

/// Append the symbolic encoding of a string.
pub(crate) fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), StagingError> {
    let len = s.len();
    if len < SHORT_STR_LIMIT {
        out.push(len as u8);
    } else if len < MEDIUM_STR_LIMIT {
        out.push(MEDIUM_STR);
        out.push((len - SHORT_STR_LIMIT) as u8);
    } else if len < LONG_STR_LIMIT {
        let rel = len - MEDIUM_STR_LIMIT;
        out.push(LONG_STR_BASE | (rel >> 8) as u8);
        out.push((rel & 0xFF) as u8);
    } else {
        return Err(oversized(len, LONG_STR_LIMIT - 1));
    }
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_container_header(
    out: &mut Vec<u8>,
    count: usize,
    base: u8,
    wide: u8,
) -> Result<(), StagingError> {
    if count < 32 {
        out.push(base + count as u8);
    } else if count <= u16::MAX as usize {
        out.push(wide);
        out.extend_from_slice(&(count as u16).to_be_bytes());
    } else {
        return Err(oversized(count, u16::MAX as usize));
    }
    Ok(())
}

pub(crate) fn write_array_header(out: &mut Vec<u8>, count: usize) -> Result<(), StagingError> {
    write_container_header(out, count, ARRAY_BASE, ARRAY_WIDE)
}

pub(crate) fn write_object_header(out: &mut Vec<u8>, count: usize) -> Result<(), StagingError> {
    write_container_header(out, count, OBJECT_BASE, OBJECT_WIDE)
}

fn write_number(out: &mut Vec<u8>, n: &Number) -> Result<(), StagingError> {
    if let Some(small) = n.as_u64().filter(|v| *v <= SMALL_INT_MAX) {
        out.push(SMALL_INT_BASE + small as u8);
        return Ok(());
    }

    let text = n.to_string();
    let len = text.len();
    if !(2..=NUMBER_MAX_LEN).contains(&len) {
        return Err(oversized(len, NUMBER_MAX_LEN));
    }
    out.push(NUMBER_BASE + len as u8);

    let nibbles: Vec<u8> = text
        .bytes()
        .map(|c| {
            NUMERAL_DIGITS
                .iter()
                .position(|d| *d == c)
                .map(|i| i as u8)
                .ok_or(StagingError::Corrupt {
                    stage: Stage::Structured,
                    offset: 0,
                    reason: "numeral contains an unexpected character",
                })
        })
        .collect::<Result<_, _>>()?;
    for pair in nibbles.chunks(2) {
        let lo = pair.get(1).copied().unwrap_or(NIBBLE_PAD);
        out.push((pair[0] << 4) | lo);
    }
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), StagingError> {
    match value {
        Value::Null => out.push(NULL),
        Value::Bool(false) => out.push(FALSE),
        Value::Bool(true) => out.push(TRUE),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => write_str(out, s)?,
        Value::Array(items) => {
            write_array_header(out, items.len())?;
            for item in items {
                write_value(out, item)?;
            }
        }
        Value::Object(map) => write_object(out, map)?,
    }
    Ok(())
}

fn write_object(out: &mut Vec<u8>, map: &Map<String, Value>) -> Result<(), StagingError> {
    write_object_header(out, map.len())?;
    for (key, value) in map {
        write_str(out, key)?;
        write_value(out, value)?;
    }
    Ok(())
}

/// Encode a record into the symbolic stage: schema string, then the field object.
pub(crate) fn encode(record: &Record) -> Result<Vec<u8>, StagingError> {
    let mut out = Vec::with_capacity(record.fields().len() * 8 + 16);
    write_str(&mut out, record.schema())?;
    write_object(&mut out, record.fields())?;
    Ok(out)
}

fn unpack_numeral(
    reader: &Reader<'_>,
    len: usize,
    packed: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), StagingError> {
    for i in 0..len {
        let byte = packed[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        let digit = NUMERAL_DIGITS
            .get(nibble as usize)
            .ok_or_else(|| reader.corrupt("invalid numeral nibble"))?;
        out.push(*digit);
    }
    Ok(())
}

fn write_json_str(out: &mut Vec<u8>, s: &str) -> Result<(), StagingError> {
    serde_json::to_writer(&mut *out, s)?;
    Ok(())
}

fn decode_value(reader: &mut Reader<'_>, out: &mut Vec<u8>) -> Result<(), StagingError> {
    match reader.next_token()? {
        Token::Null => out.extend_from_slice(b"null"),
        Token::Bool(false) => out.extend_from_slice(b"false"),
        Token::Bool(true) => out.extend_from_slice(b"true"),
        Token::SmallInt(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Token::Number { len, packed } => unpack_numeral(reader, len, packed, out)?,
        Token::Str(s) => write_json_str(out, s)?,
        Token::Symbol(_) => return Err(reader.corrupt("symbol outside the compact stage")),
        Token::Array(count) => {
            out.push(b'[');
            for i in 0..count {
                if i > 0 {
                    out.push(b',');
                }
                decode_value(reader, out)?;
            }
            out.push(b']');
        }
        Token::Object(count) => decode_object_body(reader, count, out)?,
    }
    Ok(())
}

fn decode_object_body(
    reader: &mut Reader<'_>,
    count: usize,
    out: &mut Vec<u8>,
) -> Result<(), StagingError> {
    out.push(b'{');
    for i in 0..count {
        if i > 0 {
            out.push(b',');
        }
        match reader.next_token()? {
            Token::Str(key) => write_json_str(out, key)?,
            _ => return Err(reader.corrupt("object key is not a string")),
        }
        out.push(b':');
        decode_value(reader, out)?;
    }
    out.push(b'}');
    Ok(())
}

/// Decode the symbolic stage back into canonical JSON (stage 0) bytes.
pub(crate) fn decode(bytes: &[u8]) -> Result<Vec<u8>, StagingError> {
    let mut reader = Reader::new(bytes, Stage::Symbolic);
    let mut out = Vec::with_capacity(bytes.len() * 2);

    out.extend_from_slice(b"{\"schema\":");
    match reader.next_token()? {
        Token::Str(schema) => write_json_str(&mut out, schema)?,
        _ => return Err(reader.corrupt("record does not start with a schema string")),
    }
    out.extend_from_slice(b",\"fields\":");
    match reader.next_token()? {
        Token::Object(count) => decode_object_body(&mut reader, count, &mut out)?,
        _ => return Err(reader.corrupt("record fields are not an object")),
    }
    out.push(b'}');

    reader.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(value: Value) -> (usize, usize) {
        let record = Record::from_value(value).unwrap();
        let canonical = record.canonical_bytes().unwrap();
        let symbolic = encode(&record).unwrap();
        assert_eq!(decode(&symbolic).unwrap(), canonical);
        (canonical.len(), symbolic.len())
    }

    #[test]
    fn test_task_record_sizes() {
        let (json_len, sym_len) = roundtrip(json!({
            "schema": "task",
            "fields": {"name": "Recon", "priority": "high"}
        }));
        assert_eq!(json_len, 61);
        assert_eq!(sym_len, 31);
    }

    #[test]
    fn test_numbers_keep_exact_text() {
        let (json_len, sym_len) = roundtrip(json!({
            "schema": "event",
            "fields": {
                "a": 0, "b": 15, "c": 16, "d": -1, "e": 1.5, "f": -0.0,
                "g": 1e300, "h": u64::MAX, "i": i64::MIN, "j": 2.5e-8
            }
        }));
        assert!(sym_len <= json_len);
    }

    #[test]
    fn test_string_length_classes() {
        for len in [0usize, 31, 32, 287, 288, 4000] {
            let s = "x".repeat(len);
            let (json_len, sym_len) = roundtrip(json!({
                "schema": "document",
                "fields": {"body": s, "list": [s.clone(), s.clone()]}
            }));
            assert!(sym_len <= json_len, "len {len}: {sym_len} > {json_len}");
        }
    }

    #[test]
    fn test_wide_containers() {
        let items: Vec<Value> = (0..40).map(|i| json!(i)).collect();
        let mut fields = Map::new();
        for i in 0..40 {
            fields.insert(format!("k{i:02}"), json!(null));
        }
        fields.insert("items".into(), Value::Array(items));
        let (json_len, sym_len) = roundtrip(json!({"schema": "report", "fields": fields}));
        assert!(sym_len <= json_len);
    }

    #[test]
    fn test_escaped_strings() {
        roundtrip(json!({
            "schema": "note",
            "fields": {"text": "line\nbreak \"quoted\" \u{1F600} \\ tab\t"}
        }));
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let record =
            Record::from_value(json!({"schema": "task", "fields": {"name": "Recon"}})).unwrap();
        let symbolic = encode(&record).unwrap();
        let err = decode(&symbolic[..symbolic.len() - 2]).unwrap_err();
        assert!(matches!(err, StagingError::Corrupt { stage: Stage::Symbolic, .. }));
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let record = Record::from_value(json!({"schema": "task", "fields": {}})).unwrap();
        let mut symbolic = encode(&record).unwrap();
        symbolic.push(NULL);
        assert!(decode(&symbolic).is_err());
    }
}
