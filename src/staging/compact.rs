//! Compact token stage: dictionary substitution over the symbolic stream.
//!
//! Layout: one dictionary-version byte followed by the symbolic stream in
//! which structural tokens (the schema tag and every object key) are
//! replaced by two-byte symbols. String values that happen to be dictionary
//! tokens are substituted as well; other values are copied untouched.

use crate::staging::dictionary::SymbolDictionary;
use crate::staging::symbolic::{self, Reader, Token, SYMBOL};
use crate::staging::{DictionarySet, Stage, StagingError};

/// Which way the stream is being rewritten.
#[derive(Clone, Copy)]
enum Direction {
    /// Symbolic → compact.
    Intern,
    /// Compact → symbolic.
    Expand,
}

struct Transcoder<'d> {
    dict: &'d SymbolDictionary,
    direction: Direction,
}

impl Transcoder<'_> {
    fn record(&self, reader: &mut Reader<'_>, out: &mut Vec<u8>) -> Result<(), StagingError> {
        self.string(reader, out, true)?;
        match reader.next_token()? {
            Token::Object(count) => self.object(reader, count, out)?,
            _ => return Err(reader.corrupt("record fields are not an object")),
        }
        reader.finish()
    }

    fn value(&self, reader: &mut Reader<'_>, out: &mut Vec<u8>) -> Result<(), StagingError> {
        let start = reader.position();
        match reader.next_token()? {
            Token::Str(s) => self.emit_string(reader, s, false, out)?,
            Token::Symbol(id) => self.emit_symbol(reader, id, out)?,
            Token::Array(count) => {
                symbolic::write_array_header(out, count)?;
                for _ in 0..count {
                    self.value(reader, out)?;
                }
            }
            Token::Object(count) => self.object(reader, count, out)?,
            Token::Null | Token::Bool(_) | Token::SmallInt(_) | Token::Number { .. } => {
                out.extend_from_slice(reader.since(start));
            }
        }
        Ok(())
    }

    fn object(
        &self,
        reader: &mut Reader<'_>,
        count: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), StagingError> {
        symbolic::write_object_header(out, count)?;
        for _ in 0..count {
            self.string(reader, out, true)?;
            self.value(reader, out)?;
        }
        Ok(())
    }

    /// A position that must hold a string (schema tag or object key).
    fn string(
        &self,
        reader: &mut Reader<'_>,
        out: &mut Vec<u8>,
        structural: bool,
    ) -> Result<(), StagingError> {
        match reader.next_token()? {
            Token::Str(s) => self.emit_string(reader, s, structural, out),
            Token::Symbol(id) => self.emit_symbol(reader, id, out),
            _ => Err(reader.corrupt("expected a string token")),
        }
    }

    fn emit_string(
        &self,
        reader: &Reader<'_>,
        s: &str,
        structural: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), StagingError> {
        match self.direction {
            Direction::Intern => match self.dict.symbol(s) {
                Some(id) => {
                    out.push(SYMBOL);
                    out.push(id);
                    Ok(())
                }
                None if structural => Err(StagingError::DictionaryMiss {
                    token: s.to_string(),
                    version: self.dict.version(),
                }),
                None => symbolic::write_str(out, s),
            },
            Direction::Expand => {
                if structural {
                    return Err(reader.corrupt("structural token was not interned"));
                }
                symbolic::write_str(out, s)
            }
        }
    }

    fn emit_symbol(
        &self,
        reader: &Reader<'_>,
        id: u8,
        out: &mut Vec<u8>,
    ) -> Result<(), StagingError> {
        match self.direction {
            Direction::Intern => Err(reader.corrupt("symbol in the symbolic stage")),
            Direction::Expand => {
                let token = self
                    .dict
                    .token(id)
                    .ok_or_else(|| reader.corrupt("symbol id not in dictionary"))?;
                symbolic::write_str(out, token)
            }
        }
    }
}

/// Intern a symbolic stream with the current dictionary.
pub(crate) fn encode(symbolic: &[u8], dict: &SymbolDictionary) -> Result<Vec<u8>, StagingError> {
    let mut reader = Reader::new(symbolic, Stage::Symbolic);
    let mut out = Vec::with_capacity(symbolic.len());
    out.push(dict.version());
    Transcoder {
        dict,
        direction: Direction::Intern,
    }
    .record(&mut reader, &mut out)?;
    Ok(out)
}

/// Expand a compact stream back into the symbolic stage using the
/// dictionary version recorded in its first byte.
pub(crate) fn decode(
    compact: &[u8],
    dictionaries: &DictionarySet,
) -> Result<Vec<u8>, StagingError> {
    let (&version, body) = compact.split_first().ok_or(StagingError::Corrupt {
        stage: Stage::Compact,
        offset: 0,
        reason: "missing dictionary version",
    })?;
    let dict = dictionaries.get(version)?;

    let mut reader = Reader::new(body, Stage::Compact);
    let mut out = Vec::with_capacity(compact.len() * 2);
    Transcoder {
        dict,
        direction: Direction::Expand,
    }
    .record(&mut reader, &mut out)?;
    Ok(out)
}
