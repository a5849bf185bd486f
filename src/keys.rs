//! Trivariate key engine.
//!
//! A [`TrivariateKey`] has three fixed-width 64-bit parts, each an xxh3 hash
//! of one input:
//!
//! ```text
//! content  = xxh3(compact payload bytes)
//! context  = xxh3_seeded(source | time bucket)
//! identity = xxh3_seeded(stable identity string)
//! ```
//!
//! Different seeds per part keep equal inputs in different positions from
//! producing equal parts. Tier A answers are keyed by their query with a
//! separately seeded content part, so an answer never shares a key with an
//! ingested record whose bytes equal the query. A 128-bit [`Fingerprint`] of the content is
//! stored next to each payload so a content-part collision is detected
//! instead of served.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use xxhash_rust::xxh3::{xxh3_128_with_seed, xxh3_64, xxh3_64_with_seed};

const CONTEXT_SEED: u64 = 0x6374_7874_5f6b_6579;
const IDENTITY_SEED: u64 = 0x6964_656e_745f_6b79;
const FINGERPRINT_SEED: u64 = 0x6670_7269_6e74_3132;
const ANSWER_SEED: u64 = 0x616e_7377_6572_5f61;

/// Bits in each key part.
pub const PART_BITS: u32 = 64;

/// Base-91 alphabet for the compact key form: printable ASCII without
/// space, quotes or backslash.
const BASE91: &[u8; 91] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!#$%&()*+,-./:;<=>?@[]^_`{|}~";

/// Base-91 digits needed for one 64-bit part.
const BASE91_PART_WIDTH: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid key {0:?}: expected three 16-digit hex parts separated by '-'")]
pub struct KeyParseError(pub String);

/// Three-part deterministic key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrivariateKey {
    pub content: u64,
    pub context: u64,
    pub identity: u64,
}

impl TrivariateKey {
    /// Concatenated 24-byte lookup form.
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..8].copy_from_slice(&self.content.to_be_bytes());
        out[8..16].copy_from_slice(&self.context.to_be_bytes());
        out[16..].copy_from_slice(&self.identity.to_be_bytes());
        out
    }

    /// Fixed-width base-91 form (30 characters).
    pub fn to_compact(&self) -> String {
        let mut out = String::with_capacity(BASE91_PART_WIDTH * 3);
        for part in [self.content, self.context, self.identity] {
            let mut digits = [BASE91[0]; BASE91_PART_WIDTH];
            let mut value = part;
            for slot in digits.iter_mut().rev() {
                *slot = BASE91[(value % 91) as usize];
                value /= 91;
            }
            out.extend(digits.iter().map(|&b| b as char));
        }
        out
    }
}

impl fmt::Display for TrivariateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}-{:016x}-{:016x}",
            self.content, self.context, self.identity
        )
    }
}

impl FromStr for TrivariateKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || KeyParseError(s.to_string());
        let mut parts = s.split('-');
        let mut next = || -> Result<u64, KeyParseError> {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 16 {
                return Err(err());
            }
            u64::from_str_radix(part, 16).map_err(|_| err())
        };
        let key = TrivariateKey {
            content: next()?,
            context: next()?,
            identity: next()?,
        };
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(key)
    }
}

impl Serialize for TrivariateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrivariateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 128-bit content checksum stored alongside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u128);

/// Logical/temporal context of a record: its source and a time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyContext {
    pub source: String,
    pub bucket: u64,
}

impl KeyContext {
    /// Context for a source observed at `unix_secs`, bucketed by `bucket_secs`.
    pub fn at(source: impl Into<String>, unix_secs: u64, bucket_secs: u64) -> Self {
        Self {
            source: source.into(),
            bucket: unix_secs / bucket_secs.max(1),
        }
    }

    /// Bytes fed to the context hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}|{}", self.source, self.bucket).into_bytes()
    }
}

/// Derives trivariate keys and content fingerprints.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyEngine;

impl KeyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Derive a key from the three inputs. Pure and order-sensitive.
    #[inline]
    pub fn derive(&self, content: &[u8], context: &[u8], identity: &[u8]) -> TrivariateKey {
        TrivariateKey {
            content: xxh3_64(content),
            context: xxh3_64_with_seed(context, CONTEXT_SEED),
            identity: xxh3_64_with_seed(identity, IDENTITY_SEED),
        }
    }

    /// Derive a key for compact payload bytes in a context.
    pub fn derive_for(
        &self,
        content: &[u8],
        context: &KeyContext,
        identity: &str,
    ) -> TrivariateKey {
        self.derive(content, &context.to_bytes(), identity.as_bytes())
    }

    /// Derive the Tier A answer key for a query's compact bytes.
    pub fn derive_answer_for(
        &self,
        query: &[u8],
        context: &KeyContext,
        identity: &str,
    ) -> TrivariateKey {
        TrivariateKey {
            content: xxh3_64_with_seed(query, ANSWER_SEED),
            ..self.derive_for(query, context, identity)
        }
    }

    /// Collision checksum of the content bytes.
    #[inline]
    pub fn fingerprint(&self, content: &[u8]) -> Fingerprint {
        Fingerprint(xxh3_128_with_seed(content, FINGERPRINT_SEED))
    }

    /// Birthday bound on the probability that any two of `n` distinct
    /// contents share a content part under the same context and identity.
    pub fn collision_probability(&self, n: u64) -> f64 {
        if n < 2 {
            return 0.0;
        }
        let n = n as f64;
        let space = 2f64.powi(PART_BITS as i32);
        -(-(n * (n - 1.0)) / (2.0 * space)).exp_m1()
    }
}
