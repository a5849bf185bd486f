//! Staged serializer: Record → Structured → Symbolic → Compact.
//!
//! Each stage is a lossless re-encoding of the previous one and never larger
//! than it. The serializer is a pure function of the record and the
//! dictionary set it was built with.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::staging::dictionary::DictionarySet;
use crate::staging::record::{Record, MAX_RECORD_BYTES};
use crate::staging::{compact, symbolic};

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Dictionary miss: token {token:?} is not in dictionary v{version}")]
    DictionaryMiss { token: String, version: u8 },

    #[error("Record too large: {size} exceeds limit {limit}")]
    Oversized { size: usize, limit: usize },

    #[error("Unknown dictionary version {0}")]
    UnknownDictionary(u8),

    #[error("Invalid dictionary v{version}: {reason}")]
    InvalidDictionary { version: u8, reason: String },

    #[error("Corrupt {stage} stage at offset {offset}: {reason}")]
    Corrupt {
        stage: Stage,
        offset: usize,
        reason: &'static str,
    },

    #[error("Cannot decode {from} stage to {to}: target must be an earlier stage")]
    InvalidTarget { from: Stage, to: Stage },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline stages, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Stage 0: canonical JSON.
    Structured,
    /// Stage 1: tagged binary tree.
    Symbolic,
    /// Stage 2: dictionary-interned tokens.
    Compact,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Structured, Stage::Symbolic, Stage::Compact];

    /// Numeric stage index.
    pub fn index(&self) -> usize {
        match self {
            Stage::Structured => 0,
            Stage::Symbolic => 1,
            Stage::Compact => 2,
        }
    }

    /// The stage this one decodes to, or None for the first stage.
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Structured => None,
            Stage::Symbolic => Some(Stage::Structured),
            Stage::Compact => Some(Stage::Symbolic),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Structured => write!(f, "structured"),
            Stage::Symbolic => write!(f, "symbolic"),
            Stage::Compact => write!(f, "compact"),
        }
    }
}

/// One encoding of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRepresentation {
    pub stage: Stage,
    pub bytes: Bytes,
}

impl StagedRepresentation {
    pub fn new(stage: Stage, bytes: impl Into<Bytes>) -> Self {
        Self {
            stage,
            bytes: bytes.into(),
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Everything needed to re-expand a compact payload and verify the result:
/// the dictionary version, each stage's size, and a checksum of stage 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedChain {
    pub dictionary_version: u8,
    pub stage_sizes: [usize; 3],
    pub structured_checksum: u64,
}

impl StagedChain {
    /// Compression ratio of each stage relative to the previous one.
    pub fn ratios(&self) -> [f64; 2] {
        let ratio = |from: usize, to: usize| if from == 0 { 1.0 } else { to as f64 / from as f64 };
        [
            ratio(self.stage_sizes[0], self.stage_sizes[1]),
            ratio(self.stage_sizes[1], self.stage_sizes[2]),
        ]
    }
}

/// Result of encoding one record.
#[derive(Debug, Clone)]
pub struct Staged {
    pub stages: Vec<StagedRepresentation>,
    pub chain: StagedChain,
}

impl Staged {
    /// The final, compact representation.
    pub fn compact(&self) -> &StagedRepresentation {
        &self.stages[Stage::Compact.index()]
    }

    pub fn sizes(&self) -> [usize; 3] {
        self.chain.stage_sizes
    }
}

/// The staged serializer.
#[derive(Debug, Clone, Default)]
pub struct StagedSerializer {
    dictionaries: Arc<DictionarySet>,
}

impl StagedSerializer {
    pub fn new(dictionaries: DictionarySet) -> Self {
        Self {
            dictionaries: Arc::new(dictionaries),
        }
    }

    pub fn dictionaries(&self) -> &DictionarySet {
        &self.dictionaries
    }

    /// Encode a record through every stage.
    pub fn encode(&self, record: &Record) -> Result<Staged, StagingError> {
        let structured = record.canonical_bytes()?;
        if structured.len() > MAX_RECORD_BYTES {
            return Err(StagingError::Oversized {
                size: structured.len(),
                limit: MAX_RECORD_BYTES,
            });
        }

        let dict = self.dictionaries.current();
        let symbolic = symbolic::encode(record)?;
        let compact = compact::encode(&symbolic, dict)?;

        let chain = StagedChain {
            dictionary_version: dict.version(),
            stage_sizes: [structured.len(), symbolic.len(), compact.len()],
            structured_checksum: xxh3_64(&structured),
        };

        Ok(Staged {
            stages: vec![
                StagedRepresentation::new(Stage::Structured, structured),
                StagedRepresentation::new(Stage::Symbolic, symbolic),
                StagedRepresentation::new(Stage::Compact, compact),
            ],
            chain,
        })
    }

    /// Decode a representation down to an earlier (or the same) stage.
    pub fn decode(
        &self,
        representation: &StagedRepresentation,
        target: Stage,
    ) -> Result<StagedRepresentation, StagingError> {
        if target > representation.stage {
            return Err(StagingError::InvalidTarget {
                from: representation.stage,
                to: target,
            });
        }

        let mut current = representation.clone();
        while current.stage > target {
            current = self.decode_step(&current)?;
        }
        Ok(current)
    }

    /// Decode exactly one stage.
    fn decode_step(
        &self,
        representation: &StagedRepresentation,
    ) -> Result<StagedRepresentation, StagingError> {
        match representation.stage {
            Stage::Compact => {
                let symbolic = compact::decode(&representation.bytes, &self.dictionaries)?;
                Ok(StagedRepresentation::new(Stage::Symbolic, symbolic))
            }
            Stage::Symbolic => {
                let structured = symbolic::decode(&representation.bytes)?;
                Ok(StagedRepresentation::new(Stage::Structured, structured))
            }
            Stage::Structured => Ok(representation.clone()),
        }
    }

    /// Decode a compact payload all the way back to a record.
    pub fn decode_record(&self, compact: &Bytes) -> Result<Record, StagingError> {
        let structured = self.decode(
            &StagedRepresentation::new(Stage::Compact, compact.clone()),
            Stage::Structured,
        )?;
        Record::from_canonical(&structured.bytes)
    }
}
