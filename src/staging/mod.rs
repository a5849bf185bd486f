//! Staged compression pipeline.
//!
//! - [`record`]: the Record payload and its canonical form
//! - [`dictionary`]: closed, versioned interned-symbol tables
//! - [`symbolic`]: stage 0 ↔ stage 1 tagged binary codec
//! - [`compact`]: stage 1 ↔ stage 2 dictionary substitution
//! - [`serializer`]: the staged serializer tying the stages together

mod compact;
pub mod dictionary;
pub mod record;
pub mod serializer;
mod symbolic;

pub use dictionary::{DictionarySet, SymbolDictionary};
pub use record::Record;
pub use serializer::{
    Stage, Staged, StagedChain, StagedRepresentation, StagedSerializer, StagingError,
};
