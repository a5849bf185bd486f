//! Content-addressable store and its single writer.
//!
//! - [`entry`]: CacheEntry, Tier and Origin definitions
//! - [`store`]: the concurrent-read CAS
//! - [`evictor`]: Tier A eviction policy (stale + LRU watermark)
//! - [`promoter`]: single-writer task for puts, promotions and sweeps
//! - [`archive`]: zstd-compressed on-disk entry archive

pub mod archive;
pub mod entry;
pub mod evictor;
pub mod promoter;
pub mod store;

pub use entry::{CacheEntry, Origin, Tier};
pub use promoter::{CasWriter, Decision, Observation, PromotionManager};
pub use store::{CasError, ContentStore, Lookup, PutOutcome};
