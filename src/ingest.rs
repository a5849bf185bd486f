//! Record ingestion: stage a record, derive its key and store it.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::cache::entry::{CacheEntry, Origin};
use crate::cache::promoter::CasWriter;
use crate::cache::store::{CasError, PutOutcome};
use crate::keys::{KeyContext, KeyEngine, TrivariateKey};
use crate::metrics::Metrics;
use crate::staging::{Record, StagedSerializer, StagingError};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Cas(#[from] CasError),
}

/// What ingestion produced.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub key: TrivariateKey,
    /// Fixed-width base-91 form of the key.
    pub compact_key: String,
    pub stage_sizes: [usize; 3],
    pub outcome: PutOutcome,
}

pub struct Ingestor {
    serializer: StagedSerializer,
    keys: KeyEngine,
    writer: CasWriter,
    metrics: Arc<Metrics>,
}

impl Ingestor {
    pub fn new(serializer: StagedSerializer, writer: CasWriter, metrics: Arc<Metrics>) -> Self {
        Self {
            serializer,
            keys: KeyEngine::new(),
            writer,
            metrics,
        }
    }

    /// Stage, key and store a record. Ingesting the same record twice
    /// returns the same key with `AlreadyExists`.
    pub async fn ingest(
        &self,
        record: &Record,
        context: &KeyContext,
        identity: &str,
    ) -> Result<IngestReceipt, IngestError> {
        let staged = self.serializer.encode(record)?;
        self.metrics.record_staging(&staged.chain);

        let payload = staged.compact().bytes.clone();
        let key = self.keys.derive_for(&payload, context, identity);
        let fingerprint = self.keys.fingerprint(&payload);
        let stage_sizes = staged.sizes();

        let entry = CacheEntry::new(
            key,
            payload,
            fingerprint,
            Some(staged.chain),
            Origin::Ingested,
            1.0,
        );
        let outcome = self.writer.put(entry).await?;

        info!(
            key = %key,
            schema = record.schema(),
            structured = stage_sizes[0],
            symbolic = stage_sizes[1],
            compact = stage_sizes[2],
            outcome = ?outcome,
            "Ingested record"
        );
        Ok(IngestReceipt {
            key,
            compact_key: key.to_compact(),
            stage_sizes,
            outcome,
        })
    }
}
