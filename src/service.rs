//! Wires the store, writer task, router and ingestor together.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::archive::EntryArchive;
use crate::cache::promoter::{CasWriter, PromotionManager};
use crate::cache::store::ContentStore;
use crate::compute::{AnalysisBackend, ComputeBackend, ShapeBackend};
use crate::config::Config;
use crate::ingest::Ingestor;
use crate::metrics::Metrics;
use crate::router::Router;
use crate::staging::{DictionarySet, StagedSerializer, SymbolDictionary};

/// A running instance.
pub struct Service {
    pub config: Arc<Config>,
    pub store: Arc<ContentStore>,
    pub writer: CasWriter,
    pub router: Arc<Router>,
    pub ingestor: Arc<Ingestor>,
    pub metrics: Arc<Metrics>,
    writer_task: JoinHandle<()>,
}

impl Service {
    /// Start with the built-in Tier B and Tier C backends.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        Self::start_with_backends(
            config,
            Arc::new(ShapeBackend::default()),
            Arc::new(AnalysisBackend::new()),
        )
        .await
    }

    pub async fn start_with_backends(
        config: Config,
        tier_b: Arc<dyn ComputeBackend>,
        tier_c: Arc<dyn ComputeBackend>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let mut dictionaries = DictionarySet::builtin();
        for path in &config.staging.dictionary_paths {
            let dictionary = SymbolDictionary::load(path)?;
            info!(
                version = dictionary.version(),
                tokens = dictionary.len(),
                path = %path.display(),
                "Loaded dictionary"
            );
            dictionaries.register(dictionary)?;
        }
        let serializer = StagedSerializer::new(dictionaries);
        info!(
            dictionary_version = serializer.dictionaries().current().version(),
            "Staged serializer ready"
        );

        let metrics = Arc::new(Metrics::new()?);
        let store = Arc::new(ContentStore::new(serializer.clone()));

        let archive = match &config.archive.path {
            Some(path) => Some(
                EntryArchive::open(path, config.archive.zstd_level)
                    .await
                    .with_context(|| format!("opening entry archive at {}", path.display()))?,
            ),
            None => None,
        };

        let mut manager =
            PromotionManager::new(Arc::clone(&store), &config, Arc::clone(&metrics), archive);
        let restored = manager.restore().await?;
        if restored > 0 {
            info!(restored, "Restored archived entries");
        }
        let (writer, writer_task) = manager.spawn();

        let router = Arc::new(Router::new(
            &config,
            Arc::clone(&store),
            writer.clone(),
            tier_b,
            tier_c,
            Arc::clone(&metrics),
        ));
        let ingestor = Arc::new(Ingestor::new(serializer, writer.clone(), Arc::clone(&metrics)));

        Ok(Self {
            config,
            store,
            writer,
            router,
            ingestor,
            metrics,
            writer_task,
        })
    }

    /// Stop accepting writes and wait for queued ones to be applied.
    ///
    /// The writer task exits once every [`CasWriter`] clone is dropped,
    /// including those held by the router and ingestor.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.writer.flush().await?;
        drop(self.writer);
        drop(self.router);
        drop(self.ingestor);
        self.writer_task.await?;
        info!("Service stopped");
        Ok(())
    }
}
