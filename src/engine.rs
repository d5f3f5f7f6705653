//! Shared engine state
//!
//! Wires one policy, sniffer, name generator and artifact store into the
//! single-shot and chunked upload paths. Cheap to clone.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::upload::{
    ArtifactStore, ChunkAssembler, ChunkStore, NameGenerator, Policy, RandomNames,
    SessionRegistry, SignatureSniffer, SingleShotProcessor, Sniffer, ValidationHook,
};

/// Upload engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    policy: Arc<Policy>,
    store: ArtifactStore,
    processor: SingleShotProcessor,
    chunks: ChunkStore,
    assembler: ChunkAssembler,
    sessions: SessionRegistry,
}

impl Engine {
    /// Create an engine with the signature sniffer and random names
    pub async fn new(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            sniffer: Arc::new(SignatureSniffer),
            names: Arc::new(RandomNames),
            hook: None,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn policy(&self) -> &Policy {
        &self.inner.policy
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// Single-shot batch processor
    pub fn processor(&self) -> &SingleShotProcessor {
        &self.inner.processor
    }

    /// Chunk storage
    pub fn chunks(&self) -> &ChunkStore {
        &self.inner.chunks
    }

    pub fn assembler(&self) -> &ChunkAssembler {
        &self.inner.assembler
    }

    /// Progress, listing and cancellation of chunk sessions
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Start the idle-session reaper if a TTL is configured
    pub fn start_reaper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let ttl = self.inner.config.session_ttl()?;
        let every = self.inner.config.reaper_interval();
        tracing::info!(
            ttl_hours = self.inner.config.session_ttl_hours,
            interval_secs = every.as_secs(),
            "Starting chunk session reaper"
        );
        Some(self.inner.sessions.clone().start_reaper_task(every, ttl))
    }
}

/// Builder for [`Engine`] with injectable collaborators
pub struct EngineBuilder {
    config: Config,
    sniffer: Arc<dyn Sniffer>,
    names: Arc<dyn NameGenerator>,
    hook: Option<ValidationHook>,
}

impl EngineBuilder {
    pub fn sniffer(mut self, sniffer: Arc<dyn Sniffer>) -> Self {
        self.sniffer = sniffer;
        self
    }

    pub fn names(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = names;
        self
    }

    /// Check run on every single-shot artifact after promotion
    pub fn validation_hook(mut self, hook: ValidationHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Open the chunk store (recovering sessions on disk) and wire everything up
    pub async fn build(self) -> Result<Engine> {
        let Self {
            config,
            sniffer,
            names,
            hook,
        } = self;

        let policy = Arc::new(config.policy.clone());
        let store = ArtifactStore::new(&config.upload_path, config.temp_path.clone());
        let chunks = ChunkStore::open_with_limit(
            &config.chunks_directory,
            names.clone(),
            config.max_chunks_per_session,
        )
        .await?;

        let processor = SingleShotProcessor::new(
            policy.clone(),
            sniffer.clone(),
            names.clone(),
            store.clone(),
            hook,
        );
        let assembler = ChunkAssembler::new(
            chunks.clone(),
            store.clone(),
            policy.clone(),
            sniffer,
            names,
        );
        let sessions = SessionRegistry::new(chunks.clone());

        tracing::info!(
            upload_path = %config.upload_path.display(),
            chunks_directory = %config.chunks_directory.display(),
            "Upload engine ready"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                policy,
                store,
                processor,
                chunks,
                assembler,
                sessions,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{FileSubmission, FixedSniffer};
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        Config {
            upload_path: dir.path().join("uploads"),
            temp_path: Some(dir.path().join("temp")),
            chunks_directory: dir.path().join("chunks"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_new_creates_chunks_directory() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(config_in(&dir)).await.unwrap();

        assert!(dir.path().join("chunks").is_dir());
        assert_eq!(engine.chunks().root(), dir.path().join("chunks"));
        assert!(engine.sessions().list().is_empty());
    }

    #[tokio::test]
    async fn test_builder_injects_sniffer() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.policy.allowed_types = vec!["image/png".to_string()];

        let engine = Engine::builder(config)
            .sniffer(Arc::new(FixedSniffer::new("image/png")))
            .build()
            .await
            .unwrap();

        let artifact = engine
            .processor()
            .process_one(FileSubmission::from_bytes("pic.png", *b"not really"), None, true)
            .await
            .unwrap();
        assert_eq!(artifact.detected_type, "image/png");
    }

    #[tokio::test]
    async fn test_reaper_disabled_without_ttl() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            session_ttl_hours: 0,
            ..config_in(&dir)
        };
        let engine = Engine::new(config).await.unwrap();
        assert!(engine.start_reaper().is_none());
    }
}
