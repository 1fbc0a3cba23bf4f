//! The retrieval service: one dedicated worker thread per instance that
//! runs load, search and teardown in submission order.
//!
//! Callers hold a cheap, cloneable [`RetrievalService`] handle and await
//! each operation; every call resolves exactly once, either with the
//! operation's result or with [`Error::WorkerStopped`] if the worker went
//! away first.

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    data_dir::DataDir,
    embedding::EmbeddingPipeline,
    encoder::{DefaultEncoderLoader, Encoder, EncoderLoader},
    error::{Error, Result},
    index_config::IndexConfig,
    tokenizer::{Tokenizer, TokenizerKind},
    vector_index::VectorIndex,
};

pub const DEFAULT_EMBEDDING_DIM: usize = 384;

/// Lifecycle of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unloaded,
    Loading,
    Ready,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Unloaded => f.write_str("unloaded"),
            ServiceState::Loading => f.write_str("loading"),
            ServiceState::Ready => f.write_str("ready"),
        }
    }
}

/// Arguments to [`RetrievalService::load_index`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// Required. Raw f32 LE embedding blob.
    pub index_path: PathBuf,
    /// `tokenizer.json`; without it queries use the fallback tokenizer.
    pub tokenizer_path: Option<PathBuf>,
    /// Encoder artifact; without it every search fails.
    pub encoder_path: Option<PathBuf>,
    pub embedding_dim: usize,
    pub query_prefix: Option<String>,
    /// Row count the index builder recorded. A mismatch is only logged.
    pub expected_vectors: Option<usize>,
}

impl LoadRequest {
    pub fn new(index_path: impl Into<PathBuf>, embedding_dim: usize) -> Self {
        Self {
            index_path: index_path.into(),
            tokenizer_path: None,
            encoder_path: None,
            embedding_dim,
            query_prefix: None,
            expected_vectors: None,
        }
    }

    pub fn with_tokenizer(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokenizer_path = Some(path.into());
        self
    }

    pub fn with_encoder(mut self, path: impl Into<PathBuf>) -> Self {
        self.encoder_path = Some(path.into());
        self
    }

    pub fn with_query_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.query_prefix = Some(prefix.into());
        self
    }

    /// Build a request from the conventional artifact layout of `data_dir`.
    ///
    /// Optional artifacts are only included when present on disk. The
    /// dimension, query prefix and expected row count come from `config`
    /// when given.
    pub fn from_data_dir(data_dir: &DataDir, config: Option<&IndexConfig>) -> Self {
        let embedding_dim = config
            .map(|c| c.embedding_dim)
            .unwrap_or(DEFAULT_EMBEDDING_DIM);

        let mut request = Self::new(data_dir.embeddings_blob(), embedding_dim);
        let tokenizer = data_dir.tokenizer();
        if tokenizer.exists() {
            request.tokenizer_path = Some(tokenizer);
        }
        let encoder = data_dir.encoder_model();
        if encoder.exists() {
            request.encoder_path = Some(encoder);
        }
        if let Some(config) = config {
            request.query_prefix = config.query_prefix.clone();
            request.expected_vectors = config.num_vectors;
        }
        request
    }
}

/// Snapshot of what a service instance has loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStatus {
    pub state: ServiceState,
    pub num_vectors: usize,
    pub dimension: usize,
    pub tokenizer: Option<TokenizerKind>,
    pub has_encoder: bool,
    pub query_prefix: Option<String>,
}

impl IndexStatus {
    fn unloaded(state: ServiceState) -> Self {
        Self {
            state,
            num_vectors: 0,
            dimension: 0,
            tokenizer: None,
            has_encoder: false,
            query_prefix: None,
        }
    }
}

enum Command {
    Load {
        request: LoadRequest,
        reply: oneshot::Sender<Result<IndexStatus>>,
    },
    Search {
        query: String,
        top_k: usize,
        reply: oneshot::Sender<Result<Vec<u64>>>,
    },
    Tokenize {
        text: String,
        reply: oneshot::Sender<Vec<u32>>,
    },
    Status {
        reply: oneshot::Sender<IndexStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a retrieval worker. Clones share the same worker and queue.
#[derive(Clone)]
pub struct RetrievalService {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ServiceState>,
}

impl RetrievalService {
    /// Start a worker that loads encoders with [`DefaultEncoderLoader`].
    pub fn new() -> Result<Self> {
        Self::with_encoder_loader(DefaultEncoderLoader)
    }

    pub fn with_encoder_loader(
        loader: impl EncoderLoader + 'static,
    ) -> Result<Self> {
        let (commands, queue) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ServiceState::Unloaded);

        let worker = Worker {
            loader: Box::new(loader),
            loaded: None,
            state: state_tx,
        };
        std::thread::Builder::new()
            .name("retrieval-worker".to_string())
            .spawn(move || worker.run(queue))?;

        Ok(Self { commands, state })
    }

    /// Current lifecycle state, read without queueing behind pending work.
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Load (or replace) the index, tokenizer and encoder.
    ///
    /// Only a problem with the embedding blob fails the load; an unusable
    /// tokenizer or encoder degrades to the fallback path and is logged.
    /// On failure any previously loaded state is discarded.
    pub async fn load_index(&self, request: LoadRequest) -> Result<IndexStatus> {
        self.call(|reply| Command::Load { request, reply }).await?
    }

    /// Top-`top_k` document ids (1-based rows) for `query`, best first.
    ///
    /// Fails with [`Error::NotReady`] before a successful load. An empty
    /// result means the index is loaded but has no rows.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<u64>> {
        let query = query.to_string();
        self.call(|reply| Command::Search {
            query,
            top_k,
            reply,
        })
        .await?
    }

    /// Token ids the loaded pipeline would feed the encoder for `text`.
    pub async fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let text = text.to_string();
        self.call(|reply| Command::Tokenize { text, reply }).await
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// Release the loaded state (and the encoder's native session) on the
    /// worker, after everything queued before it, and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::WorkerStopped)?;
        response.await.map_err(|_| Error::WorkerStopped)
    }
}

impl std::fmt::Debug for RetrievalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalService")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Loaded {
    index: VectorIndex,
    pipeline: EmbeddingPipeline,
}

struct Worker {
    loader: Box<dyn EncoderLoader>,
    loaded: Option<Loaded>,
    state: watch::Sender<ServiceState>,
}

impl Worker {
    fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!("retrieval worker started");

        // A dropped reply receiver means the caller stopped waiting; the
        // operation has still run, so send errors are ignored.
        while let Some(command) = queue.blocking_recv() {
            match command {
                Command::Load { request, reply } => {
                    let _ = reply.send(self.load(request));
                }
                Command::Search {
                    query,
                    top_k,
                    reply,
                } => {
                    let _ = reply.send(self.search(&query, top_k));
                }
                Command::Tokenize { text, reply } => {
                    let _ = reply.send(self.tokenize(&text));
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown { reply } => {
                    self.release();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        tracing::debug!("retrieval worker stopped");
    }

    fn set_state(&self, state: ServiceState) {
        self.state.send_replace(state);
    }

    fn current_state(&self) -> ServiceState {
        *self.state.borrow()
    }

    fn load(&mut self, request: LoadRequest) -> Result<IndexStatus> {
        self.set_state(ServiceState::Loading);

        match self.build(&request) {
            Ok(loaded) => {
                self.loaded = Some(loaded);
                self.set_state(ServiceState::Ready);
                let status = self.status();
                tracing::info!(
                    num_vectors = status.num_vectors,
                    dimension = status.dimension,
                    tokenizer = ?status.tokenizer,
                    has_encoder = status.has_encoder,
                    "retrieval index ready"
                );
                Ok(status)
            }
            Err(e) => {
                self.loaded = None;
                self.set_state(ServiceState::Unloaded);
                tracing::warn!(
                    error = %e,
                    index_path = %request.index_path.display(),
                    "failed to load retrieval index"
                );
                Err(e)
            }
        }
    }

    fn build(&self, request: &LoadRequest) -> Result<Loaded> {
        if request.index_path.as_os_str().is_empty() {
            return Err(Error::ConfigMissing("index path"));
        }
        if request.embedding_dim == 0 {
            return Err(Error::ConfigMissing("embedding dimension"));
        }
        let dimension = request.embedding_dim;

        let index = VectorIndex::open(&request.index_path, dimension)?;
        if let Some(expected) = request.expected_vectors {
            if expected != index.len() {
                tracing::warn!(
                    expected,
                    actual = index.len(),
                    "index config row count disagrees with embedding blob"
                );
            }
        }

        let tokenizer = match &request.tokenizer_path {
            Some(path) => Tokenizer::from_file(path).unwrap_or_else(|e| {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "tokenizer unusable"
                );
                Tokenizer::fallback()
            }),
            None => Tokenizer::fallback(),
        };

        let encoder = match &request.encoder_path {
            Some(path) => self.load_encoder(path, dimension),
            None => {
                tracing::warn!("no encoder configured; searches will fail");
                None
            }
        };

        let pipeline = EmbeddingPipeline::new(tokenizer, encoder, dimension)
            .with_query_prefix(request.query_prefix.clone());

        Ok(Loaded { index, pipeline })
    }

    fn load_encoder(
        &self,
        path: &std::path::Path,
        dimension: usize,
    ) -> Option<Box<dyn Encoder>> {
        match self.loader.load(path, dimension) {
            Ok(encoder) if encoder.dimension() == dimension => Some(encoder),
            Ok(encoder) => {
                tracing::warn!(
                    encoder_dimension = encoder.dimension(),
                    dimension,
                    "encoder width does not match index; searches will fail"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "encoder unavailable; searches will fail"
                );
                None
            }
        }
    }

    fn search(&mut self, query: &str, top_k: usize) -> Result<Vec<u64>> {
        let loaded = self.loaded.as_mut().ok_or(Error::NotReady)?;

        let embedding = loaded.pipeline.embed(query)?;
        let ranked = loaded.index.query(&embedding, top_k)?;

        tracing::debug!(
            top_k,
            results = ranked.len(),
            best = ranked.first().map(|r| r.score),
            "search complete"
        );
        Ok(ranked.into_iter().map(|r| r.doc_id).collect())
    }

    fn tokenize(&self, text: &str) -> Vec<u32> {
        match &self.loaded {
            Some(loaded) => loaded.pipeline.tokenize(text),
            None => Tokenizer::fallback().encode(text),
        }
    }

    fn status(&self) -> IndexStatus {
        let state = self.current_state();
        match &self.loaded {
            Some(loaded) => IndexStatus {
                state,
                num_vectors: loaded.index.len(),
                dimension: loaded.index.dimension(),
                tokenizer: Some(loaded.pipeline.tokenizer().kind()),
                has_encoder: loaded.pipeline.has_encoder(),
                query_prefix: loaded.pipeline.query_prefix().map(str::to_string),
            },
            None => IndexStatus::unloaded(state),
        }
    }

    fn release(&mut self) {
        if self.loaded.take().is_some() {
            tracing::debug!("released retrieval index");
        }
        self.set_state(ServiceState::Unloaded);
    }
}

// Runs on every exit from `Worker::run`, unwinding included, so `state()`
// never reports a worker that is gone.
impl Drop for Worker {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("retrieval worker panicked; releasing loaded state");
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_data_dir_skips_absent_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();

        let request = LoadRequest::from_data_dir(&data_dir, None);
        assert_eq!(request.index_path, data_dir.embeddings_blob());
        assert_eq!(request.embedding_dim, DEFAULT_EMBEDDING_DIM);
        assert!(request.tokenizer_path.is_none());
        assert!(request.encoder_path.is_none());
    }

    #[test]
    fn from_data_dir_uses_config_and_present_files() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        std::fs::write(data_dir.tokenizer(), "{}").unwrap();

        let config = IndexConfig::from_json(
            r#"{"embedding_dim": 8, "num_vectors": 4, "query_prefix": "query: "}"#,
        )
        .unwrap();
        let request = LoadRequest::from_data_dir(&data_dir, Some(&config));

        assert_eq!(request.embedding_dim, 8);
        assert_eq!(request.expected_vectors, Some(4));
        assert_eq!(request.query_prefix.as_deref(), Some("query: "));
        assert_eq!(request.tokenizer_path, Some(data_dir.tokenizer()));
        assert!(request.encoder_path.is_none());
    }
}
