//! nexus-rag - on-device semantic retrieval over a precomputed embedding
//! matrix.
//!
//! A query is tokenized with a SentencePiece-style BPE tokenizer, run
//! through an external neural encoder, mean-pooled and L2-normalized, then
//! scored against every stored document vector. The top-K rows come back
//! as 1-based document ids.
//!
//! # Quick start
//!
//! ```no_run
//! use nexus_rag::{LoadRequest, RetrievalService};
//!
//! # async fn run() -> nexus_rag::Result<()> {
//! let service = RetrievalService::new()?;
//! let request = LoadRequest::new("rag_embeddings.bin", 384)
//!     .with_tokenizer("tokenizer.json")
//!     .with_encoder("embedding_model.onnx")
//!     .with_query_prefix("query: ");
//!
//! service.load_index(request).await?;
//! let ids = service.search("how long to boil pasta", 3).await?;
//! println!("{ids:?}");
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod data_dir;
pub mod embedding;
pub mod encoder;
pub mod error;
pub mod index_config;
pub mod service;
pub mod tokenizer;
pub mod vector_index;

pub use data_dir::DataDir;
pub use embedding::EmbeddingPipeline;
pub use encoder::{DefaultEncoderLoader, Encoder, EncoderLoader};
pub use error::{Error, ErrorKind, Result};
pub use index_config::IndexConfig;
pub use service::{IndexStatus, LoadRequest, RetrievalService, ServiceState};
pub use tokenizer::{Tokenizer, TokenizerKind};
pub use vector_index::{RankedDocument, VectorIndex};
