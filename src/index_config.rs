use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metadata written next to the embedding blob by the index builder
/// (`rag_config.json`). Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub embedding_dim: usize,
    pub embedding_model: Option<String>,
    pub total_documents: Option<usize>,
    /// Row count of the blob, cross-checked at load time.
    pub num_vectors: Option<usize>,
    pub max_text_length: Option<usize>,
    /// Prefix the encoder expects on queries, e.g. `"query: "`.
    pub query_prefix: Option<String>,
    pub version: Option<String>,
}

impl IndexConfig {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "index config",
                path: path.to_path_buf(),
            });
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::malformed("index config", e.to_string()))
    }
}
