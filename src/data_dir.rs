use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "NEXUS_RAG_DATA_DIR";

/// Directory holding the retrieval artifacts produced by the index builder.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The NEXUS_RAG_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/nexus-rag/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("nexus-rag")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn embeddings_blob(&self) -> PathBuf {
        self.root.join("rag_embeddings.bin")
    }

    pub fn tokenizer(&self) -> PathBuf {
        self.root.join("tokenizer.json")
    }

    pub fn encoder_model(&self) -> PathBuf {
        self.root.join("embedding_model.onnx")
    }

    pub fn index_config(&self) -> PathBuf {
        self.root.join("rag_config.json")
    }
}
