use std::path::Path;

use candle_core::Tensor;

use crate::error::{Error, Result};

/// A neural text encoder: token ids in, one hidden vector per token out.
///
/// Implementations own their native runtime handles; dropping the encoder
/// releases them.
pub trait Encoder: Send {
    /// Width of each hidden vector.
    fn dimension(&self) -> usize;

    /// Run the encoder over `token_ids`.
    ///
    /// Returns a 2D tensor of shape `[token_ids.len(), dimension]`. Any
    /// runtime failure is reported as [`Error::EncoderUnavailable`].
    fn encode(&mut self, token_ids: &[u32]) -> Result<Tensor>;
}

/// Builds an [`Encoder`] from a model artifact on disk.
pub trait EncoderLoader: Send {
    fn load(&self, path: &Path, dimension: usize) -> Result<Box<dyn Encoder>>;
}

/// Loads `.onnx` artifacts when built with the `onnx` feature.
///
/// Without the feature the artifact is only checked for existence and
/// every load reports [`Error::EncoderUnavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEncoderLoader;

impl EncoderLoader for DefaultEncoderLoader {
    fn load(&self, path: &Path, dimension: usize) -> Result<Box<dyn Encoder>> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "encoder model",
                path: path.to_path_buf(),
            });
        }

        #[cfg(feature = "onnx")]
        {
            Ok(Box::new(onnx::OnnxEncoder::load(path, dimension)?))
        }

        #[cfg(not(feature = "onnx"))]
        {
            let _ = dimension;
            Err(Error::EncoderUnavailable(format!(
                "cannot run {}: built without the `onnx` feature",
                path.display()
            )))
        }
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxEncoder;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use candle_core::{Device, Tensor};
    use ort::session::{Session, builder::GraphOptimizationLevel};

    use super::Encoder;
    use crate::error::{Error, Result};

    const INPUT_IDS: &str = "input_ids";
    const ATTENTION_MASK: &str = "attention_mask";
    const LAST_HIDDEN_STATE: &str = "last_hidden_state";

    fn unavailable<E: std::fmt::Display>(
        context: &'static str,
    ) -> impl FnOnce(E) -> Error {
        move |e| Error::EncoderUnavailable(format!("{context}: {e}"))
    }

    /// Transformer encoder exported to ONNX with `input_ids` and
    /// `attention_mask` inputs and a `last_hidden_state` output.
    pub struct OnnxEncoder {
        session: Session,
        dimension: usize,
    }

    impl OnnxEncoder {
        pub fn load(path: &Path, dimension: usize) -> Result<Self> {
            tracing::info!(model_path = %path.display(), "loading ONNX encoder");

            let session = Session::builder()
                .map_err(unavailable("failed to create ONNX session builder"))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(unavailable("failed to set optimization level"))?
                .commit_from_file(path)
                .map_err(unavailable("failed to load ONNX model"))?;

            Ok(Self { session, dimension })
        }
    }

    impl Encoder for OnnxEncoder {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn encode(&mut self, token_ids: &[u32]) -> Result<Tensor> {
            let len = token_ids.len();
            let input_ids: Vec<i64> =
                token_ids.iter().map(|&id| i64::from(id)).collect();
            let attention_mask = vec![1i64; len];

            let input_ids = ort::value::Tensor::from_array((
                vec![1, len],
                input_ids.into_boxed_slice(),
            ))
            .map_err(unavailable("failed to create input_ids tensor"))?;
            let attention_mask = ort::value::Tensor::from_array((
                vec![1, len],
                attention_mask.into_boxed_slice(),
            ))
            .map_err(unavailable("failed to create attention_mask tensor"))?;

            let outputs = self
                .session
                .run(ort::inputs![
                    INPUT_IDS => input_ids,
                    ATTENTION_MASK => attention_mask,
                ])
                .map_err(unavailable("ONNX inference failed"))?;

            let hidden = outputs.get(LAST_HIDDEN_STATE).ok_or_else(|| {
                Error::EncoderUnavailable(format!(
                    "model output '{LAST_HIDDEN_STATE}' not found"
                ))
            })?;
            let (shape, data) = hidden
                .try_extract_tensor::<f32>()
                .map_err(unavailable("failed to extract output tensor"))?;

            // [1, seq_len, hidden_dim]
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            if dims != [1, len, self.dimension] {
                return Err(Error::EncoderUnavailable(format!(
                    "unexpected output shape {dims:?}, expected [1, {len}, {}]",
                    self.dimension
                )));
            }

            Ok(Tensor::from_slice(data, (len, self.dimension), &Device::Cpu)?)
        }
    }

    impl Drop for OnnxEncoder {
        fn drop(&mut self) {
            tracing::debug!("releasing ONNX encoder session");
        }
    }
}
