use std::panic::{AssertUnwindSafe, catch_unwind};

use candle_core::{DType, Tensor};

use crate::{
    encoder::Encoder,
    error::{Error, Result},
    tokenizer::Tokenizer,
};

/// Turns query text into a single unit-length embedding vector.
///
/// tokenize -> encode -> mean pool over every token position (BOS and EOS
/// included) -> L2 normalize.
pub struct EmbeddingPipeline {
    tokenizer: Tokenizer,
    encoder: Option<Box<dyn Encoder>>,
    dimension: usize,
    query_prefix: Option<String>,
}

impl EmbeddingPipeline {
    pub fn new(
        tokenizer: Tokenizer,
        encoder: Option<Box<dyn Encoder>>,
        dimension: usize,
    ) -> Self {
        Self {
            tokenizer,
            encoder,
            dimension,
            query_prefix: None,
        }
    }

    /// Prepend `prefix` to every query before tokenization (e.g. `"query: "`
    /// for E5-style encoders).
    pub fn with_query_prefix(mut self, prefix: Option<String>) -> Self {
        self.query_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn query_prefix(&self) -> Option<&str> {
        self.query_prefix.as_deref()
    }

    /// Token ids for `text` exactly as [`embed`](Self::embed) would feed
    /// them to the encoder.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        match &self.query_prefix {
            Some(prefix) => self.tokenizer.encode(&format!("{prefix}{text}")),
            None => self.tokenizer.encode(text),
        }
    }

    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let token_ids = self.tokenize(text);
        let dimension = self.dimension;

        let encoder = self.encoder.as_mut().ok_or_else(|| {
            Error::EncoderUnavailable("no encoder configured".to_string())
        })?;
        // A panicking runtime fails this query only.
        let hidden = catch_unwind(AssertUnwindSafe(|| encoder.encode(&token_ids)))
            .map_err(|payload| {
                let message = panic_message(&*payload);
                tracing::error!(panic = %message, "encoder panicked");
                Error::EncoderUnavailable(format!("encoder panicked: {message}"))
            })??;

        let (rows, cols) = hidden.dims2().map_err(|e| {
            Error::EncoderUnavailable(format!(
                "unexpected hidden state shape: {e}"
            ))
        })?;
        if rows != token_ids.len() || cols != dimension {
            return Err(Error::EncoderUnavailable(format!(
                "encoder returned [{rows}, {cols}], expected [{}, {dimension}]",
                token_ids.len()
            )));
        }

        let pooled = mean_pool(&hidden)?;
        l2_normalize(&pooled)
    }
}

impl std::fmt::Debug for EmbeddingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingPipeline")
            .field("tokenizer", &self.tokenizer.kind())
            .field("has_encoder", &self.has_encoder())
            .field("dimension", &self.dimension)
            .field("query_prefix", &self.query_prefix)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Average a `[tokens, dimension]` tensor over its token axis.
pub fn mean_pool(hidden: &Tensor) -> Result<Tensor> {
    let hidden = hidden.to_dtype(DType::F32)?;
    let (rows, cols) = hidden.dims2()?;
    if rows == 0 {
        return Ok(Tensor::zeros(cols, DType::F32, hidden.device())?);
    }
    Ok(hidden.mean(0)?)
}

/// Scale a 1D tensor to unit L2 norm.
///
/// A zero vector is returned unchanged; it scores zero against every
/// document.
pub fn l2_normalize(vector: &Tensor) -> Result<Vec<f32>> {
    let norm = vector.sqr()?.sum_all()?.to_scalar::<f32>()?.sqrt();
    if norm == 0.0 {
        tracing::warn!("query embedding has zero norm; all scores will be 0");
        return Ok(vector.to_vec1::<f32>()?);
    }
    Ok((vector / f64::from(norm))?.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::{
        error::ErrorKind,
        tokenizer::{MergeRanks, Vocabulary},
    };

    /// Emits `[id, 1.0]` for each token id.
    struct IdEncoder;

    impl Encoder for IdEncoder {
        fn dimension(&self) -> usize {
            2
        }

        fn encode(&mut self, token_ids: &[u32]) -> Result<Tensor> {
            let data: Vec<f32> = token_ids
                .iter()
                .flat_map(|&id| [id as f32, 1.0])
                .collect();
            Ok(Tensor::from_vec(data, (token_ids.len(), 2), &Device::Cpu)?)
        }
    }

    struct ZeroEncoder;

    impl Encoder for ZeroEncoder {
        fn dimension(&self) -> usize {
            2
        }

        fn encode(&mut self, token_ids: &[u32]) -> Result<Tensor> {
            Ok(Tensor::zeros((token_ids.len(), 2), DType::F32, &Device::Cpu)?)
        }
    }

    struct WrongWidthEncoder;

    impl Encoder for WrongWidthEncoder {
        fn dimension(&self) -> usize {
            3
        }

        fn encode(&mut self, token_ids: &[u32]) -> Result<Tensor> {
            Ok(Tensor::ones((token_ids.len(), 3), DType::F32, &Device::Cpu)?)
        }
    }

    struct PanickingEncoder;

    impl Encoder for PanickingEncoder {
        fn dimension(&self) -> usize {
            2
        }

        fn encode(&mut self, _token_ids: &[u32]) -> Result<Tensor> {
            panic!("runtime blew up");
        }
    }

    fn ab_tokenizer() -> Tokenizer {
        let vocab = Vocabulary::new(
            [("<s>", 0), ("</s>", 1), ("<unk>", 2), ("▁a", 3), ("▁b", 4)]
                .into_iter()
                .map(|(t, id)| (t.to_string(), id))
                .collect(),
        )
        .unwrap();
        Tokenizer::new(vocab, MergeRanks::default())
    }

    #[test]
    fn mean_pool_includes_sentinels() {
        let mut pipeline =
            EmbeddingPipeline::new(ab_tokenizer(), Some(Box::new(IdEncoder)), 2);

        // ids [0, 3, 4, 1] -> mean [2.0, 1.0] -> [2, 1] / sqrt(5)
        let v = pipeline.embed("a b").unwrap();
        let s = 5f32.sqrt();
        assert!((v[0] - 2.0 / s).abs() < 1e-6);
        assert!((v[1] - 1.0 / s).abs() < 1e-6);
    }

    #[test]
    fn embedding_has_unit_norm() {
        let mut pipeline =
            EmbeddingPipeline::new(ab_tokenizer(), Some(Box::new(IdEncoder)), 2);
        let v = pipeline.embed("b a b a").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn embed_is_deterministic() {
        let mut pipeline =
            EmbeddingPipeline::new(ab_tokenizer(), Some(Box::new(IdEncoder)), 2);
        let first = pipeline.embed("a b a").unwrap();
        let second = pipeline.embed("a b a").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_norm_returns_zero_vector() {
        let mut pipeline =
            EmbeddingPipeline::new(ab_tokenizer(), Some(Box::new(ZeroEncoder)), 2);
        assert_eq!(pipeline.embed("a").unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn missing_encoder_is_unavailable() {
        let mut pipeline = EmbeddingPipeline::new(ab_tokenizer(), None, 2);
        let err = pipeline.embed("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EncoderUnavailable);
    }

    #[test]
    fn width_mismatch_is_unavailable() {
        let mut pipeline = EmbeddingPipeline::new(
            ab_tokenizer(),
            Some(Box::new(WrongWidthEncoder)),
            2,
        );
        let err = pipeline.embed("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EncoderUnavailable);
    }

    #[test]
    fn encoder_panic_is_unavailable() {
        let mut pipeline = EmbeddingPipeline::new(
            ab_tokenizer(),
            Some(Box::new(PanickingEncoder)),
            2,
        );
        for _ in 0..2 {
            let err = pipeline.embed("a").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::EncoderUnavailable);
            assert!(err.to_string().contains("runtime blew up"));
        }
    }

    #[test]
    fn query_prefix_is_tokenized() {
        let pipeline = EmbeddingPipeline::new(Tokenizer::fallback(), None, 2)
            .with_query_prefix(Some("q: ".to_string()));
        assert_eq!(pipeline.tokenize("x"), vec![0, 113, 58, 32, 120, 2]);
    }

    #[test]
    fn empty_prefix_is_ignored() {
        let pipeline = EmbeddingPipeline::new(ab_tokenizer(), None, 2)
            .with_query_prefix(Some(String::new()));
        assert_eq!(pipeline.query_prefix(), None);
        assert_eq!(pipeline.tokenize("a"), vec![0, 3, 1]);
    }

    #[test]
    fn mean_pool_of_empty_is_zero() {
        let hidden = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        let pooled = mean_pool(&hidden).unwrap();
        assert_eq!(pooled.to_vec1::<f32>().unwrap(), vec![0.0; 4]);
    }
}
