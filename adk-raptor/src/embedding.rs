//! Embedding capability consumed by the tree builder and the query path.

use async_trait::async_trait;

use crate::error::Result;

/// A provider that turns text into a fixed-width vector.
///
/// The index never computes embeddings itself. Implementations are expected
/// to be deterministic for identical text and free of side effects; failures
/// should be reported as [`RaptorError::EmbeddingError`](crate::RaptorError::EmbeddingError)
/// carrying the offending text so that retries and audit logs can name it.
///
/// # Example
///
/// ```rust,ignore
/// use adk_raptor::EmbeddingProvider;
///
/// let embedding = provider.embed("what does the parser do?").await?;
/// assert_eq!(embedding.len(), provider.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving input order.
    ///
    /// Falls back to one [`embed`](EmbeddingProvider::embed) call per text;
    /// backends with a native batch endpoint should override it.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    /// Width of the vectors this provider produces.
    fn dimensions(&self) -> usize;
}
