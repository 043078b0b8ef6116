//! Text-generation capability used for cluster summaries and query paraphrases.

use async_trait::async_trait;

use crate::error::Result;

/// A text-completion backend.
///
/// Outputs may differ between calls. The index only relies on "text in,
/// condensed text out": a summary prompt is an instruction followed by the
/// concatenated member texts of one cluster.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Complete `prompt`, producing at most roughly `max_tokens` tokens.
    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String>;
}
