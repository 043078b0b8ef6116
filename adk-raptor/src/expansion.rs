//! Multi-query expansion.
//!
//! A single phrasing of a question can miss passages worded differently.
//! The [`MultiQueryExpander`] asks the generator for a few paraphrases,
//! retrieves for each of them and for the original, and fuses the results by
//! keeping every node's best score.
//!
//! Expansion is strictly best-effort: when the generator fails or yields
//! nothing usable, the result is exactly that of a plain
//! [`retrieve`](crate::retrieval::retrieve) call on the original query.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{ExpansionConfig, RaptorConfig, RetrievalConfig};
use crate::document::Query;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::generation::TextGenerator;
use crate::retrieval::{RetrievalResult, Retriever};
use crate::retry::RetryPolicy;
use crate::tree::Tree;

static LIST_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\d+[.):]|[-*•])\s*").expect("list marker pattern is valid")
});

/// Prompt asking for `variants` paraphrases of `query`, one per line.
pub fn expansion_prompt(query: &str, variants: usize) -> String {
    format!(
        "Given the following user question, generate {variants} similar variations of the \
         question without changing its core meaning. Write each variation on its own line, \
         without any additional explanation or labels.\n\n\
         User question: {query}\n\n\
         Variations:"
    )
}

/// Extract at most `limit` paraphrases from a generator completion.
///
/// Numbering and bullets are stripped, blank lines and surrounding quotes
/// removed, and lines repeating the original question or an earlier variant
/// (case-insensitively) are dropped.
pub fn parse_variants(completion: &str, original: &str, limit: usize) -> Vec<String> {
    let original = original.trim().to_lowercase();
    let mut seen: Vec<String> = Vec::new();
    let mut variants = Vec::new();

    for line in completion.lines() {
        if variants.len() == limit {
            break;
        }
        let stripped = LIST_MARKER.replace(line, "");
        let text = stripped.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if text.is_empty() {
            continue;
        }
        let key = text.to_lowercase();
        if key == original || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        variants.push(text.to_string());
    }
    variants
}

/// Widens a query with generated paraphrases.
pub struct MultiQueryExpander {
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: ExpansionConfig,
    retrieval: RetrievalConfig,
    retry: RetryPolicy,
}

impl MultiQueryExpander {
    /// Create an expander with default settings.
    pub fn new(generator: Arc<dyn TextGenerator>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            generator,
            embedder,
            config: ExpansionConfig::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create an expander using the expansion, retrieval and retry sections of `config`.
    pub fn from_config(
        config: &RaptorConfig,
        generator: Arc<dyn TextGenerator>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            generator,
            embedder,
            config: config.expansion.clone(),
            retrieval: config.retrieval.clone(),
            retry: RetryPolicy::new(&config.retry),
        }
    }

    /// Replace the expansion settings.
    pub fn with_config(mut self, config: ExpansionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the retrieval settings used by [`expand_and_retrieve`](Self::expand_and_retrieve).
    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Replace the retry policy for capability calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Paraphrases of `query`. Empty when expansion is disabled or the
    /// generator is unavailable; never an error.
    pub async fn expand(&self, query: &str) -> Vec<String> {
        if !self.config.enabled || self.config.variants == 0 {
            return Vec::new();
        }

        let prompt = expansion_prompt(query, self.config.variants);
        let prompt = prompt.as_str();
        let max_tokens = self.config.max_tokens;
        let generator = self.generator.clone();
        let completion = self
            .retry
            .run("expand", move || {
                let generator = generator.clone();
                async move { generator.complete(prompt, max_tokens).await }
            })
            .await;

        match completion {
            Ok(text) => {
                let variants = parse_variants(&text, query, self.config.variants);
                debug!(variants = variants.len(), "expanded query");
                variants
            }
            Err(e) => {
                warn!(error = %e, "query expansion unavailable, using original query only");
                Vec::new()
            }
        }
    }

    /// Embed `query_text` and its paraphrases into a [`Query`].
    ///
    /// Paraphrases that cannot be embedded are skipped.
    ///
    /// # Errors
    ///
    /// Returns the embedding error if the original query cannot be embedded.
    pub async fn build_query(&self, query_text: &str) -> Result<Query> {
        let embedding = self.embed(query_text).await?;
        let mut expansions = Vec::new();
        for variant in self.expand(query_text).await {
            match self.embed(&variant).await {
                Ok(e) if e.len() == embedding.len() => expansions.push(e),
                Ok(e) => warn!(
                    variant = %variant,
                    found = e.len(),
                    "variant embedding width differs, skipped"
                ),
                Err(e) => {
                    warn!(variant = %variant, error = %e, "variant embedding failed, skipped")
                }
            }
        }
        Ok(Query::new(query_text, embedding).with_expansions(expansions))
    }

    /// Expand `query_text`, retrieve for every phrasing and fuse the results.
    ///
    /// # Errors
    ///
    /// Returns the embedding error if the original query cannot be embedded.
    pub async fn expand_and_retrieve<'t>(
        &self,
        query_text: &str,
        tree: &'t Tree,
        token_budget: usize,
    ) -> Result<RetrievalResult<'t>> {
        let query = self.build_query(query_text).await?;
        let retriever = Retriever::new(self.retrieval.chars_per_token);
        Ok(retriever.retrieve_query(tree, &query, &self.retrieval.strategy, token_budget))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder.clone();
        self.retry
            .run("embed", move || {
                let embedder = embedder.clone();
                async move { embedder.embed(text).await }
            })
            .await
    }
}
