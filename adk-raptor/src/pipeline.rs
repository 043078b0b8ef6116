//! Corpus pipeline orchestrator.
//!
//! The [`RaptorPipeline`] keeps one RAPTOR tree per document and answers
//! queries across all of them: embed (and optionally expand) the query,
//! route it to the most relevant documents, retrieve from each routed tree
//! and merge the passages under one token budget. [`RaptorPipeline::answer`]
//! goes one step further and has the generator answer from those passages.
//!
//! # Example
//!
//! ```rust,ignore
//! use adk_raptor::{RaptorConfig, RaptorPipeline};
//!
//! let pipeline = RaptorPipeline::builder()
//!     .config(RaptorConfig::default())
//!     .embedding_provider(Arc::new(my_embedder))
//!     .generator(Arc::new(my_generator))
//!     .build()?;
//!
//! pipeline.index_document("handbook", &chunk_texts).await?;
//! let passages = pipeline.query("how do refunds work?").await?;
//! let answer = pipeline.answer("how do refunds work?").await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::builder::TreeBuilder;
use crate::config::{RaptorConfig, Representative};
use crate::document::{Answer, Chunk, PassageResult, Query};
use crate::embedding::EmbeddingProvider;
use crate::error::{RaptorError, Result};
use crate::expansion::MultiQueryExpander;
use crate::generation::TextGenerator;
use crate::retrieval::{Retriever, approximate_tokens};
use crate::retry::RetryPolicy;
use crate::router::{RouteScore, SemanticRouter};
use crate::tree::Tree;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(question|context)\}").expect("placeholder pattern is valid")
});

/// The corpus pipeline orchestrator.
///
/// Trees are built once and shared read-only through `Arc`, so queries never
/// wait on one another; only indexing and removal take the write lock.
/// Construct one via [`RaptorPipeline::builder()`].
pub struct RaptorPipeline {
    config: RaptorConfig,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
    expander: MultiQueryExpander,
    retry: RetryPolicy,
    cancel: CancellationToken,
    trees: RwLock<HashMap<String, Arc<Tree>>>,
}

impl RaptorPipeline {
    /// Create a new [`RaptorPipelineBuilder`].
    pub fn builder() -> RaptorPipelineBuilder {
        RaptorPipelineBuilder::default()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RaptorConfig {
        &self.config
    }

    /// Return a reference to the embedding provider.
    pub fn embedding_provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedding_provider
    }

    /// Token that cancels every build started by this pipeline.
    ///
    /// Cancellation is permanent: once fired, later builds fail immediately.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A tree builder sharing this pipeline's configuration, capabilities
    /// and cancellation token.
    pub fn tree_builder(&self) -> TreeBuilder {
        TreeBuilder::new(
            self.config.clone(),
            self.embedding_provider.clone(),
            self.generator.clone(),
        )
        .with_cancellation(self.cancel.clone())
    }

    /// Embed chunk texts of one document, in order.
    ///
    /// Chunk IDs are `{document_id}-{index}`.
    ///
    /// # Errors
    ///
    /// Returns [`RaptorError::PipelineError`] naming the document if embedding
    /// fails after retries.
    pub async fn embed_chunks(&self, document_id: &str, texts: &[String]) -> Result<Vec<Chunk>> {
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let refs = refs.as_slice();
        let provider = self.embedding_provider.clone();

        let embeddings = self
            .retry
            .run("embed", move || {
                let provider = provider.clone();
                async move { provider.embed_batch(refs).await }
            })
            .await
            .map_err(|e| {
                error!(document.id = document_id, error = %e, "embedding failed during indexing");
                RaptorError::PipelineError(format!(
                    "embedding failed for document '{document_id}': {e}"
                ))
            })?;

        if embeddings.len() != texts.len() {
            return Err(RaptorError::PipelineError(format!(
                "embedding provider returned {} vectors for {} chunks of document '{document_id}'",
                embeddings.len(),
                texts.len()
            )));
        }

        Ok(texts
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| {
                Chunk::new(format!("{document_id}-{i}"), document_id, text.clone(), embedding)
            })
            .collect())
    }

    /// Embed, build and store the tree of one document, replacing any
    /// previous tree under the same ID.
    ///
    /// # Errors
    ///
    /// Returns the embedding or build error; see
    /// [`TreeBuilder::build_tree`].
    pub async fn index_document(&self, document_id: &str, texts: &[String]) -> Result<Arc<Tree>> {
        let chunks = self.embed_chunks(document_id, texts).await?;
        self.index_chunks(document_id, &chunks).await
    }

    /// Build and store the tree of one document from already embedded chunks.
    ///
    /// # Errors
    ///
    /// See [`TreeBuilder::build_tree`].
    pub async fn index_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<Arc<Tree>> {
        let tree = Arc::new(self.tree_builder().build_tree(chunks).await.inspect_err(|e| {
            error!(document.id = document_id, error = %e, "tree build failed");
        })?);

        self.trees.write().await.insert(document_id.to_string(), tree.clone());
        info!(
            document.id = document_id,
            chunk_count = chunks.len(),
            node_count = tree.len(),
            levels = tree.depth(),
            "indexed document"
        );
        Ok(tree)
    }

    /// Drop a document's tree. Returns whether it existed.
    pub async fn remove_document(&self, document_id: &str) -> bool {
        self.trees.write().await.remove(document_id).is_some()
    }

    /// IDs of indexed documents, sorted.
    pub async fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.trees.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The tree of one document.
    pub async fn tree(&self, document_id: &str) -> Option<Arc<Tree>> {
        self.trees.read().await.get(document_id).cloned()
    }

    /// Routing representative of every indexed document.
    pub async fn representatives(&self) -> HashMap<String, Vec<f32>> {
        representatives_of(&*self.trees.read().await, self.config.router.representative)
    }

    /// Documents the router would search for `query_embedding`.
    pub async fn route(&self, query_embedding: &[f32]) -> Vec<RouteScore> {
        let representatives = self.representatives().await;
        SemanticRouter::from_config(&self.config.router).route(query_embedding, &representatives)
    }

    /// Query the corpus: embed/expand → route → retrieve per tree → merge.
    ///
    /// Passages are ordered by descending score and fit the configured token
    /// budget as a whole. An empty corpus yields no passages.
    ///
    /// # Errors
    ///
    /// Returns [`RaptorError::PipelineError`] if the query cannot be embedded.
    pub async fn query(&self, query: &str) -> Result<Vec<PassageResult>> {
        // 1. Embed the query, with paraphrases if enabled
        let query = self.build_query(query).await.map_err(|e| {
            error!(error = %e, "embedding failed during query");
            RaptorError::PipelineError(format!("query embedding failed: {e}"))
        })?;

        // 2. Route against a snapshot of the corpus
        let trees: HashMap<String, Arc<Tree>> = self.trees.read().await.clone();
        let representatives = representatives_of(&trees, self.config.router.representative);
        let routed = SemanticRouter::from_config(&self.config.router)
            .route(&query.embedding, &representatives);

        // 3. Retrieve from every routed tree
        let retrieval = &self.config.retrieval;
        let retriever = Retriever::new(retrieval.chars_per_token);
        let mut passages = Vec::new();
        for route in &routed {
            let Some(tree) = trees.get(&route.document_id) else { continue };
            let result =
                retriever.retrieve_query(tree, &query, &retrieval.strategy, retrieval.token_budget);
            passages.extend(result.hits.iter().map(|hit| PassageResult {
                document_id: route.document_id.clone(),
                node_id: hit.node.id,
                level: hit.node.level,
                text: hit.node.text.clone(),
                score: hit.score,
            }));
        }

        // 4. Merge under the shared budget
        passages.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then(a.node_id.cmp(&b.node_id))
        });
        let mut used = 0;
        let mut merged = Vec::with_capacity(passages.len());
        for passage in passages {
            let tokens = approximate_tokens(&passage.text, retrieval.chars_per_token);
            if used + tokens > retrieval.token_budget {
                break;
            }
            used += tokens;
            merged.push(passage);
        }

        info!(
            documents = routed.len(),
            expansions = query.expansions.len(),
            result_count = merged.len(),
            tokens = used,
            "query completed"
        );

        Ok(merged)
    }

    /// Answer `question` from the corpus: [`query`](Self::query), then one
    /// completion over the merged passages.
    ///
    /// With no passages the generator still answers, from an empty context.
    ///
    /// # Errors
    ///
    /// Returns the query error, or [`RaptorError::GenerationError`] once the
    /// generator's retries are spent.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let passages = self.query(question).await?;
        let prompt = answer_prompt(&self.config.answer.template, question, &passages);
        let prompt = prompt.as_str();
        let max_tokens = self.config.answer.max_tokens;
        let generator = self.generator.clone();

        let text = self
            .retry
            .run("answer", move || {
                let generator = generator.clone();
                async move {
                    let completion = generator.complete(prompt, max_tokens).await?;
                    let text = completion.trim();
                    if text.is_empty() {
                        return Err(RaptorError::GenerationError {
                            provider: "generator".to_string(),
                            message: "empty completion".to_string(),
                        });
                    }
                    Ok(text.to_string())
                }
            })
            .await
            .inspect_err(|e| error!(error = %e, "answer generation failed"))?;

        info!(passage_count = passages.len(), answer_chars = text.len(), "answer generated");
        Ok(Answer { text, passages })
    }

    async fn build_query(&self, text: &str) -> Result<Query> {
        if self.config.expansion.enabled {
            return self.expander.build_query(text).await;
        }
        let provider = self.embedding_provider.clone();
        let embedding = self
            .retry
            .run("embed", move || {
                let provider = provider.clone();
                async move { provider.embed(text).await }
            })
            .await?;
        Ok(Query::new(text, embedding))
    }
}

/// Fill `{question}` and `{context}` in `template` in one pass, so
/// placeholders inside the question or the passages stay literal.
pub fn answer_prompt(template: &str, question: &str, passages: &[PassageResult]) -> String {
    let context = passages.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join("\n\n");
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            if &caps[1] == "question" { question.to_string() } else { context.clone() }
        })
        .into_owned()
}

fn representatives_of(
    trees: &HashMap<String, Arc<Tree>>,
    kind: Representative,
) -> HashMap<String, Vec<f32>> {
    trees
        .iter()
        .filter_map(|(id, tree)| tree.representative(kind).map(|rep| (id.clone(), rep)))
        .collect()
}

/// Builder for constructing a [`RaptorPipeline`].
///
/// `config`, `embedding_provider` and `generator` are required. Call
/// [`build()`](RaptorPipelineBuilder::build) to validate and produce the
/// pipeline.
#[derive(Default)]
pub struct RaptorPipelineBuilder {
    config: Option<RaptorConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn TextGenerator>>,
    cancel: Option<CancellationToken>,
}

impl RaptorPipelineBuilder {
    /// Set the pipeline configuration.
    pub fn config(mut self, config: RaptorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Set the generator used for summaries and query paraphrases.
    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Use an existing cancellation token.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the [`RaptorPipeline`], validating that all required fields are
    /// set and the configuration is consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RaptorError::ConfigError`] if a required field is missing or
    /// the configuration is invalid.
    pub fn build(self) -> Result<RaptorPipeline> {
        let config =
            self.config.ok_or_else(|| RaptorError::ConfigError("config is required".to_string()))?;
        config.validate()?;
        let embedding_provider = self
            .embedding_provider
            .ok_or_else(|| RaptorError::ConfigError("embedding_provider is required".to_string()))?;
        let generator = self
            .generator
            .ok_or_else(|| RaptorError::ConfigError("generator is required".to_string()))?;

        let expander =
            MultiQueryExpander::from_config(&config, generator.clone(), embedding_provider.clone());
        Ok(RaptorPipeline {
            retry: RetryPolicy::new(&config.retry),
            config,
            embedding_provider,
            generator,
            expander,
            cancel: self.cancel.unwrap_or_default(),
            trees: RwLock::new(HashMap::new()),
        })
    }
}
