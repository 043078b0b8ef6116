//! Recursive tree construction.
//!
//! The [`TreeBuilder`] turns a document's chunks into a [`Tree`] level by
//! level: reduce the level's embeddings, cluster them, summarise every
//! cluster and embed the summaries. The summaries become the next level.
//! Construction stops at a single root or at the configured maximum depth.
//!
//! # Example
//!
//! ```rust,ignore
//! use adk_raptor::{RaptorConfig, TreeBuilder};
//!
//! let builder = TreeBuilder::new(RaptorConfig::default(), embedder, generator);
//! let tree = builder.build_tree(&chunks).await?;
//! println!("{} nodes over {} levels", tree.len(), tree.depth());
//! ```

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RaptorConfig;
use crate::document::Chunk;
use crate::embedding::EmbeddingProvider;
use crate::error::{RaptorError, Result};
use crate::generation::TextGenerator;
use crate::gmm::{ClusteringOutcome, SoftClusterer};
use crate::reduction::DimensionReducer;
use crate::retry::RetryPolicy;
use crate::tree::{ClusterFailure, LevelReport, NodeId, PendingNode, Tree};

/// Golden-ratio increment used to derive per-level seeds.
const LEVEL_SEED_STEP: u64 = 0x9E37_79B9_7F4A_7C15;

/// Builds RAPTOR trees from embedded chunks.
pub struct TreeBuilder {
    config: RaptorConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl TreeBuilder {
    /// Create a builder with its own cancellation token.
    pub fn new(
        config: RaptorConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        let retry = RetryPolicy::new(&config.retry);
        Self { config, embedder, generator, retry, cancel: CancellationToken::new() }
    }

    /// Use `token` to cancel builds started by this builder.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels builds in progress.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build a tree over `chunks`, taken to be in document order.
    ///
    /// A single chunk yields a one-node tree without any clustering or
    /// capability calls. Clusters whose summary cannot be generated fall back
    /// to their truncated raw text and are listed in
    /// [`BuildReport::degraded_nodes`](crate::BuildReport::degraded_nodes).
    ///
    /// # Errors
    ///
    /// - [`RaptorError::EmptyCorpus`] for an empty slice.
    /// - [`RaptorError::DimensionMismatch`] if embeddings differ in width.
    /// - [`RaptorError::Cancelled`] if the token fires mid-build.
    /// - The capability error if the root summary cannot be embedded.
    pub async fn build_tree(&self, chunks: &[Chunk]) -> Result<Tree> {
        let width = validate_chunks(chunks)?;
        let mut tree = Tree::from_chunks(chunks);
        let max_depth = self.config.tree.max_depth;

        let mut level = 0;
        while level < max_depth {
            let current = tree.level_ids(level).to_vec();
            if current.len() <= 1 {
                break;
            }
            self.check_cancelled()?;

            let embeddings: Vec<Vec<f32>> =
                tree.level(level).map(|node| node.embedding.clone()).collect();
            let outcome = self.cluster_level(level, embeddings).await?;

            let groups: Vec<Vec<NodeId>> = outcome
                .clusters
                .iter()
                .map(|cluster| {
                    let mut members: Vec<NodeId> =
                        cluster.members.iter().map(|&i| current[i]).collect();
                    members.sort_unstable();
                    members
                })
                .collect();
            let texts: Vec<String> = groups
                .iter()
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|&id| tree.node(id))
                        .map(|node| node.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .collect();

            tree.report_mut().levels.push(LevelReport {
                level,
                input_nodes: current.len(),
                n_components: outcome.n_components,
                clusters: groups.len(),
                degenerate: outcome.degenerate,
                bic: outcome
                    .selection
                    .as_ref()
                    .and_then(|s| s.scores.iter().find(|(k, _)| *k == s.chosen).map(|(_, b)| *b)),
            });

            let results: Vec<Result<PendingNode>> = stream::iter(groups.iter().zip(texts))
                .map(|(members, text)| self.materialize_cluster(members.clone(), text, width))
                .buffered(self.config.tree.max_concurrency.max(1))
                .collect()
                .await;

            let single_cluster = groups.len() == 1;
            let mut pending = Vec::with_capacity(groups.len());
            let mut last_error = None;
            for (members, result) in groups.into_iter().zip(results) {
                match result {
                    Ok(node) => pending.push(node),
                    Err(RaptorError::Cancelled) => return Err(RaptorError::Cancelled),
                    Err(e) => {
                        warn!(level, members = members.len(), error = %e, "cluster dropped");
                        tree.report_mut().failures.push(ClusterFailure {
                            level,
                            members,
                            error: e.to_string(),
                        });
                        last_error = Some(e);
                    }
                }
            }

            if pending.is_empty() {
                match last_error {
                    Some(e) if single_cluster => return Err(e),
                    _ => {
                        warn!(level, "no cluster could be materialised, stopping");
                        break;
                    }
                }
            }

            let created = tree.push_level(pending).len();
            info!(level = level + 1, nodes = created, "built tree level");
            level += 1;
        }

        info!(
            nodes = tree.len(),
            levels = tree.depth(),
            degraded = tree.report().degraded_nodes.len(),
            failures = tree.report().failures.len(),
            "built tree"
        );
        Ok(tree)
    }

    /// Reduce and cluster one level off the async executor.
    async fn cluster_level(
        &self,
        level: usize,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<ClusteringOutcome> {
        let seed = self
            .config
            .seed
            .map(|s| s.wrapping_add((level as u64 + 1).wrapping_mul(LEVEL_SEED_STEP)));
        let reducer = DimensionReducer::new(self.config.reduction.clone()).with_seed(seed);
        let clusterer = SoftClusterer::new(self.config.clustering.clone()).with_seed(seed);

        let outcome = tokio::task::spawn_blocking(move || {
            let reduced = reducer.reduce(&embeddings);
            clusterer.cluster(&reduced)
        })
        .await
        .map_err(|e| RaptorError::PipelineError(format!("clustering task failed: {e}")))?;

        debug!(
            level,
            n_components = outcome.n_components,
            clusters = outcome.clusters.len(),
            degenerate = outcome.degenerate,
            "clustered level"
        );
        Ok(outcome)
    }

    /// Summarise and embed one cluster.
    async fn materialize_cluster(
        &self,
        children: Vec<NodeId>,
        text: String,
        width: usize,
    ) -> Result<PendingNode> {
        self.check_cancelled()?;

        let (summary, degraded) = match self.summarize(&text).await {
            Ok(summary) => (summary, false),
            Err(RaptorError::Cancelled) => return Err(RaptorError::Cancelled),
            Err(e) => {
                warn!(members = children.len(), error = %e, "summarization failed, using raw text");
                (truncate_chars(&text, self.config.tree.fallback_summary_chars), true)
            }
        };

        let embedding = self.embed(&summary).await?;
        if embedding.len() != width {
            return Err(RaptorError::DimensionMismatch { expected: width, found: embedding.len() });
        }
        Ok(PendingNode { text: summary, embedding, children, degraded })
    }

    /// Summarise `text`, splitting it first if it is too long for one prompt.
    async fn summarize(&self, text: &str) -> Result<String> {
        let limit = self.config.tree.max_summary_input_chars;
        if text.chars().count() <= limit {
            return self.complete_summary(text).await;
        }

        let pieces = split_chars(text, limit);
        debug!(pieces = pieces.len(), "summarizing long cluster text in pieces");
        let mut partial = Vec::with_capacity(pieces.len());
        for piece in pieces {
            self.check_cancelled()?;
            partial.push(self.complete_summary(piece).await?);
        }
        self.complete_summary(&partial.join("\n")).await
    }

    async fn complete_summary(&self, text: &str) -> Result<String> {
        let prompt = format!("{}\n\n{text}", self.config.tree.summary_instruction);
        let prompt = prompt.as_str();
        let max_tokens = self.config.tree.summary_max_tokens;
        let generator = self.generator.clone();

        self.retry
            .run("summarize", move || {
                let generator = generator.clone();
                async move {
                    let completion = generator.complete(prompt, max_tokens).await?;
                    let summary = completion.trim();
                    if summary.is_empty() {
                        return Err(RaptorError::GenerationError {
                            provider: "generator".to_string(),
                            message: "empty completion".to_string(),
                        });
                    }
                    Ok(summary.to_string())
                }
            })
            .await
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

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() { Err(RaptorError::Cancelled) } else { Ok(()) }
    }
}

/// Build a tree with a one-off [`TreeBuilder`].
///
/// # Errors
///
/// See [`TreeBuilder::build_tree`].
pub async fn build_tree(
    chunks: &[Chunk],
    config: &RaptorConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
) -> Result<Tree> {
    TreeBuilder::new(config.clone(), embedder, generator).build_tree(chunks).await
}

/// Shared embedding width of `chunks`.
fn validate_chunks(chunks: &[Chunk]) -> Result<usize> {
    let first = chunks.first().ok_or(RaptorError::EmptyCorpus)?;
    let width = first.embedding.len();
    if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != width) {
        return Err(RaptorError::DimensionMismatch { expected: width, found: bad.embedding.len() });
    }
    Ok(width)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Split `text` into pieces of at most `max_chars` characters.
fn split_chars(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let end = rest.char_indices().nth(max_chars).map_or(rest.len(), |(idx, _)| idx);
        let (head, tail) = rest.split_at(end);
        pieces.push(head);
        rest = tail;
    }
    pieces
}
