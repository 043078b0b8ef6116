//! Configuration for tree construction, retrieval, routing and expansion.
//!
//! Every knob has a default taken from how RAPTOR indexes are usually run
//! (10 reduced dimensions, a soft-membership threshold of 0.1, a BIC search
//! over `[1, 10]` components). They are defaults, not constants: they change
//! clustering granularity noticeably and should be tuned per corpus.

use serde::{Deserialize, Serialize};

use crate::error::{RaptorError, Result};

/// Distance used to build the k-nearest-neighbour graph before reduction.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Straight-line distance.
    Euclidean,
    /// `1 - cosine_similarity`.
    #[default]
    Cosine,
}

/// Parameters of the UMAP-style dimensionality reducer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReductionConfig {
    /// Dimension of the reduced space.
    pub target_dim: usize,
    /// Neighbours per point. `None` uses `floor(sqrt(n - 1))`.
    pub n_neighbors: Option<usize>,
    /// Metric for the neighbour graph.
    pub metric: DistanceMetric,
    /// Layout optimisation epochs.
    pub n_epochs: usize,
    /// Initial learning rate; decays linearly to zero.
    pub learning_rate: f64,
    /// Negative samples drawn per positive edge sample.
    pub negative_sample_rate: usize,
    /// `a` of the low-dimensional kernel `1 / (1 + a * d^(2b))`.
    pub curve_a: f64,
    /// `b` of the low-dimensional kernel `1 / (1 + a * d^(2b))`.
    pub curve_b: f64,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        // a/b correspond to min_dist = 0.1, spread = 1.0
        Self {
            target_dim: 10,
            n_neighbors: None,
            metric: DistanceMetric::Cosine,
            n_epochs: 200,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            curve_a: 1.577,
            curve_b: 0.895,
        }
    }
}

/// Parameters of the Gaussian mixture clusterer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusteringConfig {
    /// Smallest component count tried by the BIC search.
    pub min_k: usize,
    /// Largest component count tried by the BIC search.
    pub max_k: usize,
    /// A point joins every component whose responsibility exceeds this.
    pub membership_threshold: f64,
    /// Below this many points the clusterer returns a single cluster.
    pub min_points: usize,
    /// EM iteration cap.
    pub max_iter: usize,
    /// EM stops once the mean log-likelihood gain drops below this.
    pub tol: f64,
    /// Diagonal ridge, relative to the mean per-dimension variance of the data.
    pub reg_covar: f64,
    /// EM restarts per component count; the best log-likelihood wins.
    pub n_init: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_k: 1,
            max_k: 10,
            membership_threshold: 0.1,
            min_points: 3,
            max_iter: 100,
            tol: 1e-6,
            reg_covar: 1e-6,
            n_init: 3,
        }
    }
}

/// Parameters of the recursive tree builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeConfig {
    /// Highest level the builder may produce (level 0 holds the chunks).
    pub max_depth: usize,
    /// Cluster summarisations in flight at once.
    pub max_concurrency: usize,
    /// `max_tokens` passed to the generator for each summary.
    pub summary_max_tokens: usize,
    /// Cluster texts longer than this are summarised piecewise first.
    pub max_summary_input_chars: usize,
    /// Length of the raw-concatenation fallback when summarisation fails.
    pub fallback_summary_chars: usize,
    /// Instruction placed before the concatenated member texts.
    pub summary_instruction: String,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_concurrency: 4,
            summary_max_tokens: 256,
            max_summary_input_chars: 3000,
            fallback_summary_chars: 2000,
            summary_instruction: "Write a concise summary of the following passages, keeping \
                                  the key facts and names:"
                .to_string(),
        }
    }
}

/// Retry and timeout policy for capability calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 200, max_delay_ms: 2000, timeout_ms: 30_000 }
    }
}

/// How nodes are selected from a tree at query time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Descend from the top level, keeping the `top_n` most similar nodes per
    /// level, for at most `max_depth` levels (`None` = down to the leaves).
    TreeTraversal {
        /// Nodes kept per level.
        top_n: usize,
        /// Levels visited, counted from the top.
        max_depth: Option<usize>,
    },
    /// Rank every node of every level together.
    #[default]
    CollapsedTree,
}

/// Retrieval parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Node selection strategy.
    pub strategy: RetrievalStrategy,
    /// Approximate token budget of a retrieval result.
    pub token_budget: usize,
    /// Characters counted as one token.
    pub chars_per_token: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { strategy: RetrievalStrategy::CollapsedTree, token_budget: 2000, chars_per_token: 4 }
    }
}

/// Which embedding stands in for a whole document when routing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Representative {
    /// The root embedding (mean of the top level if the tree has several roots).
    #[default]
    Root,
    /// Mean of the leaf (chunk) embeddings.
    MeanOfLeaves,
}

/// Semantic router parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Documents returned per query.
    pub top_k: usize,
    /// Documents scoring below this are never routed to.
    pub min_similarity: Option<f32>,
    /// Representative embedding used per document.
    pub representative: Representative,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { top_k: 3, min_similarity: None, representative: Representative::Root }
    }
}

/// Multi-query expansion parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpansionConfig {
    /// Whether the pipeline expands queries at all.
    pub enabled: bool,
    /// Paraphrases requested from the generator.
    pub variants: usize,
    /// `max_tokens` for the paraphrase completion.
    pub max_tokens: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self { enabled: true, variants: 3, max_tokens: 256 }
    }
}

/// Answer generation over retrieved passages.
///
/// `template` is filled by substituting `{question}` with the query text and
/// `{context}` with the merged passages, one per paragraph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerConfig {
    /// Prompt template with `{question}` and `{context}` placeholders.
    pub template: String,
    /// `max_tokens` for the answer completion.
    pub max_tokens: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            template: "You are an assistant answering questions from a document collection. \
                       Use the key points below as context.\n\n\
                       Question:\n{question}\n\n\
                       Key points:\n{context}\n\n\
                       Write a complete and accurate answer that addresses the question \
                       directly and draws on the key points.\n\n\
                       Answer:"
                .to_string(),
            max_tokens: 512,
        }
    }
}

/// Complete configuration of a RAPTOR index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RaptorConfig {
    /// Seed for every stochastic step. `None` draws from the OS.
    pub seed: Option<u64>,
    /// Dimensionality reduction.
    pub reduction: ReductionConfig,
    /// Gaussian mixture clustering.
    pub clustering: ClusteringConfig,
    /// Tree construction.
    pub tree: TreeConfig,
    /// Capability retries.
    pub retry: RetryConfig,
    /// Retrieval.
    pub retrieval: RetrievalConfig,
    /// Routing.
    pub router: RouterConfig,
    /// Query expansion.
    pub expansion: ExpansionConfig,
    /// Answer generation.
    #[serde(default)]
    pub answer: AnswerConfig,
}

impl RaptorConfig {
    /// Create a new builder for constructing a [`RaptorConfig`].
    pub fn builder() -> RaptorConfigBuilder {
        RaptorConfigBuilder::default()
    }

    /// Check that all parameters are mutually consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RaptorError::ConfigError`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RaptorError::ConfigError(msg));

        if self.reduction.target_dim == 0 {
            return invalid("target_dim must be greater than zero".to_string());
        }
        if self.reduction.n_neighbors == Some(0) {
            return invalid("n_neighbors must be greater than zero".to_string());
        }
        if self.reduction.curve_a <= 0.0 || self.reduction.curve_b <= 0.0 {
            return invalid("curve parameters a and b must be positive".to_string());
        }
        let clustering = &self.clustering;
        if clustering.min_k == 0 || clustering.min_k > clustering.max_k {
            return invalid(format!(
                "cluster range [{}, {}] must satisfy 1 <= min_k <= max_k",
                clustering.min_k, clustering.max_k
            ));
        }
        if !(0.0..1.0).contains(&clustering.membership_threshold) {
            return invalid(format!(
                "membership_threshold ({}) must lie in [0, 1)",
                clustering.membership_threshold
            ));
        }
        if clustering.max_iter == 0 || clustering.n_init == 0 {
            return invalid("max_iter and n_init must be greater than zero".to_string());
        }
        if clustering.reg_covar <= 0.0 {
            return invalid("reg_covar must be positive".to_string());
        }
        if self.tree.max_depth == 0 {
            return invalid("max_depth must be at least 1".to_string());
        }
        if self.tree.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".to_string());
        }
        if self.tree.max_summary_input_chars == 0 {
            return invalid("max_summary_input_chars must be greater than zero".to_string());
        }
        if self.retry.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".to_string());
        }
        if self.retrieval.token_budget == 0 {
            return invalid("token_budget must be greater than zero".to_string());
        }
        if self.retrieval.chars_per_token == 0 {
            return invalid("chars_per_token must be greater than zero".to_string());
        }
        if let RetrievalStrategy::TreeTraversal { top_n, max_depth } = self.retrieval.strategy {
            if top_n == 0 {
                return invalid("tree traversal top_n must be greater than zero".to_string());
            }
            if max_depth == Some(0) {
                return invalid("tree traversal max_depth must be at least 1".to_string());
            }
        }
        if self.router.top_k == 0 {
            return invalid("router top_k must be greater than zero".to_string());
        }
        if !self.answer.template.contains("{question}") {
            return invalid("answer template must contain {question}".to_string());
        }
        if self.answer.max_tokens == 0 {
            return invalid("answer max_tokens must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`RaptorConfig`].
#[derive(Debug, Clone, Default)]
pub struct RaptorConfigBuilder {
    config: RaptorConfig,
}

impl RaptorConfigBuilder {
    /// Seed every stochastic step (reduction layout, EM initialisation).
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Set the reduced dimension.
    pub fn target_dim(mut self, dim: usize) -> Self {
        self.config.reduction.target_dim = dim;
        self
    }

    /// Set the neighbour count of the reduction graph.
    pub fn n_neighbors(mut self, k: usize) -> Self {
        self.config.reduction.n_neighbors = Some(k);
        self
    }

    /// Set the neighbour-graph metric.
    pub fn metric(mut self, metric: DistanceMetric) -> Self {
        self.config.reduction.metric = metric;
        self
    }

    /// Set the layout optimisation epochs.
    pub fn n_epochs(mut self, epochs: usize) -> Self {
        self.config.reduction.n_epochs = epochs;
        self
    }

    /// Set the BIC search range `[min_k, max_k]`.
    pub fn cluster_range(mut self, min_k: usize, max_k: usize) -> Self {
        self.config.clustering.min_k = min_k;
        self.config.clustering.max_k = max_k;
        self
    }

    /// Set the soft-membership threshold.
    pub fn membership_threshold(mut self, threshold: f64) -> Self {
        self.config.clustering.membership_threshold = threshold;
        self
    }

    /// Set the minimum point count that allows clustering.
    pub fn min_cluster_points(mut self, points: usize) -> Self {
        self.config.clustering.min_points = points;
        self
    }

    /// Set the maximum tree depth.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.tree.max_depth = depth;
        self
    }

    /// Set how many cluster summaries are generated concurrently.
    pub fn max_concurrency(mut self, concurrency: usize) -> Self {
        self.config.tree.max_concurrency = concurrency;
        self
    }

    /// Set the instruction placed before cluster texts.
    pub fn summary_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.tree.summary_instruction = instruction.into();
        self
    }

    /// Set the capability retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the retrieval strategy.
    pub fn strategy(mut self, strategy: RetrievalStrategy) -> Self {
        self.config.retrieval.strategy = strategy;
        self
    }

    /// Set the retrieval token budget.
    pub fn token_budget(mut self, budget: usize) -> Self {
        self.config.retrieval.token_budget = budget;
        self
    }

    /// Set how many documents the router returns.
    pub fn router_top_k(mut self, top_k: usize) -> Self {
        self.config.router.top_k = top_k;
        self
    }

    /// Set the router's similarity floor.
    pub fn router_min_similarity(mut self, min_similarity: f32) -> Self {
        self.config.router.min_similarity = Some(min_similarity);
        self
    }

    /// Enable or disable multi-query expansion.
    pub fn expansion(mut self, enabled: bool) -> Self {
        self.config.expansion.enabled = enabled;
        self
    }

    /// Set the number of paraphrases requested per query.
    pub fn expansion_variants(mut self, variants: usize) -> Self {
        self.config.expansion.variants = variants;
        self
    }

    /// Set the answer prompt template (`{question}` and `{context}` placeholders).
    pub fn answer_template(mut self, template: impl Into<String>) -> Self {
        self.config.answer.template = template.into();
        self
    }

    /// Set `max_tokens` for answer completions.
    pub fn answer_max_tokens(mut self, max_tokens: usize) -> Self {
        self.config.answer.max_tokens = max_tokens;
        self
    }

    /// Replace the reduction section wholesale.
    pub fn reduction(mut self, reduction: ReductionConfig) -> Self {
        self.config.reduction = reduction;
        self
    }

    /// Replace the clustering section wholesale.
    pub fn clustering(mut self, clustering: ClusteringConfig) -> Self {
        self.config.clustering = clustering;
        self
    }

    /// Build the [`RaptorConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RaptorError::ConfigError`] if validation fails; see
    /// [`RaptorConfig::validate`].
    pub fn build(self) -> Result<RaptorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
