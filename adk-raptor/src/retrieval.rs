//! Token-budgeted retrieval over a built [`Tree`].
//!
//! Two strategies are available, selected by configuration:
//!
//! - [`RetrievalStrategy::TreeTraversal`] descends from the top level and
//!   keeps the `top_n` most similar nodes per level, then looks only at their
//!   children.
//! - [`RetrievalStrategy::CollapsedTree`] flattens every level into one pool
//!   and ranks it as a whole.
//!
//! Both stop adding nodes as soon as the next one would push the result over
//! the token budget. Node text is never truncated.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::config::RetrievalStrategy;
use crate::document::Query;
use crate::tree::{NodeId, Tree, TreeNode};

/// Characters counted as one token when no other value is configured.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Approximate token count of `text`: one token per `chars_per_token` chars, rounded up.
pub fn approximate_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count().div_ceil(chars_per_token.max(1))
}

/// A node selected by retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit<'t> {
    /// The selected node.
    pub node: &'t TreeNode,
    /// Cosine similarity to the query.
    pub score: f32,
    /// Tokens charged against the budget for this node.
    pub tokens: usize,
}

/// Ordered retrieval output bounded by a token budget.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult<'t> {
    /// Selected nodes: visiting order for tree traversal, descending score
    /// otherwise.
    pub hits: Vec<RetrievalHit<'t>>,
    /// Sum of `hits[i].tokens`; never exceeds `token_budget`.
    pub total_tokens: usize,
    /// Budget the result was built under.
    pub token_budget: usize,
    /// Whether a candidate was rejected because it would exceed the budget.
    pub budget_exhausted: bool,
}

impl<'t> RetrievalResult<'t> {
    fn new(token_budget: usize) -> Self {
        Self { hits: Vec::new(), total_tokens: 0, token_budget, budget_exhausted: false }
    }

    /// Add a hit if it fits. Returns `false` once the budget is exhausted.
    fn push(&mut self, node: &'t TreeNode, score: f32, chars_per_token: usize) -> bool {
        let tokens = approximate_tokens(&node.text, chars_per_token);
        if self.total_tokens + tokens > self.token_budget {
            self.budget_exhausted = true;
            return false;
        }
        self.total_tokens += tokens;
        self.hits.push(RetrievalHit { node, score, tokens });
        true
    }

    /// Number of hits.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether nothing was retrieved.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// IDs of the selected nodes, in result order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.hits.iter().map(|h| h.node.id).collect()
    }

    /// Whether node `id` was selected.
    pub fn contains(&self, id: NodeId) -> bool {
        self.hits.iter().any(|h| h.node.id == id)
    }

    /// Node texts joined into a context block for a downstream prompt.
    pub fn context(&self) -> String {
        self.hits.iter().map(|h| h.node.text.as_str()).collect::<Vec<_>>().join("\n\n")
    }
}

/// Retrieval engine with a fixed token estimate.
#[derive(Debug, Clone, Copy)]
pub struct Retriever {
    chars_per_token: usize,
}

impl Default for Retriever {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl Retriever {
    /// Create a retriever counting `chars_per_token` characters per token.
    pub fn new(chars_per_token: usize) -> Self {
        Self { chars_per_token: chars_per_token.max(1) }
    }

    /// Select nodes of `tree` for `query_embedding` under `token_budget`.
    pub fn retrieve<'t>(
        &self,
        tree: &'t Tree,
        query_embedding: &[f32],
        strategy: &RetrievalStrategy,
        token_budget: usize,
    ) -> RetrievalResult<'t> {
        match *strategy {
            RetrievalStrategy::CollapsedTree => {
                let ranked = rank(
                    tree.nodes()
                        .iter()
                        .map(|n| (n, cosine_similarity(query_embedding, &n.embedding))),
                );
                self.take_within_budget(ranked, token_budget)
            }
            RetrievalStrategy::TreeTraversal { top_n, max_depth } => {
                self.traverse(tree, query_embedding, top_n, max_depth, token_budget)
            }
        }
    }

    /// Retrieve for a [`Query`], fusing its expansions if it has any.
    ///
    /// Without expansions this is exactly [`retrieve`](Self::retrieve) on the
    /// query embedding.
    pub fn retrieve_query<'t>(
        &self,
        tree: &'t Tree,
        query: &Query,
        strategy: &RetrievalStrategy,
        token_budget: usize,
    ) -> RetrievalResult<'t> {
        if query.expansions.is_empty() {
            return self.retrieve(tree, &query.embedding, strategy, token_budget);
        }
        let embeddings: Vec<&[f32]> = std::iter::once(query.embedding.as_slice())
            .chain(query.expansions.iter().map(Vec::as_slice))
            .collect();
        self.fuse(tree, &embeddings, strategy, token_budget)
    }

    /// Retrieve independently for every embedding, keep each node's best
    /// score, re-rank and apply the budget to the union.
    pub fn fuse<'t>(
        &self,
        tree: &'t Tree,
        embeddings: &[&[f32]],
        strategy: &RetrievalStrategy,
        token_budget: usize,
    ) -> RetrievalResult<'t> {
        let mut best: HashMap<NodeId, (&'t TreeNode, f32)> = HashMap::new();
        for embedding in embeddings {
            for hit in self.retrieve(tree, embedding, strategy, token_budget).hits {
                best.entry(hit.node.id)
                    .and_modify(|slot| slot.1 = slot.1.max(hit.score))
                    .or_insert((hit.node, hit.score));
            }
        }
        self.take_within_budget(rank(best.into_values()), token_budget)
    }

    fn traverse<'t>(
        &self,
        tree: &'t Tree,
        query_embedding: &[f32],
        top_n: usize,
        max_depth: Option<usize>,
        token_budget: usize,
    ) -> RetrievalResult<'t> {
        let mut result = RetrievalResult::new(token_budget);
        let mut frontier: Vec<NodeId> = tree.top_level().to_vec();
        let mut visited_levels = 0;

        while !frontier.is_empty() && max_depth.is_none_or(|d| visited_levels < d) {
            let mut selected = rank(
                frontier
                    .iter()
                    .filter_map(|&id| tree.node(id))
                    .map(|n| (n, cosine_similarity(query_embedding, &n.embedding))),
            );
            selected.truncate(top_n.max(1));

            for &(node, score) in &selected {
                if !result.push(node, score, self.chars_per_token) {
                    return result;
                }
            }
            visited_levels += 1;

            let children: BTreeSet<NodeId> =
                selected.iter().flat_map(|(node, _)| node.children.iter().copied()).collect();
            frontier = children.into_iter().collect();
        }
        result
    }

    fn take_within_budget<'t>(
        &self,
        ranked: Vec<(&'t TreeNode, f32)>,
        token_budget: usize,
    ) -> RetrievalResult<'t> {
        let mut result = RetrievalResult::new(token_budget);
        for (node, score) in ranked {
            if !result.push(node, score, self.chars_per_token) {
                break;
            }
        }
        result
    }
}

/// Retrieve with the default token estimate.
pub fn retrieve<'t>(
    tree: &'t Tree,
    query_embedding: &[f32],
    strategy: &RetrievalStrategy,
    token_budget: usize,
) -> RetrievalResult<'t> {
    Retriever::default().retrieve(tree, query_embedding, strategy, token_budget)
}

/// Sort by descending score, then ascending node ID.
fn rank<'t>(scored: impl IntoIterator<Item = (&'t TreeNode, f32)>) -> Vec<(&'t TreeNode, f32)> {
    let mut scored: Vec<_> = scored.into_iter().collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
    scored
}
