//! Semantic routing: choose which document trees a query should search.
//!
//! Each document is represented by one embedding (see
//! [`Tree::representative`](crate::Tree::representative)). Routing ranks the
//! representatives by cosine similarity to the query. There is no randomness:
//! identical inputs always produce the same ordering, with ties broken by
//! document ID.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::RouterConfig;
use crate::retrieval::cosine_similarity;

/// A routed document and its similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteScore {
    /// Document identifier.
    pub document_id: String,
    /// Cosine similarity between the query and the document representative.
    pub score: f32,
}

/// Ranks documents against a query embedding.
#[derive(Debug, Clone)]
pub struct SemanticRouter {
    top_k: usize,
    min_similarity: Option<f32>,
}

impl SemanticRouter {
    /// Create a router returning at most `top_k` documents.
    pub fn new(top_k: usize) -> Self {
        Self { top_k, min_similarity: None }
    }

    /// Create a router from configuration.
    pub fn from_config(config: &RouterConfig) -> Self {
        Self { top_k: config.top_k, min_similarity: config.min_similarity }
    }

    /// Never route to documents scoring below `min_similarity`.
    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = Some(min_similarity);
        self
    }

    /// Top documents for `query_embedding`, best first.
    pub fn route(
        &self,
        query_embedding: &[f32],
        representatives: &HashMap<String, Vec<f32>>,
    ) -> Vec<RouteScore> {
        let mut scored: Vec<RouteScore> = representatives
            .iter()
            .map(|(document_id, embedding)| RouteScore {
                document_id: document_id.clone(),
                score: cosine_similarity(query_embedding, embedding),
            })
            .filter(|r| self.min_similarity.is_none_or(|min| r.score >= min))
            .collect();

        scored.sort_by(|a, b| {
            b.score.total_cmp(&a.score).then_with(|| a.document_id.cmp(&b.document_id))
        });
        scored.truncate(self.top_k);
        scored
    }
}

/// Top `top_k` document IDs for `query_embedding`, best first.
pub fn route(
    query_embedding: &[f32],
    representatives: &HashMap<String, Vec<f32>>,
    top_k: usize,
) -> Vec<String> {
    SemanticRouter::new(top_k)
        .route(query_embedding, representatives)
        .into_iter()
        .map(|r| r.document_id)
        .collect()
}
