//! RAPTOR tree-organized retrieval for ADK-Rust.
//!
//! This crate provides:
//! - UMAP-style dimensionality reduction of chunk embeddings
//! - Gaussian mixture clustering trained by EM, with BIC model-order
//!   selection and soft (overlapping) membership
//! - Recursive tree construction: cluster, summarise, embed, repeat
//! - Token-budgeted retrieval by tree traversal or over the collapsed tree
//! - Semantic routing across documents and multi-query expansion
//! - A corpus pipeline tying these together, with answer generation over the
//!   retrieved passages
//!
//! Embedding and text generation are injected through the
//! [`EmbeddingProvider`] and [`TextGenerator`] traits. With the `openai`
//! feature, [`openai`] provides implementations for OpenAI-compatible APIs.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use adk_raptor::{RaptorConfig, RetrievalStrategy, TreeBuilder, retrieve};
//!
//! let config = RaptorConfig::builder().seed(42).max_depth(4).build()?;
//! let builder = TreeBuilder::new(config, Arc::new(embedder), Arc::new(generator));
//! let tree = builder.build_tree(&chunks).await?;
//!
//! let result = retrieve(&tree, &query_embedding, &RetrievalStrategy::CollapsedTree, 2000);
//! println!("{}", result.context());
//! ```

pub mod builder;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod expansion;
pub mod generation;
pub mod gmm;
pub mod pipeline;
pub mod reduction;
pub mod retrieval;
pub mod retry;
pub mod router;
pub mod tree;

#[cfg(feature = "openai")]
pub mod openai;

pub use builder::{TreeBuilder, build_tree};
pub use config::{
    AnswerConfig, ClusteringConfig, DistanceMetric, ExpansionConfig, RaptorConfig,
    RaptorConfigBuilder, ReductionConfig, Representative, RetrievalConfig, RetrievalStrategy,
    RetryConfig, RouterConfig, TreeConfig,
};
pub use document::{Answer, Chunk, PassageResult, Query};
pub use embedding::EmbeddingProvider;
pub use error::{RaptorError, Result};
pub use expansion::{MultiQueryExpander, parse_variants};
pub use generation::TextGenerator;
pub use gmm::{Cluster, ClusteringOutcome, GaussianMixture, SoftClusterer};
pub use pipeline::{RaptorPipeline, RaptorPipelineBuilder, answer_prompt};
pub use reduction::DimensionReducer;
pub use retrieval::{RetrievalHit, RetrievalResult, Retriever, cosine_similarity, retrieve};
pub use retry::RetryPolicy;
pub use router::{RouteScore, SemanticRouter, route};
pub use tree::{BuildReport, ClusterFailure, LevelReport, NodeId, Tree, TreeNode};
pub use tokio_util::sync::CancellationToken;
