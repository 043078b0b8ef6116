//! Data types for chunks, queries and retrieved passages.

use serde::{Deserialize, Serialize};

use crate::tree::NodeId;

/// A contiguous span of a document together with its embedding.
///
/// The order of a chunk slice handed to the tree builder is taken to be the
/// document order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Unique identifier for the chunk.
    pub id: String,
    /// The ID of the document the chunk was cut from.
    pub document_id: String,
    /// The chunk text.
    pub text: String,
    /// The vector embedding of `text`.
    pub embedding: Vec<f32>,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        text: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self { id: id.into(), document_id: document_id.into(), text: text.into(), embedding }
    }
}

/// A query: its text, its embedding and optional paraphrase embeddings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    /// The query text as asked.
    pub text: String,
    /// Embedding of `text`.
    pub embedding: Vec<f32>,
    /// Embeddings of paraphrased variants, searched alongside `embedding`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expansions: Vec<Vec<f32>>,
}

impl Query {
    /// A query without expansions.
    pub fn new(text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self { text: text.into(), embedding, expansions: Vec::new() }
    }

    /// Attach paraphrase embeddings.
    pub fn with_expansions(mut self, expansions: Vec<Vec<f32>>) -> Self {
        self.expansions = expansions;
        self
    }
}

/// A passage returned by the corpus pipeline, detached from its tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassageResult {
    /// Document whose tree produced the passage.
    pub document_id: String,
    /// Node within that document's tree.
    pub node_id: NodeId,
    /// Tree level of the node (0 = original chunk).
    pub level: usize,
    /// Node text.
    pub text: String,
    /// Cosine similarity to the query (maximum over query variants).
    pub score: f32,
}

/// A generated answer and the passages it was grounded on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    /// Generator output, trimmed.
    pub text: String,
    /// Passages placed in the prompt, in prompt order.
    pub passages: Vec<PassageResult>,
}
