//! The RAPTOR tree: an arena of nodes addressed by index, grouped by level.
//!
//! Level 0 holds the original chunks in document order. Each higher level
//! holds one summary node per cluster of the level below. Because clusters
//! overlap, a node may have several parents, so the structure is a layered
//! DAG rather than a strict tree; parent and child links are plain
//! [`NodeId`]s into [`Tree::nodes`].

use serde::{Deserialize, Serialize};

use crate::config::Representative;
use crate::document::Chunk;

/// Index of a node in [`Tree::nodes`].
pub type NodeId = usize;

/// A node of the tree: an original chunk (level 0) or a cluster summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeNode {
    /// Position in [`Tree::nodes`].
    pub id: NodeId,
    /// 0 for chunks, `n` for summaries of level `n - 1` clusters.
    pub level: usize,
    /// Chunk text or summary text.
    pub text: String,
    /// Embedding of `text`.
    pub embedding: Vec<f32>,
    /// Members of the summarised cluster, ascending. Empty for leaves.
    pub children: Vec<NodeId>,
    /// Summaries that include this node, ascending.
    pub parents: Vec<NodeId>,
    /// Source chunk ID for leaves.
    pub chunk_id: Option<String>,
    /// Set when summarisation failed and `text` is a truncated concatenation.
    #[serde(default)]
    pub degraded: bool,
}

impl TreeNode {
    /// Whether the node is an original chunk.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Clustering outcome of one level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelReport {
    /// Level that was clustered.
    pub level: usize,
    /// Nodes on that level.
    pub input_nodes: usize,
    /// Component count chosen by the BIC search.
    pub n_components: usize,
    /// Non-empty clusters produced.
    pub clusters: usize,
    /// Whether the level had too few nodes to cluster.
    pub degenerate: bool,
    /// BIC of the chosen component count.
    pub bic: Option<f64>,
}

/// A cluster whose summary node could not be created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterFailure {
    /// Level of the cluster members.
    pub level: usize,
    /// Member node IDs.
    pub members: Vec<NodeId>,
    /// Rendered error.
    pub error: String,
}

/// What happened while a tree was built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildReport {
    /// One entry per clustered level.
    pub levels: Vec<LevelReport>,
    /// Summary nodes built from the raw-text fallback.
    pub degraded_nodes: Vec<NodeId>,
    /// Clusters dropped because their summary could not be embedded.
    pub failures: Vec<ClusterFailure>,
}

/// A summary node about to be appended by the builder.
#[derive(Debug, Clone)]
pub(crate) struct PendingNode {
    pub text: String,
    pub embedding: Vec<f32>,
    pub children: Vec<NodeId>,
    pub degraded: bool,
}

/// A built RAPTOR tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    levels: Vec<Vec<NodeId>>,
    report: BuildReport,
}

impl Tree {
    /// A tree holding only the leaf level.
    pub(crate) fn from_chunks(chunks: &[Chunk]) -> Self {
        let nodes: Vec<TreeNode> = chunks
            .iter()
            .enumerate()
            .map(|(id, chunk)| TreeNode {
                id,
                level: 0,
                text: chunk.text.clone(),
                embedding: chunk.embedding.clone(),
                children: Vec::new(),
                parents: Vec::new(),
                chunk_id: Some(chunk.id.clone()),
                degraded: false,
            })
            .collect();
        let levels = vec![(0..nodes.len()).collect()];
        Self { nodes, levels, report: BuildReport::default() }
    }

    /// Append a level of summary nodes and link them to their children.
    pub(crate) fn push_level(&mut self, pending: Vec<PendingNode>) -> &[NodeId] {
        let level = self.levels.len();
        let mut ids = Vec::with_capacity(pending.len());
        for node in pending {
            let id = self.nodes.len();
            for &child in &node.children {
                self.nodes[child].parents.push(id);
            }
            if node.degraded {
                self.report.degraded_nodes.push(id);
            }
            self.nodes.push(TreeNode {
                id,
                level,
                text: node.text,
                embedding: node.embedding,
                children: node.children,
                parents: Vec::new(),
                chunk_id: None,
                degraded: node.degraded,
            });
            ids.push(id);
        }
        self.levels.push(ids);
        &self.levels[level]
    }

    pub(crate) fn report_mut(&mut self) -> &mut BuildReport {
        &mut self.report
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// All nodes, leaves first, then each level in order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Node IDs of `level`, or an empty slice beyond the top.
    pub fn level_ids(&self, level: usize) -> &[NodeId] {
        self.levels.get(level).map_or(&[], Vec::as_slice)
    }

    /// Nodes of `level`.
    pub fn level(&self, level: usize) -> impl Iterator<Item = &TreeNode> {
        self.level_ids(level).iter().map(|&id| &self.nodes[id])
    }

    /// Number of levels, leaves included.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Highest level index.
    pub fn max_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Nodes of the highest level.
    pub fn top_level(&self) -> &[NodeId] {
        self.level_ids(self.max_level())
    }

    /// The single root, if the top level has exactly one node.
    pub fn root(&self) -> Option<&TreeNode> {
        match self.top_level() {
            [id] => self.nodes.get(*id),
            _ => None,
        }
    }

    /// Leaf nodes in document order.
    pub fn leaves(&self) -> impl Iterator<Item = &TreeNode> {
        self.level(0)
    }

    /// Total node count.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children of `id`, in ascending ID order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &TreeNode> {
        self.nodes
            .get(id)
            .map_or(&[][..], |n| n.children.as_slice())
            .iter()
            .map(|&c| &self.nodes[c])
    }

    /// Build statistics.
    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    /// Nodes whose text is a fallback concatenation.
    pub fn degraded_nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter().filter(|n| n.degraded)
    }

    /// Embedding standing in for the whole tree when routing.
    pub fn representative(&self, kind: Representative) -> Option<Vec<f32>> {
        match kind {
            Representative::Root => match self.root() {
                Some(root) => Some(root.embedding.clone()),
                None => mean_embedding(self.level(self.max_level())),
            },
            Representative::MeanOfLeaves => mean_embedding(self.leaves()),
        }
    }
}

fn mean_embedding<'a>(nodes: impl Iterator<Item = &'a TreeNode>) -> Option<Vec<f32>> {
    let mut sum: Option<Vec<f32>> = None;
    let mut count = 0usize;
    for node in nodes {
        let acc = sum.get_or_insert_with(|| vec![0.0; node.embedding.len()]);
        for (slot, v) in acc.iter_mut().zip(&node.embedding) {
            *slot += v;
        }
        count += 1;
    }
    sum.map(|mut v| {
        v.iter_mut().for_each(|x| *x /= count as f32);
        v
    })
}
