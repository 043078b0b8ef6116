//! Property and integration tests for token-budgeted retrieval.

mod common;

use std::sync::Arc;

use adk_raptor::retrieval::approximate_tokens;
use adk_raptor::{RetrievalStrategy, Tree, TreeBuilder, retrieve};
use common::{DIM, TopicEmbedder, TopicSummarizer, test_config, topic_chunks};
use proptest::prelude::*;

fn build(topics: &[usize], per_topic: usize) -> Tree {
    let chunks = topic_chunks("doc", topics, per_topic);
    let builder = TreeBuilder::new(
        test_config(),
        Arc::new(TopicEmbedder::new()),
        Arc::new(TopicSummarizer::new()),
    );
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(builder.build_tree(&chunks)).unwrap()
}

fn arb_strategy() -> impl Strategy<Value = RetrievalStrategy> {
    prop_oneof![
        Just(RetrievalStrategy::CollapsedTree),
        (1usize..4, proptest::option::of(1usize..4))
            .prop_map(|(top_n, max_depth)| RetrievalStrategy::TreeTraversal { top_n, max_depth }),
    ]
}

/// **Feature: adk-raptor, Property 1: Retrieval respects the token budget**
/// *For any* tree, query embedding, strategy and token budget, the summed
/// token estimate of the retrieved nodes SHALL NOT exceed the budget, and no
/// node SHALL appear twice.
mod prop_budget_bound {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn retrieved_tokens_never_exceed_budget(
            topics in proptest::sample::subsequence(vec![0usize, 1, 2, 3], 1..=4),
            per_topic in 1usize..5,
            query in proptest::collection::vec(-1.0f32..1.0f32, DIM),
            strategy in arb_strategy(),
            budget in 1usize..60,
        ) {
            let tree = build(&topics, per_topic);
            let result = retrieve(&tree, &query, &strategy, budget);

            let counted: usize =
                result.hits.iter().map(|h| approximate_tokens(&h.node.text, 4)).sum();
            prop_assert_eq!(counted, result.total_tokens);
            prop_assert!(result.total_tokens <= budget);

            let mut ids = result.node_ids();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), result.len());
        }
    }
}

/// **Feature: adk-raptor, Property 2: Collapsed retrieval is ranked**
/// *For any* query, collapsed-tree hits SHALL be ordered by descending score.
mod prop_collapsed_ordering {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn collapsed_hits_descend(
            query in proptest::collection::vec(-1.0f32..1.0f32, DIM),
            budget in 1usize..200,
        ) {
            let tree = build(&[0, 1, 2], 3);
            let result = retrieve(&tree, &query, &RetrievalStrategy::CollapsedTree, budget);
            for window in result.hits.windows(2) {
                prop_assert!(window[0].score >= window[1].score);
            }
        }
    }
}

#[test]
fn leaf_query_reaches_its_leaf_through_traversal() {
    let tree = build(&[0, 1, 2, 3], 5);
    assert!(tree.max_level() >= 2, "expected a tree of at least three levels");

    let target = tree.leaves().nth(7).unwrap();
    let strategy = RetrievalStrategy::TreeTraversal { top_n: 3, max_depth: None };
    let result = retrieve(&tree, &target.embedding, &strategy, 10_000);

    let deepest = result.hits.iter().map(|h| h.node.level).min().unwrap();
    assert_eq!(deepest, 0);
    assert!(result.contains(target.id), "leaf {} not retrieved", target.id);
}

#[test]
fn collapsed_prefers_matching_summary_and_leaves() {
    let tree = build(&[0, 1, 2, 3], 5);
    let query = TopicEmbedder::vector("topic 2 question");
    let result = retrieve(&tree, &query, &RetrievalStrategy::CollapsedTree, 30);

    assert!(!result.is_empty());
    assert!(result.budget_exhausted);
    assert!(result.hits[0].node.text.contains("topic 2"));
    assert!(result.context().contains("topic 2"));
}
