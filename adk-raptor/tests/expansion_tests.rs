//! Integration tests for multi-query expansion.

mod common;

use std::sync::Arc;

use adk_raptor::{
    ExpansionConfig, MultiQueryExpander, RetrievalStrategy, RetryPolicy, Tree, TreeBuilder,
    retrieve,
};
use common::{
    FailingGenerator, FixedGenerator, TopicEmbedder, TopicSummarizer, fast_retry, test_config,
    topic_chunks,
};

async fn topic_tree() -> Tree {
    let chunks = topic_chunks("doc", &[0, 1, 2, 3], 6);
    TreeBuilder::new(
        test_config(),
        Arc::new(TopicEmbedder::new()),
        Arc::new(TopicSummarizer::new()),
    )
    .build_tree(&chunks)
    .await
    .unwrap()
}

fn expander(generator: Arc<dyn adk_raptor::TextGenerator>) -> MultiQueryExpander {
    MultiQueryExpander::new(generator, Arc::new(TopicEmbedder::new()))
        .with_retry(RetryPolicy::new(&fast_retry()))
}

#[tokio::test]
async fn unavailable_generator_matches_plain_retrieval() {
    let tree = topic_tree().await;
    let generator = Arc::new(FailingGenerator::default());
    let expander = expander(generator.clone());

    for (query, budget) in [("topic 0 question", 25), ("topic 3 question", 60), ("anything", 12)] {
        let expanded = expander.expand_and_retrieve(query, &tree, budget).await.unwrap();
        let plain = retrieve(
            &tree,
            &TopicEmbedder::vector(query),
            &RetrievalStrategy::CollapsedTree,
            budget,
        );

        assert_eq!(expanded.node_ids(), plain.node_ids(), "query {query:?}");
        let expanded_scores: Vec<f32> = expanded.hits.iter().map(|h| h.score).collect();
        let plain_scores: Vec<f32> = plain.hits.iter().map(|h| h.score).collect();
        assert_eq!(expanded_scores, plain_scores);
        assert_eq!(expanded.total_tokens, plain.total_tokens);
    }
    assert!(generator.calls() > 0);
}

#[tokio::test]
async fn unusable_completion_matches_plain_retrieval() {
    let tree = topic_tree().await;
    // only repeats the question, so no variant survives parsing
    let expander = expander(Arc::new(FixedGenerator("1. topic 1 question\n\n".into())));

    let expanded = expander.expand_and_retrieve("topic 1 question", &tree, 40).await.unwrap();
    let plain = retrieve(
        &tree,
        &TopicEmbedder::vector("topic 1 question"),
        &RetrievalStrategy::CollapsedTree,
        40,
    );
    assert_eq!(expanded.node_ids(), plain.node_ids());
}

#[tokio::test]
async fn paraphrases_widen_the_result() {
    let tree = topic_tree().await;
    let generator = FixedGenerator("1. topic 3 question\n2. topic 3 question, rephrased".into());
    let expander = expander(Arc::new(generator));

    let query = expander.build_query("topic 0 question").await.unwrap();
    assert_eq!(query.expansions.len(), 2);

    let budget = 30;
    let plain = retrieve(&tree, &query.embedding, &RetrievalStrategy::CollapsedTree, budget);
    let expanded = expander.expand_and_retrieve("topic 0 question", &tree, budget).await.unwrap();

    assert!(plain.hits.iter().all(|h| !h.node.text.contains("topic 3")));
    assert!(expanded.hits.iter().any(|h| h.node.text.contains("topic 3")));
    assert!(expanded.hits.iter().any(|h| h.node.text.contains("topic 0")));
    assert!(expanded.total_tokens <= budget);
    for window in expanded.hits.windows(2) {
        assert!(window[0].score >= window[1].score);
    }
}

#[tokio::test]
async fn disabled_expansion_never_calls_the_generator() {
    let generator = Arc::new(FailingGenerator::default());
    let expander = expander(generator.clone())
        .with_config(ExpansionConfig { enabled: false, ..ExpansionConfig::default() });

    assert!(expander.expand("topic 2 question").await.is_empty());
    let query = expander.build_query("topic 2 question").await.unwrap();
    assert!(query.expansions.is_empty());
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn requested_variant_count_caps_parsing() {
    let generator = FixedGenerator("a\nb\nc\nd\ne".into());
    let expander = expander(Arc::new(generator))
        .with_config(ExpansionConfig { variants: 2, ..ExpansionConfig::default() });

    assert_eq!(expander.expand("question").await, vec!["a".to_string(), "b".to_string()]);
}
