//! Integration tests for the corpus pipeline.

mod common;

use std::sync::Arc;

use adk_raptor::{RaptorConfig, RaptorError, RaptorPipeline, Representative};
use common::{
    FailingGenerator, TopicEmbedder, TopicSummarizer, fast_retry, passage_text, test_config,
};

fn texts(topics: &[usize], per_topic: usize) -> Vec<String> {
    topics.iter().flat_map(|&t| (0..per_topic).map(move |p| passage_text(t, p))).collect()
}

fn pipeline(config: RaptorConfig) -> RaptorPipeline {
    RaptorPipeline::builder()
        .config(config)
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .generator(Arc::new(TopicSummarizer::new()))
        .build()
        .unwrap()
}

async fn two_document_pipeline(config: RaptorConfig) -> RaptorPipeline {
    let pipeline = pipeline(config);
    pipeline.index_document("alpha", &texts(&[0, 1], 8)).await.unwrap();
    pipeline.index_document("beta", &texts(&[2, 3], 8)).await.unwrap();
    pipeline
}

#[tokio::test]
async fn query_is_routed_to_the_matching_document() {
    let mut config = test_config();
    config.router.top_k = 1;
    config.expansion.enabled = false;
    let pipeline = two_document_pipeline(config).await;

    let routed = pipeline.route(&TopicEmbedder::vector("topic 2 question")).await;
    assert_eq!(routed[0].document_id, "beta");

    let passages = pipeline.query("topic 2 question").await.unwrap();
    assert!(!passages.is_empty());
    assert!(passages.iter().all(|p| p.document_id == "beta"));
    assert!(passages[0].text.contains("topic 2"));
    for window in passages.windows(2) {
        assert!(window[0].score >= window[1].score);
    }
}

#[tokio::test]
async fn merged_passages_fit_the_budget() {
    let mut config = test_config();
    config.retrieval.token_budget = 40;
    config.router.representative = Representative::MeanOfLeaves;
    let pipeline = two_document_pipeline(config).await;

    let passages = pipeline.query("topic 1 question").await.unwrap();

    let tokens: usize = passages.iter().map(|p| p.text.chars().count().div_ceil(4)).sum();
    assert!(tokens <= 40);
    assert_eq!(passages[0].document_id, "alpha");
}

#[tokio::test]
async fn expansion_failure_does_not_fail_queries() {
    let mut config = test_config();
    config.retry = fast_retry();
    let pipeline = RaptorPipeline::builder()
        .config(config)
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .generator(Arc::new(FailingGenerator::default()))
        .build()
        .unwrap();
    pipeline.index_document("gamma", &texts(&[3], 4)).await.unwrap();

    let passages = pipeline.query("topic 3 question").await.unwrap();
    assert!(!passages.is_empty());
    assert!(passages.iter().all(|p| p.document_id == "gamma"));
}

#[tokio::test]
async fn answers_from_the_merged_passages() {
    let mut config = test_config();
    config.expansion.enabled = false;
    let generator = Arc::new(TopicSummarizer::new());
    let pipeline = RaptorPipeline::builder()
        .config(config)
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .generator(generator.clone())
        .build()
        .unwrap();
    pipeline.index_document("alpha", &texts(&[0, 1], 8)).await.unwrap();
    pipeline.index_document("beta", &texts(&[2, 3], 8)).await.unwrap();

    let answer = pipeline.answer("topic 2 question").await.unwrap();

    assert_eq!(answer.passages, pipeline.query("topic 2 question").await.unwrap());
    assert!(!answer.passages.is_empty());
    let prompt = generator.prompts().last().cloned().unwrap();
    assert!(prompt.contains("Question:\ntopic 2 question"), "prompt: {prompt}");
    for passage in &answer.passages {
        assert!(prompt.contains(&passage.text));
    }
    assert!(answer.text.starts_with("summary:"));
    assert!(answer.text.contains("topic 2"));
}

#[tokio::test]
async fn answer_prompt_follows_the_configured_template() {
    let config = RaptorConfig::builder()
        .seed(42)
        .target_dim(2)
        .expansion(false)
        .retry(fast_retry())
        .answer_template("Q={question}\nK={context}")
        .answer_max_tokens(64)
        .build()
        .unwrap();
    let generator = Arc::new(TopicSummarizer::new());
    let pipeline = RaptorPipeline::builder()
        .config(config)
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .generator(generator.clone())
        .build()
        .unwrap();
    pipeline.index_document("gamma", &texts(&[1], 1)).await.unwrap();

    let answer = pipeline.answer("topic 1 question").await.unwrap();

    let prompt = generator.prompts().last().cloned().unwrap();
    assert_eq!(prompt, format!("Q=topic 1 question\nK={}", passage_text(1, 0)));
    assert_eq!(answer.passages.len(), 1);
}

#[tokio::test]
async fn answer_surfaces_generator_failure() {
    let generator = Arc::new(FailingGenerator::default());
    let pipeline = RaptorPipeline::builder()
        .config(test_config())
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .generator(generator.clone())
        .build()
        .unwrap();
    pipeline.index_document("delta", &texts(&[3], 1)).await.unwrap();
    assert!(!pipeline.query("topic 3 question").await.unwrap().is_empty());

    let before = generator.calls();
    let result = pipeline.answer("topic 3 question").await;
    assert!(matches!(result, Err(RaptorError::GenerationError { .. })));
    // expansion attempts plus both attempts of the answer
    assert!(generator.calls() >= before + 2);
}

#[tokio::test]
async fn chunks_are_embedded_in_order() {
    let pipeline = pipeline(test_config());
    let chunks = pipeline.embed_chunks("delta", &texts(&[1], 3)).await.unwrap();

    let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["delta-0", "delta-1", "delta-2"]);
    assert!(chunks.iter().all(|c| c.document_id == "delta"));
    assert_eq!(chunks[1].embedding, TopicEmbedder::vector(&passage_text(1, 1)));
}

#[tokio::test]
async fn documents_can_be_replaced_and_removed() {
    let pipeline = two_document_pipeline(test_config()).await;
    assert_eq!(pipeline.document_ids().await, vec!["alpha", "beta"]);

    let replaced = pipeline.index_document("alpha", &texts(&[0], 1)).await.unwrap();
    assert_eq!(replaced.len(), 1);
    assert_eq!(pipeline.tree("alpha").await.unwrap().len(), 1);

    assert!(pipeline.remove_document("alpha").await);
    assert!(!pipeline.remove_document("alpha").await);
    assert_eq!(pipeline.document_ids().await, vec!["beta"]);
}

#[tokio::test]
async fn empty_corpus_answers_with_nothing() {
    let pipeline = pipeline(test_config());
    assert!(pipeline.query("topic 0 question").await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_document_is_rejected() {
    let pipeline = pipeline(test_config());
    let result = pipeline.index_document("empty", &[]).await;
    assert!(matches!(result, Err(RaptorError::EmptyCorpus)));
    assert!(pipeline.document_ids().await.is_empty());
}

#[tokio::test]
async fn cancelled_pipeline_refuses_to_build() {
    let pipeline = pipeline(test_config());
    pipeline.cancellation_token().cancel();

    let result = pipeline.index_document("epsilon", &texts(&[0, 1], 4)).await;
    assert!(matches!(result, Err(RaptorError::Cancelled)));
}

#[test]
fn builder_requires_every_capability() {
    let missing_generator = RaptorPipeline::builder()
        .config(RaptorConfig::default())
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .build();
    assert!(matches!(
        missing_generator,
        Err(RaptorError::ConfigError(msg)) if msg.contains("generator")
    ));

    let missing_config = RaptorPipeline::builder()
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .generator(Arc::new(TopicSummarizer::new()))
        .build();
    assert!(matches!(missing_config, Err(RaptorError::ConfigError(_))));

    let mut invalid = RaptorConfig::default();
    invalid.retrieval.token_budget = 0;
    let invalid_config = RaptorPipeline::builder()
        .config(invalid)
        .embedding_provider(Arc::new(TopicEmbedder::new()))
        .generator(Arc::new(TopicSummarizer::new()))
        .build();
    assert!(matches!(invalid_config, Err(RaptorError::ConfigError(_))));
}
