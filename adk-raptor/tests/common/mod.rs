//! Deterministic stub capabilities shared by the integration tests.
//!
//! Texts speak a tiny language: `topic 2 passage 7` is a chunk about topic 2,
//! `summary: topic 0 topic 1` a summary covering topics 0 and 1. The
//! embedder places every topic on its own block of dimensions, so topics are
//! mutually orthogonal and summaries sit at the mean of their topics.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};

use adk_raptor::{
    CancellationToken, Chunk, EmbeddingProvider, RaptorConfig, RaptorError, Result, RetryConfig,
    TextGenerator,
};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use regex::Regex;

pub const DIM: usize = 32;
pub const TOPICS: usize = 4;
const BLOCK: usize = DIM / TOPICS;

static TOPIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"topic (\d+)").unwrap());
static PASSAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"passage (\d+)").unwrap());

/// Distinct topics mentioned in `text`, ascending.
pub fn topics_in(text: &str) -> Vec<usize> {
    let mut topics: Vec<usize> = TOPIC
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .filter(|t| *t < TOPICS)
        .collect();
    topics.sort_unstable();
    topics.dedup();
    topics
}

pub fn passage_text(topic: usize, passage: usize) -> String {
    format!("topic {topic} passage {passage}")
}

/// Embeds by topic; chunk texts get small seeded noise, everything else none.
#[derive(Default)]
pub struct TopicEmbedder {
    fail_on: Option<String>,
    calls: AtomicUsize,
}

impl TopicEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every text containing `needle`.
    pub fn failing_on(needle: impl Into<String>) -> Self {
        Self { fail_on: Some(needle.into()), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let topics = topics_in(text);
        if topics.is_empty() {
            return vec![0.25; DIM];
        }
        let mut v = vec![0.0f32; DIM];
        for &t in &topics {
            for slot in &mut v[t * BLOCK..(t + 1) * BLOCK] {
                *slot += 1.0 / topics.len() as f32;
            }
        }
        if let Some(passage) = PASSAGE.captures(text).and_then(|c| c[1].parse::<u64>().ok()) {
            let seed = topics[0] as u64 * 1_000 + passage;
            let mut rng = StdRng::seed_from_u64(seed);
            let noise = Normal::new(0.0f32, 0.05).unwrap();
            for slot in &mut v {
                *slot += rng.sample(noise);
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for TopicEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.fail_on {
            if text.contains(needle.as_str()) {
                return Err(RaptorError::EmbeddingError {
                    provider: "topic-stub".into(),
                    text: text.to_string(),
                    message: "embedding service unavailable".into(),
                });
            }
        }
        Ok(Self::vector(text))
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Summarises by listing the topics found in the prompt; records prompts.
#[derive(Default)]
pub struct TopicSummarizer {
    prompts: Mutex<Vec<String>>,
}

impl TopicSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for TopicSummarizer {
    async fn complete(&self, prompt: &str, _max_tokens: usize) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let topics: Vec<String> = topics_in(prompt).iter().map(|t| format!("topic {t}")).collect();
        Ok(format!("summary: {}", topics.join(" ")))
    }
}

/// A generator that is always down.
#[derive(Default)]
pub struct FailingGenerator {
    calls: AtomicUsize,
}

impl FailingGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for FailingGenerator {
    async fn complete(&self, _prompt: &str, _max_tokens: usize) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RaptorError::GenerationError {
            provider: "failing-stub".into(),
            message: "model server unreachable".into(),
        })
    }
}

/// Returns the same completion for every prompt.
pub struct FixedGenerator(pub String);

#[async_trait]
impl TextGenerator for FixedGenerator {
    async fn complete(&self, _prompt: &str, _max_tokens: usize) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Summarises like [`TopicSummarizer`] but fires a cancellation token first.
pub struct CancellingGenerator(pub CancellationToken);

#[async_trait]
impl TextGenerator for CancellingGenerator {
    async fn complete(&self, prompt: &str, _max_tokens: usize) -> Result<String> {
        self.0.cancel();
        let topics: Vec<String> = topics_in(prompt).iter().map(|t| format!("topic {t}")).collect();
        Ok(format!("summary: {}", topics.join(" ")))
    }
}

/// `per_topic` chunks for each of `topics`, grouped by topic.
pub fn topic_chunks(document_id: &str, topics: &[usize], per_topic: usize) -> Vec<Chunk> {
    topics
        .iter()
        .flat_map(|&t| (0..per_topic).map(move |p| (t, p)))
        .enumerate()
        .map(|(i, (t, p))| {
            let text = passage_text(t, p);
            let embedding = TopicEmbedder::vector(&text);
            Chunk::new(format!("{document_id}-{i}"), document_id, text, embedding)
        })
        .collect()
}

/// Retries that fail fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 1, timeout_ms: 5_000 }
}

/// Seeded configuration reducing to two dimensions.
pub fn test_config() -> RaptorConfig {
    RaptorConfig::builder()
        .seed(42)
        .target_dim(2)
        .cluster_range(1, 6)
        .max_depth(5)
        .retry(fast_retry())
        .build()
        .unwrap()
}

/// Seeded configuration with the default reduction (ten dimensions).
pub fn default_reduction_config() -> RaptorConfig {
    RaptorConfig::builder()
        .seed(42)
        .cluster_range(1, 6)
        .max_depth(5)
        .retry(fast_retry())
        .build()
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
