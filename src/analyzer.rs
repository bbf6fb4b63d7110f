//! The external analysis operation boundary.
//!
//! The queue and orchestrator only need the success/failure outcome of an
//! analysis and an error classification; they never interpret the generated
//! documents. Implementations wrap whichever LLM provider performs the
//! analysis.

use async_trait::async_trait;
use thiserror::Error;

use crate::job::Job;

/// The parameters of one analysis, reconstructed from the stored job fields
/// so that a job can be re-submitted after a process restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub title: String,
    pub author: String,
    pub genre: String,
    pub purpose: String,
    pub audience: String,
}

impl From<&Job> for AnalysisRequest {
    fn from(job: &Job) -> Self {
        Self {
            title: job.title.clone(),
            author: job.author.clone(),
            genre: job.genre.clone(),
            purpose: job.purpose.clone(),
            audience: job.audience.clone(),
        }
    }
}

/// The markdown documents produced by a successful analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisDocuments {
    pub primary_summary: String,
    pub detailed: String,
    pub executive_summary: String,
    pub quick_reference: String,
}

/// Provider token accounting for one analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisOutcome {
    pub documents: AnalysisDocuments,
    pub usage: TokenUsage,
}

/// Classified failure from the analysis provider.
///
/// The classification drives the queue's retry policy: rate limits and
/// overloads are retried under a cooldown, exhaustion pauses the queue, and
/// anything else is terminal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider signalled throttling (e.g. HTTP 429).
    #[error("provider rate limited: {0}")]
    RateLimited(String),
    /// The provider is transiently overloaded (e.g. HTTP 500).
    #[error("provider overloaded: {0}")]
    Overloaded(String),
    /// Billing or credit exhaustion; operator action required.
    #[error("provider resources exhausted: {0}")]
    Exhausted(String),
    /// Any other failure; not retried.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Classifies a raw provider error message by substring matching.
    ///
    /// This is a fallback for adapters that only see message text. The
    /// matched substrings are provider-API-specific and brittle; prefer
    /// constructing the typed variant directly from the provider's
    /// structured error response.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("rate_limit") || lowered.contains("429") {
            Self::RateLimited(message)
        } else if lowered.contains("credit balance") || lowered.contains("billing") {
            Self::Exhausted(message)
        } else if lowered.contains("overloaded") || lowered.contains("500") {
            Self::Overloaded(message)
        } else {
            Self::Other(message)
        }
    }

    /// Wraps an arbitrary error as [`ProviderError::Other`].
    pub fn other(error: impl std::fmt::Display) -> Self {
        Self::Other(error.to_string())
    }
}

/// The opaque, fallible analysis operation.
#[async_trait]
pub trait BookAnalyzer: Send + Sync + 'static {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome, ProviderError>;
}
