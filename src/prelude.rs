//! The purpose of this module is to alleviate the need to import many of the
//! `[bindery]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use bindery::prelude::*;
//! ```
pub use crate::analyzer::{
    AnalysisDocuments, AnalysisOutcome, AnalysisRequest, BookAnalyzer, ProviderError, TokenUsage,
};
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::job::{Job, JobId, JobStatus, Priority};
pub use crate::queue::{ProcessingQueue, QueueConfig, QueueStatus};
pub use crate::recovery::RecoveryConfig;
pub use crate::service::{AnalysisService, RetrySummary, ServiceConfig, SubmitRequest};
pub use crate::store::{memory::InMemoryStore, JobStore};
pub use crate::webhook::{EventType, WebhookConfig, WebhookDispatcher};
