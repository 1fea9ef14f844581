//! manyshot-eval - many-shot in-context learning harness for multimodal LLMs
//! with subgroup bias accounting
//!
//! This crate provides:
//! - Stratified demonstration sampling balanced across classes and subgroups
//! - Multi-image, multi-question prompt assembly with a strict answer format
//! - A sequential batch runner with retry, checkpoint/resume, and cumulative
//!   token-usage accounting across interrupted runs
//! - An async client for OpenAI-compatible chat-completions APIs

pub mod checkpoint;
pub mod client;
pub mod dataset;
pub mod error;
pub mod prompt;
pub mod runner;
pub mod sampler;

pub use crate::checkpoint::{terminal_marker, CheckpointStore, TokenUsage, ERROR_SENTINEL};
pub use crate::client::{ApiConfig, CallError, ModelClient, OpenAiClient};
pub use crate::dataset::{Demographics, ImageStore, LabelTable, LabeledRow, Subgroup};
pub use crate::error::{HarnessError, Result};
pub use crate::prompt::{assemble, AssembledPrompt, IMAGE_MARKER};
pub use crate::runner::{
    batch_key, BatchOutcome, CancelSignal, ExperimentConfig, RetryPolicy, RunReport, Runner,
    RESULTS_HEADER,
};
pub use crate::sampler::{sample_demo_set, subgroup_quotas, DemoExample};
