//! Batch query runner: drives the sampler, prompt assembler, and model
//! client over the shuffled test set, one batch at a time, with retry,
//! checkpoint/resume, and token-usage accounting.
//!
//! Batches are strictly sequential: the checkpoint file is a single shared
//! mutable resource and usage counters accumulate additively per run. The
//! model call is the only suspension point; cancellation is observed at the
//! boundary around it, never mid-call.

use crate::checkpoint::{CheckpointStore, TokenUsage, ERROR_SENTINEL};
use crate::client::{CallError, ModelClient};
use crate::dataset::{Demographics, ImageStore, LabelTable};
use crate::error::{HarnessError, Result};
use crate::prompt;
use crate::sampler::sample_demo_set;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Per-question completion budget passed to the model call.
const MAX_TOKENS_PER_QUESTION: usize = 60;

/// Header schema of the external results table. Metric rows are appended by
/// the analysis step, outside the harness.
pub const RESULTS_HEADER: [&str; 14] = [
    "num_shots_per_class",
    "black_race_split",
    "accuracy",
    "acc_error",
    "f1",
    "f1_error",
    "black_accuracy",
    "black_acc_error",
    "black_f1",
    "black_f1_error",
    "white_accuracy",
    "white_acc_error",
    "white_f1",
    "white_f1_error",
];

/// Batch identity: a pure function of the ordered test-item identifiers.
/// Reordering the identifiers changes the identity.
pub fn batch_key(ids: &[String]) -> String {
    format!("{:?}", ids)
}

/// Injectable bound on the per-run attempt loop. No backoff between
/// attempts; the client's request timeout is the only pacing.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Terminal state of one batch within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Checkpoint already held a complete entry; no call made.
    Skipped,
    /// A complete response is now stored.
    Succeeded,
    /// Attempts exhausted; the stored entry is error-marked or incomplete
    /// and will be retried on the next invocation.
    Failed,
}

/// One experiment configuration. Its identity string keys the checkpoint
/// file, so distinct configurations never alias the same state.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub dataset_name: String,
    pub model_name: String,
    pub shots_per_class: usize,
    /// Target fraction of demonstration examples drawn from the Black
    /// subgroup, per class.
    pub split: f64,
    /// Questions batched into one API call.
    pub batch_size: usize,
    /// Experiment-level constant seeding the test-set shuffle; identical
    /// seeds reproduce identical batch identities across runs.
    pub seed: u64,
    pub out_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl ExperimentConfig {
    /// `{dataset}_{total_shots}shot_{model}_{batch}_{split:.2}split`
    pub fn exp_name(&self, num_classes: usize) -> String {
        format!(
            "{}_{}shot_{}_{}_{:.2}split",
            self.dataset_name,
            self.shots_per_class * num_classes,
            self.model_name,
            self.batch_size,
            self.split
        )
    }

    pub fn checkpoint_path(&self, num_classes: usize) -> PathBuf {
        self.out_dir.join(format!("{}.json", self.exp_name(num_classes)))
    }

    pub fn results_table_path(&self) -> PathBuf {
        self.out_dir.join(format!(
            "{}_{}_{}_results.csv",
            self.dataset_name, self.model_name, self.batch_size
        ))
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HarnessError::Config("batch size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(HarnessError::Config("max attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// External-interrupt signal, observed only at the call boundary.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn disabled() -> Self {
        Self { rx: None }
    }

    /// A signal plus the sender that trips it.
    pub fn listen() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx: Some(rx) })
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancellation is signalled; pends forever when disabled
    /// or the sender is gone.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// What one invocation of the harness did.
#[derive(Debug)]
pub struct RunReport {
    pub exp_name: String,
    pub outcomes: Vec<BatchOutcome>,
    pub calls_made: usize,
    /// Cumulative usage after folding this run's delta into the checkpoint.
    pub usage: TokenUsage,
    pub checkpoint_path: PathBuf,
    pub results_table_path: PathBuf,
}

impl RunReport {
    pub fn count(&self, outcome: BatchOutcome) -> usize {
        self.outcomes.iter().filter(|o| **o == outcome).count()
    }
}

/// Sequential batch driver around an injected model-calling capability.
pub struct Runner<C: ModelClient> {
    client: C,
    config: ExperimentConfig,
    cancel: CancelSignal,
}

impl<C: ModelClient> Runner<C> {
    pub fn new(client: C, config: ExperimentConfig) -> Self {
        Self {
            client,
            config,
            cancel: CancelSignal::disabled(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the experiment: sample demos, then process every batch of the
    /// shuffled test set, persisting the checkpoint after each one.
    pub async fn run(
        &self,
        test_set: &LabelTable,
        demo_pool: &LabelTable,
        demographics: &Demographics,
        class_desp: &[String],
        images: &ImageStore,
    ) -> Result<RunReport> {
        self.config.validate()?;
        if demo_pool.classes != test_set.classes {
            return Err(HarnessError::Dataset(format!(
                "demo pool classes {:?} do not match test set classes {:?}",
                demo_pool.classes, test_set.classes
            )));
        }

        // Fatal on unsatisfiable configurations, before any API call.
        let mut demos = sample_demo_set(
            demo_pool,
            demographics,
            class_desp,
            self.config.shots_per_class,
            self.config.split,
        )?;

        let num_classes = demo_pool.classes.len();
        let exp_name = self.config.exp_name(num_classes);
        let checkpoint_path = self.config.checkpoint_path(num_classes);
        let mut checkpoint = CheckpointStore::load(checkpoint_path.clone())?;

        info!(
            experiment = %exp_name,
            test_size = test_set.len(),
            demo_size = demos.len(),
            resumed_entries = checkpoint.len(),
            "starting run"
        );

        // Experiment-level constant shuffle: decorrelates batch composition
        // from dataset ordering while keeping batch identities stable across
        // resumed runs with the same seed.
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut test_ids = test_set.ids();
        test_ids.shuffle(&mut rng);

        let mut outcomes = Vec::new();
        let mut calls_made = 0usize;

        for chunk in test_ids.chunks(self.config.batch_size) {
            let key = batch_key(chunk);
            let questions = chunk.len();

            // Presentation-order reshuffle only; the demo set itself is
            // never re-sampled.
            demos.shuffle(&mut rng);
            let assembled = prompt::assemble(&demos, chunk, class_desp, images);
            let max_tokens = (MAX_TOKENS_PER_QUESTION * questions) as u32;

            let mut calls_this_batch = 0usize;
            for _ in 0..self.config.retry.max_attempts {
                if checkpoint.is_complete(&key, questions) {
                    break;
                }
                if self.cancel.is_cancelled() {
                    return self.flush_cancelled(&mut checkpoint);
                }

                let call_result = tokio::select! {
                    res = self.client.call(&assembled.text, &assembled.image_refs, max_tokens) => res,
                    _ = self.cancel.cancelled() => {
                        // No partial result for the in-flight batch.
                        return self.flush_cancelled(&mut checkpoint);
                    }
                };
                calls_this_batch += 1;
                calls_made += 1;

                match call_result {
                    Ok(response) => {
                        debug!(batch = %key, "model response:\n{response}");
                        checkpoint.put(&key, response);
                    }
                    Err(CallError::Cancelled) => {
                        return self.flush_cancelled(&mut checkpoint);
                    }
                    Err(CallError::Transient(trace)) => {
                        let marked = format!("{ERROR_SENTINEL} {trace}");
                        warn!(batch = %key, "{marked}");
                        checkpoint.put(&key, marked);
                    }
                }
            }

            checkpoint.save()?;

            let outcome = if calls_this_batch == 0 {
                BatchOutcome::Skipped
            } else if checkpoint.is_complete(&key, questions) {
                BatchOutcome::Succeeded
            } else {
                BatchOutcome::Failed
            };
            match outcome {
                BatchOutcome::Failed => {
                    warn!(batch = %key, attempts = calls_this_batch, "batch failed; will retry on next invocation")
                }
                _ => info!(batch = %key, ?outcome, "batch done"),
            }
            outcomes.push(outcome);
        }

        // The client is fresh per run, so its counters are this run's delta.
        checkpoint.merge_usage(self.client.token_usage());
        checkpoint.save()?;

        let results_table_path = self.config.results_table_path();
        ensure_results_table(&results_table_path)?;

        Ok(RunReport {
            exp_name,
            outcomes,
            calls_made,
            usage: checkpoint.usage(),
            checkpoint_path,
            results_table_path,
        })
    }

    fn flush_cancelled(&self, checkpoint: &mut CheckpointStore) -> Result<RunReport> {
        checkpoint.merge_usage(self.client.token_usage());
        checkpoint.save()?;
        info!("cancelled; token usage and checkpoint flushed");
        Err(HarnessError::Cancelled)
    }
}

/// Create the results table with its fixed header and zero rows if absent.
/// Metric rows are appended by the external analysis step.
fn ensure_results_table(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(RESULTS_HEADER)?;
    writer.flush()?;
    Ok(())
}
