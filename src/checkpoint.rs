//! Durable checkpoint store: batch results plus cumulative token usage.
//!
//! One JSON file per experiment identity. Saved after every batch and
//! unconditionally on interruption, so writes use atomic replace (sibling
//! temp file, fsync, rename) to never corrupt previously saved state.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Prefix marking a stored entry as a failed call's diagnostic trace.
pub const ERROR_SENTINEL: &str = "ERROR!!!!";

/// The literal delimiter a fully-formed response must contain for its last
/// question. Governs whether a stored entry is reusable on resume.
pub fn terminal_marker(question: usize) -> String {
    format!("END FORMAT TEMPLATE FOR QUESTION {question}")
}

/// Cumulative (prompt, completion, total) token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    results: BTreeMap<String, String>,
    #[serde(default)]
    token_usage: TokenUsage,
}

/// Durable mapping from batch identity to raw model response (or an
/// error-marked trace), plus the run-spanning token-usage counters.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    doc: CheckpointFile,
}

impl CheckpointStore {
    /// Load the prior mapping from `path`, or start empty if absent.
    pub fn load(path: PathBuf) -> Result<Self> {
        let doc = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckpointFile::default(),
            Err(e) => return Err(HarnessError::Persistence { path, source: e }),
        };
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.doc.results.get(id).map(String::as_str)
    }

    /// Upsert the raw result for a batch identity.
    pub fn put(&mut self, id: &str, value: String) {
        self.doc.results.insert(id.to_string(), value);
    }

    /// An entry is complete iff it exists, is not error-marked, and contains
    /// the terminal delimiter for the batch's last question.
    pub fn is_complete(&self, id: &str, total_questions: usize) -> bool {
        match self.doc.results.get(id) {
            Some(v) => {
                !v.starts_with(ERROR_SENTINEL) && v.contains(&terminal_marker(total_questions))
            }
            None => false,
        }
    }

    pub fn usage(&self) -> TokenUsage {
        self.doc.token_usage
    }

    /// Fold one run's usage delta into the cumulative counters.
    pub fn merge_usage(&mut self, delta: TokenUsage) {
        self.doc.token_usage.add(delta);
    }

    /// Stored (batch identity, raw value) pairs, in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.doc.results.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.doc.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.results.is_empty()
    }

    /// Persist the full mapping, overwriting the prior file atomically.
    pub fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.doc)?;
        self.write_atomic(&bytes)
            .map_err(|source| HarnessError::Persistence {
                path: self.path.clone(),
                source,
            })
    }

    fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let name = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("checkpoint");
        let tmp = self
            .path
            .with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
