//! Execution records for selective commit into the final answer.
//!
//! Every dispatched code directive leaves a record. A record becomes
//! user-visible only when a final answer names it in `commit`; once
//! committed it stays committed. Uncommitted records are kept for audit
//! until the background sweep removes them.

use chrono::{DateTime, Utc};
use codeloop_core::Language;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One dispatched code directive and what it printed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub completion_id: String,
    pub code: String,
    pub language: Language,
    pub captured_output: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub committed: bool,
}

impl ExecutionRecord {
    pub fn new(
        id: impl Into<String>,
        completion_id: impl Into<String>,
        code: impl Into<String>,
        language: Language,
    ) -> Self {
        Self {
            id: id.into(),
            completion_id: completion_id.into(),
            code: code.into(),
            language,
            captured_output: String::new(),
            success: true,
            timestamp: Utc::now(),
            committed: false,
        }
    }

    /// Set the captured output and outcome.
    pub fn with_output(mut self, output: impl Into<String>, success: bool) -> Self {
        self.captured_output = output.into();
        self.success = success;
        self
    }

    /// Markdown block shown under a final answer.
    pub fn render(&self) -> String {
        let mut out = format!(
            "**Execution `{}`**\n```{}\n{}\n```",
            self.id,
            self.language.as_str(),
            self.code.trim_end()
        );
        let output = self.captured_output.trim_end();
        if !output.is_empty() {
            out.push_str("\nOutput:\n```\n");
            out.push_str(output);
            out.push_str("\n```");
        }
        out
    }
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<ExecutionRecord>,
    /// Auto ids handed out since the last clear; never decreases on sweep
    issued: u64,
}

/// Shared, insertion-ordered store of execution records.
///
/// Cloning yields another handle onto the same records.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    state: Arc<Mutex<LogState>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A fresh `exec-{n}` id, unique until the next `clear()`.
    ///
    /// The counter survives sweeps, so an id is never reissued while a
    /// committed record may still hold it.
    pub fn next_id(&self) -> String {
        let mut state = self.lock();
        loop {
            state.issued += 1;
            let id = format!("exec-{}", state.issued);
            if !state.records.iter().any(|r| r.id == id) {
                return id;
            }
        }
    }

    /// Add a record. A record with the same id is replaced; a committed
    /// record keeps its committed flag.
    pub fn add(&self, mut record: ExecutionRecord) {
        let mut state = self.lock();
        let records = &mut state.records;
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            record.committed |= existing.committed;
            *existing = record;
        } else {
            records.push(record);
        }
    }

    pub fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.lock().records.iter().find(|r| r.id == id).cloned()
    }

    /// Mark records committed. Unknown ids are ignored.
    ///
    /// Returns the matching records in the order the ids were given.
    pub fn commit(&self, ids: &[String]) -> Vec<ExecutionRecord> {
        let mut state = self.lock();
        let records = &mut state.records;
        let mut committed = Vec::new();
        for id in ids {
            if let Some(record) = records.iter_mut().find(|r| &r.id == id) {
                record.committed = true;
                if !committed.iter().any(|c: &ExecutionRecord| &c.id == id) {
                    committed.push(record.clone());
                }
            }
        }
        committed
    }

    pub fn committed_only(&self) -> Vec<ExecutionRecord> {
        self.lock().records.iter().filter(|r| r.committed).cloned().collect()
    }

    pub fn all(&self) -> Vec<ExecutionRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.issued = 0;
    }

    /// Remove uncommitted records older than `max_age`.
    pub fn sweep(&self, max_age: Duration) -> usize {
        match chrono::Duration::from_std(max_age) {
            Ok(age) => self.sweep_before(Utc::now() - age),
            Err(_) => 0,
        }
    }

    /// Remove uncommitted records stamped before `cutoff`.
    pub fn sweep_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let records = &mut state.records;
        let before = records.len();
        records.retain(|r| r.committed || r.timestamp >= cutoff);
        before - records.len()
    }
}
