//! Per-completion side channel for out-of-band signals.
//!
//! Executed code (or the host driving the kernel) can leave a "thoughts"
//! note or a final answer keyed by the completion id that dispatched it.
//! The loop reads and clears the entry right after the execution returns.

use chrono::{DateTime, Utc};
use codeloop_core::FinalizeRecord;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct SideChannelEntry {
    pub thoughts: Option<String>,
    pub final_answer: Option<FinalizeRecord>,
    /// Time of the most recent write
    pub updated_at: DateTime<Utc>,
}

impl Default for SideChannelEntry {
    fn default() -> Self {
        Self {
            thoughts: None,
            final_answer: None,
            updated_at: Utc::now(),
        }
    }
}

/// Shared side-channel table. Cloning yields another handle onto the same table.
#[derive(Debug, Clone, Default)]
pub struct SideChannelStore {
    entries: Arc<Mutex<HashMap<String, SideChannelEntry>>>,
}

impl SideChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SideChannelEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, completion_id: &str) -> Option<SideChannelEntry> {
        self.lock().get(completion_id).cloned()
    }

    /// Replace the whole entry for a completion.
    pub fn set(&self, completion_id: impl Into<String>, entry: SideChannelEntry) {
        self.lock().insert(completion_id.into(), entry);
    }

    pub fn set_thoughts(&self, completion_id: impl Into<String>, thoughts: impl Into<String>) {
        let mut entries = self.lock();
        let entry = entries.entry(completion_id.into()).or_default();
        entry.thoughts = Some(thoughts.into());
        entry.updated_at = Utc::now();
    }

    pub fn set_final_answer(&self, completion_id: impl Into<String>, record: FinalizeRecord) {
        let mut entries = self.lock();
        let entry = entries.entry(completion_id.into()).or_default();
        entry.final_answer = Some(record);
        entry.updated_at = Utc::now();
    }

    /// Remove and return the entry for a completion.
    pub fn take(&self, completion_id: &str) -> Option<SideChannelEntry> {
        self.lock().remove(completion_id)
    }

    pub fn clear(&self, completion_id: &str) {
        self.lock().remove(completion_id);
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove entries whose latest write is older than `max_age`.
    pub fn sweep(&self, max_age: Duration) -> usize {
        match chrono::Duration::from_std(max_age) {
            Ok(age) => self.sweep_before(Utc::now() - age),
            Err(_) => 0,
        }
    }

    /// Remove entries last written before `cutoff`.
    pub fn sweep_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.updated_at >= cutoff);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_create_entries() {
        let store = SideChannelStore::new();
        assert!(store.get("c1").is_none());

        store.set_thoughts("c1", "trying a regression");
        store.set_final_answer(
            "c1",
            FinalizeRecord {
                content: "slope is 2".into(),
                commit_ids: vec!["fit".into()],
            },
        );

        let entry = store.get("c1").unwrap();
        assert_eq!(entry.thoughts.as_deref(), Some("trying a regression"));
        assert_eq!(entry.final_answer.unwrap().commit_ids, vec!["fit"]);
    }

    #[test]
    fn take_consumes_entry() {
        let store = SideChannelStore::new();
        store.set_thoughts("c1", "x");
        assert!(store.take("c1").is_some());
        assert!(store.take("c1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn entries_are_keyed_by_completion() {
        let store = SideChannelStore::new();
        store.set_thoughts("a", "one");
        store.set_thoughts("b", "two");
        store.clear("a");
        assert!(store.get("a").is_none());
        assert_eq!(store.get("b").unwrap().thoughts.as_deref(), Some("two"));
    }

    #[test]
    fn sweep_removes_stale_entries() {
        let store = SideChannelStore::new();
        store.set("old", SideChannelEntry {
            updated_at: Utc::now() - chrono::Duration::hours(2),
            ..SideChannelEntry::default()
        });
        store.set_thoughts("new", "fresh");

        assert_eq!(store.sweep(Duration::from_secs(3600)), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
    }

    #[test]
    fn clones_share_state() {
        let store = SideChannelStore::new();
        let kernel_handle = store.clone();
        kernel_handle.set_thoughts("c9", "from the kernel");
        assert!(store.get("c9").is_some());
    }
}
