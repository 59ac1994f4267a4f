//! In-memory collaborators for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use pump_traits::{StatusSink, Store, StoreValue};

/// Volatile `Store`. Counts commits and can be told to fail them.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, StoreValue>,
    pub commits: usize,
    pub fail_commits: bool,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        self.values.get(key).copied()
    }

    fn put(&mut self, key: &str, value: StoreValue) {
        self.values.insert(key.to_owned(), value);
    }

    fn commit(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail_commits {
            return Err(Box::new(std::io::Error::other("memory store: commit refused")));
        }
        self.commits += 1;
        Ok(())
    }
}

/// Sink that keeps every line it is shown. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl StatusSink for RecordingSink {
    fn show(&mut self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line.to_owned());
    }
}
