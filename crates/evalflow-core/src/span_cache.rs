//! Per-run cache of span records, keyed by trace root.
//!
//! Expiry is lazy: every read or write first drops roots that have not been
//! touched for longer than the TTL. There is no background sweeper.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use evalflow_types::SpanRecord;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

struct Entry {
    records: Vec<SpanRecord>,
    by_span: HashMap<String, usize>,
    last_accessed: Instant,
    /// Monotonic access stamp; orders roots for LRU eviction even when two
    /// accesses share an `Instant`.
    stamp: u64,
}

struct State {
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

pub struct SpanCache {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<State>,
}

impl Default for SpanCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl SpanCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: Mutex::new(State {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Merge `record` into the span `(root_span_id, span_id)`; present fields win, `None` never overwrites.
    pub fn write(&self, root_span_id: &str, span_id: &str, mut record: SpanRecord) {
        record.root_span_id = root_span_id.to_string();
        record.span_id = span_id.to_string();

        let now = Instant::now();
        let mut state = self.lock();
        self.sweep(&mut state, now);

        if !state.entries.contains_key(root_span_id) && state.entries.len() >= self.max_entries {
            evict_least_recent(&mut state);
        }

        let stamp = state.tick();
        let entry = state
            .entries
            .entry(root_span_id.to_string())
            .or_insert_with(|| Entry {
                records: Vec::new(),
                by_span: HashMap::new(),
                last_accessed: now,
                stamp,
            });
        entry.last_accessed = now;
        entry.stamp = stamp;

        match entry.by_span.get(span_id) {
            Some(&idx) => entry.records[idx].merge(record),
            None => {
                entry.by_span.insert(span_id.to_string(), entry.records.len());
                entry.records.push(record);
            }
        }
    }

    /// All records under `root_span_id`, in first-write order, or `None` if absent or expired.
    pub fn get(&self, root_span_id: &str) -> Option<Vec<SpanRecord>> {
        let now = Instant::now();
        let mut state = self.lock();
        self.sweep(&mut state, now);

        let stamp = state.tick();
        let entry = state.entries.get_mut(root_span_id)?;
        entry.last_accessed = now;
        entry.stamp = stamp;
        Some(entry.records.clone())
    }

    /// Whether a live entry exists. Does not refresh the entry.
    pub fn has(&self, root_span_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        self.sweep(&mut state, now);
        state.entries.contains_key(root_span_id)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        self.sweep(&mut state, now);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self, state: &mut State, now: Instant) {
        let ttl = self.ttl;
        state
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_accessed) <= ttl);
    }
}

fn evict_least_recent(state: &mut State) {
    let oldest = state
        .entries
        .iter()
        .min_by_key(|(_, entry)| entry.stamp)
        .map(|(root, _)| root.clone());
    if let Some(root) = oldest {
        tracing::debug!(root_span_id = %root, "span cache full, evicting least recently used root");
        state.entries.remove(&root);
    }
}
