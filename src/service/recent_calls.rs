use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecentCall {
    pub id: u64,
    pub ts: i64,
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: Option<i64>,
    pub model: String,
    pub status: u16,
    pub latency_ms: i64,
    pub attempts: u32,
    /// Channels in the order they were tried.
    pub channels: Vec<i64>,
    pub error_kind: Option<String>,
}

/// Fixed-capacity trace of the last relays. Lost on restart.
pub struct RecentCalls {
    capacity: usize,
    next_id: AtomicU64,
    entries: RwLock<VecDeque<RecentCall>>,
}

impl RecentCalls {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Stores `call` with a fresh id (the incoming id is ignored) and returns that id.
    pub fn push(&self, mut call: RecentCall) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        call.id = id;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        // Keep ids ascending even when writers race between fetch_add and the lock.
        let position = entries.iter().rposition(|e| e.id < id).map_or(0, |p| p + 1);
        entries.insert(position, call);
        id
    }

    pub fn get(&self, id: u64) -> Option<RecentCall> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().find(|e| e.id == id).cloned()
    }

    /// Newest first. `before_id` pages backwards.
    pub fn list(&self, limit: usize, before_id: Option<u64>) -> Vec<RecentCall> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .filter(|e| before_id.is_none_or(|b| e.id < b))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
