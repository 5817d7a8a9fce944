//! In-memory view of what the cache holds, persisted as JSON.
//!
//! Entries are keyed by sha256. `uris` remembers which content a reference
//! last resolved to so a repeat resolve without an expected checksum can
//! still hit. Recency is a logical clock, not wall time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub size_bytes: u64,
    pub last_resolved: DateTime<Utc>,
    tick: u64,
    pins: usize,
}

#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
    uris: HashMap<String, String>,
    reserved: u64,
    clock: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    version: u32,
    entries: BTreeMap<String, PersistedEntry>,
    uris: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    size_bytes: u64,
    last_resolved: DateTime<Utc>,
}

impl CacheIndex {
    pub fn get(&self, sha256: &str) -> Option<&IndexEntry> { self.entries.get(sha256) }

    pub fn sha_for_uri(&self, uri: &str) -> Option<&str> { self.uris.get(uri).map(String::as_str) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn used_bytes(&self) -> u64 { self.entries.values().map(|e| e.size_bytes).sum() }

    pub fn reserved_bytes(&self) -> u64 { self.reserved }

    pub fn pinned_count(&self) -> usize { self.entries.values().filter(|e| e.pins > 0).count() }

    pub fn is_pinned(&self, sha256: &str) -> bool { self.entries.get(sha256).map(|e| e.pins > 0).unwrap_or(false) }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Mark as most recently resolved and take a pin. Returns false when the
    /// entry is gone.
    pub fn touch_and_pin(&mut self, sha256: &str, uri: &str) -> bool {
        let tick = self.next_tick();
        let Some(entry) = self.entries.get_mut(sha256) else { return false };
        entry.tick = tick;
        entry.last_resolved = Utc::now();
        entry.pins += 1;
        self.uris.insert(uri.to_string(), sha256.to_string());
        true
    }

    pub fn unpin(&mut self, sha256: &str) {
        if let Some(entry) = self.entries.get_mut(sha256) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    pub fn set_size(&mut self, sha256: &str, size_bytes: u64) {
        if let Some(entry) = self.entries.get_mut(sha256) { entry.size_bytes = size_bytes; }
    }

    /// Drop an entry and every reference pointing at it.
    pub fn remove(&mut self, sha256: &str) -> Option<IndexEntry> {
        self.uris.retain(|_, s| s != sha256);
        self.entries.remove(sha256)
    }

    /// Free enough room for `incoming` bytes under `budget`, least recently
    /// resolved first, skipping pinned entries. On success the bytes are
    /// reserved and the evicted sha256s are returned; the caller deletes their
    /// files and later calls [`CacheIndex::release`].
    pub fn reserve(&mut self, incoming: u64, budget: u64) -> Result<Vec<String>> {
        if incoming > budget {
            return Err(EngineError::CacheStorageError {
                reason: format!("artifact of {incoming} bytes exceeds cache budget of {budget} bytes"),
            });
        }
        let mut candidates: Vec<(u64, String, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .map(|(sha, e)| (e.tick, sha.clone(), e.size_bytes))
            .collect();
        candidates.sort();

        let mut needed = (self.used_bytes() + self.reserved + incoming).saturating_sub(budget);
        let mut victims = Vec::new();
        for (_, sha, size) in candidates {
            if needed == 0 { break; }
            needed = needed.saturating_sub(size);
            victims.push(sha);
        }
        if needed > 0 {
            return Err(EngineError::CacheStorageError {
                reason: format!("cannot free {needed} bytes: remaining entries are pinned or reserved"),
            });
        }
        for sha in &victims { self.remove(sha); }
        self.reserved += incoming;
        Ok(victims)
    }

    pub fn release(&mut self, bytes: u64) { self.reserved = self.reserved.saturating_sub(bytes); }

    /// Record a freshly installed object. Re-inserting known content keeps
    /// its pins.
    pub fn insert(&mut self, uri: &str, sha256: &str, size_bytes: u64) {
        let tick = self.next_tick();
        let entry = self.entries.entry(sha256.to_string()).or_insert_with(|| IndexEntry {
            size_bytes,
            last_resolved: Utc::now(),
            tick,
            pins: 0,
        });
        entry.size_bytes = size_bytes;
        entry.tick = tick;
        entry.last_resolved = Utc::now();
        self.uris.insert(uri.to_string(), sha256.to_string());
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let persisted = Persisted {
            version: 1,
            entries: self
                .entries
                .iter()
                .map(|(sha, e)| (sha.clone(), PersistedEntry { size_bytes: e.size_bytes, last_resolved: e.last_resolved }))
                .collect(),
            uris: self.uris.iter().map(|(u, s)| (u.clone(), s.clone())).collect(),
        };
        serde_json::to_vec_pretty(&persisted).map_err(|e| EngineError::storage("encode cache index", e))
    }

    /// Rebuild from disk. Entries whose object file is missing or has the
    /// wrong length are dropped; recency order follows `last_resolved`.
    pub fn load(path: &Path, object_path: impl Fn(&str) -> std::path::PathBuf) -> Result<Self> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(EngineError::storage("read cache index", e)),
        };
        let persisted: Persisted = match serde_json::from_slice(&raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache index unreadable, starting empty");
                return Ok(Self::default());
            }
        };

        let mut ordered: Vec<(String, PersistedEntry)> = persisted.entries.into_iter().collect();
        ordered.sort_by_key(|(_, e)| e.last_resolved);
        let mut index = Self::default();
        for (sha, e) in ordered {
            match std::fs::metadata(object_path(&sha)) {
                Ok(meta) if meta.len() == e.size_bytes => {
                    let tick = index.next_tick();
                    index.entries.insert(sha, IndexEntry { size_bytes: e.size_bytes, last_resolved: e.last_resolved, tick, pins: 0 });
                }
                _ => tracing::warn!(sha256 = %sha, "dropping stale cache index entry"),
            }
        }
        index.uris = persisted.uris.into_iter().filter(|(_, sha)| index.entries.contains_key(sha)).collect();
        Ok(index)
    }
}
