//! Per-upstream request statistics with opportunistic JSON persistence.
//!
//! Counters are keyed by upstream name and only ever grow; an upstream that
//! is renamed or removed keeps its old entry so telemetry is append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Persisted schema version.
const STATS_VERSION: u32 = 1;

/// Counters for one upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStat {
    pub requests: u64,
    pub errors: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Read-only view over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub endpoints: BTreeMap<String, EndpointStat>,
}

/// On-disk document: the snapshot plus a version tag and save time.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsFile {
    version: u32,
    total_requests: u64,
    endpoints: BTreeMap<String, EndpointStat>,
    saved_at: DateTime<Utc>,
}

/// Process-wide statistics store. One mutex per upstream; the outer map
/// only takes a write lock the first time a name is seen.
pub struct StatsStore {
    endpoints: RwLock<HashMap<String, Arc<Mutex<EndpointStat>>>>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, name: &str) -> Arc<Mutex<EndpointStat>> {
        if let Some(stat) = self.endpoints.read().unwrap().get(name) {
            return stat.clone();
        }
        self.endpoints
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Count an attempt against an upstream. Always called before any
    /// `record_tokens` / `record_error` for the same logical request.
    pub fn record_attempt(&self, name: &str) {
        let entry = self.entry(name);
        let mut stat = entry.lock().unwrap();
        stat.requests += 1;
        stat.last_used = Some(Utc::now());
    }

    /// Add token usage from a committed (2xx) attempt.
    pub fn record_tokens(&self, name: &str, input: u64, output: u64) {
        let entry = self.entry(name);
        let mut stat = entry.lock().unwrap();
        stat.input_tokens += input;
        stat.output_tokens += output;
        stat.total = stat.input_tokens + stat.output_tokens;
    }

    pub fn record_error(&self, name: &str) {
        let entry = self.entry(name);
        entry.lock().unwrap().errors += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let endpoints: BTreeMap<String, EndpointStat> = self
            .endpoints
            .read()
            .unwrap()
            .iter()
            .map(|(name, stat)| (name.clone(), stat.lock().unwrap().clone()))
            .collect();
        let total_requests = endpoints.values().map(|s| s.requests).sum();
        StatsSnapshot {
            total_requests,
            endpoints,
        }
    }

    /// Serialize the current snapshot to `path`.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = self.snapshot();
        let file = StatsFile {
            version: STATS_VERSION,
            total_requests: snapshot.total_requests,
            endpoints: snapshot.endpoints,
            saved_at: Utc::now(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "statistics saved");
        Ok(())
    }

    /// Rehydrate from `path`. A missing or malformed file yields an empty
    /// store with a warning; it is never fatal.
    pub fn load(path: &Path) -> Self {
        let store = Self::new();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return store,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read statistics, starting empty");
                return store;
            }
        };

        match serde_json::from_str::<StatsFile>(&data) {
            Ok(file) => {
                let mut endpoints = store.endpoints.write().unwrap();
                for (name, stat) in file.endpoints {
                    endpoints.insert(name, Arc::new(Mutex::new(stat)));
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed statistics file, starting empty");
            }
        }
        store
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}
