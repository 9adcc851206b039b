use crate::model::{AlertSettings, HealthCheckResult, Outcome, ProxyEndpoint};
use crate::parser::ParsedLink;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Per-endpoint history is bounded; the oldest records are dropped once an
/// endpoint exceeds this many checks.
const MAX_HISTORY: usize = 1000;

/// In-process face of the persistence collaborator: endpoints, per-endpoint
/// check history and the alert-settings singleton. Concurrent access is
/// serialized per map shard / per lock, nothing here requires external
/// coordination.
pub struct Store {
    endpoints: DashMap<u64, ProxyEndpoint>,
    // Oldest first; readers that want newest-first iterate in reverse.
    checks: DashMap<u64, Vec<HealthCheckResult>>,
    settings: RwLock<Option<AlertSettings>>,
    next_endpoint_id: AtomicU64,
    next_check_id: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            checks: DashMap::new(),
            settings: RwLock::new(None),
            next_endpoint_id: AtomicU64::new(1),
            next_check_id: AtomicU64::new(1),
        }
    }

    // ---------------- endpoints ----------------

    pub fn insert(&self, parsed: ParsedLink) -> ProxyEndpoint {
        let id = self.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        let endpoint = parsed.into_endpoint(id);
        self.endpoints.insert(id, endpoint.clone());
        endpoint
    }

    /// Re-parse edit: every link-derived field is replaced, while id,
    /// creation time, enabled flag and group reference survive.
    pub fn update(&self, id: u64, parsed: ParsedLink) -> Option<ProxyEndpoint> {
        let mut entry = self.endpoints.get_mut(&id)?;
        let old = entry.value().clone();
        let mut endpoint = parsed.into_endpoint(id);
        endpoint.created_at = old.created_at;
        endpoint.enabled = old.enabled;
        endpoint.group_id = old.group_id;
        endpoint.updated_at = Utc::now();
        *entry.value_mut() = endpoint.clone();
        Some(endpoint)
    }

    /// Deletes the endpoint and cascades its check history.
    pub fn remove(&self, id: u64) -> bool {
        let existed = self.endpoints.remove(&id).is_some();
        self.checks.remove(&id);
        existed
    }

    pub fn get(&self, id: u64) -> Option<ProxyEndpoint> {
        self.endpoints.get(&id).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<ProxyEndpoint> {
        let mut list: Vec<ProxyEndpoint> =
            self.endpoints.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|e| e.id);
        list
    }

    pub fn enabled(&self) -> Vec<ProxyEndpoint> {
        let mut list: Vec<ProxyEndpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.value().enabled)
            .map(|e| e.value().clone())
            .collect();
        list.sort_by_key(|e| e.id);
        list
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) {
        if let Some(mut entry) = self.endpoints.get_mut(&id) {
            entry.value_mut().enabled = enabled;
            entry.value_mut().updated_at = Utc::now();
        }
    }

    // ---------------- check history ----------------

    pub fn record_up(&self, endpoint_id: u64, latency_ms: f64) -> HealthCheckResult {
        self.record(endpoint_id, Outcome::Up, Some(latency_ms), None)
    }

    pub fn record_down(&self, endpoint_id: u64, error: String) -> HealthCheckResult {
        self.record(endpoint_id, Outcome::Down, None, Some(error))
    }

    fn record(
        &self,
        endpoint_id: u64,
        outcome: Outcome,
        latency_ms: Option<f64>,
        error: Option<String>,
    ) -> HealthCheckResult {
        let result = HealthCheckResult {
            id: self.next_check_id.fetch_add(1, Ordering::Relaxed),
            endpoint_id,
            outcome,
            latency_ms,
            error,
            checked_at: Utc::now(),
        };
        let mut history = self.checks.entry(endpoint_id).or_default();
        history.push(result.clone());
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
        result
    }

    /// Up to `limit` most recent results, newest first.
    pub fn recent_checks(&self, endpoint_id: u64, limit: usize) -> Vec<HealthCheckResult> {
        self.checks
            .get(&endpoint_id)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_check(&self, endpoint_id: u64) -> Option<HealthCheckResult> {
        self.checks
            .get(&endpoint_id)
            .and_then(|h| h.last().cloned())
    }

    // ---------------- settings ----------------

    /// The settings singleton, created with defaults on first access.
    pub fn settings(&self) -> AlertSettings {
        {
            let guard = self.settings.read().expect("settings lock poisoned");
            if let Some(settings) = guard.as_ref() {
                return settings.clone();
            }
        }
        let mut guard = self.settings.write().expect("settings lock poisoned");
        guard.get_or_insert_with(AlertSettings::default).clone()
    }

    pub fn update_settings<F>(&self, mutate: F) -> AlertSettings
    where
        F: FnOnce(&mut AlertSettings),
    {
        let mut guard = self.settings.write().expect("settings lock poisoned");
        let settings = guard.get_or_insert_with(AlertSettings::default);
        mutate(settings);
        settings.clone()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
