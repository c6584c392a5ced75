//! The fetcher registry: `fetcherId -> FetcherConfig`, idle-TTL eviction,
//! thread-safe mutation under concurrent gRPC access.
//!
//! Lookup and List take the reader-writer lock's read side; Save, Delete,
//! and the background sweeper take the write side. Per-entry
//! `last_accessed_ms` is an atomic so a `Get` can refresh it while only
//! holding the read lock, closing a race where the sweeper would
//! otherwise observe a stale timestamp for an entry a concurrent `Get`
//! just touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::health::HealthHandle;
use crate::plugins::is_known_plugin_family;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    pub fetcher_id: String,
    pub plugin_id: String,
    pub config_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherInfo {
    pub fetcher_id: String,
    pub fetcher_class: String,
    pub params: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("fetcherId must not be empty")]
    EmptyFetcherId,
    #[error("unknown plugin family: {0}")]
    UnknownPluginFamily(String),
}

/// Whether `Delete` actually removes entries, or is a configured no-op;
/// some deployments treat delete as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    Enabled,
    Disabled,
}

struct Entry {
    config: FetcherConfig,
    #[allow(dead_code)] // kept for parity with the data model; not read today
    created_at_ms: u64,
    last_accessed_ms: AtomicU64,
}

pub struct RegistryConfig {
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub delete_policy: DeletePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_millis(2000),
            sweep_interval: Duration::from_millis(1000),
            delete_policy: DeletePolicy::Enabled,
        }
    }
}

#[derive(Clone)]
pub struct FetcherRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    epoch: Instant,
    idle_ttl: Duration,
    delete_policy: DeletePolicy,
}

impl FetcherRegistry {
    /// Spawns the background sweeper and returns the registry handle. The
    /// sweeper task runs for the lifetime of the returned handle's clones;
    /// there is no explicit stop, matching a process-lifetime component.
    pub fn spawn(config: RegistryConfig, health: Option<HealthHandle>) -> Self {
        let registry = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            epoch: Instant::now(),
            idle_ttl: config.idle_ttl,
            delete_policy: config.delete_policy,
        };

        let entries = registry.entries.clone();
        let idle_ttl = config.idle_ttl;
        let sweep_interval = config.sweep_interval;
        let epoch = registry.epoch;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                sweep_once(&entries, epoch, idle_ttl);
                if let Some(h) = &health {
                    h.report_healthy().await;
                }
            }
        });

        registry
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Save(fetcherId, pluginId, configJson) — insert or atomically replace.
    pub fn save(
        &self,
        fetcher_id: &str,
        plugin_id: &str,
        config_json: &str,
    ) -> Result<(), RegistryError> {
        if fetcher_id.is_empty() {
            return Err(RegistryError::EmptyFetcherId);
        }
        if !is_known_plugin_family(plugin_id) {
            return Err(RegistryError::UnknownPluginFamily(plugin_id.to_string()));
        }

        let now = self.now_ms();
        let entry = Entry {
            config: FetcherConfig {
                fetcher_id: fetcher_id.to_string(),
                plugin_id: plugin_id.to_string(),
                config_json: config_json.to_string(),
            },
            created_at_ms: now,
            last_accessed_ms: AtomicU64::new(now),
        };

        let mut map = self.entries.write().expect("poisoned registry lock");
        map.insert(fetcher_id.to_string(), entry);
        metrics::gauge!("tika_pipes_registry_entries").set(map.len() as f64);
        Ok(())
    }

    /// Get(fetcherId) — returns `None` if absent or expired, refreshing
    /// `lastAccessedAt` on a hit before releasing the read lock.
    pub fn get(&self, fetcher_id: &str) -> Option<FetcherInfo> {
        let now = self.now_ms();
        let map = self.entries.read().expect("poisoned registry lock");
        let entry = map.get(fetcher_id)?;

        if now.saturating_sub(entry.last_accessed_ms.load(Ordering::Relaxed))
            > self.idle_ttl.as_millis() as u64
        {
            return None;
        }
        entry.last_accessed_ms.store(now, Ordering::Relaxed);
        Some(to_info(&entry.config))
    }

    /// Internal lookup for the dispatcher: the raw config a worker needs
    /// to hand to the parse subprocess, as opposed to [`Self::get`]'s
    /// gRPC-facing `FetcherInfo` projection. Also refreshes TTL.
    pub fn get_config(&self, fetcher_id: &str) -> Option<FetcherConfig> {
        let now = self.now_ms();
        let map = self.entries.read().expect("poisoned registry lock");
        let entry = map.get(fetcher_id)?;

        if now.saturating_sub(entry.last_accessed_ms.load(Ordering::Relaxed))
            > self.idle_ttl.as_millis() as u64
        {
            return None;
        }
        entry.last_accessed_ms.store(now, Ordering::Relaxed);
        Some(entry.config.clone())
    }

    /// Delete(fetcherId) — honors the configured delete policy.
    pub fn delete(&self, fetcher_id: &str) -> bool {
        if self.delete_policy == DeletePolicy::Disabled {
            return false;
        }
        let mut map = self.entries.write().expect("poisoned registry lock");
        let removed = map.remove(fetcher_id).is_some();
        metrics::gauge!("tika_pipes_registry_entries").set(map.len() as f64);
        removed
    }

    /// List() — snapshot of all non-expired entries.
    pub fn list(&self) -> Vec<FetcherInfo> {
        let now = self.now_ms();
        let map = self.entries.read().expect("poisoned registry lock");
        map.values()
            .filter(|entry| {
                now.saturating_sub(entry.last_accessed_ms.load(Ordering::Relaxed))
                    <= self.idle_ttl.as_millis() as u64
            })
            .map(|entry| to_info(&entry.config))
            .collect()
    }
}

fn to_info(config: &FetcherConfig) -> FetcherInfo {
    FetcherInfo {
        fetcher_id: config.fetcher_id.clone(),
        fetcher_class: config.plugin_id.clone(),
        params: decode_params(&config.config_json),
    }
}

/// Decodes the top-level keys of `configJson` into a flat string map, for
/// introspection only (`Get`'s `paramsMap`).
fn decode_params(config_json: &str) -> HashMap<String, String> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(config_json) else {
        return HashMap::new();
    };
    map.into_iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect()
}

fn sweep_once(entries: &Arc<RwLock<HashMap<String, Entry>>>, epoch: Instant, idle_ttl: Duration) {
    let now = epoch.elapsed().as_millis() as u64;
    let idle_ttl_ms = idle_ttl.as_millis() as u64;
    let mut map = match entries.write() {
        Ok(map) => map,
        Err(_) => {
            warn!("poisoned registry lock during sweep, skipping this pass");
            return;
        }
    };
    let before = map.len();
    map.retain(|_, entry| {
        now.saturating_sub(entry.last_accessed_ms.load(Ordering::Relaxed)) <= idle_ttl_ms
    });
    let evicted = before - map.len();
    metrics::gauge!("tika_pipes_registry_entries").set(map.len() as f64);
    if evicted > 0 {
        metrics::counter!("tika_pipes_registry_evictions_total").increment(evicted as u64);
        info!(evicted, "swept expired fetcher registry entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(idle_ttl_ms: u64, sweep_ms: u64) -> FetcherRegistry {
        FetcherRegistry::spawn(
            RegistryConfig {
                idle_ttl: Duration::from_millis(idle_ttl_ms),
                sweep_interval: Duration::from_millis(sweep_ms),
                delete_policy: DeletePolicy::Enabled,
            },
            None,
        )
    }

    #[tokio::test]
    async fn save_then_get_roundtrips_class_and_params() {
        let reg = registry(60_000, 60_000);
        reg.save(
            "f1",
            "FileSystemFetcher",
            r#"{"extractFileSystemMetadata": true, "basePath": "/tmp"}"#,
        )
        .unwrap();

        let info = reg.get("f1").expect("must exist");
        assert_eq!(info.fetcher_class, "FileSystemFetcher");
        assert_eq!(info.params.get("basePath").unwrap(), "/tmp");
        assert_eq!(info.params.get("extractFileSystemMetadata").unwrap(), "true");
    }

    #[tokio::test]
    async fn save_twice_is_in_place_replacement() {
        let reg = registry(60_000, 60_000);
        reg.save("f1", "FileSystemFetcher", r#"{"opt": true}"#).unwrap();
        reg.save("f1", "FileSystemFetcher", r#"{"opt": false}"#).unwrap();

        let info = reg.get("f1").unwrap();
        assert_eq!(info.params.get("opt").unwrap(), "false");
    }

    #[tokio::test]
    async fn save_rejects_empty_fetcher_id() {
        let reg = registry(60_000, 60_000);
        let err = reg.save("", "FileSystemFetcher", "{}").unwrap_err();
        assert!(matches!(err, RegistryError::EmptyFetcherId));
    }

    #[tokio::test]
    async fn save_rejects_unknown_plugin_family() {
        let reg = registry(60_000, 60_000);
        let err = reg.save("f1", "NotAFetcher", "{}").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPluginFamily(_)));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let reg = registry(60_000, 60_000);
        assert!(reg.get("nope").is_none());
    }

    #[tokio::test]
    async fn delete_removes_present_entry() {
        let reg = registry(60_000, 60_000);
        reg.save("f1", "FileSystemFetcher", "{}").unwrap();
        assert!(reg.delete("f1"));
        assert!(reg.get("f1").is_none());
        assert!(!reg.delete("f1"));
    }

    #[tokio::test]
    async fn disabled_delete_policy_is_always_a_no_op() {
        let reg = FetcherRegistry::spawn(
            RegistryConfig {
                idle_ttl: Duration::from_millis(60_000),
                sweep_interval: Duration::from_millis(60_000),
                delete_policy: DeletePolicy::Disabled,
            },
            None,
        );
        reg.save("f1", "FileSystemFetcher", "{}").unwrap();
        assert!(!reg.delete("f1"));
        assert!(reg.get("f1").is_some());
    }

    #[tokio::test]
    async fn list_returns_snapshot_of_all_live_entries() {
        let reg = registry(60_000, 60_000);
        for i in 0..10 {
            reg.save(
                &format!("nick{i}:is:cool"),
                "FileSystemFetcher",
                "{}",
            )
            .unwrap();
        }
        assert_eq!(reg.list().len(), 10);
    }

    #[tokio::test]
    async fn idle_entry_is_evicted_after_ttl_plus_sweep() {
        let reg = registry(50, 20);
        reg.save("f1", "FileSystemFetcher", "{}").unwrap();
        assert!(reg.get("f1").is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(reg.get("f1").is_none());
    }

    #[tokio::test]
    async fn repeated_get_keeps_entry_alive_past_its_original_ttl() {
        let reg = registry(80, 20);
        reg.save("f1", "FileSystemFetcher", "{}").unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(reg.get("f1").is_some(), "repeated access must refresh TTL");
        }
    }
}
