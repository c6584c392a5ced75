//! Configuration: a thin `Envconfig`-sourced struct for operational
//! settings, expanded into richly-typed components via `to_components`
//! (mirrors `cyclotron-fetch/src/config.rs`'s `Config` -> `(AppConfig,
//! PoolConfig)` split, since `envconfig` can't express defaults that need
//! a function call or a second document to resolve).
//!
//! The bulk of the pipeline's settings live in one JSON document (worker
//! count, runtime path, plugin roots, TTLs, message sizes, TLS material)
//! rather than in environment variables; the few env vars (`NUM_WORKERS`,
//! `MAX_INBOUND_MESSAGE_SIZE`, `MAX_OUTBOUND_MESSAGE_SIZE`) override the
//! document when present.

use std::collections::HashMap;
use std::time::Duration;

use envconfig::Envconfig;
use serde::Deserialize;

use crate::registry::DeletePolicy;
use crate::worker::WorkerConfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub bind_host: String,

    #[envconfig(from = "BIND_PORT", default = "3305")]
    pub bind_port: u16,

    #[envconfig(from = "PIPELINE_CONFIG_PATH", default = "./pipeline_config.json")]
    pub pipeline_config_path: String,

    pub num_workers: Option<usize>, // NUM_WORKERS; defaults to the pipeline document's pipeWorkerCount
    pub max_inbound_message_size: Option<usize>, // MAX_INBOUND_MESSAGE_SIZE
    pub max_outbound_message_size: Option<usize>, // MAX_OUTBOUND_MESSAGE_SIZE
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineDocument {
    #[serde(default = "default_worker_count")]
    pipe_worker_count: usize,
    runtime_path: String,
    #[serde(default)]
    runtime_args: Vec<String>,
    #[serde(default)]
    plugin_roots: Vec<String>,
    #[serde(default = "default_fetcher_idle_ttl_ms")]
    fetcher_idle_ttl_ms: u64,
    #[serde(default = "default_fetcher_sweep_interval_ms")]
    fetcher_sweep_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default = "default_in_flight_multiplier")]
    in_flight_multiplier: usize,
    #[serde(default = "default_max_message_bytes")]
    max_inbound_message_bytes: usize,
    #[serde(default = "default_max_message_bytes")]
    max_outbound_message_bytes: usize,
    /// Whether `DeleteFetcher` actually removes entries; some deployments
    /// run with delete disabled so fetcher definitions are append-only.
    #[serde(default = "default_delete_enabled")]
    delete_enabled: bool,
    #[serde(default)]
    tls: Option<TlsDocument>,
}

fn default_worker_count() -> usize {
    4
}
fn default_fetcher_idle_ttl_ms() -> u64 {
    2000
}
fn default_fetcher_sweep_interval_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_in_flight_multiplier() -> usize {
    1
}
fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_delete_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TlsDocument {
    server_cert_chain_path: String,
    server_private_key_path: String,
    #[serde(default)]
    trust_cert_collection_path: Option<String>,
    #[serde(default)]
    client_auth_required: bool,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub server_cert_chain_path: String,
    pub server_private_key_path: String,
    pub trust_cert_collection_path: Option<String>,
    pub client_auth_required: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub runtime_path: String,
    pub runtime_args: Vec<String>,
    pub plugin_roots: Vec<String>,
    pub fetcher_idle_ttl: Duration,
    pub fetcher_sweep_interval: Duration,
    pub request_timeout_ceiling: Duration,
    pub in_flight_multiplier: usize,
    pub max_inbound_message_bytes: usize,
    pub max_outbound_message_bytes: usize,
    pub delete_policy: DeletePolicy,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSizing {
    pub num_workers: usize,
    pub worker_config: WorkerConfig,
}

impl Config {
    /// Loads and `${VAR}`-substitutes the pipeline document, layers the
    /// few operational env var overrides on top, and splits into the
    /// pieces the rest of the service actually wants.
    pub fn to_components(self) -> anyhow::Result<(AppConfig, PoolSizing)> {
        let raw = std::fs::read_to_string(&self.pipeline_config_path).map_err(|e| {
            anyhow::anyhow!(
                "failed to read pipeline config at {}: {e}",
                self.pipeline_config_path
            )
        })?;
        let substituted = substitute_env_vars(&raw);
        let doc: PipelineDocument = serde_json::from_str(&substituted)
            .map_err(|e| anyhow::anyhow!("failed to parse pipeline config: {e}"))?;

        let num_workers = self.num_workers.unwrap_or(doc.pipe_worker_count);
        let max_inbound_message_bytes = self
            .max_inbound_message_size
            .unwrap_or(doc.max_inbound_message_bytes);
        let max_outbound_message_bytes = self
            .max_outbound_message_size
            .unwrap_or(doc.max_outbound_message_bytes);

        let app_config = AppConfig {
            bind_host: self.bind_host,
            bind_port: self.bind_port,
            runtime_path: doc.runtime_path,
            runtime_args: doc.runtime_args,
            plugin_roots: doc.plugin_roots,
            fetcher_idle_ttl: Duration::from_millis(doc.fetcher_idle_ttl_ms),
            fetcher_sweep_interval: Duration::from_millis(doc.fetcher_sweep_interval_ms),
            request_timeout_ceiling: Duration::from_millis(doc.request_timeout_ms),
            in_flight_multiplier: doc.in_flight_multiplier,
            max_inbound_message_bytes,
            max_outbound_message_bytes,
            delete_policy: if doc.delete_enabled {
                DeletePolicy::Enabled
            } else {
                DeletePolicy::Disabled
            },
            tls: doc.tls.map(|t| TlsConfig {
                server_cert_chain_path: t.server_cert_chain_path,
                server_private_key_path: t.server_private_key_path,
                trust_cert_collection_path: t.trust_cert_collection_path,
                client_auth_required: t.client_auth_required,
            }),
        };

        let pool_sizing = PoolSizing {
            num_workers,
            worker_config: WorkerConfig::default(),
        };

        Ok((app_config, pool_sizing))
    }
}

/// Replaces `${NAME}` with the value of environment variable `NAME`,
/// leaving the placeholder untouched if the variable isn't set.
fn substitute_env_vars(input: &str) -> String {
    let mut cache: HashMap<&str, Option<String>> = HashMap::new();
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                let value = cache
                    .entry(name)
                    .or_insert_with(|| std::env::var(name).ok())
                    .clone();
                match value {
                    Some(v) => out.push_str(&v),
                    None => out.push_str(&input[i..i + 3 + end]),
                }
                i += 3 + end;
                continue;
            }
        }
        let ch_len = input[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }
    out
}
