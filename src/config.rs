//! # Configuration Management for GhostWire
//!
//! Central runtime configuration for the GhostWire service. Settings are loaded from a
//! YAML file and then layered with environment-variable overrides for the handful of
//! values that are typically deployment-specific (bind address, database path, upstream
//! URLs) — the file is the source of defaults, the environment is the source of truth
//! for a given deployment.
//!
//! ## Loading
//!
//! ```no_run
//! use ghostwire::config::load_config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("config.yaml")?;
//! println!("binding {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! A missing file is filled in entirely from defaults; a present-but-malformed file is a
//! fatal startup error rather than a silent fallback to defaults.

use serde::{Deserialize, Serialize};
use std::{env, fs};
use tracing::info;

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_db_path() -> String {
    "ghostwire.db".to_string()
}
fn default_dim() -> usize {
    768
}
fn default_max_elements() -> usize {
    100_000
}
fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_query() -> usize {
    50
}
fn default_local_gen_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_remote_gen_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "gemma3:1b".to_string()
}
fn default_remote_model() -> String {
    "gemma3:12b".to_string()
}
fn default_embed_models() -> Vec<String> {
    vec![
        "embeddinggemma".to_string(),
        "granite-embedding".to_string(),
        "nomic-embed-text".to_string(),
        "mxbai-embed-large".to_string(),
        "snowflake-arctic-embed".to_string(),
        "all-minilm".to_string(),
    ]
}
fn default_top_k() -> usize {
    5
}
fn default_max_context_items() -> usize {
    10
}
fn default_min_context_items() -> usize {
    1
}
fn default_max_context_tokens() -> usize {
    2048
}
fn default_context_strategy() -> ContextStrategy {
    ContextStrategy::Recency
}
fn default_context_truncation() -> ContextTruncation {
    ContextTruncation::Sentence
}
fn default_cache_ttl_exact_minutes() -> i64 {
    120
}
fn default_cache_ttl_approx_minutes() -> i64 {
    60
}
fn default_cache_sim_threshold() -> f32 {
    0.9
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> LogFormat {
    LogFormat::Plain
}
fn default_stream_chunk_size() -> usize {
    64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    Recency,
    Relevance,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextTruncation {
    Sentence,
    Word,
    Character,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
}

/// Complete runtime configuration for GhostWire, deserialized from `config.yaml` and
/// then overridden field-by-field from the environment (see [`load_config`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostWireConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_query")]
    pub ef_query: usize,

    #[serde(default = "default_local_gen_url")]
    pub local_gen_url: String,
    #[serde(default = "default_remote_gen_url")]
    pub remote_gen_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_remote_model")]
    pub remote_model: String,

    #[serde(default = "default_embed_models")]
    pub embed_models: Vec<String>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_items")]
    pub max_context_items: usize,
    #[serde(default = "default_min_context_items")]
    pub min_context_items: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_context_strategy")]
    pub context_strategy: ContextStrategy,
    #[serde(default = "default_context_truncation")]
    pub context_truncation: ContextTruncation,

    #[serde(default = "default_cache_ttl_exact_minutes")]
    pub cache_ttl_exact_minutes: i64,
    #[serde(default = "default_cache_ttl_approx_minutes")]
    pub cache_ttl_approx_minutes: i64,
    #[serde(default = "default_cache_sim_threshold")]
    pub cache_sim_threshold: f32,

    #[serde(default)]
    pub disable_summarization: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,
}

impl Default for GhostWireConfig {
    fn default() -> Self {
        GhostWireConfig {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dim: default_dim(),
            max_elements: default_max_elements(),
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_query: default_ef_query(),
            local_gen_url: default_local_gen_url(),
            remote_gen_url: default_remote_gen_url(),
            default_model: default_model(),
            remote_model: default_remote_model(),
            embed_models: default_embed_models(),
            top_k: default_top_k(),
            max_context_items: default_max_context_items(),
            min_context_items: default_min_context_items(),
            max_context_tokens: default_max_context_tokens(),
            context_strategy: default_context_strategy(),
            context_truncation: default_context_truncation(),
            cache_ttl_exact_minutes: default_cache_ttl_exact_minutes(),
            cache_ttl_approx_minutes: default_cache_ttl_approx_minutes(),
            cache_sim_threshold: default_cache_sim_threshold(),
            disable_summarization: false,
            log_level: default_log_level(),
            log_format: default_log_format(),
            stream_chunk_size: default_stream_chunk_size(),
        }
    }
}

/// Load configuration from `path`, falling back to defaults for a missing file and
/// then layering environment-variable overrides on top.
///
/// # Errors
/// Returns an error if the file exists but cannot be parsed as YAML.
pub fn load_config(path: &str) -> Result<GhostWireConfig, Box<dyn std::error::Error>> {
    let mut config = if let Ok(raw) = fs::read_to_string(path) {
        serde_yaml::from_str(&raw).map_err(|e| format!("invalid config at {}: {}", path, e))?
    } else {
        info!("no config file at {}, using defaults", path);
        GhostWireConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut GhostWireConfig) {
    if let Ok(v) = env::var("GHOSTWIRE_HOST") {
        config.host = v;
    }
    if let Ok(v) = env::var("GHOSTWIRE_PORT") {
        if let Ok(port) = v.parse() {
            config.port = port;
        }
    }
    if let Ok(v) = env::var("GHOSTWIRE_DB_PATH") {
        config.db_path = v;
    }
    if let Ok(v) = env::var("GHOSTWIRE_LOCAL_GEN_URL") {
        config.local_gen_url = v;
    }
    if let Ok(v) = env::var("GHOSTWIRE_REMOTE_GEN_URL") {
        config.remote_gen_url = v;
    }
    if let Ok(v) = env::var("GHOSTWIRE_LOG_LEVEL") {
        config.log_level = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_missing_file() {
        let config = load_config("/nonexistent/ghostwire-config.yaml").unwrap();
        assert_eq!(config.dim, 768);
        assert_eq!(config.cache_ttl_exact_minutes, 120);
        assert_eq!(config.cache_ttl_approx_minutes, 60);
        assert!(config.cache_ttl_exact_minutes > config.cache_ttl_approx_minutes);
    }

    #[test]
    fn partial_yaml_is_merged_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dim: 4\ntop_k: 2\n").unwrap();
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.dim, 4);
        assert_eq!(config.top_k, 2);
        // untouched fields still get defaults
        assert_eq!(config.max_context_tokens, 2048);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dim: [this is not valid for a usize field").unwrap();
        let result = load_config(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn env_override_takes_precedence_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: \"127.0.0.1\"\n").unwrap();
        unsafe {
            env::set_var("GHOSTWIRE_HOST", "0.0.0.0");
        }
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        unsafe {
            env::remove_var("GHOSTWIRE_HOST");
        }
    }
}
