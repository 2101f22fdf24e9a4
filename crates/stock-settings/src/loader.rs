//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::Result;
use crate::types::{StockSettings, MAX_STREAM_TIMEOUT_SECONDS};

/// Environment variable naming an explicit settings file.
pub const CONFIG_PATH_ENV: &str = "STOCKSTREAM_CONFIG";

/// Resolve the settings file: `$STOCKSTREAM_CONFIG`, else `./stockstream.json`.
pub fn settings_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("stockstream.json"))
}

/// An environment override that was set but could not be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnoredEnvVar {
    pub key: String,
    pub value: String,
    pub reason: String,
}

/// Loaded settings plus what the loader did on the way.
///
/// Loading happens before logging is configured, so nothing is logged
/// here; call [`LoadedSettings::log_report`] once a subscriber is installed.
#[derive(Clone, Debug)]
pub struct LoadedSettings {
    pub settings: StockSettings,
    /// The file that was merged, if it existed.
    pub source: Option<PathBuf>,
    pub ignored_env: Vec<IgnoredEnvVar>,
}

impl LoadedSettings {
    pub fn log_report(&self) {
        match &self.source {
            Some(path) => tracing::info!(path = %path.display(), "settings loaded from file"),
            None => tracing::info!("no settings file, using defaults"),
        }
        for ignored in &self.ignored_env {
            tracing::warn!(
                key = %ignored.key,
                value = %ignored.value,
                reason = %ignored.reason,
                "ignoring environment override"
            );
        }
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LoadedSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error. Validation is left to the caller.
pub fn load_settings_from_path(path: &Path) -> Result<LoadedSettings> {
    let (mut settings, source) = load_file_layer(path)?;
    let ignored_env = apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(LoadedSettings {
        settings,
        source,
        ignored_env,
    })
}

fn load_file_layer(path: &Path) -> Result<(StockSettings, Option<PathBuf>)> {
    let defaults = serde_json::to_value(StockSettings::default())?;

    if !path.exists() {
        return Ok((serde_json::from_value(defaults)?, None));
    }

    let content = std::fs::read_to_string(path)?;
    let user: Value = serde_json::from_str(&content)?;
    let merged = deep_merge(defaults, user);
    Ok((serde_json::from_value(merged)?, Some(path.to_path_buf())))
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

struct EnvReader<F> {
    lookup: F,
    ignored: Vec<IgnoredEnvVar>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn number(&mut self, key: &str, min: u64, max: u64) -> Option<u64> {
        let raw = self.string(key)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            self.ignore(key, raw, format!("expected an integer between {min} and {max}"));
        }
        parsed
    }

    fn flag(&mut self, key: &str) -> Option<bool> {
        let raw = self.string(key)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            self.ignore(key, raw, "expected a boolean".to_string());
        }
        parsed
    }

    fn ignore(&mut self, key: &str, value: String, reason: String) {
        self.ignored.push(IgnoredEnvVar {
            key: key.to_string(),
            value,
            reason,
        });
    }
}

/// Apply `STOCKSTREAM_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are skipped and returned; range
/// checks here are looser than [`StockSettings::validate`], which still
/// runs afterwards.
pub fn apply_env_overrides<F>(settings: &mut StockSettings, lookup: F) -> Vec<IgnoredEnvVar>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = EnvReader {
        lookup,
        ignored: Vec::new(),
    };

    // ── Database ────────────────────────────────────────────────────
    if let Some(v) = env.string("STOCKSTREAM_DATABASE_URL") {
        settings.database.url = v;
    }
    if let Some(v) = env.number("STOCKSTREAM_DATABASE_POOL_SIZE", 1, 1024) {
        settings.database.max_pool_size = v as usize;
    }

    // ── Listener ────────────────────────────────────────────────────
    if let Some(v) = env.string("STOCKSTREAM_CHANNEL") {
        settings.listener.channel_to_listen = v;
    }
    if let Some(v) = env.number("STOCKSTREAM_POLL_WAIT_MS", 1, 600_000) {
        settings.listener.poll_wait_ms = v;
    }

    // ── Stream ──────────────────────────────────────────────────────
    if let Some(v) = env.number("STOCKSTREAM_HEARTBEAT_SECONDS", 1, 3600) {
        settings.stream.heartbeat_interval_seconds = v;
    }
    if let Some(v) = env.number("STOCKSTREAM_SUBSCRIBER_CAPACITY", 1, 1_000_000) {
        settings.stream.subscriber_capacity = v as usize;
    }
    if let Some(v) = env.number("STOCKSTREAM_STREAM_TIMEOUT_SECONDS", 1, MAX_STREAM_TIMEOUT_SECONDS) {
        settings.stream.timeout_seconds = Some(v);
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("STOCKSTREAM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.number("STOCKSTREAM_PORT", 0, u16::MAX as u64) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("STOCKSTREAM_CORS_ORIGIN") {
        settings.server.cors_origin = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("STOCKSTREAM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.flag("STOCKSTREAM_LOG_JSON") {
        settings.logging.json = v;
    }

    env.ignored
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
