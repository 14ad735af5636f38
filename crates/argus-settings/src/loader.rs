//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ArgusSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `ARGUS_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ArgusSettings;

/// Resolve the path to the settings file (`~/.argus/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".argus").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ArgusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error. The result is
/// not validated; call [`ArgusSettings::validate`] before serving.
pub fn load_settings_from_path(path: &Path) -> Result<ArgusSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<ArgusSettings> {
    let defaults = serde_json::to_value(ArgusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply `ARGUS_*` environment variable overrides.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut ArgusSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
pub fn apply_overrides<F>(settings: &mut ArgusSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("ARGUS_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("ARGUS_TCP_PORT", 0, 65535) {
        settings.server.tcp_port = v;
    }
    if let Some(v) = env.u16("ARGUS_HTTP_PORT", 0, 65535) {
        settings.server.http_port = v;
    }
    if let Some(v) = env.bool("ARGUS_ENABLE_HTTP") {
        settings.server.enable_http = v;
    }
    if let Some(v) = env.usize("ARGUS_MAX_CONNECTIONS", 1, 100_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.usize("ARGUS_MAX_FRAME_BYTES", 1024, 256 * 1024 * 1024) {
        settings.server.max_frame_bytes = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("ARGUS_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.session.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("ARGUS_MISSED_HEARTBEATS", 1, 100) {
        settings.session.missed_heartbeats = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.usize("ARGUS_QUEUE_DEPTH", 1, 1_000_000) {
        settings.session.outbound_queue_depth = v;
    }
    if let Some(v) = env.u64("ARGUS_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.session.handshake_timeout_ms = v;
    }
    if let Some(v) = env.u64("ARGUS_DRAIN_TIMEOUT_MS", 0, 600_000) {
        settings.session.drain_timeout_ms = v;
    }

    // ── Commands / scheduler / shutdown ─────────────────────────────
    if let Some(v) = env.u64("ARGUS_COMMAND_TIMEOUT_MS", 1, 3_600_000) {
        settings.commands.timeout_ms = v;
    }
    if let Some(v) = env.u64("ARGUS_TICK_INTERVAL_MS", 0, 60_000) {
        settings.scheduler.tick_interval_ms = v;
    }
    if let Some(v) = env.u64("ARGUS_SHUTDOWN_GRACE_MS", 0, 600_000) {
        settings.shutdown.grace_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("ARGUS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("ARGUS_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers ────────────────────────────────────────────────────────

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
