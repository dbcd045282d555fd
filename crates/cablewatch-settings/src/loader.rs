//! Layered settings loading.
//!
//! `CablewatchSettings::default()` is serialized to JSON, the user file is
//! merged over it key by key (nested objects recursively, `null` leaves the
//! default in place, anything else replaces), and the result is deserialized
//! again. `CABLEWATCH_*` variables are applied last.

use std::io::ErrorKind;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{
    CablewatchSettings, DEBOUNCE_WINDOW_MS, HANDSHAKE_TIMEOUT_MS, IDLE_TIMEOUT_MS, MAX_WAIT_MS,
};

/// Settings file location: `$CABLEWATCH_SETTINGS` when set, otherwise
/// `~/.cablewatch/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("CABLEWATCH_SETTINGS").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
    PathBuf::from(home).join(".cablewatch").join("settings.json")
}

/// [`load_settings_from_path`] at [`settings_path`].
pub fn load_settings() -> Result<CablewatchSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path`, then apply environment overrides.
///
/// A missing file yields the defaults. The file must hold a JSON object.
pub fn load_settings_from_path(path: &Path) -> Result<CablewatchSettings> {
    let mut merged = serde_json::to_value(CablewatchSettings::default())?;

    match std::fs::read_to_string(path) {
        Ok(content) => {
            let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            if !user.is_object() {
                return Err(SettingsError::invalid(
                    "settings",
                    format!("{} must hold a JSON object", path.display()),
                ));
            }
            debug!(?path, "merging settings file");
            deep_merge(&mut merged, user);
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(?path, "no settings file, using defaults");
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let mut settings: CablewatchSettings =
        serde_json::from_value(merged).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Merge `overlay` into `base` in place.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None if value.is_null() => {}
                    None => {
                        let _ = base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `CABLEWATCH_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut CablewatchSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Each variable has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (fall back to file/default)
pub fn apply_overrides_from(
    settings: &mut CablewatchSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("CABLEWATCH_URL") {
        settings.cable_url = v;
    }
    if let Some(v) = env.string("CABLEWATCH_CHANNEL") {
        settings.channel_name = v;
    }
    if let Some(v) = env.string("CABLEWATCH_EVENTS") {
        settings.allowed_events = parse_event_list(&v);
    }
    if let Some(v) = env.u64("CABLEWATCH_DEBOUNCE_MS", &DEBOUNCE_WINDOW_MS) {
        settings.debounce_window_ms = v;
    }
    if let Some(v) = env.u64("CABLEWATCH_MAX_WAIT_MS", &MAX_WAIT_MS) {
        settings.max_wait_ms = v;
    }
    if let Some(v) = env.u64("CABLEWATCH_IDLE_TIMEOUT_MS", &IDLE_TIMEOUT_MS) {
        settings.idle_timeout_ms = v;
    }
    if let Some(v) = env.u64("CABLEWATCH_HANDSHAKE_TIMEOUT_MS", &HANDSHAKE_TIMEOUT_MS) {
        settings.handshake_timeout_ms = v;
    }
    if let Some(v) = env.string("CABLEWATCH_DEBOUNCE_POLICY") {
        if let Ok(policy) = serde_json::from_value(Value::String(v.to_lowercase())) {
            settings.debounce_policy = policy;
        } else {
            tracing::warn!(key = "CABLEWATCH_DEBOUNCE_POLICY", value = %v, "invalid policy, ignoring");
        }
    }
    if let Some(v) = env.bool("CABLEWATCH_INCLUDE_RAW") {
        settings.include_raw = v;
    }
    if let Some(v) = env.bool("CABLEWATCH_INCOMING_ONLY") {
        settings.incoming_only = v;
    }
    if let Some(v) = env.bool("CABLEWATCH_FLUSH_ON_SHUTDOWN") {
        settings.flush_on_shutdown = v;
    }
    if let Some(v) = env.string("CABLEWATCH_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Some(v) = env.bool("CABLEWATCH_LOG_JSON") {
        settings.log_json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

/// Parse a string as a `u64` inside `range`.
pub fn parse_u64_in(val: &str, range: &RangeInclusive<u64>) -> Option<u64> {
    val.parse().ok().filter(|n| range.contains(n))
}

/// Split a comma-separated event list, trimming blanks.
pub fn parse_event_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, range: &RangeInclusive<u64>) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_in(&val, range);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
