//! Shared timestamp/event helpers for deterministic envelopes.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// Returns the current instant as RFC-3339 UTC (audit-record `ts` form).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Parse a timestamp in either RFC-3339 form or the legacy epoch-`Z` form
/// into unix-epoch seconds. Returns `None` for anything else.
pub fn parse_ts_epoch(ts: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.timestamp());
    }
    let trimmed = ts.strip_suffix('Z')?;
    trimmed.parse::<i64>().ok()
}

/// Render unix-epoch seconds as RFC-3339 UTC for display.
pub fn epoch_to_iso(epoch_secs: i64) -> String {
    match Utc.timestamp_opt(epoch_secs, 0) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        _ => format!("{}Z", epoch_secs),
    }
}

/// Standard command response envelope shape used across CLI surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
