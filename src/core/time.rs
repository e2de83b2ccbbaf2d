//! Timestamps and ids for sessions, index metadata and CLI envelopes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue};
use ulid::Ulid;

/// Current instant in UTC. Session timestamps serialize as RFC 3339.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// RFC 3339 with second precision, e.g. `2026-10-19T08:15:02Z`.
pub fn now_rfc3339() -> String {
    now_utc().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Session ids are ULIDs, so they sort by creation time and are filename safe.
pub fn new_session_id() -> String {
    Ulid::new().to_string()
}

/// Envelope printed by `--format json` CLI commands. Keys in `extra` are
/// merged after the fixed header fields.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut envelope = Map::new();
    envelope.insert("envelope_version".into(), "1.0.0".into());
    envelope.insert("ts".into(), now_rfc3339().into());
    envelope.insert("event_id".into(), Ulid::new().to_string().into());
    envelope.insert("cmd".into(), cmd.into());
    envelope.insert("status".into(), status.into());
    if let JsonValue::Object(extra) = extra {
        envelope.extend(extra);
    }
    JsonValue::Object(envelope)
}
