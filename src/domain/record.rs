use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// One decoded log line. Lines that fail to decode are skipped by callers,
/// never surfaced as errors; kinds we do not know are absorbed as `Unknown`.
#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    SessionMeta(SessionMetaRecord),
    TurnContext(TurnContextRecord),
    Event(EventRecord),
    Response(ResponseRecord),
    Unknown(UnknownRecord),
}

impl LogRecord {
    pub fn timestamp_ms(&self) -> Option<i64> {
        match self {
            Self::SessionMeta(record) => record.timestamp_ms,
            Self::TurnContext(record) => record.timestamp_ms,
            Self::Event(record) => record.timestamp_ms,
            Self::Response(record) => record.timestamp_ms,
            Self::Unknown(record) => record.timestamp_ms,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionMetaRecord {
    pub timestamp_ms: Option<i64>,
    pub id: String,
    pub started_at_ms: Option<i64>,
    pub cwd: PathBuf,
    pub originator: Option<String>,
    pub cli_version: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TurnContextRecord {
    pub timestamp_ms: Option<i64>,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub cwd: Option<String>,
    pub summary: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub timestamp_ms: Option<i64>,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseRecord {
    pub timestamp_ms: Option<i64>,
    pub item_type: String,
    pub role: Option<String>,
    pub payload: Value,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnknownRecord {
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SessionMetaPayload {
    id: String,
    timestamp: Option<Value>,
    cwd: String,
    originator: Option<String>,
    cli_version: Option<String>,
    instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TurnContextPayload {
    model: Option<String>,
    approval_policy: Option<String>,
    cwd: Option<String>,
    summary: Option<String>,
}

pub fn decode_log_line(line: &str) -> Option<LogRecord> {
    let trimmed = line.strip_suffix('\r').unwrap_or(line).trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: Value = serde_json::from_str(trimmed).ok()?;
    let timestamp_ms = value.get("timestamp").and_then(parse_timestamp_value);
    let line_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match line_type {
        "session_meta" => {
            let payload: SessionMetaPayload =
                serde_json::from_value(value.get("payload")?.clone()).ok()?;
            let started_at_ms = payload
                .timestamp
                .as_ref()
                .and_then(parse_timestamp_value)
                .or(timestamp_ms);
            Some(LogRecord::SessionMeta(SessionMetaRecord {
                timestamp_ms,
                id: payload.id,
                started_at_ms,
                cwd: PathBuf::from(payload.cwd),
                originator: payload.originator,
                cli_version: payload.cli_version,
                instructions: payload.instructions,
            }))
        }
        "turn_context" => {
            let payload: TurnContextPayload =
                serde_json::from_value(value.get("payload").cloned().unwrap_or(Value::Null))
                    .unwrap_or(TurnContextPayload {
                        model: None,
                        approval_policy: None,
                        cwd: None,
                        summary: None,
                    });
            Some(LogRecord::TurnContext(TurnContextRecord {
                timestamp_ms,
                model: payload.model,
                approval_policy: payload.approval_policy,
                cwd: payload.cwd,
                summary: payload.summary,
            }))
        }
        "event_msg" => {
            let payload = value.get("payload").cloned().unwrap_or(Value::Null);
            let event_type = payload
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Some(LogRecord::Event(EventRecord {
                timestamp_ms,
                event_type,
                payload,
            }))
        }
        "response_item" => {
            let payload = value.get("payload").cloned().unwrap_or(Value::Null);
            let item_type = payload
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let role = payload
                .get("role")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(LogRecord::Response(ResponseRecord {
                timestamp_ms,
                item_type,
                role,
                payload,
            }))
        }
        _ => Some(LogRecord::Unknown(UnknownRecord { timestamp_ms })),
    }
}

// Envelope timestamps are RFC 3339 strings; numeric epoch values appear in
// older logs, in seconds or milliseconds depending on the writer.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

fn parse_timestamp_value(value: &Value) -> Option<i64> {
    match value {
        Value::String(raw) => parse_rfc3339_to_unix_ms(raw),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                if int.abs() >= EPOCH_MILLIS_THRESHOLD {
                    Some(int)
                } else {
                    int.checked_mul(1000)
                }
            } else {
                let secs = number.as_f64()?;
                if !secs.is_finite() {
                    return None;
                }
                Some((secs * 1000.0) as i64)
            }
        }
        _ => None,
    }
}

pub fn parse_rfc3339_to_unix_ms(value: &str) -> Option<i64> {
    let timestamp = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    let ms: i128 = timestamp.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(ms).ok()
}

pub fn format_unix_ms_rfc3339(ms: i64) -> Option<String> {
    let nanos = i128::from(ms).checked_mul(1_000_000)?;
    let timestamp = OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()?;
    timestamp.format(&Rfc3339).ok()
}
