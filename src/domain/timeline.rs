use crate::domain::{EventRecord, LogRecord, ResponseRecord, TurnContextRecord};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Actor {
    User,
    Assistant,
    Info,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimelineEvent {
    pub actor: Actor,
    pub title: Option<String>,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    /// Number of consecutive semantically-identical rows collapsed into this
    /// event. Always >= 1.
    pub repeat: u32,
    pub timestamp_ms: Option<i64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConversationTurn {
    pub user: Option<TimelineEvent>,
    pub outputs: Vec<TimelineEvent>,
}

impl ConversationTurn {
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.user
            .as_ref()
            .and_then(|event| event.timestamp_ms)
            .or_else(|| self.outputs.first().and_then(|event| event.timestamp_ms))
    }
}

pub const ENVIRONMENT_TITLE: &str = "environment";
pub const REASONING_TITLE: &str = "reasoning";
pub const TURN_CONTEXT_TITLE: &str = "turn context";
pub const TOKEN_USAGE_TITLE: &str = "token usage";

const ENVIRONMENT_OPEN: &str = "<environment_context>";
const ENVIRONMENT_CLOSE: &str = "</environment_context>";

/// Projects one decoded record to zero or one timeline event.
pub fn project_record(record: &LogRecord) -> Option<TimelineEvent> {
    match record {
        LogRecord::SessionMeta(_) | LogRecord::Unknown(_) => None,
        LogRecord::TurnContext(ctx) => project_turn_context(ctx),
        LogRecord::Event(event) => project_event(event),
        LogRecord::Response(item) => project_response(item),
    }
}

fn project_turn_context(ctx: &TurnContextRecord) -> Option<TimelineEvent> {
    let mut lines: Vec<String> = Vec::new();
    for (label, value) in [
        ("model", &ctx.model),
        ("approval", &ctx.approval_policy),
        ("cwd", &ctx.cwd),
        ("summary", &ctx.summary),
    ] {
        if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            lines.push(format!("{label}: {value}"));
        }
    }
    if lines.is_empty() {
        return None;
    }
    Some(TimelineEvent {
        actor: Actor::Info,
        title: Some(TURN_CONTEXT_TITLE.to_string()),
        text: lines.join("\n"),
        metadata: BTreeMap::new(),
        repeat: 1,
        timestamp_ms: ctx.timestamp_ms,
    })
}

fn project_event(event: &EventRecord) -> Option<TimelineEvent> {
    match event.event_type.as_str() {
        // Streamed duplicate of agent_reasoning; keeping both would double
        // every reasoning block.
        "agent_reasoning_delta" => None,
        "token_count" => {
            let mut metadata = BTreeMap::new();
            if let Value::Object(map) = &event.payload {
                for (key, value) in map {
                    if key == "type" {
                        continue;
                    }
                    flatten_value(key, value, &mut metadata);
                }
            }
            if metadata.is_empty() {
                return None;
            }
            Some(TimelineEvent {
                actor: Actor::Info,
                title: Some(TOKEN_USAGE_TITLE.to_string()),
                text: String::new(),
                metadata,
                repeat: 1,
                timestamp_ms: event.timestamp_ms,
            })
        }
        "agent_reasoning" => {
            let text = event_text(&event.payload)?;
            Some(TimelineEvent {
                actor: Actor::Info,
                title: Some(REASONING_TITLE.to_string()),
                text,
                metadata: BTreeMap::new(),
                repeat: 1,
                timestamp_ms: event.timestamp_ms,
            })
        }
        "environment_context" => {
            let text = event_text(&event.payload).unwrap_or_default();
            environment_event(&text, event.timestamp_ms)
        }
        other => {
            let text = event_text(&event.payload)?;
            let (actor, title) = match other {
                "user_message" => (Actor::User, None),
                "agent_message" => (Actor::Assistant, None),
                _ => (Actor::Info, Some(other.to_string())),
            };
            Some(TimelineEvent {
                actor,
                title,
                text,
                metadata: BTreeMap::new(),
                repeat: 1,
                timestamp_ms: event.timestamp_ms,
            })
        }
    }
}

fn project_response(item: &ResponseRecord) -> Option<TimelineEvent> {
    match item.item_type.as_str() {
        "function_call" | "function_call_output" | "custom_tool_call" | "custom_tool_call_output"
        | "local_shell_call" => None,
        "message" => {
            let joined = joined_content_text(&item.payload);
            if joined.trim().is_empty() {
                return None;
            }
            if item.role.as_deref() == Some("user") {
                // The event_msg path already carries the user prompt; the only
                // user-role response worth keeping is an embedded environment
                // context document.
                return environment_event(&joined, item.timestamp_ms);
            }
            Some(TimelineEvent {
                actor: Actor::Assistant,
                title: None,
                text: joined,
                metadata: BTreeMap::new(),
                repeat: 1,
                timestamp_ms: item.timestamp_ms,
            })
        }
        other => {
            let joined = joined_summary_text(&item.payload);
            if joined.trim().is_empty() {
                return None;
            }
            Some(TimelineEvent {
                actor: Actor::Info,
                title: Some(other.to_string()),
                text: joined,
                metadata: BTreeMap::new(),
                repeat: 1,
                timestamp_ms: item.timestamp_ms,
            })
        }
    }
}

fn event_text(payload: &Value) -> Option<String> {
    let text = payload
        .get("message")
        .and_then(|v| v.as_str())
        .or_else(|| payload.get("text").and_then(|v| v.as_str()))?;
    if text.trim().is_empty() {
        return None;
    }
    Some(text.to_string())
}

fn joined_content_text(payload: &Value) -> String {
    let Some(content) = payload.get("content").and_then(|v| v.as_array()) else {
        return String::new();
    };
    let mut texts: Vec<&str> = Vec::new();
    for block in content {
        let block_type = block.get("type").and_then(|v| v.as_str());
        if matches!(block_type, Some("input_text") | Some("output_text")) {
            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                texts.push(text);
            }
        }
    }
    texts.join("\n")
}

fn joined_summary_text(payload: &Value) -> String {
    let Some(summary) = payload.get("summary").and_then(|v| v.as_array()) else {
        return String::new();
    };
    let mut parts: Vec<&str> = Vec::new();
    for entry in summary {
        if let Some(text) = entry.get("text").and_then(|v| v.as_str()) {
            if !text.trim().is_empty() {
                parts.push(text);
            }
        }
    }
    parts.join("\n\n")
}

fn environment_event(text: &str, timestamp_ms: Option<i64>) -> Option<TimelineEvent> {
    let document = extract_delimited(text, ENVIRONMENT_OPEN, ENVIRONMENT_CLOSE)?;
    let metadata = parse_tag_pairs(document);
    let rendered = metadata
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join("\n");
    Some(TimelineEvent {
        actor: Actor::Info,
        title: Some(ENVIRONMENT_TITLE.to_string()),
        text: rendered,
        metadata,
        repeat: 1,
        timestamp_ms,
    })
}

fn extract_delimited<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

fn parse_tag_pairs(document: &str) -> BTreeMap<String, String> {
    let mut pairs = BTreeMap::new();
    let mut rest = document;
    while let Some(open_at) = rest.find('<') {
        let after_open = &rest[open_at + 1..];
        let Some(close_bracket) = after_open.find('>') else {
            break;
        };
        let key = &after_open[..close_bracket];
        if key.is_empty() || key.starts_with('/') || key.contains('<') {
            rest = &after_open[close_bracket + 1..];
            continue;
        }
        let body = &after_open[close_bracket + 1..];
        let closing = format!("</{key}>");
        let Some(value_end) = body.find(&closing) else {
            rest = body;
            continue;
        };
        pairs.insert(key.to_string(), body[..value_end].trim().to_string());
        rest = &body[value_end + closing.len()..];
    }
    pairs
}

fn flatten_value(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, inner) in map {
                flatten_value(&format!("{prefix}.{key}"), inner, out);
            }
        }
        Value::Array(items) => {
            for (index, inner) in items.iter().enumerate() {
                flatten_value(&format!("{prefix}.{index}"), inner, out);
            }
        }
        Value::String(text) => {
            out.insert(prefix.to_string(), text.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Full pipeline: project, order, collapse, group.
pub fn build_turns(records: impl IntoIterator<Item = LogRecord>) -> Vec<ConversationTurn> {
    let mut events: Vec<TimelineEvent> = records
        .into_iter()
        .filter_map(|record| project_record(&record))
        .collect();
    // Stable: rows sharing a timestamp keep their log order.
    events.sort_by_key(|event| event.timestamp_ms);
    group_turns(collapse_consecutive(events))
}

/// Merges runs of consecutive events that are identical on actor, title,
/// text, and metadata (empty-valued keys stripped before comparison). No
/// whitespace or formatting normalization is applied.
pub fn collapse_consecutive(events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    let mut collapsed: Vec<TimelineEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let Some(last) = collapsed.last_mut() {
            if last.actor == event.actor
                && last.title == event.title
                && last.text == event.text
                && stripped_metadata(&last.metadata) == stripped_metadata(&event.metadata)
            {
                last.repeat = last.repeat.saturating_add(event.repeat);
                continue;
            }
        }
        collapsed.push(event);
    }
    collapsed
}

fn stripped_metadata(metadata: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    metadata
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect()
}

pub fn group_turns(events: Vec<TimelineEvent>) -> Vec<ConversationTurn> {
    let mut turns: Vec<ConversationTurn> = Vec::new();
    let mut pending: Option<ConversationTurn> = None;

    for event in events {
        if event.actor == Actor::User {
            if let Some(turn) = pending.take() {
                turns.push(turn);
            }
            pending = Some(ConversationTurn {
                user: Some(event),
                outputs: Vec::new(),
            });
        } else {
            pending
                .get_or_insert_with(|| ConversationTurn {
                    user: None,
                    outputs: Vec::new(),
                })
                .outputs
                .push(event);
        }
    }

    if let Some(turn) = pending {
        turns.push(turn);
    }
    turns
}

fn is_environment(event: &TimelineEvent) -> bool {
    event.actor == Actor::Info && event.title.as_deref() == Some(ENVIRONMENT_TITLE)
}

/// Sum of (last output timestamp - first relevant timestamp) over turns,
/// skipping environment-context events when picking the endpoints. Returns
/// None (no data) when no turn yields a usable positive delta; this is
/// distinct from a zero duration.
pub fn active_duration_ms(turns: &[ConversationTurn]) -> Option<i64> {
    let mut total: i64 = 0;
    let mut contributed = false;

    for turn in turns {
        let first = turn
            .user
            .iter()
            .chain(turn.outputs.iter())
            .filter(|event| !is_environment(event))
            .find_map(|event| event.timestamp_ms);
        let last = turn
            .outputs
            .iter()
            .rev()
            .filter(|event| !is_environment(event))
            .find_map(|event| event.timestamp_ms);
        if let (Some(first), Some(last)) = (first, last) {
            if last > first {
                total = total.saturating_add(last - first);
                contributed = true;
            }
        }
    }

    contributed.then_some(total)
}
