use crate::domain::{
    Actor, ConversationTurn, ENVIRONMENT_TITLE, REASONING_TITLE, SessionSummary,
    TOKEN_USAGE_TITLE, TURN_CONTEXT_TITLE, TimelineEvent, format_unix_ms_rfc3339,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestOptions {
    pub include_reasoning: bool,
    pub include_tool_summaries: bool,
    pub merge_consecutive_assistant: bool,
    pub max_message_bytes: usize,
    pub max_total_bytes: usize,
}

impl Default for DigestOptions {
    fn default() -> Self {
        Self {
            include_reasoning: false,
            include_tool_summaries: false,
            merge_consecutive_assistant: false,
            max_message_bytes: 2 * 1024,
            max_total_bytes: 64 * 1024,
        }
    }
}

pub const DIGEST_TRUNCATED_MARKER: &str = "\n[... digest truncated ...]\n";

const TRUNCATE_FLOOR_BYTES: usize = 32;

pub fn session_header(summary: &SessionSummary) -> String {
    let started = summary
        .started_at_ms
        .and_then(format_unix_ms_rfc3339)
        .unwrap_or_else(|| "unknown start".to_string());
    format!("## Session {} ({started})\n\n", summary.id)
}

fn is_reasoning(event: &TimelineEvent) -> bool {
    event.actor == Actor::Info && event.title.as_deref() == Some(REASONING_TITLE)
}

fn is_tool_summary(event: &TimelineEvent) -> bool {
    event.actor == Actor::Info
        && !matches!(
            event.title.as_deref(),
            Some(ENVIRONMENT_TITLE)
                | Some(REASONING_TITLE)
                | Some(TURN_CONTEXT_TITLE)
                | Some(TOKEN_USAGE_TITLE)
                | None
        )
}

/// Renders one turn. Returns the rendered block and whether the last block
/// written is assistant-authored, which feeds the consecutive-assistant merge
/// on the next call.
pub fn render_turn(
    turn: &ConversationTurn,
    options: &DigestOptions,
    previous_block_assistant: bool,
) -> (String, bool) {
    let mut out = String::new();
    let mut last_assistant = previous_block_assistant;

    if let Some(user) = &turn.user {
        if !user.text.trim().is_empty() {
            out.push_str("### User\n\n");
            out.push_str(&truncate_message(&user.text, options.max_message_bytes));
            out.push_str("\n\n");
            last_assistant = false;
        }
    }

    if options.include_reasoning || options.include_tool_summaries {
        for event in &turn.outputs {
            let included = (options.include_reasoning && is_reasoning(event))
                || (options.include_tool_summaries && is_tool_summary(event));
            if !included || event.text.trim().is_empty() {
                continue;
            }
            let title = event.title.as_deref().unwrap_or("note");
            out.push_str(&format!("### {title}\n\n"));
            out.push_str(&truncate_message(&event.text, options.max_message_bytes));
            out.push_str("\n\n");
            last_assistant = false;
        }
    }

    if let Some(reply) = turn
        .outputs
        .iter()
        .rev()
        .find(|event| event.actor == Actor::Assistant)
    {
        if !reply.text.trim().is_empty() {
            if !(options.merge_consecutive_assistant && last_assistant) {
                out.push_str("### Assistant\n\n");
            }
            out.push_str(&truncate_message(&reply.text, options.max_message_bytes));
            out.push_str("\n\n");
            last_assistant = true;
        }
    }

    (out, last_assistant)
}

/// Bounds a message body to `max_bytes` by keeping a head and a tail slice
/// joined with an elision marker. Slices are cut on char boundaries; the
/// result never exceeds `max_bytes` plus the marker's length.
pub fn truncate_message(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }

    let slice = TRUNCATE_FLOOR_BYTES.max(max_bytes / 4).min(max_bytes / 2);
    let head_end = floor_char_boundary(body, slice);
    let tail_start = ceil_char_boundary(body, body.len().saturating_sub(slice));
    let elided = tail_start - head_end;
    format!(
        "{}[... {elided} bytes elided ...]{}",
        &body[..head_end],
        &body[tail_start..]
    )
}

/// Clips an already rendered session body into a remaining total budget,
/// using the same head/tail strategy as per-message truncation.
pub fn clip_to_budget(body: &str, budget: usize) -> String {
    truncate_message(body, budget)
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn event(actor: Actor, title: Option<&str>, text: &str, ts: i64) -> TimelineEvent {
        TimelineEvent {
            actor,
            title: title.map(str::to_string),
            text: text.to_string(),
            metadata: BTreeMap::new(),
            repeat: 1,
            timestamp_ms: Some(ts),
        }
    }

    #[test]
    fn long_message_keeps_head_and_tail_within_cap() {
        let body = "a".repeat(10_000);
        let rendered = truncate_message(&body, 100);

        let marker_start = rendered.find("[...").expect("marker");
        let marker_end = rendered.find("...]").expect("marker end") + 4;
        let head = &rendered[..marker_start];
        let tail = &rendered[marker_end..];

        assert_eq!(head, "a".repeat(32));
        assert_eq!(tail, "a".repeat(32));
        let marker_len = marker_end - marker_start;
        assert!(rendered.len() <= 100 + marker_len);
    }

    #[test]
    fn short_message_is_untouched() {
        assert_eq!(truncate_message("hello", 100), "hello");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "é".repeat(4_000);
        let rendered = truncate_message(&body, 101);
        assert!(rendered.contains("bytes elided"));
        assert!(rendered.starts_with('é'));
        assert!(rendered.ends_with('é'));
    }

    #[test]
    fn renders_user_and_last_assistant_output() {
        let turn = ConversationTurn {
            user: Some(event(Actor::User, None, "question", 1)),
            outputs: vec![
                event(Actor::Assistant, None, "draft", 2),
                event(Actor::Info, Some(REASONING_TITLE), "thinking", 3),
                event(Actor::Assistant, None, "final answer", 4),
            ],
        };
        let (rendered, last_assistant) = render_turn(&turn, &DigestOptions::default(), false);

        assert!(rendered.contains("### User\n\nquestion"));
        assert!(rendered.contains("### Assistant\n\nfinal answer"));
        assert!(!rendered.contains("draft"));
        assert!(!rendered.contains("thinking"));
        assert!(last_assistant);
    }

    #[test]
    fn merge_flag_appends_bare_text_after_assistant_block() {
        let options = DigestOptions {
            merge_consecutive_assistant: true,
            ..DigestOptions::default()
        };
        let turn = ConversationTurn {
            user: None,
            outputs: vec![event(Actor::Assistant, None, "continued", 5)],
        };

        let (merged, _) = render_turn(&turn, &options, true);
        assert!(!merged.contains("### Assistant"));
        assert!(merged.contains("continued"));

        let (unmerged, _) = render_turn(&turn, &DigestOptions::default(), true);
        assert!(unmerged.contains("### Assistant"));
    }

    #[test]
    fn inclusion_flags_gate_reasoning_and_tool_summaries() {
        let turn = ConversationTurn {
            user: Some(event(Actor::User, None, "q", 1)),
            outputs: vec![
                event(Actor::Info, Some(REASONING_TITLE), "thinking hard", 2),
                event(Actor::Info, Some("web_search_call"), "searched docs", 3),
                event(Actor::Assistant, None, "a", 4),
            ],
        };

        let (plain, _) = render_turn(&turn, &DigestOptions::default(), false);
        assert!(!plain.contains("thinking hard"));
        assert!(!plain.contains("searched docs"));

        let options = DigestOptions {
            include_reasoning: true,
            include_tool_summaries: true,
            ..DigestOptions::default()
        };
        let (full, _) = render_turn(&turn, &options, false);
        assert!(full.contains("thinking hard"));
        assert!(full.contains("searched docs"));
    }
}
