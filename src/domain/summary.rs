use crate::domain::LogRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Aggregate projection of one session log file. Identity is `log_path`.
/// `origin` and `remote_path` are enrichment-only fields: callers copy them
/// onto a freshly built summary via [`SessionSummary::enriched`], never by
/// mutating a cached entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub log_path: PathBuf,
    pub file_size_bytes: u64,
    pub started_at_ms: Option<i64>,
    pub ended_at_ms: Option<i64>,
    pub updated_at_ms: Option<i64>,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_calls: usize,
    pub turn_contexts: usize,
    pub events: usize,
    pub lines: usize,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub cwd: PathBuf,
    pub originator: Option<String>,
    pub cli_version: Option<String>,
    pub instructions: Option<String>,
    pub active_duration_ms: Option<i64>,
    pub origin: Option<String>,
    pub remote_path: Option<PathBuf>,
}

impl SessionSummary {
    pub fn enriched(&self, origin: &str, remote_path: Option<PathBuf>) -> Self {
        let mut copy = self.clone();
        copy.origin = Some(origin.to_string());
        copy.remote_path = remote_path;
        copy
    }
}

/// Folds a stream of decoded records into a `SessionSummary`. Returns nothing
/// from `finalize` when no session_meta row was observed; the scanner treats
/// that as a signal to escalate from a partial to a full parse.
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    meta: Option<MetaFields>,
    max_timestamp_ms: Option<i64>,
    user_messages: usize,
    assistant_messages: usize,
    tool_calls: usize,
    turn_contexts: usize,
    events: usize,
    model: Option<String>,
    approval_policy: Option<String>,
}

#[derive(Debug)]
struct MetaFields {
    id: String,
    started_at_ms: Option<i64>,
    cwd: PathBuf,
    originator: Option<String>,
    cli_version: Option<String>,
    instructions: Option<String>,
}

impl SummaryBuilder {
    pub fn observe(&mut self, record: &LogRecord) {
        self.events += 1;
        if let Some(ts) = record.timestamp_ms() {
            // Rows are not guaranteed strictly increasing.
            self.max_timestamp_ms = Some(self.max_timestamp_ms.map_or(ts, |max| max.max(ts)));
        }

        match record {
            LogRecord::SessionMeta(meta) => {
                if self.meta.is_none() {
                    self.meta = Some(MetaFields {
                        id: meta.id.clone(),
                        started_at_ms: meta.started_at_ms,
                        cwd: meta.cwd.clone(),
                        originator: meta.originator.clone(),
                        cli_version: meta.cli_version.clone(),
                        instructions: meta.instructions.clone(),
                    });
                }
            }
            LogRecord::TurnContext(ctx) => {
                self.turn_contexts += 1;
                if ctx.model.is_some() {
                    self.model = ctx.model.clone();
                }
                if ctx.approval_policy.is_some() {
                    self.approval_policy = ctx.approval_policy.clone();
                }
            }
            LogRecord::Event(event) => match event.event_type.as_str() {
                "user_message" => self.user_messages += 1,
                "agent_message" => self.assistant_messages += 1,
                _ => {}
            },
            LogRecord::Response(item) => {
                if matches!(
                    item.item_type.as_str(),
                    "function_call" | "custom_tool_call" | "local_shell_call"
                ) {
                    self.tool_calls += 1;
                }
            }
            LogRecord::Unknown(_) => {}
        }
    }

    pub fn finalize(
        self,
        log_path: PathBuf,
        file_size_bytes: u64,
        lines: usize,
    ) -> Option<SessionSummary> {
        let meta = self.meta?;
        let instructions = meta
            .instructions
            .as_deref()
            .map(clean_instructions)
            .filter(|text| !text.is_empty());

        Some(SessionSummary {
            id: meta.id,
            log_path,
            file_size_bytes,
            started_at_ms: meta.started_at_ms,
            ended_at_ms: self.max_timestamp_ms,
            updated_at_ms: self.max_timestamp_ms,
            user_messages: self.user_messages,
            assistant_messages: self.assistant_messages,
            tool_calls: self.tool_calls,
            turn_contexts: self.turn_contexts,
            events: self.events,
            lines,
            model: self.model,
            approval_policy: self.approval_policy,
            cwd: meta.cwd,
            originator: meta.originator,
            cli_version: meta.cli_version,
            instructions,
            active_duration_ms: None,
            origin: None,
            remote_path: None,
        })
    }
}

const WRAPPER_TAGS: [&str; 2] = ["user_instructions", "instructions"];

/// Strips instructional wrapper tags from instruction text. Idempotent:
/// applying it to its own output is a no-op.
pub fn clean_instructions(text: &str) -> String {
    let mut current = text.trim();
    loop {
        let Some(inner) = WRAPPER_TAGS
            .iter()
            .find_map(|tag| strip_wrapper(current, tag))
        else {
            break;
        };
        current = inner.trim();
    }
    current.to_string()
}

fn strip_wrapper<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(&format!("<{tag}>"))?;
    rest.strip_suffix(&format!("</{tag}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decode_log_line;

    fn observe_lines(builder: &mut SummaryBuilder, lines: &[&str]) -> usize {
        let mut count = 0usize;
        for line in lines {
            count += 1;
            if let Some(record) = decode_log_line(line) {
                builder.observe(&record);
            }
        }
        count
    }

    const META_LINE: &str = r#"{"timestamp":"2026-02-18T21:45:57.762Z","type":"session_meta","payload":{"id":"s1","timestamp":"2026-02-18T21:39:39.022Z","cwd":"/tmp/project","originator":"cli","cli_version":"0.9.0"}}"#;

    #[test]
    fn meta_only_log_yields_all_zero_counts() {
        let mut builder = SummaryBuilder::default();
        let lines = observe_lines(&mut builder, &[META_LINE]);
        let summary = builder
            .finalize(PathBuf::from("/tmp/s1.jsonl"), 120, lines)
            .expect("summary");

        assert_eq!(summary.id, "s1");
        assert_eq!(summary.user_messages, 0);
        assert_eq!(summary.assistant_messages, 0);
        assert_eq!(summary.tool_calls, 0);
        assert_eq!(summary.turn_contexts, 0);
        assert_eq!(summary.events, 1);
        assert_eq!(summary.lines, 1);
        assert_eq!(summary.cwd.to_string_lossy(), "/tmp/project");
    }

    #[test]
    fn counts_rows_per_category() {
        let mut builder = SummaryBuilder::default();
        let lines = observe_lines(
            &mut builder,
            &[
                META_LINE,
                r#"{"timestamp":"2026-02-18T21:46:00Z","type":"turn_context","payload":{"model":"gpt-5.2","approval_policy":"never"}}"#,
                r#"{"timestamp":"2026-02-18T21:46:01Z","type":"event_msg","payload":{"type":"user_message","message":"hello"}}"#,
                r#"{"timestamp":"2026-02-18T21:46:02Z","type":"event_msg","payload":{"type":"agent_message","message":"hi"}}"#,
                r#"{"timestamp":"2026-02-18T21:46:03Z","type":"response_item","payload":{"type":"function_call","name":"shell","call_id":"c1","arguments":"{}"}}"#,
                r#"{"timestamp":"2026-02-18T21:46:04Z","type":"weird_kind","payload":{}}"#,
            ],
        );
        let summary = builder
            .finalize(PathBuf::from("/tmp/s1.jsonl"), 512, lines)
            .expect("summary");

        assert_eq!(summary.user_messages, 1);
        assert_eq!(summary.assistant_messages, 1);
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(summary.turn_contexts, 1);
        assert_eq!(summary.events, 6);
        assert_eq!(summary.lines, 6);
        assert_eq!(summary.model.as_deref(), Some("gpt-5.2"));
        assert_eq!(summary.approval_policy.as_deref(), Some("never"));
    }

    #[test]
    fn tracks_maximum_timestamp_across_non_monotonic_rows() {
        let mut builder = SummaryBuilder::default();
        let lines = observe_lines(
            &mut builder,
            &[
                META_LINE,
                r#"{"timestamp":"2026-02-18T22:00:05Z","type":"event_msg","payload":{"type":"user_message","message":"later"}}"#,
                r#"{"timestamp":"2026-02-18T21:50:00Z","type":"event_msg","payload":{"type":"agent_message","message":"earlier"}}"#,
            ],
        );
        let summary = builder
            .finalize(PathBuf::from("/tmp/s1.jsonl"), 256, lines)
            .expect("summary");

        let expected = crate::domain::parse_rfc3339_to_unix_ms("2026-02-18T22:00:05Z").unwrap();
        assert_eq!(summary.ended_at_ms, Some(expected));
        assert_eq!(summary.updated_at_ms, Some(expected));
    }

    #[test]
    fn finalize_without_meta_yields_none() {
        let mut builder = SummaryBuilder::default();
        observe_lines(
            &mut builder,
            &[r#"{"timestamp":"2026-02-18T21:46:01Z","type":"event_msg","payload":{"type":"user_message","message":"hello"}}"#],
        );
        assert!(
            builder
                .finalize(PathBuf::from("/tmp/s1.jsonl"), 64, 1)
                .is_none()
        );
    }

    #[test]
    fn clean_instructions_is_idempotent() {
        let wrapped = "<user_instructions>\nAlways write tests.\n</user_instructions>";
        let once = clean_instructions(wrapped);
        assert_eq!(once, "Always write tests.");
        assert_eq!(clean_instructions(&once), once);

        let nested = "<instructions><user_instructions>inner</user_instructions></instructions>";
        assert_eq!(clean_instructions(nested), "inner");
        assert_eq!(clean_instructions("plain text"), "plain text");
    }

    #[test]
    fn empty_cleaned_instructions_are_dropped() {
        let line = r#"{"timestamp":"2026-02-18T21:45:57.762Z","type":"session_meta","payload":{"id":"s1","cwd":"/tmp","instructions":"<user_instructions></user_instructions>"}}"#;
        let mut builder = SummaryBuilder::default();
        observe_lines(&mut builder, &[line]);
        let summary = builder
            .finalize(PathBuf::from("/tmp/s1.jsonl"), 64, 1)
            .expect("summary");
        assert_eq!(summary.instructions, None);
    }

    #[test]
    fn enrichment_is_a_pure_copy() {
        let mut builder = SummaryBuilder::default();
        observe_lines(&mut builder, &[META_LINE]);
        let summary = builder
            .finalize(PathBuf::from("/tmp/s1.jsonl"), 64, 1)
            .expect("summary");

        let enriched = summary.enriched("mirror", Some(PathBuf::from("/remote/s1.jsonl")));
        assert_eq!(enriched.origin.as_deref(), Some("mirror"));
        assert_eq!(summary.origin, None);
        assert_eq!(enriched.id, summary.id);
    }
}
