use crate::domain::{
    DIGEST_TRUNCATED_MARKER, DigestOptions, SessionSummary, clip_to_budget, render_turn,
    session_header,
};
use crate::infra::cache::lock;
use crate::infra::{CancelFlag, FileStamp, LoadTimelineError, load_session_turns};
use lru::LruCache;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;

pub const DEFAULT_MEMO_CAPACITY: usize = 32;

struct MemoEntry {
    stamp: Option<FileStamp>,
    options: DigestOptions,
    rendered: String,
}

/// Renders byte-budgeted Markdown digests across sessions. Per-session
/// renders are memoized in a small LRU keyed by log path; a stored entry is
/// reused only when both the file stamp and the options signature match.
pub struct DigestExporter {
    memo: Mutex<LruCache<PathBuf, MemoEntry>>,
}

impl Default for DigestExporter {
    fn default() -> Self {
        Self::new(DEFAULT_MEMO_CAPACITY)
    }
}

impl DigestExporter {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Assembles the digest in ascending session start order under the total
    /// byte budget. Cancellation is polled between sessions and between
    /// turns; the result is always a structurally valid prefix.
    pub fn render(
        &self,
        sessions: &[SessionSummary],
        options: &DigestOptions,
        cancel: &CancelFlag,
    ) -> String {
        let mut ordered: Vec<&SessionSummary> = sessions.iter().collect();
        ordered.sort_by_key(|summary| summary.started_at_ms);

        let mut out = String::new();
        for summary in ordered {
            if cancel.is_cancelled() {
                break;
            }

            let header = session_header(summary);
            if out.len() + header.len() > options.max_total_bytes {
                out.push_str(DIGEST_TRUNCATED_MARKER);
                break;
            }

            let body = match self.session_body(summary, options, cancel) {
                Ok(body) => body,
                // An unreadable session is excluded; the digest goes on.
                Err(_) => continue,
            };

            out.push_str(&header);
            let remaining = options.max_total_bytes.saturating_sub(out.len());
            if body.len() > remaining {
                out.push_str(&clip_to_budget(&body, remaining));
            } else {
                out.push_str(&body);
            }
        }
        out
    }

    fn session_body(
        &self,
        summary: &SessionSummary,
        options: &DigestOptions,
        cancel: &CancelFlag,
    ) -> Result<String, LoadTimelineError> {
        let stamp = fs::metadata(&summary.log_path)
            .ok()
            .map(|metadata| FileStamp::of(&metadata));

        if let Some(entry) = lock(&self.memo).get(&summary.log_path) {
            // When the file is gone the stamp cannot be checked; a memoized
            // render with matching options still stands in for it.
            let stamp_ok = stamp.is_none() || entry.stamp == stamp;
            if stamp_ok && entry.options == *options {
                return Ok(entry.rendered.clone());
            }
        }

        let turns = load_session_turns(&summary.log_path)?;
        let mut rendered = String::new();
        let mut last_assistant = false;
        for turn in &turns {
            if cancel.is_cancelled() {
                break;
            }
            let (block, ends_assistant) = render_turn(turn, options, last_assistant);
            rendered.push_str(&block);
            last_assistant = ends_assistant;
        }

        lock(&self.memo).put(
            summary.log_path.clone(),
            MemoEntry {
                stamp,
                options: options.clone(),
                rendered: rendered.clone(),
            },
        );
        Ok(rendered)
    }
}
