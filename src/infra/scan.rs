use crate::domain::{SessionSummary, SummaryBuilder, decode_log_line};
use crate::infra::cache::lock;
use crate::infra::{FileStamp, SessionCache, read_tail};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use time::{Date, Month, OffsetDateTime};
use walkdir::WalkDir;

pub const SESSION_FILE_EXTENSION: &str = "jsonl";

// Well-formed lines fed to the builder before the head parse stops. The tail
// window independently corrects the last-updated timestamp.
const PARTIAL_PARSE_LINES: usize = 400;
const SHALLOW_PARSE_LINES: usize = 200;
const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ResolveSessionsDirError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

pub fn resolve_sessions_dir() -> Result<PathBuf, ResolveSessionsDirError> {
    if let Some(override_dir) = std::env::var_os("ROLLBOX_SESSIONS_DIR") {
        return Ok(PathBuf::from(override_dir));
    }
    let Some(home) = dirs::home_dir() else {
        return Err(ResolveSessionsDirError::HomeDirNotFound);
    };
    Ok(home.join(".codex").join("sessions"))
}

#[derive(Debug, Error)]
pub enum ResolveStateDirError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

pub fn resolve_state_dir() -> Result<PathBuf, ResolveStateDirError> {
    if let Some(override_dir) = std::env::var_os("ROLLBOX_STATE_DIR") {
        return Ok(PathBuf::from(override_dir));
    }
    let Some(home) = dirs::home_dir() else {
        return Err(ResolveStateDirError::HomeDirNotFound);
    };
    Ok(home.join(".rollbox"))
}

/// Coarse calendar filter narrowing the walked subtree to the fixed
/// `YEAR/MONTH[/DAY]` layout before any content is read. Directory placement
/// can disagree with content dates (mirrored or misfiled logs), so callers
/// apply [`scope_matches`] on the returned summaries as well.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanScope {
    All,
    Month(Date),
    Day(Date),
}

impl ScanScope {
    pub fn today() -> Self {
        Self::Day(OffsetDateTime::now_utc().date())
    }

    fn base_dir(&self, root: &Path) -> PathBuf {
        match self {
            Self::All => root.to_path_buf(),
            Self::Month(date) => root
                .join(format!("{:04}", date.year()))
                .join(format!("{:02}", u8::from(date.month()))),
            Self::Day(date) => root
                .join(format!("{:04}", date.year()))
                .join(format!("{:02}", u8::from(date.month())))
                .join(format!("{:02}", date.day())),
        }
    }
}

pub fn scope_matches(summary: &SessionSummary, scope: ScanScope) -> bool {
    match scope {
        ScanScope::All => true,
        ScanScope::Month(date) => [summary.started_at_ms, summary.updated_at_ms]
            .iter()
            .flatten()
            .filter_map(|ms| unix_ms_to_date(*ms))
            .any(|d| d.year() == date.year() && d.month() == date.month()),
        ScanScope::Day(date) => [summary.started_at_ms, summary.updated_at_ms]
            .iter()
            .flatten()
            .filter_map(|ms| unix_ms_to_date(*ms))
            .any(|d| d == date),
    }
}

fn unix_ms_to_date(ms: i64) -> Option<Date> {
    let nanos = i128::from(ms).checked_mul(1_000_000)?;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .map(|ts| ts.date())
}

/// Cooperative cancellation handle. The scanner checks it before admitting
/// each queued file; queued-but-not-started files are abandoned.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanWarningCount(usize);

impl From<usize> for ScanWarningCount {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl ScanWarningCount {
    pub fn get(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanStats {
    pub cache_hits: usize,
    pub parsed_files: usize,
}

#[derive(Clone, Debug)]
pub struct ScanOutput {
    /// Unordered: summaries combine as a set; callers sort as needed.
    pub sessions: Vec<SessionSummary>,
    pub warnings: ScanWarningCount,
    pub stats: ScanStats,
}

/// Scans the session tree, consulting the cache before parsing. A missing or
/// unreadable root yields an empty output, never an error.
pub fn scan_sessions(
    root: &Path,
    scope: ScanScope,
    cache: &SessionCache,
    cancel: &CancelFlag,
) -> ScanOutput {
    let mut warnings = 0usize;
    let files = discover_session_files(root, scope, &mut warnings);

    let cache_hits = AtomicUsize::new(0);
    let parsed_files = AtomicUsize::new(0);
    let worker_warnings = AtomicUsize::new(0);

    let sessions = run_pool(files, cancel, |path| {
        match index_session_file(path, cache, &cache_hits, &parsed_files) {
            Ok(Some(summary)) => Some(summary),
            Ok(None) | Err(_) => {
                worker_warnings.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    });

    warnings += worker_warnings.load(Ordering::Relaxed);
    ScanOutput {
        sessions,
        warnings: ScanWarningCount::from(warnings),
        stats: ScanStats {
            cache_hits: cache_hits.load(Ordering::Relaxed),
            parsed_files: parsed_files.load(Ordering::Relaxed),
        },
    }
}

fn discover_session_files(root: &Path, scope: ScanScope, warnings: &mut usize) -> Vec<PathBuf> {
    let base = scope.base_dir(root);
    if !base.exists() {
        return Vec::new();
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&base).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_error) => {
                *warnings += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some(SESSION_FILE_EXTENSION) {
            continue;
        }
        files.push(entry.into_path());
    }
    files
}

fn worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(2)
}

/// Fixed in-flight window of one file per worker: a worker admits the next
/// queued file only after finishing the current one, which is the sole
/// backpressure bound regardless of tree size.
fn run_pool<T, F>(files: Vec<PathBuf>, cancel: &CancelFlag, task: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Path) -> Option<T> + Sync,
{
    let queue = Mutex::new(VecDeque::from(files));
    let results = Mutex::new(Vec::new());
    let workers = worker_pool_size();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(path) = lock(&queue).pop_front() else {
                        break;
                    };
                    if let Some(result) = task(&path) {
                        lock(&results).push(result);
                    }
                }
            });
        }
    });

    results
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn index_session_file(
    path: &Path,
    cache: &SessionCache,
    cache_hits: &AtomicUsize,
    parsed_files: &AtomicUsize,
) -> io::Result<Option<SessionSummary>> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Ok(None);
    }
    let stamp = FileStamp::of(&metadata);

    if let Some(summary) = cache.lookup(path, stamp) {
        cache_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(Some(summary));
    }

    parsed_files.fetch_add(1, Ordering::Relaxed);
    let summary = match partial_parse(path, stamp.size_bytes)? {
        Some(summary) => Some(summary),
        None => full_parse(path, stamp.size_bytes)?,
    };
    let Some(summary) = summary else {
        return Ok(None);
    };

    cache.insert(path, stamp, summary.clone());
    Ok(Some(summary))
}

fn partial_parse(path: &Path, file_size_bytes: u64) -> io::Result<Option<SessionSummary>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut builder = SummaryBuilder::default();
    let mut lines = 0usize;
    let mut well_formed = 0usize;
    for line_result in reader.lines() {
        let Ok(line) = line_result else {
            break;
        };
        lines += 1;
        let Some(record) = decode_log_line(&line) else {
            continue;
        };
        builder.observe(&record);
        well_formed += 1;
        if well_formed >= PARTIAL_PARSE_LINES {
            break;
        }
    }

    let Some(mut summary) = builder.finalize(path.to_path_buf(), file_size_bytes, lines) else {
        return Ok(None);
    };

    // The head window can miss the newest rows entirely; the tail window
    // wins whenever it is later.
    if let Some(tail_ts) = latest_tail_timestamp(path) {
        if summary.updated_at_ms.is_none_or(|current| tail_ts > current) {
            summary.updated_at_ms = Some(tail_ts);
        }
    }

    Ok(Some(summary))
}

fn full_parse(path: &Path, file_size_bytes: u64) -> io::Result<Option<SessionSummary>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut builder = SummaryBuilder::default();
    let mut lines = 0usize;
    for line_result in reader.lines() {
        let Ok(line) = line_result else {
            break;
        };
        lines += 1;
        let Some(record) = decode_log_line(&line) else {
            continue;
        };
        builder.observe(&record);
    }

    Ok(builder.finalize(path.to_path_buf(), file_size_bytes, lines))
}

fn latest_tail_timestamp(path: &Path) -> Option<i64> {
    let (tail, _size) = read_tail(path, TAIL_WINDOW_BYTES).ok()?;
    let mut latest: Option<i64> = None;
    for line in tail.lines().rev() {
        let Some(record) = decode_log_line(line) else {
            continue;
        };
        if let Some(ts) = record.timestamp_ms() {
            latest = Some(latest.map_or(ts, |max| max.max(ts)));
        }
    }
    latest
}

/// Counts session files under the scope without reading any content.
pub fn count_session_files(root: &Path, scope: ScanScope) -> usize {
    let mut warnings = 0usize;
    discover_session_files(root, scope, &mut warnings).len()
}

/// Working-directory histogram over a shallow partial scan: only the first
/// few hundred lines of each file are read, stopping at the first
/// session_meta row.
pub fn cwd_histogram(
    root: &Path,
    scope: ScanScope,
    cancel: &CancelFlag,
) -> BTreeMap<String, usize> {
    let mut warnings = 0usize;
    let files = discover_session_files(root, scope, &mut warnings);
    let cwds = run_pool(files, cancel, |path| shallow_session_cwd(path));

    let mut histogram: BTreeMap<String, usize> = BTreeMap::new();
    for cwd in cwds {
        *histogram.entry(cwd).or_insert(0) += 1;
    }
    histogram
}

fn shallow_session_cwd(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let reader = BufReader::new(file);
    for line_result in reader.lines().take(SHALLOW_PARSE_LINES) {
        let Ok(line) = line_result else {
            break;
        };
        if let Some(crate::domain::LogRecord::SessionMeta(meta)) = decode_log_line(&line) {
            return Some(meta.cwd.to_string_lossy().into_owned());
        }
    }
    None
}

/// Per-day session counts, keyed by the directory-encoded date when the file
/// sits in the `YEAR/MONTH/DAY` layout, else by its modification date.
pub fn calendar_counts(root: &Path, scope: ScanScope) -> BTreeMap<Date, usize> {
    let mut warnings = 0usize;
    let mut counts: BTreeMap<Date, usize> = BTreeMap::new();
    for path in discover_session_files(root, scope, &mut warnings) {
        let date = directory_encoded_date(root, &path).or_else(|| modification_date(&path));
        if let Some(date) = date {
            *counts.entry(date).or_insert(0) += 1;
        }
    }
    counts
}

fn directory_encoded_date(root: &Path, path: &Path) -> Option<Date> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative
        .components()
        .filter_map(|c| c.as_os_str().to_str());
    let year: i32 = components.next()?.parse().ok()?;
    let month: u8 = components.next()?.parse().ok()?;
    let day: u8 = components.next()?.parse().ok()?;
    // The last component must be the file itself, not a deeper nesting.
    components.next()?;
    if components.next().is_some() {
        return None;
    }
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn modification_date(path: &Path) -> Option<Date> {
    let metadata = fs::metadata(path).ok()?;
    let stamp = FileStamp::of(&metadata);
    unix_ms_to_date(stamp.modified_unix_ms?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs;
    use tempfile::tempdir;
    use time::macros::date;

    fn meta_line(id: &str, ts: &str, cwd: &str) -> String {
        format!(
            r#"{{"timestamp":"{ts}","type":"session_meta","payload":{{"id":"{id}","timestamp":"{ts}","cwd":"{cwd}"}}}}"#
        )
    }

    fn event_line(ts: &str, payload_type: &str, message: &str) -> String {
        format!(
            r#"{{"timestamp":"{ts}","type":"event_msg","payload":{{"type":"{payload_type}","message":"{message}"}}}}"#
        )
    }

    fn write_session(path: &Path, lines: &[String]) {
        fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
        fs::write(path, lines.join("\n")).expect("write");
    }

    #[test]
    fn scans_calendar_layout_and_scope_narrows_the_walk() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        write_session(
            &root.join("2026/02/18/a.jsonl"),
            &[meta_line("a", "2026-02-18T10:00:00Z", "/tmp/p")],
        );
        write_session(
            &root.join("2026/03/01/b.jsonl"),
            &[meta_line("b", "2026-03-01T10:00:00Z", "/tmp/p")],
        );

        let cache = SessionCache::in_memory();
        let all = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(all.sessions.len(), 2);

        let day = scan_sessions(
            root,
            ScanScope::Day(date!(2026 - 02 - 18)),
            &cache,
            &CancelFlag::new(),
        );
        assert_eq!(day.sessions.len(), 1);
        assert_eq!(day.sessions[0].id, "a");

        let month = scan_sessions(
            root,
            ScanScope::Month(date!(2026 - 03 - 01)),
            &cache,
            &CancelFlag::new(),
        );
        assert_eq!(month.sessions.len(), 1);
        assert_eq!(month.sessions[0].id, "b");
    }

    #[test]
    fn unchanged_stamp_skips_content_entirely() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        let path = root.join("2026/02/18/a.jsonl");
        write_session(
            &path,
            &[
                meta_line("a", "2026-02-18T10:00:00Z", "/tmp/p"),
                event_line("2026-02-18T10:00:01Z", "user_message", "hello"),
            ],
        );

        let cache = SessionCache::in_memory();
        let first = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(first.stats.parsed_files, 1);
        assert_eq!(first.stats.cache_hits, 0);

        // Garble the content under a byte-identical size and restore the
        // stamp: the second scan must not look at the bytes at all.
        let original = fs::metadata(&path).expect("metadata");
        let mtime = FileTime::from_last_modification_time(&original);
        let garbage = "x".repeat(original.len() as usize);
        fs::write(&path, garbage).expect("garble");
        filetime::set_file_mtime(&path, mtime).expect("restore mtime");

        let second = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(second.stats.cache_hits, 1);
        assert_eq!(second.stats.parsed_files, 0);
        assert_eq!(second.sessions, first.sessions);
    }

    #[test]
    fn changed_stamp_reparses_identical_content() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        let path = root.join("2026/02/18/a.jsonl");
        write_session(&path, &[meta_line("a", "2026-02-18T10:00:00Z", "/tmp/p")]);

        let cache = SessionCache::in_memory();
        let first = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(first.stats.parsed_files, 1);

        let metadata = fs::metadata(&path).expect("metadata");
        let bumped = FileTime::from_unix_time(
            FileTime::from_last_modification_time(&metadata).unix_seconds() + 5,
            0,
        );
        filetime::set_file_mtime(&path, bumped).expect("bump mtime");

        let second = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(second.stats.parsed_files, 1);
        assert_eq!(second.stats.cache_hits, 0);
    }

    #[test]
    fn escalates_to_full_parse_when_meta_is_past_the_head_window() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        let path = root.join("2026/02/18/a.jsonl");

        let mut lines: Vec<String> = (0..PARTIAL_PARSE_LINES + 10)
            .map(|i| event_line("2026-02-18T10:00:00Z", "agent_message", &format!("row {i}")))
            .collect();
        lines.push(meta_line("late", "2026-02-18T10:00:00Z", "/tmp/p"));
        write_session(&path, &lines);

        let cache = SessionCache::in_memory();
        let output = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(output.sessions.len(), 1);
        assert_eq!(output.sessions[0].id, "late");
        assert_eq!(output.sessions[0].lines, PARTIAL_PARSE_LINES + 11);
    }

    #[test]
    fn tail_timestamp_overrides_head_parse_result() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        let path = root.join("2026/02/18/a.jsonl");

        let mut lines = vec![meta_line("a", "2026-02-18T10:00:00Z", "/tmp/p")];
        for i in 0..PARTIAL_PARSE_LINES {
            lines.push(event_line(
                "2026-02-18T10:05:00Z",
                "agent_message",
                &format!("row {i}"),
            ));
        }
        lines.push(event_line("2026-02-18T12:00:00Z", "agent_message", "late"));
        write_session(&path, &lines);

        let cache = SessionCache::in_memory();
        let output = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(output.sessions.len(), 1);

        let expected =
            crate::domain::parse_rfc3339_to_unix_ms("2026-02-18T12:00:00Z").expect("ts");
        assert_eq!(output.sessions[0].updated_at_ms, Some(expected));
        // The head parse never saw the late row.
        let head_max =
            crate::domain::parse_rfc3339_to_unix_ms("2026-02-18T10:05:00Z").expect("ts");
        assert_eq!(output.sessions[0].ended_at_ms, Some(head_max));
    }

    #[test]
    fn metaless_file_is_excluded_with_a_warning() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        write_session(
            &root.join("2026/02/18/a.jsonl"),
            &[event_line("2026-02-18T10:00:01Z", "user_message", "hello")],
        );
        write_session(
            &root.join("2026/02/18/b.jsonl"),
            &[meta_line("b", "2026-02-18T10:00:00Z", "/tmp/p")],
        );

        let cache = SessionCache::in_memory();
        let output = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(output.sessions.len(), 1);
        assert_eq!(output.sessions[0].id, "b");
        assert_eq!(output.warnings.get(), 1);
    }

    #[test]
    fn missing_root_yields_empty_output() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("does-not-exist");

        let cache = SessionCache::in_memory();
        let output = scan_sessions(&root, ScanScope::All, &cache, &CancelFlag::new());
        assert!(output.sessions.is_empty());
        assert_eq!(output.warnings.get(), 0);
    }

    #[test]
    fn cancellation_abandons_queued_files() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        write_session(
            &root.join("2026/02/18/a.jsonl"),
            &[meta_line("a", "2026-02-18T10:00:00Z", "/tmp/p")],
        );

        let cancel = CancelFlag::new();
        cancel.cancel();
        let cache = SessionCache::in_memory();
        let output = scan_sessions(root, ScanScope::All, &cache, &cancel);
        assert!(output.sessions.is_empty());
        assert_eq!(output.stats.parsed_files, 0);
    }

    #[test]
    fn scope_matches_uses_content_dates() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        // Misfiled: directory says March, content says February.
        write_session(
            &root.join("2026/03/01/a.jsonl"),
            &[meta_line("a", "2026-02-18T10:00:00Z", "/tmp/p")],
        );

        let cache = SessionCache::in_memory();
        let output = scan_sessions(root, ScanScope::All, &cache, &CancelFlag::new());
        assert_eq!(output.sessions.len(), 1);

        let summary = &output.sessions[0];
        assert!(scope_matches(summary, ScanScope::Day(date!(2026 - 02 - 18))));
        assert!(!scope_matches(summary, ScanScope::Day(date!(2026 - 03 - 01))));
        assert!(scope_matches(
            summary,
            ScanScope::Month(date!(2026 - 02 - 01))
        ));
        assert!(scope_matches(summary, ScanScope::All));
    }

    #[test]
    fn bulk_helpers_count_without_full_parsing() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();
        write_session(
            &root.join("2026/02/18/a.jsonl"),
            &[meta_line("a", "2026-02-18T10:00:00Z", "/tmp/alpha")],
        );
        write_session(
            &root.join("2026/02/18/b.jsonl"),
            &[meta_line("b", "2026-02-18T11:00:00Z", "/tmp/alpha")],
        );
        write_session(
            &root.join("2026/02/19/c.jsonl"),
            &[meta_line("c", "2026-02-19T11:00:00Z", "/tmp/beta")],
        );
        write_session(&root.join("loose.jsonl"), &[meta_line(
            "d",
            "2026-02-20T11:00:00Z",
            "/tmp/beta",
        )]);

        assert_eq!(count_session_files(root, ScanScope::All), 4);
        assert_eq!(
            count_session_files(root, ScanScope::Day(date!(2026 - 02 - 18))),
            2
        );

        let histogram = cwd_histogram(root, ScanScope::All, &CancelFlag::new());
        assert_eq!(histogram.get("/tmp/alpha"), Some(&2));
        assert_eq!(histogram.get("/tmp/beta"), Some(&2));

        let counts = calendar_counts(root, ScanScope::All);
        assert_eq!(counts.get(&date!(2026 - 02 - 18)), Some(&2));
        assert_eq!(counts.get(&date!(2026 - 02 - 19)), Some(&1));
        // The loose file falls back to its modification date (today).
        assert_eq!(counts.values().sum::<usize>(), 4);
    }
}
