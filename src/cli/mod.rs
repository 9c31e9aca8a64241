use crate::domain::{
    Actor, DigestOptions, SessionSummary, active_duration_ms, format_unix_ms_rfc3339,
};
use crate::infra::{
    CancelFlag, DigestExporter, LoadTimelineError, ScanScope, SessionCache, calendar_counts,
    count_session_files, cwd_histogram, load_first_instructions, load_session_turns,
    scan_sessions, scope_matches, search_session_file,
};
use humansize::{DECIMAL, format_size};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Date, Month};

const DEFAULT_LIMIT: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Command(CliCommand),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CliCommand {
    Sessions {
        scope: ScanScope,
        offset: usize,
        limit: usize,
        size: bool,
    },
    History {
        target: Option<String>,
        limit: usize,
        stats: bool,
    },
    Instructions {
        target: Option<String>,
    },
    Digest {
        scope: ScanScope,
        options: DigestOptions,
    },
    Stats {
        scope: ScanScope,
        by: StatsBy,
    },
    Find {
        needle: String,
        scope: ScanScope,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatsBy {
    Cwd,
    Day,
    Count,
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidFlagValue { flag: String, value: String },

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut iter = args.iter().skip(1).peekable();
    let Some(subcommand) = iter.next() else {
        return Ok(CliInvocation::Command(CliCommand::Sessions {
            scope: ScanScope::All,
            offset: 0,
            limit: DEFAULT_LIMIT,
            size: false,
        }));
    };

    match subcommand.as_str() {
        "sessions" => {
            let mut scope = ScanScope::All;
            let mut offset = 0usize;
            let mut limit = DEFAULT_LIMIT;
            let mut size = false;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--scope" => scope = parse_scope_flag(iter.next())?,
                    "--offset" => offset = parse_usize_flag("--offset", iter.next())?,
                    "--limit" => limit = parse_usize_flag("--limit", iter.next())?,
                    "--size" => size = true,
                    other => return Err(flag_or_argument_error(other)),
                }
            }
            Ok(CliInvocation::Command(CliCommand::Sessions {
                scope,
                offset,
                limit,
                size,
            }))
        }
        "history" => {
            let mut target: Option<String> = None;
            let mut limit = DEFAULT_LIMIT;
            let mut stats = false;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--limit" => limit = parse_usize_flag("--limit", iter.next())?,
                    "--stats" => stats = true,
                    other if other.starts_with("--") => {
                        return Err(CliParseError::UnknownFlag(other.to_string()));
                    }
                    other => {
                        if target.is_some() {
                            return Err(CliParseError::UnexpectedArgument(other.to_string()));
                        }
                        target = Some(other.to_string());
                    }
                }
            }
            Ok(CliInvocation::Command(CliCommand::History {
                target,
                limit,
                stats,
            }))
        }
        "instructions" => {
            let mut target: Option<String> = None;
            for arg in iter {
                if arg.starts_with("--") {
                    return Err(CliParseError::UnknownFlag(arg.clone()));
                }
                if target.is_some() {
                    return Err(CliParseError::UnexpectedArgument(arg.clone()));
                }
                target = Some(arg.clone());
            }
            Ok(CliInvocation::Command(CliCommand::Instructions { target }))
        }
        "digest" => {
            let mut scope = ScanScope::All;
            let mut options = DigestOptions::default();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--scope" => scope = parse_scope_flag(iter.next())?,
                    "--reasoning" => options.include_reasoning = true,
                    "--tools" => options.include_tool_summaries = true,
                    "--merge" => options.merge_consecutive_assistant = true,
                    "--message-bytes" => {
                        options.max_message_bytes =
                            parse_usize_flag("--message-bytes", iter.next())?;
                    }
                    "--max-bytes" => {
                        options.max_total_bytes = parse_usize_flag("--max-bytes", iter.next())?;
                    }
                    other => return Err(flag_or_argument_error(other)),
                }
            }
            Ok(CliInvocation::Command(CliCommand::Digest { scope, options }))
        }
        "stats" => {
            let mut scope = ScanScope::All;
            let mut by = StatsBy::Day;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--scope" => scope = parse_scope_flag(iter.next())?,
                    "--by" => {
                        let value = iter
                            .next()
                            .ok_or_else(|| CliParseError::MissingFlagValue("--by".to_string()))?;
                        by = match value.as_str() {
                            "cwd" => StatsBy::Cwd,
                            "day" => StatsBy::Day,
                            "count" => StatsBy::Count,
                            _ => {
                                return Err(CliParseError::InvalidFlagValue {
                                    flag: "--by".to_string(),
                                    value: value.clone(),
                                });
                            }
                        };
                    }
                    other => return Err(flag_or_argument_error(other)),
                }
            }
            Ok(CliInvocation::Command(CliCommand::Stats { scope, by }))
        }
        "find" => {
            let mut needle: Option<String> = None;
            let mut scope = ScanScope::All;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--scope" => scope = parse_scope_flag(iter.next())?,
                    other if other.starts_with("--") => {
                        return Err(CliParseError::UnknownFlag(other.to_string()));
                    }
                    other => {
                        if needle.is_some() {
                            return Err(CliParseError::UnexpectedArgument(other.to_string()));
                        }
                        needle = Some(other.to_string());
                    }
                }
            }
            let needle = needle.ok_or(CliParseError::MissingArgument("needle"))?;
            Ok(CliInvocation::Command(CliCommand::Find { needle, scope }))
        }
        other => Err(CliParseError::UnknownSubcommand(other.to_string())),
    }
}

fn flag_or_argument_error(arg: &str) -> CliParseError {
    if arg.starts_with("--") {
        CliParseError::UnknownFlag(arg.to_string())
    } else {
        CliParseError::UnexpectedArgument(arg.to_string())
    }
}

fn parse_usize_flag(flag: &str, value: Option<&String>) -> Result<usize, CliParseError> {
    let value = value.ok_or_else(|| CliParseError::MissingFlagValue(flag.to_string()))?;
    value
        .parse()
        .map_err(|_| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.clone(),
        })
}

fn parse_scope_flag(value: Option<&String>) -> Result<ScanScope, CliParseError> {
    let value = value.ok_or_else(|| CliParseError::MissingFlagValue("--scope".to_string()))?;
    parse_scope_value(value).ok_or_else(|| CliParseError::InvalidFlagValue {
        flag: "--scope".to_string(),
        value: value.clone(),
    })
}

/// Accepts `all`, `today`, `YYYY-MM`, or `YYYY-MM-DD`.
fn parse_scope_value(value: &str) -> Option<ScanScope> {
    match value {
        "all" => return Some(ScanScope::All),
        "today" => return Some(ScanScope::today()),
        _ => {}
    }

    let parts: Vec<&str> = value.split('-').collect();
    let year: i32 = parts.first()?.parse().ok()?;
    let month = Month::try_from(parts.get(1)?.parse::<u8>().ok()?).ok()?;
    match parts.len() {
        2 => Date::from_calendar_date(year, month, 1).ok().map(ScanScope::Month),
        3 => {
            let day: u8 = parts.get(2)?.parse().ok()?;
            Date::from_calendar_date(year, month, day)
                .ok()
                .map(ScanScope::Day)
        }
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    LoadTimeline(#[from] LoadTimelineError),

    #[error("failed to write output: {0}")]
    WriteOutput(#[from] io::Error),
}

pub fn run(
    command: CliCommand,
    sessions_dir: &Path,
    cache: &SessionCache,
) -> Result<(), CliRunError> {
    match command {
        CliCommand::Sessions {
            scope,
            offset,
            limit,
            size,
        } => run_sessions(sessions_dir, cache, scope, offset, limit, size),
        CliCommand::History {
            target,
            limit,
            stats,
        } => run_history(sessions_dir, cache, target.as_deref(), limit, stats),
        CliCommand::Instructions { target } => {
            run_instructions(sessions_dir, cache, target.as_deref())
        }
        CliCommand::Digest { scope, options } => {
            run_digest(sessions_dir, cache, scope, &options)
        }
        CliCommand::Stats { scope, by } => run_stats(sessions_dir, scope, by),
        CliCommand::Find { needle, scope } => run_find(sessions_dir, cache, scope, &needle),
    }
}

fn scoped_sessions(
    sessions_dir: &Path,
    cache: &SessionCache,
    scope: ScanScope,
) -> Vec<SessionSummary> {
    let output = scan_sessions(sessions_dir, scope, cache, &CancelFlag::new());
    if output.warnings.get() > 0 {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "warning: {} file(s) skipped", output.warnings.get());
    }
    // Directory placement is only a coarse filter; match on content dates.
    output
        .sessions
        .into_iter()
        .filter(|summary| scope_matches(summary, scope))
        .collect()
}

fn run_sessions(
    sessions_dir: &Path,
    cache: &SessionCache,
    scope: ScanScope,
    offset: usize,
    limit: usize,
    size: bool,
) -> Result<(), CliRunError> {
    let mut sessions = scoped_sessions(sessions_dir, cache, scope);
    sessions.sort_by_key(|summary| std::cmp::Reverse(summary.updated_at_ms));

    let mut out = io::stdout().lock();
    for summary in sessions.iter().skip(offset).take(limit) {
        let started = summary
            .started_at_ms
            .and_then(format_unix_ms_rfc3339)
            .unwrap_or_else(|| "-".to_string());
        if size {
            writeln!(
                out,
                "{started}\t{}\t{}\t{}\t{}",
                summary.id,
                summary.cwd.display(),
                format_size(summary.file_size_bytes, DECIMAL),
                summary.log_path.display()
            )?;
        } else {
            writeln!(
                out,
                "{started}\t{}\t{}\t{}",
                summary.id,
                summary.cwd.display(),
                summary.log_path.display()
            )?;
        }
    }
    Ok(())
}

fn resolve_history_target(
    sessions_dir: &Path,
    cache: &SessionCache,
    target: Option<&str>,
) -> Result<PathBuf, CliRunError> {
    if let Some(target) = target {
        let as_path = Path::new(target);
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
    }

    let mut sessions = scoped_sessions(sessions_dir, cache, ScanScope::All);
    sessions.sort_by_key(|summary| std::cmp::Reverse(summary.updated_at_ms));

    match target {
        None => sessions
            .first()
            .map(|summary| summary.log_path.clone())
            .ok_or_else(|| CliRunError::SessionNotFound("(no sessions)".to_string())),
        Some(target) => sessions
            .iter()
            .find(|summary| summary.id == target || summary.id.starts_with(target))
            .map(|summary| summary.log_path.clone())
            .ok_or_else(|| CliRunError::SessionNotFound(target.to_string())),
    }
}

fn run_history(
    sessions_dir: &Path,
    cache: &SessionCache,
    target: Option<&str>,
    limit: usize,
    stats: bool,
) -> Result<(), CliRunError> {
    let log_path = resolve_history_target(sessions_dir, cache, target)?;
    let turns = load_session_turns(&log_path)?;

    let mut out = io::stdout().lock();
    for turn in turns.iter().take(limit) {
        if let Some(user) = &turn.user {
            write_event_row(&mut out, user)?;
        }
        for event in &turn.outputs {
            write_event_row(&mut out, event)?;
        }
    }

    if stats {
        let mut err = io::stderr().lock();
        let active = match active_duration_ms(&turns) {
            Some(ms) => format!("{ms}ms"),
            None => "no data".to_string(),
        };
        writeln!(err, "turns: {}\tactive: {active}", turns.len())?;
    }
    Ok(())
}

fn write_event_row(
    out: &mut impl Write,
    event: &crate::domain::TimelineEvent,
) -> Result<(), CliRunError> {
    let timestamp = event
        .timestamp_ms
        .and_then(format_unix_ms_rfc3339)
        .unwrap_or_else(|| "-".to_string());
    let label = match event.actor {
        Actor::User => "user",
        Actor::Assistant => "assistant",
        Actor::Info => event.title.as_deref().unwrap_or("info"),
    };
    let first_line = event
        .text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("(no text)");
    let repeat = if event.repeat > 1 {
        format!(" (x{})", event.repeat)
    } else {
        String::new()
    };
    writeln!(out, "{timestamp}\t{label}\t{first_line}{repeat}")?;
    Ok(())
}

fn run_digest(
    sessions_dir: &Path,
    cache: &SessionCache,
    scope: ScanScope,
    options: &DigestOptions,
) -> Result<(), CliRunError> {
    let sessions = scoped_sessions(sessions_dir, cache, scope);
    let exporter = DigestExporter::default();
    let digest = exporter.render(&sessions, options, &CancelFlag::new());

    let mut out = io::stdout().lock();
    write!(out, "{digest}")?;
    Ok(())
}

fn run_instructions(
    sessions_dir: &Path,
    cache: &SessionCache,
    target: Option<&str>,
) -> Result<(), CliRunError> {
    let log_path = resolve_history_target(sessions_dir, cache, target)?;
    let mut out = io::stdout().lock();
    match load_first_instructions(&log_path)? {
        Some(instructions) => writeln!(out, "{instructions}")?,
        None => writeln!(out, "(no instructions)")?,
    }
    Ok(())
}

fn run_stats(sessions_dir: &Path, scope: ScanScope, by: StatsBy) -> Result<(), CliRunError> {
    let mut out = io::stdout().lock();
    match by {
        StatsBy::Count => {
            writeln!(out, "{}", count_session_files(sessions_dir, scope))?;
        }
        StatsBy::Cwd => {
            for (cwd, count) in cwd_histogram(sessions_dir, scope, &CancelFlag::new()) {
                writeln!(out, "{count}\t{cwd}")?;
            }
        }
        StatsBy::Day => {
            for (date, count) in calendar_counts(sessions_dir, scope) {
                writeln!(out, "{date}\t{count}")?;
            }
        }
    }
    Ok(())
}

fn run_find(
    sessions_dir: &Path,
    cache: &SessionCache,
    scope: ScanScope,
    needle: &str,
) -> Result<(), CliRunError> {
    let sessions = scoped_sessions(sessions_dir, cache, scope);
    let mut out = io::stdout().lock();
    for summary in sessions {
        let Ok(matches) = search_session_file(&summary.log_path, needle) else {
            continue;
        };
        for (line_no, line) in matches {
            let snippet: String = line.trim().chars().take(160).collect();
            writeln!(out, "{}:{line_no}\t{snippet}", summary.log_path.display())?;
        }
    }
    Ok(())
}

pub fn print_help() {
    let text = format!(
        "{name} - index and digest CLI-assistant session logs\n\nUSAGE:\n  {name} sessions [--scope S] [--limit N] [--offset N] [--size]   List sessions (default command)\n  {name} history [log-path|session-id] [--limit N] [--stats]      Print a session timeline (defaults to latest)\n  {name} instructions [log-path|session-id]                       Print the session's first instructions\n  {name} digest [--scope S] [--max-bytes N] [--message-bytes N] [--merge] [--reasoning] [--tools]\n                                                                  Render a Markdown digest of the scoped sessions\n  {name} stats [--scope S] [--by cwd|day|count]                   Aggregate counts over the scoped tree\n  {name} find NEEDLE [--scope S]                                  Substring scan over raw log lines\n  {name} --help | --version\n\nSCOPE:\n  --scope VALUE  all | today | YYYY-MM | YYYY-MM-DD (default: all)\n\nOUTPUT:\n  sessions: started_at<TAB>session_id<TAB>cwd<TAB>log_path (with --size adds a size column)\n  history:  timestamp<TAB>actor<TAB>first_line\n\nENV:\n  ROLLBOX_SESSIONS_DIR  Override the session log root (default: ~/.codex/sessions)\n  ROLLBOX_STATE_DIR     Override the state dir holding the summary cache (default: ~/.rollbox)\n",
        name = env!("CARGO_PKG_NAME")
    );
    let mut out = io::stdout().lock();
    let _ = write!(out, "{text}");
}
