use crate::domain::{
    ConversationTurn, LogRecord, build_turns, clean_instructions, decode_log_line,
};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadTimelineError {
    #[error("failed to open session file: {0}")]
    OpenFile(#[from] io::Error),
}

/// Full-parse timeline reconstruction. Always re-reads the whole file; no
/// incremental state is carried between requests.
pub fn load_session_turns(path: &Path) -> Result<Vec<ConversationTurn>, LoadTimelineError> {
    let records = read_records(path)?;
    Ok(build_turns(records))
}

/// Stops at the first session_meta row with non-empty cleaned instructions,
/// without building a timeline.
pub fn load_first_instructions(path: &Path) -> Result<Option<String>, LoadTimelineError> {
    let file = open_session_file(path)?;
    let reader = BufReader::new(file);
    for line_result in reader.lines() {
        let Ok(line) = line_result else {
            break;
        };
        let Some(LogRecord::SessionMeta(meta)) = decode_log_line(&line) else {
            continue;
        };
        if let Some(raw) = meta.instructions.as_deref() {
            let cleaned = clean_instructions(raw);
            if !cleaned.is_empty() {
                return Ok(Some(cleaned));
            }
        }
    }
    Ok(None)
}

/// Plain linear substring scan over raw log lines. Deliberately not part of
/// the indexing machinery.
pub fn search_session_file(
    path: &Path,
    needle: &str,
) -> Result<Vec<(u64, String)>, LoadTimelineError> {
    let file = open_session_file(path)?;
    let reader = BufReader::new(file);

    let mut matches = Vec::new();
    let mut line_no: u64 = 0;
    for line_result in reader.lines() {
        let Ok(line) = line_result else {
            break;
        };
        line_no += 1;
        if line.contains(needle) {
            matches.push((line_no, line));
        }
    }
    Ok(matches)
}

fn read_records(path: &Path) -> Result<Vec<LogRecord>, LoadTimelineError> {
    let file = open_session_file(path)?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for line_result in reader.lines() {
        let Ok(line) = line_result else {
            break;
        };
        if let Some(record) = decode_log_line(&line) {
            records.push(record);
        }
    }
    Ok(records)
}

fn open_session_file(path: &Path) -> Result<File, LoadTimelineError> {
    if path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::IsADirectory,
            format!("path is a directory: {}", path.display()),
        )
        .into());
    }
    Ok(File::open(path)?)
}
