use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Reads up to `max_bytes` from the end of a file. When the window starts
/// mid-file the first (possibly partial) line is dropped so callers only see
/// complete lines. Returns the tail text and the file size.
pub fn read_tail(path: &Path, max_bytes: u64) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let start = size.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buffer = Vec::with_capacity((size - start) as usize);
    file.read_to_end(&mut buffer)?;
    let mut text = String::from_utf8_lossy(&buffer).into_owned();

    if start > 0 {
        match text.find('\n') {
            Some(newline) => {
                text.drain(..=newline);
            }
            None => text.clear(),
        }
    }

    Ok((text, size))
}
