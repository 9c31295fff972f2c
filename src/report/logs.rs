//! Build-log post-processing for report embedding.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// How many trailing non-blank lines a report embeds per failed build.
pub const TAIL_LINES: usize = 30;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("static pattern compiles")
});

/// Removes ANSI escape sequences from builder output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// The last `lines` non-blank lines of a log file.
///
/// Reads at most `lines` KiB from the end of the file; missing or
/// unreadable logs yield an empty string.
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let Ok(end) = file.seek(SeekFrom::End(0)) else {
        return String::new();
    };
    let window = (lines as u64) * 1024;
    let start = end.saturating_sub(window);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let tail: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let skip = tail.len().saturating_sub(lines);
    tail[skip..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[31merror\x1b[0m: boom"), "error: boom");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn log_tail_returns_trailing_non_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");
        let mut content = String::new();
        for i in 0..100 {
            content.push_str(&format!("line {i}\n\n"));
        }
        std::fs::write(&path, &content).unwrap();

        let tail = log_tail(&path, 3);
        assert_eq!(tail, "line 97\nline 98\nline 99");
    }

    #[test]
    fn log_tail_of_missing_file_is_empty() {
        assert_eq!(log_tail(Path::new("/no/such/log"), 30), "");
    }

    #[test]
    fn log_tail_handles_short_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.log");
        std::fs::write(&path, "only line\n").unwrap();
        assert_eq!(log_tail(&path, 30), "only line");
    }
}
