use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use parking_lot::Mutex;

pub trait Logger: Send + Sync {
    fn call(&self, _op: &str, _peer: &str) {}
    fn transfer_done(&self, _op: &str, _path: &Path, _bytes: u64) {}
    fn cleanup_failed(&self, _path: &Path, _msg: &str) {}
    fn error(&self, _op: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

fn open_append<P: AsRef<Path>>(path: P) -> Result<File> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent).ok();
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn call_line(op: &str, peer: &str) -> String {
    format!("{:<12} called from: {}", op, peer)
}

/// Timestamped lines on stderr; the daemon's default sink.
pub struct StderrLogger;

impl StderrLogger {
    fn line(&self, s: &str) {
        eprintln!("[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for StderrLogger {
    fn call(&self, op: &str, peer: &str) {
        self.line(&call_line(op, peer));
    }
    fn transfer_done(&self, op: &str, path: &Path, bytes: u64) {
        self.line(&format!("{:<12} done path={} bytes={}", op, path.display(), bytes));
    }
    fn cleanup_failed(&self, path: &Path, msg: &str) {
        self.line(&format!("CLEANUP path={} msg={}", path.display(), msg));
    }
    fn error(&self, op: &str, msg: &str) {
        self.line(&format!("{:<12} error: {}", op, msg));
    }
}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(open_append(path)?),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn call(&self, op: &str, peer: &str) {
        self.line(&call_line(op, peer));
    }
    fn transfer_done(&self, op: &str, path: &Path, bytes: u64) {
        self.line(&format!("DONE op={} path={} bytes={}", op, path.display(), bytes));
    }
    fn cleanup_failed(&self, path: &Path, msg: &str) {
        self.line(&format!("CLEANUP path={} msg={}", path.display(), msg));
    }
    fn error(&self, op: &str, msg: &str) {
        self.line(&format!("ERROR op={} msg={}", op, msg));
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    Call,
    Done,
    CleanupFailed,
    Error,
}

#[derive(Serialize, Debug)]
pub struct JournalEntry<'a> {
    pub timestamp: String,
    pub event: JournalEvent,
    pub op: Option<&'a str>,
    pub peer: Option<&'a str>,
    pub path: Option<String>,
    pub bytes: Option<u64>,
    pub error: Option<&'a str>,
}

impl<'a> JournalEntry<'a> {
    fn new(event: JournalEvent) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event,
            op: None,
            peer: None,
            path: None,
            bytes: None,
            error: None,
        }
    }
}

/// JSONL journal, one record per event.
pub struct JournalLogger {
    file: Mutex<File>,
}

impl JournalLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(open_append(path)?),
        })
    }

    fn record(&self, entry: &JournalEntry<'_>) {
        let mut f = self.file.lock();
        if serde_json::to_writer(&mut *f, entry).is_ok() {
            let _ = f.write_all(b"\n");
        }
    }
}

impl Logger for JournalLogger {
    fn call(&self, op: &str, peer: &str) {
        let mut e = JournalEntry::new(JournalEvent::Call);
        e.op = Some(op);
        e.peer = Some(peer);
        self.record(&e);
    }
    fn transfer_done(&self, op: &str, path: &Path, bytes: u64) {
        let mut e = JournalEntry::new(JournalEvent::Done);
        e.op = Some(op);
        e.path = Some(path.display().to_string());
        e.bytes = Some(bytes);
        self.record(&e);
    }
    fn cleanup_failed(&self, path: &Path, msg: &str) {
        let mut e = JournalEntry::new(JournalEvent::CleanupFailed);
        e.path = Some(path.display().to_string());
        e.error = Some(msg);
        self.record(&e);
    }
    fn error(&self, op: &str, msg: &str) {
        let mut e = JournalEntry::new(JournalEvent::Error);
        e.op = Some(op);
        e.error = Some(msg);
        self.record(&e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_text_logger_appends_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs/gotd.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.call("ListFile", "127.0.0.1:5000");
        logger.error("UploadFile", "disk full");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("ListFile     called from: 127.0.0.1:5000"));
        assert!(lines[1].contains("ERROR op=UploadFile msg=disk full"));
    }

    #[test]
    fn test_journal_records_are_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        let logger = JournalLogger::new(&path).unwrap();
        logger.transfer_done("DownloadFile", Path::new("data"), 4097);
        logger.cleanup_failed(Path::new("data-x.tar"), "busy");
        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["event"], "done");
        assert_eq!(records[0]["bytes"], 4097);
        assert_eq!(records[1]["event"], "cleanup_failed");
        assert_eq!(records[1]["error"], "busy");
    }
}
