//! JSONL file writer for component logs.
//!
//! Each component writes to its own append-only file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::JsonLogEntry;

/// Writer that appends log entries to `<logs_dir>/<date>_<component>.jsonl`.
pub struct ComponentLogWriter {
    component: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ComponentLogWriter {
    /// Open (or create) today's log file for a component.
    pub fn new(logs_dir: impl AsRef<Path>, component: impl Into<String>) -> std::io::Result<Self> {
        let component = component.into();
        let logs_dir = logs_dir.as_ref();
        fs::create_dir_all(logs_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{}_{}.jsonl", date, component));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            component,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a log entry as a single line.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    /// Flush any buffered data to disk.
    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for ComponentLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every entry from the JSONL files in `logs_dir`, sorted by timestamp.
///
/// Lines that fail to parse are skipped.
pub fn read_all_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<JsonLogEntry>> {
    let logs_dir = logs_dir.as_ref();
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(logs_dir)? {
        let path = dir_entry?.path();
        if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
            let content = fs::read_to_string(&path)?;
            entries.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| JsonLogEntry::from_json_line(line).ok()),
            );
        }
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}
