//! App log storage
//!
//! Log lines are keyed by their timestamp rendered as fixed-width RFC 3339
//! UTC text with nanoseconds (`2024-05-01T12:00:00.000000001Z`). Keys of that
//! shape sort lexicographically in time order, so "logs since T" is a range
//! query over the key space. Storing a line under an existing key replaces
//! it.

use crate::error::{Result, StorageError};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Store kind backed by a JSON-lines file
pub const FILE_KIND: &str = "file";
/// Store kind kept in memory
pub const MEMORY_KIND: &str = "memory";

/// Timestamped log lines of one app
pub trait LogStore: Send + Sync {
    /// Save `line` under timestamp `t`
    fn store(&self, t: DateTime<Utc>, line: &str) -> Result<()>;

    /// Lines stored at or after `t`, oldest first
    fn logs_since(&self, t: DateTime<Utc>) -> Result<Vec<String>>;
}

/// Render a timestamp as a store key
pub fn log_key(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Open a store of the given kind for `app`
///
/// # Errors
///
/// [`StorageError::UnknownKind`] for kinds other than `"file"` and
/// `"memory"`; file errors for the file kind.
pub fn new_log_store(path: &Path, app: &str, kind: &str) -> Result<Arc<dyn LogStore>> {
    match kind {
        FILE_KIND => Ok(Arc::new(FileLogStore::open(path, app)?)),
        MEMORY_KIND => Ok(Arc::new(MemoryLogStore::new())),
        other => Err(StorageError::UnknownKind(other.to_string()).into()),
    }
}

/// [`LogStore`] kept in process memory
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    logs: Mutex<BTreeMap<String, String>>,
}

impl MemoryLogStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn store(&self, t: DateTime<Utc>, line: &str) -> Result<()> {
        self.logs.lock().insert(log_key(&t), line.to_string());
        Ok(())
    }

    fn logs_since(&self, t: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .logs
            .lock()
            .range(log_key(&t)..)
            .map(|(_, line)| line.clone())
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    app: String,
    ts: String,
    line: String,
}

struct FileState {
    file: File,
    index: BTreeMap<String, String>,
}

/// [`LogStore`] appending to a JSON-lines file
///
/// Several apps may share one file; each record carries its app name and a
/// store only sees its own app's records. The file is opened once and kept
/// open; every record is written with a single append under the store's
/// lock.
pub struct FileLogStore {
    path: PathBuf,
    app: String,
    state: Mutex<FileState>,
}

impl FileLogStore {
    /// Open (or create) the store at `path` for `app`
    ///
    /// A torn record at the end of the file, left by an interrupted write,
    /// is cut off. Any other unparsable record is an error.
    pub fn open(path: &Path, app: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StorageError::from)?;
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StorageError::Io(e).into()),
        };

        let complete = match contents.rfind('\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        if complete < contents.len() {
            warn!(path = %path.display(), "Dropping torn log record");
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(StorageError::from)?;
            file.set_len(complete as u64).map_err(StorageError::from)?;
        }

        let mut index = BTreeMap::new();
        for (idx, line) in contents[..complete].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord =
                serde_json::from_str(line).map_err(|e| StorageError::CorruptRecord {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            if record.app == app {
                index.insert(record.ts, record.line);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StorageError::from)?;
        debug!(path = %path.display(), app, records = index.len(), "Opened log store");

        Ok(Self {
            path: path.to_path_buf(),
            app: app.to_string(),
            state: Mutex::new(FileState { file, index }),
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStore for FileLogStore {
    fn store(&self, t: DateTime<Utc>, line: &str) -> Result<()> {
        let record = LogRecord {
            app: self.app.clone(),
            ts: log_key(&t),
            line: line.to_string(),
        };
        let mut bytes = serde_json::to_vec(&record).map_err(StorageError::from)?;
        bytes.push(b'\n');

        let mut state = self.state.lock();
        append_record(&mut state.file, &bytes).map_err(StorageError::from)?;
        state.index.insert(record.ts, record.line);
        Ok(())
    }

    fn logs_since(&self, t: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .index
            .range(log_key(&t)..)
            .map(|(_, line)| line.clone())
            .collect())
    }
}

/// A file that can be cut back to an earlier length
trait AppendTarget: Write {
    fn end(&self) -> io::Result<u64>;
    fn cut(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn cut(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

// Write one record or nothing: a failed write is cut off again so later
// records never land behind a torn one.
fn append_record<F: AppendTarget>(file: &mut F, bytes: &[u8]) -> io::Result<()> {
    let before = file.end()?;
    let written = file.write_all(bytes).and_then(|_| file.flush());
    if let Err(e) = written {
        if let Err(undo) = file.cut(before) {
            warn!(error = %undo, "Failed to drop partial log record");
        }
        return Err(e);
    }
    Ok(())
}

/// [`io::Write`] adapter storing every write as one line stamped with the
/// current time
pub struct LogWriter {
    store: Arc<dyn LogStore>,
}

impl LogWriter {
    /// Wrap a store
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.store
            .store(Utc::now(), text.trim_end_matches(|c| c == '\r' || c == '\n'))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fill(store: &dyn LogStore) {
        for i in 0..3 {
            store
                .store(base() + Duration::seconds(i), &format!("line {}", i))
                .unwrap();
        }
    }

    #[test]
    fn test_keys_are_fixed_width() {
        let whole = log_key(&base());
        let nanos = log_key(&(base() + Duration::nanoseconds(1)));
        assert_eq!(whole, "2024-05-01T12:00:00.000000000Z");
        assert_eq!(whole.len(), nanos.len());
        assert!(whole < nanos);
    }

    #[test]
    fn test_logs_since_exact_and_between() {
        let store = MemoryLogStore::new();
        fill(&store);

        assert_eq!(
            store.logs_since(base() + Duration::seconds(1)).unwrap(),
            vec!["line 1", "line 2"]
        );
        assert_eq!(
            store.logs_since(base() + Duration::milliseconds(500)).unwrap(),
            vec!["line 1", "line 2"]
        );
        assert_eq!(store.logs_since(base() - Duration::days(1)).unwrap().len(), 3);
        assert!(store.logs_since(base() + Duration::days(1)).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("apps.jsonl");

        {
            let store = FileLogStore::open(&path, "chat").unwrap();
            fill(&store);
            let other = FileLogStore::open(&path, "ssh").unwrap();
            other.store(base(), "ssh line").unwrap();
        }

        let store = FileLogStore::open(&path, "chat").unwrap();
        assert_eq!(
            store.logs_since(base() + Duration::milliseconds(1)).unwrap(),
            vec!["line 1", "line 2"]
        );
        assert_eq!(store.logs_since(base()).unwrap().len(), 3);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apps.jsonl");
        {
            let store = FileLogStore::open(&path, "chat").unwrap();
            store.store(base(), "kept").unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"app\":\"chat\",\"ts\":").unwrap();
        drop(file);

        let store = FileLogStore::open(&path, "chat").unwrap();
        store.store(base() + Duration::seconds(1), "after").unwrap();
        drop(store);

        let store = FileLogStore::open(&path, "chat").unwrap();
        assert_eq!(store.logs_since(base()).unwrap(), vec!["kept", "after"]);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("apps.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        assert!(FileLogStore::open(&path, "chat").is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let dir = TempDir::new().unwrap();
        let err = new_log_store(&dir.path().join("x"), "chat", "bbolt")
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "no log store of type bbolt");
    }

    #[test]
    fn test_writer_stores_lines() {
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let mut writer = LogWriter::new(store.clone());
        writer.write_all(b"hello\n").unwrap();

        let logs = store.logs_since(Utc::now() - Duration::minutes(1)).unwrap();
        assert_eq!(logs, vec!["hello"]);
    }

    /// Accepts `room` bytes, then fails
    struct ShortFile {
        data: Vec<u8>,
        room: usize,
    }

    impl Write for ShortFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.room);
            self.data.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendTarget for ShortFile {
        fn end(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn cut(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_record() {
        let mut file = ShortFile {
            data: b"{\"earlier\":1}\n".to_vec(),
            room: 5,
        };
        assert!(append_record(&mut file, b"{\"later\":2}\n").is_err());
        assert_eq!(file.data, b"{\"earlier\":1}\n");

        file.room = 64;
        append_record(&mut file, b"{\"later\":2}\n").unwrap();
        assert_eq!(file.data, b"{\"earlier\":1}\n{\"later\":2}\n");
    }
}
