//! # ha-storage
//!
//! why: provide the durability boundary for the replicated log and the raft state record
//! relations: used by ha-core's log store, which mirrors it in memory and writes through
//! what: LogEntry and RaftStateRecord records, Storage trait, FileStorage journal, InMemoryStorage for testing

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the single raft state record kept next to the log.
pub const RAFT_STATE_KEY: &str = "raft_state";

/// A single record of the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Dense, strictly increasing position in this server's log
    pub index: u64,
    /// The term when this entry was created
    pub term: u32,
    /// Index of the preceding entry
    pub prev_index: u64,
    /// Term of the preceding entry
    pub prev_term: u32,
    /// The command to be applied to the state machine
    pub command: String,
    /// Unix timestamp of application, 0 while the entry is stored but not applied
    #[serde(default)]
    pub applied_at: i64,
    /// Position in the federated log, only for entries that propagate to child zones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_index: Option<u64>,
}

impl LogEntry {
    /// Create a new, not yet applied, log entry
    pub fn new(index: u64, term: u32, prev_index: u64, prev_term: u32, command: impl Into<String>) -> Self {
        Self {
            index,
            term,
            prev_index,
            prev_term,
            command: command.into(),
            applied_at: 0,
            federated_index: None,
        }
    }

    /// The synthetic bootstrap record stored at index 0.
    ///
    /// It is born applied so the apply cursor starts past it.
    pub fn sentinel(applied_at: i64) -> Self {
        Self {
            applied_at: applied_at.max(1),
            ..Self::new(0, 0, 0, 0, "")
        }
    }

    pub fn with_federated_index(mut self, federated_index: Option<u64>) -> Self {
        self.federated_index = federated_index;
        self
    }

    pub fn is_applied(&self) -> bool {
        self.applied_at != 0
    }

    pub fn is_sentinel(&self) -> bool {
        self.index == 0
    }
}

/// Persisted election state: current term and the vote cast in it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStateRecord {
    pub term: u32,
    pub voted_for: Option<u64>,
}

/// Everything recovered from a backing store on startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedLog {
    pub raft_state: RaftStateRecord,
    /// entries in index order
    pub entries: Vec<LogEntry>,
}

/// trait for durable storage of the log table and the raft state record
///
/// both live in the same store so they are recovered together on startup.
/// implementations:
/// - journal file on disk (production)
/// - in-memory (testing)
pub trait Storage: Send {
    /// load everything persisted so far (for crash recovery)
    fn load(&self) -> io::Result<PersistedLog>;

    /// persist the current term and voted_for
    fn save_raft_state(&mut self, state: &RaftStateRecord) -> io::Result<()>;

    /// insert an entry, replacing any entry already stored at its index
    fn put_entry(&mut self, entry: &LogEntry) -> io::Result<()>;

    /// record the application timestamp of an entry
    fn mark_applied(&mut self, index: u64, applied_at: i64) -> io::Result<()>;

    /// truncate log from given index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// delete the given entries (purge)
    fn delete_entries(&mut self, indices: &[u64]) -> io::Result<()>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

// -- journal records --

/// one line of the on-disk journal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Put { entry: LogEntry },
    Applied { index: u64, at: i64 },
    Truncate { from: u64 },
    Delete { indices: Vec<u64> },
    State { name: String, term: u32, voted_for: Option<u64> },
}

/// in-memory image of a store, rebuilt by replaying journal records
#[derive(Debug, Default)]
struct LogImage {
    raft_state: RaftStateRecord,
    entries: BTreeMap<u64, LogEntry>,
}

impl LogImage {
    fn replay(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Put { entry } => {
                self.entries.insert(entry.index, entry);
            }
            JournalRecord::Applied { index, at } => {
                if let Some(entry) = self.entries.get_mut(&index) {
                    entry.applied_at = at;
                }
            }
            JournalRecord::Truncate { from } => {
                self.entries.retain(|&index, _| index < from);
            }
            JournalRecord::Delete { indices } => {
                for index in indices {
                    self.entries.remove(&index);
                }
            }
            JournalRecord::State { term, voted_for, .. } => {
                self.raft_state = RaftStateRecord { term, voted_for };
            }
        }
    }

    fn snapshot(&self) -> PersistedLog {
        PersistedLog {
            raft_state: self.raft_state,
            entries: self.entries.values().cloned().collect(),
        }
    }

    fn clear(&mut self) {
        self.raft_state = RaftStateRecord::default();
        self.entries.clear();
    }
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

// -- file storage implementation --

/// journal records written before compaction is considered
const COMPACT_MIN_RECORDS: usize = 1024;

/// file-based storage implementation using std::fs
///
/// stores state in a directory with a single `journal.jsonl`: one json record
/// per line, each flushed to disk before the call returns. the journal is
/// replayed on open and rewritten (temp file then rename) once dead records
/// outnumber live ones.
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// append handle on the journal
    journal: File,
    image: LogImage,
    /// records currently in the journal file
    records: usize,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist and replays any existing journal
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (image, records, torn) = Self::replay(&Self::journal_path_in(&dir))?;
        let journal = Self::open_append(&Self::journal_path_in(&dir))?;

        let mut storage = Self {
            dir,
            journal,
            image,
            records,
        };

        // drop the torn tail so later appends start on a clean line
        if torn {
            storage.compact()?;
        }

        Ok(storage)
    }

    /// get the directory this storage lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// number of records currently in the journal file
    pub fn journal_records(&self) -> usize {
        self.records
    }

    fn journal_path_in(dir: &Path) -> PathBuf {
        dir.join("journal.jsonl")
    }

    fn journal_path(&self) -> PathBuf {
        Self::journal_path_in(&self.dir)
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// replay the journal; returns the image, the record count and whether a torn tail was skipped
    fn replay(path: &Path) -> io::Result<(LogImage, usize, bool)> {
        let mut image = LogImage::default();
        if !path.exists() {
            return Ok((image, 0, false));
        }

        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut records = 0;
        let mut torn = false;

        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => {
                    image.replay(record);
                    records += 1;
                }
                // a crash mid-write can only leave the last line incomplete
                Err(e) if i + 1 == lines.len() => {
                    warn!(path = %path.display(), error = %e, "skipping torn journal tail");
                    torn = true;
                }
                Err(e) => return Err(invalid_data(e)),
            }
        }

        Ok((image, records, torn))
    }

    fn write_record(&mut self, record: &JournalRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(invalid_data)?;
        line.push('\n');

        self.journal.write_all(line.as_bytes())?;
        self.journal.sync_data()?;
        self.records += 1;
        Ok(())
    }

    fn maybe_compact(&mut self) -> io::Result<()> {
        let live = self.image.entries.len() + 1;
        if self.records > COMPACT_MIN_RECORDS && self.records > 2 * live {
            self.compact()?;
        }
        Ok(())
    }

    /// rewrite the journal so it holds exactly one record per live item
    pub fn compact(&mut self) -> io::Result<()> {
        let mut records = vec![JournalRecord::State {
            name: RAFT_STATE_KEY.to_string(),
            term: self.image.raft_state.term,
            voted_for: self.image.raft_state.voted_for,
        }];
        records.extend(
            self.image
                .entries
                .values()
                .map(|entry| JournalRecord::Put { entry: entry.clone() }),
        );

        let mut buf = String::new();
        for record in &records {
            buf.push_str(&serde_json::to_string(record).map_err(invalid_data)?);
            buf.push('\n');
        }

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("journal.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.journal_path())?;

        self.journal = Self::open_append(&self.journal_path())?;
        debug!(before = self.records, after = records.len(), "compacted journal");
        self.records = records.len();
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load(&self) -> io::Result<PersistedLog> {
        Ok(self.image.snapshot())
    }

    fn save_raft_state(&mut self, state: &RaftStateRecord) -> io::Result<()> {
        self.write_record(&JournalRecord::State {
            name: RAFT_STATE_KEY.to_string(),
            term: state.term,
            voted_for: state.voted_for,
        })?;
        self.image.raft_state = *state;
        self.maybe_compact()
    }

    fn put_entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        let record = JournalRecord::Put { entry: entry.clone() };
        self.write_record(&record)?;
        self.image.replay(record);
        Ok(())
    }

    fn mark_applied(&mut self, index: u64, applied_at: i64) -> io::Result<()> {
        let record = JournalRecord::Applied { index, at: applied_at };
        self.write_record(&record)?;
        self.image.replay(record);
        self.maybe_compact()
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        let record = JournalRecord::Truncate { from: from_index };
        self.write_record(&record)?;
        self.image.replay(record);
        self.maybe_compact()
    }

    fn delete_entries(&mut self, indices: &[u64]) -> io::Result<()> {
        if indices.is_empty() {
            return Ok(());
        }

        let record = JournalRecord::Delete {
            indices: indices.to_vec(),
        };
        self.write_record(&record)?;
        self.image.replay(record);
        self.maybe_compact()
    }

    fn clear(&mut self) -> io::Result<()> {
        self.image.clear();
        self.journal = File::create(self.journal_path())?;
        self.journal.sync_all()?;
        self.journal = Self::open_append(&self.journal_path())?;
        self.records = 0;
        Ok(())
    }
}

// -- in-memory storage implementation --

#[derive(Default)]
struct MemoryInner {
    image: LogImage,
    fail_writes: bool,
}

/// in-memory storage for testing
///
/// clones share the same state, so handing a clone to a new log store
/// simulates a process restart over the same data.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// make every following write fail with an io error (fault injection)
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    fn write<F: FnOnce(&mut LogImage)>(&self, f: F) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        f(&mut inner.image);
        Ok(())
    }
}

impl Storage for InMemoryStorage {
    fn load(&self) -> io::Result<PersistedLog> {
        Ok(self.inner.lock().image.snapshot())
    }

    fn save_raft_state(&mut self, state: &RaftStateRecord) -> io::Result<()> {
        self.write(|image| image.raft_state = *state)
    }

    fn put_entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        let entry = entry.clone();
        self.write(|image| image.replay(JournalRecord::Put { entry }))
    }

    fn mark_applied(&mut self, index: u64, applied_at: i64) -> io::Result<()> {
        self.write(|image| image.replay(JournalRecord::Applied { index, at: applied_at }))
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.write(|image| image.replay(JournalRecord::Truncate { from: from_index }))
    }

    fn delete_entries(&mut self, indices: &[u64]) -> io::Result<()> {
        let indices = indices.to_vec();
        self.write(|image| image.replay(JournalRecord::Delete { indices }))
    }

    fn clear(&mut self) -> io::Result<()> {
        self.inner.lock().image.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u32, command: &str) -> LogEntry {
        LogEntry::new(index, term, index.saturating_sub(1), term, command)
    }

    #[test]
    fn in_memory_storage_persists_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage
            .save_raft_state(&RaftStateRecord { term: 5, voted_for: Some(2) })
            .unwrap();
        let state = storage.load().unwrap().raft_state;

        assert_eq!(state.term, 5);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn in_memory_clones_share_state() {
        let mut storage = InMemoryStorage::new();
        let restarted = storage.clone();

        storage.put_entry(&entry(1, 1, "a")).unwrap();

        assert_eq!(restarted.load().unwrap().entries.len(), 1);
    }

    #[test]
    fn in_memory_injected_failure_is_reported() {
        let mut storage = InMemoryStorage::new();
        storage.set_fail_writes(true);

        assert!(storage.put_entry(&entry(1, 1, "a")).is_err());
        assert!(storage.load().unwrap().entries.is_empty());
    }

    #[test]
    fn put_replaces_existing_index() {
        let mut storage = InMemoryStorage::new();

        storage.put_entry(&entry(1, 1, "old")).unwrap();
        storage.put_entry(&entry(1, 2, "new")).unwrap();

        let log = storage.load().unwrap().entries;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].command, "new");
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .save_raft_state(&RaftStateRecord { term: 10, voted_for: Some(1) })
                .unwrap();
            storage.put_entry(&entry(1, 10, "command")).unwrap();
            storage.mark_applied(1, 1_700_000_000).unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let persisted = storage.load().unwrap();

            assert_eq!(persisted.raft_state.term, 10);
            assert_eq!(persisted.raft_state.voted_for, Some(1));
            assert_eq!(persisted.entries.len(), 1);
            assert_eq!(persisted.entries[0].applied_at, 1_700_000_000);
        }
    }

    #[test]
    fn file_storage_skips_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.put_entry(&entry(1, 1, "a")).unwrap();
            storage.put_entry(&entry(2, 1, "b")).unwrap();
        }

        let path = dir.path().join("journal.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"put\",\"entry\":{\"ind").unwrap();
        drop(file);

        let mut storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load().unwrap().entries.len(), 2);

        // the journal is clean again and accepts appends
        storage.put_entry(&entry(3, 1, "c")).unwrap();
        let reopened = FileStorage::new(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap().entries.len(), 3);
    }

    #[test]
    fn file_storage_rejects_corruption_in_the_middle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        fs::write(&path, "garbage\n{\"op\":\"truncate\",\"from\":1}\n").unwrap();

        let err = FileStorage::new(dir.path()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn compaction_keeps_live_state() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        for i in 1..=20 {
            storage.put_entry(&entry(i, 1, "x")).unwrap();
            storage.mark_applied(i, 100 + i as i64).unwrap();
        }
        storage.delete_entries(&(1..=15).collect::<Vec<_>>()).unwrap();
        storage.compact().unwrap();

        assert_eq!(storage.journal_records(), 6);
        let reopened = FileStorage::new(dir.path()).unwrap();
        let log = reopened.load().unwrap().entries;
        assert_eq!(log.len(), 5);
        assert_eq!(log[0].index, 16);
        assert_eq!(log[0].applied_at, 116);
    }
}
