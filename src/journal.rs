//! Event journal, transactional outbox storage, and snapshots.
//!
//! Every append is one atomic commit that contains the new events *and* one
//! [`OutboxRecord`] per event. Either both become visible or neither does,
//! which is what lets the outbox publisher deliver at-least-once without a
//! distributed transaction.
//!
//! Two backends share one in-memory index:
//!
//! - [`MemoryJournal`]: the index alone. For tests and single-process use.
//! - [`FileJournal`]: the index rebuilt from `journal.jsonl` on open. Each
//!   commit and each outbox delivery is one JSON line, fsynced before the
//!   call returns. A torn final line (crash mid-write) is discarded on open.
//!   Snapshots live at `snapshots/<aggregate_type>/<hex key>.json` and are
//!   written via temp file + rename.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::JournalError;
use crate::event::{NewEvent, StoredEvent, StreamId, now_millis};
use crate::outbox::OutboxRecord;

/// A point-in-time snapshot of an aggregate's state.
///
/// `sequence` is the last sequence number folded into `state`; replay
/// resumes at `sequence + 1`. Journals store the type-erased
/// `Snapshot<Value>`; the actor converts it to and from its own state type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned"))]
pub struct Snapshot<S> {
    /// The aggregate state at snapshot time.
    pub state: S,
    /// Last sequence number folded into `state`.
    pub sequence: u64,
}

/// Sequence numbers and journal positions assigned by one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedRange {
    /// Sequence number of the first appended event.
    pub first_sequence: u64,
    /// Sequence number of the last appended event; the stream's new head.
    pub last_sequence: u64,
    /// Global position of the first appended event.
    pub first_position: u64,
}

impl CommittedRange {
    /// Number of events in the range.
    pub fn len(&self) -> u64 {
        (self.last_sequence + 1).saturating_sub(self.first_sequence)
    }

    /// Returns `true` if the append carried no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only per-entity event log with optimistic sequencing.
///
/// Methods are synchronous. Both backends answer reads from memory, and
/// writes are short fsynced appends made from the aggregate's own thread.
pub trait EventJournal: Send + Sync + 'static {
    /// Atomically append `events` to `stream` if its last sequence number is
    /// `expected_sequence`, together with one outbox record per event.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Conflict`] (and writes nothing) when the stream
    /// has moved past `expected_sequence`.
    fn append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        tag: u32,
        events: Vec<NewEvent>,
    ) -> Result<CommittedRange, JournalError>;

    /// Events of `stream` with sequence number `>= from_sequence`, in order.
    fn read_stream(
        &self,
        stream: &StreamId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, JournalError>;

    /// Last sequence number of `stream`, `0` if it has no events.
    fn last_sequence(&self, stream: &StreamId) -> Result<u64, JournalError>;

    /// Up to `limit` events carrying `tag`, with global position
    /// `>= from_position`, in position order.
    fn read_tag(
        &self,
        tag: u32,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, JournalError>;

    /// Replace the stream's snapshot.
    fn save_snapshot(&self, stream: &StreamId, snapshot: Snapshot<Value>)
    -> Result<(), JournalError>;

    /// The stream's latest snapshot, if any.
    fn load_snapshot(&self, stream: &StreamId) -> Result<Option<Snapshot<Value>>, JournalError>;
}

/// Durable queue of records awaiting broker delivery.
pub trait OutboxStore: Send + Sync + 'static {
    /// Up to `limit` undelivered records, oldest first.
    fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, JournalError>;

    /// Remove a delivered record. Returns `false` if it was already gone.
    fn delete(&self, id: u64) -> Result<bool, JournalError>;

    /// Number of undelivered records.
    fn pending_count(&self) -> Result<usize, JournalError>;
}

/// A prepared append: events and outbox records with ids assigned.
#[derive(Debug)]
struct Commit {
    events: Vec<StoredEvent>,
    outbox: Vec<OutboxRecord>,
}

/// In-memory index shared by both backends.
#[derive(Default)]
struct Ledger {
    log: Vec<StoredEvent>,
    streams: HashMap<StreamId, Vec<usize>>,
    outbox: BTreeMap<u64, OutboxRecord>,
    last_outbox_id: u64,
    snapshots: HashMap<StreamId, Snapshot<Value>>,
}

impl Ledger {
    fn last_sequence(&self, stream: &StreamId) -> u64 {
        self.streams
            .get(stream)
            .and_then(|ix| ix.last())
            .map_or(0, |&i| self.log[i].sequence)
    }

    /// Check the expected sequence and assign sequences, positions, and
    /// outbox ids. Does not mutate; [`commit`](Self::commit) does.
    fn prepare(
        &self,
        stream: &StreamId,
        expected: u64,
        tag: u32,
        events: Vec<NewEvent>,
    ) -> Result<Commit, JournalError> {
        let actual = self.last_sequence(stream);
        if actual != expected {
            return Err(JournalError::Conflict { expected, actual });
        }

        let recorded_at = now_millis();
        let first_position = self.log.len() as u64;
        let mut commit = Commit {
            events: Vec::with_capacity(events.len()),
            outbox: Vec::with_capacity(events.len()),
        };
        for (i, new) in events.into_iter().enumerate() {
            let offset = i as u64;
            let stored = StoredEvent {
                event_id: new.event_id,
                aggregate_type: stream.aggregate_type.clone(),
                entity_key: stream.key.clone(),
                sequence: expected + 1 + offset,
                global_position: first_position + offset,
                tag,
                event_type: new.event_type,
                payload: new.payload,
                metadata: new.metadata,
                recorded_at,
            };
            commit.outbox.push(OutboxRecord {
                id: self.last_outbox_id + 1 + offset,
                topic: new.topic,
                partition_key: new.partition_key,
                payload: serde_json::to_value(&stored)?,
                created_at: recorded_at,
            });
            commit.events.push(stored);
        }
        Ok(commit)
    }

    fn commit(&mut self, commit: Commit) -> CommittedRange {
        let first_position = self.log.len() as u64;
        let (first_sequence, last_sequence) = match (commit.events.first(), commit.events.last())
        {
            (Some(first), Some(last)) => (first.sequence, last.sequence),
            _ => (1, 0),
        };
        for event in commit.events {
            let index = self.log.len();
            self.streams
                .entry(event.stream_id())
                .or_default()
                .push(index);
            self.log.push(event);
        }
        for record in commit.outbox {
            self.last_outbox_id = self.last_outbox_id.max(record.id);
            self.outbox.insert(record.id, record);
        }
        CommittedRange {
            first_sequence,
            last_sequence,
            first_position,
        }
    }

    fn read_stream(&self, stream: &StreamId, from_sequence: u64) -> Vec<StoredEvent> {
        self.streams.get(stream).map_or_else(Vec::new, |ix| {
            ix.iter()
                .map(|&i| &self.log[i])
                .filter(|e| e.sequence >= from_sequence)
                .cloned()
                .collect()
        })
    }

    fn read_tag(&self, tag: u32, from_position: u64, limit: usize) -> Vec<StoredEvent> {
        let start = usize::try_from(from_position).unwrap_or(usize::MAX);
        self.log
            .iter()
            .skip(start)
            .filter(|e| e.tag == tag)
            .take(limit)
            .cloned()
            .collect()
    }

    fn pending(&self, limit: usize) -> Vec<OutboxRecord> {
        self.outbox.values().take(limit).cloned().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Journal held entirely in memory.
///
/// Cloning is not supported; share it through an `Arc`.
#[derive(Default)]
pub struct MemoryJournal {
    ledger: Mutex<Ledger>,
}

impl MemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventJournal for MemoryJournal {
    fn append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        tag: u32,
        events: Vec<NewEvent>,
    ) -> Result<CommittedRange, JournalError> {
        let mut ledger = lock(&self.ledger);
        let commit = ledger.prepare(stream, expected_sequence, tag, events)?;
        Ok(ledger.commit(commit))
    }

    fn read_stream(
        &self,
        stream: &StreamId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, JournalError> {
        Ok(lock(&self.ledger).read_stream(stream, from_sequence))
    }

    fn last_sequence(&self, stream: &StreamId) -> Result<u64, JournalError> {
        Ok(lock(&self.ledger).last_sequence(stream))
    }

    fn read_tag(
        &self,
        tag: u32,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, JournalError> {
        Ok(lock(&self.ledger).read_tag(tag, from_position, limit))
    }

    fn save_snapshot(
        &self,
        stream: &StreamId,
        snapshot: Snapshot<Value>,
    ) -> Result<(), JournalError> {
        lock(&self.ledger).snapshots.insert(stream.clone(), snapshot);
        Ok(())
    }

    fn load_snapshot(&self, stream: &StreamId) -> Result<Option<Snapshot<Value>>, JournalError> {
        Ok(lock(&self.ledger).snapshots.get(stream).cloned())
    }
}

impl OutboxStore for MemoryJournal {
    fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, JournalError> {
        Ok(lock(&self.ledger).pending(limit))
    }

    fn delete(&self, id: u64) -> Result<bool, JournalError> {
        Ok(lock(&self.ledger).outbox.remove(&id).is_some())
    }

    fn pending_count(&self) -> Result<usize, JournalError> {
        Ok(lock(&self.ledger).outbox.len())
    }
}

/// One line of `journal.jsonl`, as written.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EntryRef<'a> {
    Commit {
        events: &'a [StoredEvent],
        outbox: &'a [OutboxRecord],
    },
    Delivered {
        id: u64,
    },
}

/// One line of `journal.jsonl`, as read back.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Entry {
    Commit {
        events: Vec<StoredEvent>,
        outbox: Vec<OutboxRecord>,
    },
    Delivered {
        id: u64,
    },
}

struct FileInner {
    ledger: Ledger,
    file: File,
    /// Length of the file up to the last fully written line.
    len: u64,
}

impl FileInner {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let result = self
            .file
            .write_all(line)
            .and_then(|()| self.file.sync_data());
        match result {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(trunc) = self.file.set_len(self.len) {
                    tracing::warn!(error = %trunc, "failed to truncate partial journal line");
                }
                Err(e)
            }
        }
    }
}

/// Journal persisted to a directory.
///
/// All events stay indexed in memory after [`open`](FileJournal::open);
/// the file is only appended to.
pub struct FileJournal {
    dir: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileJournal {
    /// Name of the commit log inside the journal directory.
    pub const LOG_FILE: &'static str = "journal.jsonl";

    /// Open (or create) the journal rooted at `dir` and rebuild its index.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] if the directory or log cannot be opened
    /// and [`JournalError::Corrupt`] if a line other than the last fails to
    /// decode.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(Self::LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut ledger = Ledger::default();
        let mut len = 0u64;
        let mut commits = 0usize;
        for (index, chunk) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
            if chunk.last() != Some(&b'\n') {
                tracing::warn!(
                    path = %path.display(),
                    bytes = chunk.len(),
                    "discarding torn journal tail"
                );
                break;
            }
            len += chunk.len() as u64;
            let line = &chunk[..chunk.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Entry>(line) {
                Ok(Entry::Commit { events, outbox }) => {
                    ledger.commit(Commit { events, outbox });
                    commits += 1;
                }
                Ok(Entry::Delivered { id }) => {
                    ledger.outbox.remove(&id);
                }
                Err(e) => {
                    return Err(JournalError::Corrupt {
                        line: index + 1,
                        reason: e.to_string(),
                    });
                }
            }
        }
        if len < contents.len() as u64 {
            file.set_len(len)?;
        }

        tracing::info!(
            path = %path.display(),
            commits,
            events = ledger.log.len(),
            pending_outbox = ledger.outbox.len(),
            "journal opened"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(FileInner { ledger, file, len }),
        })
    }

    /// Root directory of this journal.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, stream: &StreamId) -> PathBuf {
        snapshot_path(&self.dir, stream)
    }
}

impl EventJournal for FileJournal {
    fn append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        tag: u32,
        events: Vec<NewEvent>,
    ) -> Result<CommittedRange, JournalError> {
        let mut inner = lock(&self.inner);
        let commit = inner
            .ledger
            .prepare(stream, expected_sequence, tag, events)?;
        let mut line = serde_json::to_vec(&EntryRef::Commit {
            events: &commit.events,
            outbox: &commit.outbox,
        })?;
        line.push(b'\n');
        inner.write_line(&line)?;
        Ok(inner.ledger.commit(commit))
    }

    fn read_stream(
        &self,
        stream: &StreamId,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, JournalError> {
        Ok(lock(&self.inner).ledger.read_stream(stream, from_sequence))
    }

    fn last_sequence(&self, stream: &StreamId) -> Result<u64, JournalError> {
        Ok(lock(&self.inner).ledger.last_sequence(stream))
    }

    fn read_tag(
        &self,
        tag: u32,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, JournalError> {
        Ok(lock(&self.inner).ledger.read_tag(tag, from_position, limit))
    }

    fn save_snapshot(
        &self,
        stream: &StreamId,
        snapshot: Snapshot<Value>,
    ) -> Result<(), JournalError> {
        let path = self.snapshot_path(stream);
        let Some(dir) = path.parent() else {
            return Err(io::Error::other("snapshot path has no parent").into());
        };
        std::fs::create_dir_all(dir)?;

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec(&snapshot)?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn load_snapshot(&self, stream: &StreamId) -> Result<Option<Snapshot<Value>>, JournalError> {
        let path = self.snapshot_path(stream);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Snapshot<Value>>(&bytes) {
            Ok(snap) => Ok(Some(snap)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }
}

impl OutboxStore for FileJournal {
    fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, JournalError> {
        Ok(lock(&self.inner).ledger.pending(limit))
    }

    fn delete(&self, id: u64) -> Result<bool, JournalError> {
        let mut inner = lock(&self.inner);
        if !inner.ledger.outbox.contains_key(&id) {
            return Ok(false);
        }
        let mut line = serde_json::to_vec(&EntryRef::Delivered { id })?;
        line.push(b'\n');
        inner.write_line(&line)?;
        inner.ledger.outbox.remove(&id);
        Ok(true)
    }

    fn pending_count(&self) -> Result<usize, JournalError> {
        Ok(lock(&self.inner).ledger.outbox.len())
    }
}

/// Filesystem path of a stream's snapshot under `base_dir`.
///
/// Keys are hex-encoded so that any key string maps to a valid, unique
/// file name.
pub fn snapshot_path(base_dir: &Path, stream: &StreamId) -> PathBuf {
    let stem: String = stream
        .key
        .as_str()
        .bytes()
        .map(|b| format!("{b:02x}"))
        .collect();
    base_dir
        .join("snapshots")
        .join(&stream.aggregate_type)
        .join(format!("{stem}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EntityKey, EventMetadata};
    use serde_json::json;
    use uuid::Uuid;

    fn stream(key: &str) -> StreamId {
        StreamId::new("counter", EntityKey::new(key))
    }

    fn new_event(n: u64) -> NewEvent {
        NewEvent {
            event_id: Uuid::new_v4(),
            event_type: "Added".into(),
            payload: json!({ "amount": n }),
            topic: "counter-events".into(),
            partition_key: "pk".into(),
            metadata: EventMetadata::default(),
        }
    }

    /// Behavior both backends must share.
    fn exercise<J: EventJournal + OutboxStore>(journal: &J) {
        let a = stream("a");
        let b = stream("b");

        let range = journal
            .append(&a, 0, 1, vec![new_event(1), new_event(2)])
            .expect("first append should succeed");
        assert_eq!(range.first_sequence, 1);
        assert_eq!(range.last_sequence, 2);
        assert_eq!(range.first_position, 0);
        assert_eq!(range.len(), 2);

        journal
            .append(&b, 0, 2, vec![new_event(3)])
            .expect("append to other stream should succeed");

        let conflict = journal.append(&a, 1, 1, vec![new_event(9)]);
        assert!(matches!(
            conflict,
            Err(JournalError::Conflict {
                expected: 1,
                actual: 2
            })
        ));

        assert_eq!(journal.last_sequence(&a).expect("last_sequence"), 2);
        assert_eq!(journal.last_sequence(&stream("none")).expect("last_sequence"), 0);

        let tail = journal.read_stream(&a, 2).expect("read_stream");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 2);
        assert_eq!(tail[0].payload, json!({ "amount": 2 }));

        let tagged = journal.read_tag(2, 0, 10).expect("read_tag");
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].entity_key.as_str(), "b");
        assert_eq!(tagged[0].global_position, 2);
        assert!(journal.read_tag(1, 2, 10).expect("read_tag").is_empty());
        assert_eq!(journal.read_tag(1, 0, 1).expect("read_tag").len(), 1);

        // One outbox record per event, oldest first, carrying the stored event.
        let pending = journal.pending(10).expect("pending");
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].id < w[1].id));
        let first: StoredEvent =
            serde_json::from_value(pending[0].payload.clone()).expect("payload decodes");
        assert_eq!(first.entity_key.as_str(), "a");
        assert_eq!(first.sequence, 1);

        assert!(journal.delete(pending[0].id).expect("delete"));
        assert!(!journal.delete(pending[0].id).expect("second delete"));
        assert_eq!(journal.pending_count().expect("pending_count"), 2);
    }

    #[test]
    fn memory_journal_contract() {
        exercise(&MemoryJournal::new());
    }

    #[test]
    fn file_journal_contract() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        exercise(&FileJournal::open(dir.path()).expect("open should succeed"));
    }

    #[test]
    fn conflicting_append_writes_no_outbox_records() {
        let journal = MemoryJournal::new();
        let a = stream("a");
        journal.append(&a, 0, 0, vec![new_event(1)]).expect("append");
        let _ = journal.append(&a, 0, 0, vec![new_event(2), new_event(3)]);
        assert_eq!(journal.pending_count().expect("pending_count"), 1);
        assert_eq!(journal.read_stream(&a, 0).expect("read").len(), 1);
    }

    #[test]
    fn file_journal_reopen_restores_events_and_outbox() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let a = stream("a");
        let delivered_id = {
            let journal = FileJournal::open(dir.path()).expect("open should succeed");
            journal
                .append(&a, 0, 0, vec![new_event(1), new_event(2)])
                .expect("append");
            let pending = journal.pending(1).expect("pending");
            journal.delete(pending[0].id).expect("delete");
            pending[0].id
        };

        let journal = FileJournal::open(dir.path()).expect("reopen should succeed");
        assert_eq!(journal.last_sequence(&a).expect("last_sequence"), 2);
        let pending = journal.pending(10).expect("pending");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].id > delivered_id);

        let range = journal
            .append(&a, 2, 0, vec![new_event(3)])
            .expect("append after reopen");
        assert_eq!(range.first_position, 2);
        let pending = journal.pending(10).expect("pending");
        assert!(pending[1].id > pending[0].id, "outbox ids keep increasing");
    }

    #[test]
    fn file_journal_discards_torn_tail() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let a = stream("a");
        {
            let journal = FileJournal::open(dir.path()).expect("open should succeed");
            journal.append(&a, 0, 0, vec![new_event(1)]).expect("append");
        }
        let path = dir.path().join(FileJournal::LOG_FILE);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open log");
        file.write_all(br#"{"kind":"commit","events":[{"ev"#)
            .expect("write torn line");
        drop(file);

        let journal = FileJournal::open(dir.path()).expect("reopen should succeed");
        assert_eq!(journal.last_sequence(&a).expect("last_sequence"), 1);
        journal
            .append(&a, 1, 0, vec![new_event(2)])
            .expect("append after torn tail");

        let journal = FileJournal::open(dir.path()).expect("second reopen should succeed");
        assert_eq!(journal.last_sequence(&a).expect("last_sequence"), 2);
    }

    #[test]
    fn file_journal_rejects_corrupt_interior_line() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        std::fs::write(
            dir.path().join(FileJournal::LOG_FILE),
            b"not json\n{\"kind\":\"delivered\",\"id\":1}\n",
        )
        .expect("write log");

        let result = FileJournal::open(dir.path());
        assert!(matches!(result, Err(JournalError::Corrupt { line: 1, .. })));
    }

    #[test]
    fn snapshot_save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let journal = FileJournal::open(dir.path()).expect("open should succeed");
        let a = stream("org.example:lib");
        let snap = Snapshot {
            state: json!({ "value": 42 }),
            sequence: 7,
        };

        journal.save_snapshot(&a, snap.clone()).expect("save should succeed");
        let loaded = journal.load_snapshot(&a).expect("load should succeed");
        assert_eq!(loaded, Some(snap));

        let final_path = snapshot_path(dir.path(), &a);
        assert!(final_path.exists(), "final snapshot file should exist");
        assert!(!final_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_snapshot_is_a_miss() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let journal = FileJournal::open(dir.path()).expect("open should succeed");
        let a = stream("bad");
        let path = snapshot_path(dir.path(), &a);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        std::fs::write(&path, b"this is not valid json!!!").expect("write corrupt file");

        assert!(journal.load_snapshot(&a).expect("load should succeed").is_none());
    }

    #[test]
    fn snapshot_path_hex_encodes_key() {
        let path = snapshot_path(Path::new("/data"), &StreamId::new("details", "g:a".into()));
        assert_eq!(path, PathBuf::from("/data/snapshots/details/673a61.json"));
    }
}
