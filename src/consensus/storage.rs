//! Persistent raft storage: an in-memory raft log fronted by write-ahead
//! segment files and a snapshot file. Entries are durable before raft is
//! acknowledged; snapshots compact the log while retaining a tail of entries
//! for slow followers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use prost::bytes::Bytes;
use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage};

use super::segment::Segment;
use crate::errors::{ChainError, ChainResult};

const ENTRIES_PER_SEGMENT: u64 = 10_000;
const SNAPSHOT_FILE: &str = "snapshot";
const STATE_FILE: &str = "state";

fn storage_err(err: impl ToString) -> ChainError {
    ChainError::Storage(err.to_string())
}

pub struct RaftStorage {
    mem: MemStorage,
    segments: BTreeMap<u64, Segment>,
    wal_dir: PathBuf,
    snap_dir: PathBuf,
    catch_up_entries: u64,
    last_snapshot: Snapshot,
    conf_state: ConfState,
    fresh: bool,
}

impl RaftStorage {
    /// Restores persisted raft data: the latest snapshot, the hard state and
    /// every WAL entry past the snapshot. A missing WAL directory marks the
    /// node as fresh.
    pub fn create<P: AsRef<Path>>(
        wal_dir: P,
        snap_dir: P,
        catch_up_entries: u64,
    ) -> ChainResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        let snap_dir = snap_dir.as_ref().to_path_buf();
        let fresh = !wal_dir.exists();
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&snap_dir)?;

        let mem = MemStorage::new();
        let mut last_snapshot = Snapshot::default();
        let mut conf_state = ConfState::default();

        let snapshot_path = snap_dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let data = fs::read(&snapshot_path)?;
            let mut snapshot = Snapshot::default();
            snapshot
                .merge_from_bytes(&data)
                .map_err(|e| storage_err(format!("corrupt snapshot file: {}", e)))?;
            conf_state = snapshot.get_metadata().get_conf_state().clone();
            mem.wl()
                .apply_snapshot(snapshot.clone())
                .map_err(storage_err)?;
            last_snapshot = snapshot;
        }

        let state_path = wal_dir.join(STATE_FILE);
        if state_path.exists() {
            let data = fs::read(&state_path)?;
            let mut hard_state = HardState::default();
            hard_state
                .merge_from_bytes(&data)
                .map_err(|e| storage_err(format!("corrupt state file: {}", e)))?;
            mem.wl().set_hardstate(hard_state);
        }

        let mut segment_starts = Vec::new();
        for dir_entry in fs::read_dir(&wal_dir)? {
            let path = dir_entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(start) = name
                .strip_prefix("wal_")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                segment_starts.push((start, path));
            }
        }
        segment_starts.sort_by_key(|(start, _)| *start);

        let replay_from = mem.last_index().map_err(storage_err)?;
        let mut segments = BTreeMap::new();
        let mut entries = Vec::new();
        for (start, path) in segment_starts {
            let mut segment = Segment::open(&path, start)?;
            for index in segment.first_index()..segment.next_index() {
                let data = segment.read(index)?;
                let mut entry = Entry::default();
                entry
                    .merge_from_bytes(&data)
                    .map_err(|e| storage_err(format!("corrupt WAL entry {}: {}", index, e)))?;
                if entry.index > replay_from {
                    entries.push(entry);
                }
            }
            segments.insert(start, segment);
        }
        if !entries.is_empty() {
            info!("replaying {} WAL entries", entries.len());
            mem.wl().append(&entries).map_err(storage_err)?;
        }

        Ok(RaftStorage {
            mem,
            segments,
            wal_dir,
            snap_dir,
            catch_up_entries,
            last_snapshot,
            conf_state,
            fresh,
        })
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn conf_state(&self) -> &ConfState {
        &self.conf_state
    }

    /// Seeds an empty log with the initial voter set. The seed snapshot sits
    /// at index 1, which becomes the chain's initial applied index, and is
    /// persisted so a restart replays the WAL on top of it.
    pub fn bootstrap(&mut self, voters: Vec<u64>) -> ChainResult<u64> {
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 1;
        snapshot.mut_metadata().term = 1;
        snapshot.mut_metadata().mut_conf_state().voters = voters;
        self.persist_snapshot(&snapshot)?;
        self.conf_state = snapshot.get_metadata().get_conf_state().clone();
        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .map_err(storage_err)?;
        self.last_snapshot = snapshot;
        Ok(1)
    }

    /// Appends entries to the WAL and persists the hard state. Returns only
    /// after the write is on disk.
    pub fn save(&mut self, hard_state: Option<HardState>, entries: &[Entry]) -> ChainResult<()> {
        if !entries.is_empty() {
            self.mem.wl().append(entries).map_err(storage_err)?;
            self.truncate_wal_from(entries[0].index)?;
            for entry in entries {
                let data = entry.write_to_bytes().map_err(storage_err)?;
                let segment = self.segment_for_append(entry.index)?;
                segment.append(&[data])?;
            }
        }
        if let Some(hs) = hard_state {
            self.mem.wl().set_hardstate(hs.clone());
            self.persist_hard_state(&hs)?;
        }
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem.wl().set_conf_state(conf_state.clone());
        self.conf_state = conf_state;
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.mem.wl().mut_hard_state().set_commit(commit);
    }

    /// Latest persisted snapshot, empty if none was ever taken.
    pub fn snapshot(&self) -> &Snapshot {
        &self.last_snapshot
    }

    /// Persists a snapshot received from the leader and resets the log to it.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> ChainResult<()> {
        self.persist_snapshot(&snapshot)?;
        self.conf_state = snapshot.get_metadata().get_conf_state().clone();
        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .map_err(storage_err)?;
        self.last_snapshot = snapshot;

        // applying the snapshot advanced the commit index; a stale state
        // file must not win on restart
        let hard_state = self.mem.rl().hard_state().clone();
        self.persist_hard_state(&hard_state)?;

        // the local log diverged or fell behind; the WAL restarts past the
        // snapshot
        let starts: Vec<u64> = self.segments.keys().copied().collect();
        for start in starts {
            self.segments.remove(&start);
            let _ = fs::remove_file(self.wal_dir.join(format!("wal_{}.log", start)));
        }
        Ok(())
    }

    /// Persists a locally taken snapshot at `index` and compacts the log,
    /// retaining `catch_up_entries` entries behind it.
    pub fn take_snapshot(
        &mut self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> ChainResult<()> {
        let term = self.mem.term(index).map_err(storage_err)?;
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = index;
        snapshot.mut_metadata().term = term;
        snapshot.mut_metadata().set_conf_state(conf_state.clone());
        snapshot.set_data(Bytes::from(data));

        self.persist_snapshot(&snapshot)?;
        self.last_snapshot = snapshot;
        self.conf_state = conf_state;

        let first = self.mem.first_index().map_err(storage_err)?;
        let last = self.mem.last_index().map_err(storage_err)?;
        let compact_to = index.saturating_sub(self.catch_up_entries);
        if compact_to > first && compact_to <= last {
            self.mem.wl().compact(compact_to).map_err(storage_err)?;
            let stale: Vec<u64> = self
                .segments
                .iter()
                .filter(|(_, segment)| segment.next_index() <= compact_to)
                .map(|(start, _)| *start)
                .collect();
            for start in stale {
                self.segments.remove(&start);
                let _ = fs::remove_file(self.wal_dir.join(format!("wal_{}.log", start)));
            }
        }
        Ok(())
    }

    fn persist_snapshot(&self, snapshot: &Snapshot) -> ChainResult<()> {
        let data = snapshot.write_to_bytes().map_err(storage_err)?;
        let tmp = self.snap_dir.join("snapshot.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.snap_dir.join(SNAPSHOT_FILE))?;
        Ok(())
    }

    fn persist_hard_state(&self, hard_state: &HardState) -> ChainResult<()> {
        let data = hard_state.write_to_bytes().map_err(storage_err)?;
        let tmp = self.wal_dir.join("state.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.wal_dir.join(STATE_FILE))?;
        Ok(())
    }

    fn truncate_wal_from(&mut self, index: u64) -> ChainResult<()> {
        let obsolete: Vec<u64> = self
            .segments
            .iter()
            .filter(|(start, _)| **start >= index)
            .map(|(start, _)| *start)
            .collect();
        for start in obsolete {
            self.segments.remove(&start);
            let _ = fs::remove_file(self.wal_dir.join(format!("wal_{}.log", start)));
        }
        if let Some((_, tail)) = self.segments.iter_mut().next_back() {
            tail.truncate_from(index)?;
        }
        Ok(())
    }

    fn segment_for_append(&mut self, index: u64) -> ChainResult<&mut Segment> {
        let tail_key = match self.segments.iter().next_back() {
            Some((start, tail))
                if tail.next_index() == index && tail.len() < ENTRIES_PER_SEGMENT =>
            {
                *start
            }
            _ => {
                let segment =
                    Segment::open(self.wal_dir.join(format!("wal_{}.log", index)), index)?;
                self.segments.insert(index, segment);
                index
            }
        };
        Ok(self
            .segments
            .get_mut(&tail_key)
            .expect("tail segment was just looked up or inserted"))
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        // slow followers get the last persisted snapshot, which carries the
        // serialized block the in-memory storage does not know about
        if self.last_snapshot.get_metadata().index >= request_index
            && self.last_snapshot.get_metadata().index > 0
        {
            return Ok(self.last_snapshot.clone());
        }
        self.mem.snapshot(request_index, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.set_data(Bytes::from(data.to_vec()));
        e
    }

    fn hard_state(term: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.commit = commit;
        hs
    }

    #[test]
    fn fresh_flag_tracks_wal_dir() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("wal");
        let snap = dir.path().join("snap");

        let storage = RaftStorage::create(&wal, &snap, 10).unwrap();
        assert!(storage.is_fresh());
        drop(storage);

        let storage = RaftStorage::create(&wal, &snap, 10).unwrap();
        assert!(!storage.is_fresh());
    }

    #[test]
    fn restart_replays_entries_and_hard_state() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("wal");
        let snap = dir.path().join("snap");

        {
            let mut storage = RaftStorage::create(&wal, &snap, 10).unwrap();
            storage.bootstrap(vec![1]).unwrap();
            let entries: Vec<Entry> =
                (2..=5).map(|i| entry(i, 1, format!("e{}", i).as_bytes())).collect();
            storage.save(Some(hard_state(1, 5)), &entries).unwrap();
        }

        let storage = RaftStorage::create(&wal, &snap, 10).unwrap();
        assert_eq!(storage.last_index().unwrap(), 5);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, 5);

        let restored = storage
            .entries(2, 6, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(restored.len(), 4);
        assert_eq!(&restored[0].data[..], b"e2");
    }

    #[test]
    fn take_snapshot_retains_catch_up_entries() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("wal");
        let snap = dir.path().join("snap");

        let mut storage = RaftStorage::create(&wal, &snap, 2).unwrap();
        storage.bootstrap(vec![1]).unwrap();
        let entries: Vec<Entry> = (2..=10).map(|i| entry(i, 1, b"x")).collect();
        storage.save(Some(hard_state(1, 10)), &entries).unwrap();

        let mut conf_state = ConfState::default();
        conf_state.voters = vec![1];
        storage
            .take_snapshot(10, conf_state, b"last block".to_vec())
            .unwrap();

        assert_eq!(storage.first_index().unwrap(), 8);
        assert_eq!(storage.snapshot().get_metadata().index, 10);
        assert_eq!(&storage.snapshot().get_data()[..], b"last block");
    }

    #[test]
    fn restart_restores_persisted_snapshot() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("wal");
        let snap = dir.path().join("snap");

        {
            let mut storage = RaftStorage::create(&wal, &snap, 1).unwrap();
            storage.bootstrap(vec![1]).unwrap();
            let entries: Vec<Entry> = (2..=6).map(|i| entry(i, 1, b"x")).collect();
            storage.save(Some(hard_state(1, 6)), &entries).unwrap();
            let mut conf_state = ConfState::default();
            conf_state.voters = vec![1];
            storage.take_snapshot(6, conf_state, b"block six".to_vec()).unwrap();
        }

        let storage = RaftStorage::create(&wal, &snap, 1).unwrap();
        assert_eq!(storage.snapshot().get_metadata().index, 6);
        assert_eq!(&storage.snapshot().get_data()[..], b"block six");
        assert_eq!(storage.conf_state().voters, vec![1]);
        assert_eq!(storage.last_index().unwrap(), 6);
    }

    #[test]
    fn conflicting_suffix_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("wal");
        let snap = dir.path().join("snap");

        {
            let mut storage = RaftStorage::create(&wal, &snap, 10).unwrap();
            storage.bootstrap(vec![1]).unwrap();
            let entries: Vec<Entry> = (2..=5).map(|i| entry(i, 1, b"old")).collect();
            storage.save(None, &entries).unwrap();
            let replacement: Vec<Entry> = (4..=6).map(|i| entry(i, 2, b"new")).collect();
            storage.save(Some(hard_state(2, 6)), &replacement).unwrap();
        }

        let storage = RaftStorage::create(&wal, &snap, 10).unwrap();
        let restored = storage
            .entries(2, 7, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(restored.len(), 5);
        assert_eq!(&restored[1].data[..], b"old");
        assert_eq!(&restored[2].data[..], b"new");
        assert_eq!(restored[4].term, 2);
    }
}
