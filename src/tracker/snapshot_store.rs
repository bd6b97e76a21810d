//! Per-window chatter snapshots
//!
//! Holds one merged audience set per channel for the current flush window.
//! Repeated records for a channel are unioned, never summed.
//!
//! ## Generations
//!
//! Every `clear()` advances the store generation. Writers stamp each
//! record with the generation they observed when their fetch was issued, so
//! a fetch that resolves after a flush cannot leak into the next window.
//!
//! ## Spool
//!
//! With a spool directory configured, each merged snapshot is mirrored to
//! `<spool>/<channel>.json`. Opening a store over a non-empty spool reloads
//! it: spool contents always belong to the window that has not been flushed
//! yet, which is what lets an interrupted flush be resumed after a restart.
//! A record whose spool write fails is still kept in memory and reported as
//! `SpoolFailed`, so the pass report shows the window is not fully on disk.

use super::types::{Channel, ChatterSnapshot};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of a single `record` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First snapshot for this channel in the window
    Inserted { total: u64 },
    /// Unioned with an existing snapshot
    Merged { total: u64 },
    /// Kept in memory but the spool file could not be written
    SpoolFailed { total: u64 },
    /// Generation mismatch, snapshot dropped
    Stale { generation: u64, current: u64 },
}

/// Narrow write capability handed to the scheduler
pub trait SnapshotSink: Send + Sync {
    /// Generation writers must stamp on records issued now
    fn generation(&self) -> u64;

    /// Merge a snapshot fetched under `generation`
    fn record(&self, generation: u64, snapshot: ChatterSnapshot) -> RecordOutcome;
}

#[derive(Debug, Default)]
struct StoreInner {
    generation: u64,
    snapshots: HashMap<Channel, ChatterSnapshot>,
}

pub struct SnapshotStore {
    inner: Mutex<StoreInner>,
    spool: Option<SnapshotSpool>,
}

impl SnapshotStore {
    /// In-memory store without spool
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            spool: None,
        }
    }

    /// Store mirrored to `dir`, reloading any snapshots already spooled there
    pub fn with_spool(dir: impl AsRef<Path>) -> io::Result<Self> {
        let spool = SnapshotSpool::open(dir)?;
        let restored = spool.load_all()?;

        let mut inner = StoreInner::default();
        for snapshot in restored {
            inner.snapshots.insert(snapshot.channel.clone(), snapshot);
        }

        if !inner.snapshots.is_empty() {
            log::info!(
                "♻️  Restored {} spooled snapshots from {}",
                inner.snapshots.len(),
                spool.dir.display()
            );
        }

        Ok(Self {
            inner: Mutex::new(inner),
            spool: Some(spool),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap()
    }

    /// Last recorded total for `channel`
    pub fn total_for(&self, channel: &Channel) -> Option<u64> {
        self.lock().snapshots.get(channel).map(|s| s.total_count)
    }

    /// Totals for every recorded channel
    pub fn totals(&self) -> HashMap<Channel, u64> {
        self.lock()
            .snapshots
            .iter()
            .map(|(channel, snapshot)| (channel.clone(), snapshot.total_count))
            .collect()
    }

    /// Consistent read-only view of all member sets
    ///
    /// Member sets are shared, not copied; a later merge copies-on-write and
    /// never mutates a set handed out here.
    pub fn read_all(&self) -> HashMap<Channel, Arc<HashSet<String>>> {
        self.lock()
            .snapshots
            .iter()
            .map(|(channel, snapshot)| (channel.clone(), Arc::clone(&snapshot.members)))
            .collect()
    }

    /// Recorded channels, sorted
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.lock().snapshots.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.lock().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every snapshot and advance the generation
    pub fn clear(&self) -> io::Result<()> {
        let mut inner = self.lock();
        let dropped = inner.snapshots.len();
        inner.snapshots.clear();
        inner.generation += 1;

        log::debug!(
            "🧹 Cleared {} snapshots (generation now {})",
            dropped,
            inner.generation
        );

        match &self.spool {
            Some(spool) => spool.clear(),
            None => Ok(()),
        }
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSink for SnapshotStore {
    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn record(&self, generation: u64, snapshot: ChatterSnapshot) -> RecordOutcome {
        let mut inner = self.lock();

        if generation != inner.generation {
            log::warn!(
                "⚠️  Dropping stale snapshot for {} (generation {} != {})",
                snapshot.channel,
                generation,
                inner.generation
            );
            return RecordOutcome::Stale {
                generation,
                current: inner.generation,
            };
        }

        let channel = snapshot.channel.clone();
        let mut outcome = match inner.snapshots.get_mut(&channel) {
            Some(existing) => {
                existing.merge(&snapshot);
                RecordOutcome::Merged {
                    total: existing.total_count,
                }
            }
            None => {
                let total = snapshot.total_count;
                inner.snapshots.insert(channel.clone(), snapshot);
                RecordOutcome::Inserted { total }
            }
        };

        // Spool write stays under the lock so file and memory agree
        if let (Some(spool), Some(current)) = (&self.spool, inner.snapshots.get(&channel)) {
            if let Err(e) = spool.write(current) {
                log::warn!("⚠️  Failed to spool snapshot for {}: {}", channel, e);
                outcome = RecordOutcome::SpoolFailed {
                    total: current.total_count,
                };
            }
        }

        outcome
    }
}

/// Directory of `<channel>.json` snapshot files
struct SnapshotSpool {
    dir: PathBuf,
}

impl SnapshotSpool {
    fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, channel: &Channel) -> PathBuf {
        self.dir.join(format!("{}.json", channel))
    }

    fn json_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        files.sort();
        Ok(files)
    }

    fn load_all(&self) -> io::Result<Vec<ChatterSnapshot>> {
        let mut snapshots = Vec::new();

        for path in self.json_files()? {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<ChatterSnapshot>(&raw) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    log::warn!("⚠️  Skipping unreadable spool file {}: {}", path.display(), e);
                }
            }
        }

        Ok(snapshots)
    }

    fn write(&self, snapshot: &ChatterSnapshot) -> io::Result<()> {
        let target = self.path_for(&snapshot.channel);
        let tmp = target.with_extension("json.tmp");

        let json = serde_json::to_vec(snapshot)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &target)
    }

    fn clear(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::types::AudienceSample;

    fn snapshot(channel: &str, members: &[&str]) -> ChatterSnapshot {
        ChatterSnapshot::from_sample(
            Channel::parse(channel).unwrap(),
            AudienceSample {
                total_count: members.len() as u64,
                members: members.iter().map(|m| m.to_string()).collect(),
            },
        )
    }

    #[test]
    fn test_record_inserts_then_merges() {
        let store = SnapshotStore::new();
        let generation = store.generation();

        let first = store.record(generation, snapshot("a", &["u1", "u2"]));
        assert_eq!(first, RecordOutcome::Inserted { total: 2 });

        let second = store.record(generation, snapshot("A", &["u2", "u3"]));
        assert_eq!(second, RecordOutcome::Merged { total: 3 });

        let channel = Channel::parse("a").unwrap();
        assert_eq!(store.total_for(&channel), Some(3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_full_overlap_never_double_counts() {
        let store = SnapshotStore::new();
        let generation = store.generation();

        store.record(generation, snapshot("a", &["u1", "u2", "u3"]));
        store.record(generation, snapshot("a", &["u1", "u2", "u3"]));

        assert_eq!(store.total_for(&Channel::parse("a").unwrap()), Some(3));
    }

    #[test]
    fn test_read_all_view_is_isolated_from_later_merges() {
        let store = SnapshotStore::new();
        let generation = store.generation();
        store.record(generation, snapshot("a", &["u1"]));

        let view = store.read_all();
        store.record(generation, snapshot("a", &["u2"]));

        let channel = Channel::parse("a").unwrap();
        assert_eq!(view[&channel].len(), 1);
        assert_eq!(store.read_all()[&channel].len(), 2);
    }

    #[test]
    fn test_stale_generation_dropped_after_clear() {
        let store = SnapshotStore::new();
        let old_generation = store.generation();
        store.record(old_generation, snapshot("a", &["u1"]));

        store.clear().unwrap();
        assert!(store.is_empty());

        let outcome = store.record(old_generation, snapshot("a", &["u9"]));
        assert_eq!(
            outcome,
            RecordOutcome::Stale {
                generation: old_generation,
                current: old_generation + 1
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_spool_mirrors_and_restores() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = SnapshotStore::with_spool(dir.path()).unwrap();
            let generation = store.generation();
            store.record(generation, snapshot("a", &["u1", "u2"]));
            store.record(generation, snapshot("b", &["u3"]));
            store.record(generation, snapshot("a", &["u4"]));
        }

        assert!(dir.path().join("a.json").exists());
        assert!(dir.path().join("b.json").exists());

        let restored = SnapshotStore::with_spool(dir.path()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.total_for(&Channel::parse("a").unwrap()), Some(3));
        assert_eq!(restored.channels(), vec![
            Channel::parse("a").unwrap(),
            Channel::parse("b").unwrap()
        ]);
    }

    #[test]
    fn test_clear_empties_spool() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::with_spool(dir.path()).unwrap();
        store.record(store.generation(), snapshot("a", &["u1"]));

        store.clear().unwrap();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        let reopened = SnapshotStore::with_spool(dir.path()).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_spool_write_failure_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::with_spool(dir.path()).unwrap();

        // A directory squatting on the target path makes the rename fail
        fs::create_dir(dir.path().join("a.json")).unwrap();

        let outcome = store.record(store.generation(), snapshot("a", &["u1", "u2"]));
        assert_eq!(outcome, RecordOutcome::SpoolFailed { total: 2 });
        assert_eq!(store.total_for(&Channel::parse("a").unwrap()), Some(2));

        let ok = store.record(store.generation(), snapshot("b", &["u3"]));
        assert_eq!(ok, RecordOutcome::Inserted { total: 1 });
    }

    #[test]
    fn test_upstream_total_below_member_set_raised() {
        let store = SnapshotStore::new();
        let generation = store.generation();
        let understated = |channel: &str| {
            ChatterSnapshot::from_sample(
                Channel::parse(channel).unwrap(),
                AudienceSample {
                    total_count: 1,
                    members: vec!["u1".to_string(), "u2".to_string()],
                },
            )
        };

        store.record(generation, understated("a"));
        store.record(generation, understated("b"));

        let totals = store.totals();
        let view = store.read_all();
        let shared = view[&Channel::parse("a").unwrap()]
            .intersection(&view[&Channel::parse("b").unwrap()])
            .count() as u64;
        assert_eq!(shared, 2);
        assert!(totals.values().all(|total| *total >= shared));
    }

    #[test]
    fn test_corrupt_spool_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let store = SnapshotStore::with_spool(dir.path()).unwrap();
        assert!(store.is_empty());
    }
}
