//! Persistence of the motor counters and the calibration result.
//!
//! A store is a set of named signed-integer slots. [`FileStore`] keeps one
//! small YAML file per slot. Each file is replaced through a temp file that
//! is fsynced before the rename, and the directory is fsynced after it, so a
//! save that returned `Ok` survives a power cut. The phase index and the
//! global position are still two separate files. A crash between the two renames can leave `phase_index` updated and
//! `global_position` stale. That window is accepted: the next move re-persists
//! both, and a stale pair is at most one move out of date.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::calibration::CalibrationResult;
use crate::error::{MotorError, MotorResult};
use crate::phase_table::PhaseIndex;
use crate::sequencer::Direction;
use crate::tracker::{DirectionMapping, MotorState};

pub const PHASE_INDEX_SLOT: &str = "phase_index";
pub const GLOBAL_POSITION_SLOT: &str = "global_position";
pub const FULL_RANGE_STEPS_SLOT: &str = "full_range_steps";
pub const CALIBRATION_DIRECTION_SLOT: &str = "calibration_direction";

/// Named signed-integer slots.
pub trait PersistentStore {
    fn exists(&self, slot: &str) -> bool;

    /// Fails with [`MotorError::MissingState`] if the slot was never written.
    fn load(&self, slot: &str) -> MotorResult<i64>;

    fn save(&mut self, slot: &str, value: i64) -> MotorResult<()>;

    /// Human readable location, used in operator messages.
    fn location(&self) -> String;
}

/// One `<slot>.yaml` file per slot inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        self.dir.join(format!("{}.yaml", slot))
    }
}

impl PersistentStore for FileStore {
    fn exists(&self, slot: &str) -> bool {
        self.slot_path(slot).is_file()
    }

    fn load(&self, slot: &str) -> MotorResult<i64> {
        let path = self.slot_path(slot);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MotorError::MissingState {
                    slot: slot.to_string(),
                    location: self.location(),
                })
            }
            Err(e) => return Err(MotorError::storage(path, e)),
        };
        serde_yaml::from_str::<i64>(&text).map_err(|_| MotorError::CorruptState {
            slot: slot.to_string(),
            value: text.trim().to_string(),
        })
    }

    fn save(&mut self, slot: &str, value: i64) -> MotorResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| MotorError::storage(&self.dir, e))?;
        let path = self.slot_path(slot);
        let tmp = self.dir.join(format!(".{}.yaml.tmp", slot));
        let body = serde_yaml::to_string(&value)
            .map_err(|e| MotorError::storage(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        replace_durably(&path, &tmp, body.as_bytes())
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Write `body` to `tmp`, flush it to disk, rename it over `path`, then sync
/// the parent directory so the rename itself is on disk.
pub(crate) fn replace_durably(path: &Path, tmp: &Path, body: &[u8]) -> MotorResult<()> {
    let mut file = File::create(tmp).map_err(|e| MotorError::storage(tmp, e))?;
    file.write_all(body).map_err(|e| MotorError::storage(tmp, e))?;
    file.sync_all().map_err(|e| MotorError::storage(tmp, e))?;
    drop(file);
    fs::rename(tmp, path).map_err(|e| MotorError::storage(path, e))?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> MotorResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| MotorError::storage(dir, e))
}

// Directories cannot be opened for syncing here
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> MotorResult<()> {
    Ok(())
}

/// Map-backed store. Clones share the slots.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: Arc<Mutex<BTreeMap<String, i64>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(phase: i64, position: i64) -> Self {
        let store = Self::new();
        if let Ok(mut slots) = store.slots.lock() {
            slots.insert(PHASE_INDEX_SLOT.to_string(), phase);
            slots.insert(GLOBAL_POSITION_SLOT.to_string(), position);
        }
        store
    }

    pub fn get(&self, slot: &str) -> Option<i64> {
        self.slots.lock().ok().and_then(|s| s.get(slot).copied())
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

impl PersistentStore for MemoryStore {
    fn exists(&self, slot: &str) -> bool {
        self.get(slot).is_some()
    }

    fn load(&self, slot: &str) -> MotorResult<i64> {
        self.get(slot).ok_or_else(|| MotorError::MissingState {
            slot: slot.to_string(),
            location: self.location(),
        })
    }

    fn save(&mut self, slot: &str, value: i64) -> MotorResult<()> {
        let poisoned = || MotorError::storage(self.location(), io::Error::other("memory store lock poisoned"));
        self.slots.lock().map_err(|_| poisoned())?.insert(slot.to_string(), value);
        *self.saves.lock().map_err(|_| poisoned())? += 1;
        Ok(())
    }

    fn location(&self) -> String {
        "in-memory store".to_string()
    }
}

/// Typed view over a [`PersistentStore`] for one motor.
#[derive(Debug)]
pub struct MotorStateStore<S> {
    store: S,
}

impl<S: PersistentStore> MotorStateStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Both counters must exist; a missing one is never defaulted.
    pub fn load(&self, mapping: DirectionMapping) -> MotorResult<MotorState> {
        for slot in [PHASE_INDEX_SLOT, GLOBAL_POSITION_SLOT] {
            if !self.store.exists(slot) {
                return Err(MotorError::MissingState {
                    slot: slot.to_string(),
                    location: self.store.location(),
                });
            }
        }
        let phase = PhaseIndex::from_raw(self.store.load(PHASE_INDEX_SLOT)?);
        let position = self.store.load(GLOBAL_POSITION_SLOT)?;
        log::debug!(target: "store", "Loaded phase={} position={} from {}", phase.value(), position, self.store.location());
        Ok(MotorState { phase, position, mapping })
    }

    /// Phase index first, then position.
    pub fn save(&mut self, state: &MotorState) -> MotorResult<()> {
        self.store.save(PHASE_INDEX_SLOT, state.phase.into())?;
        self.store.save(GLOBAL_POSITION_SLOT, state.position)?;
        Ok(())
    }

    /// Write (0, 0) without any motor present.
    pub fn reset(&mut self) -> MotorResult<()> {
        self.store.save(PHASE_INDEX_SLOT, 0)?;
        self.store.save(GLOBAL_POSITION_SLOT, 0)?;
        log::info!(target: "store", "Motor counters reset to 0 in {}", self.store.location());
        Ok(())
    }

    pub fn save_calibration(&mut self, result: &CalibrationResult) -> MotorResult<()> {
        self.store.save(CALIBRATION_DIRECTION_SLOT, result.direction.code())?;
        self.store.save(FULL_RANGE_STEPS_SLOT, result.steps_traveled as i64)?;
        Ok(())
    }

    /// `None` until a calibration run has finished.
    pub fn load_calibration(&self) -> MotorResult<Option<CalibrationResult>> {
        if !self.store.exists(FULL_RANGE_STEPS_SLOT) {
            return Ok(None);
        }
        let steps = self.store.load(FULL_RANGE_STEPS_SLOT)?;
        let steps_traveled = u64::try_from(steps).map_err(|_| MotorError::CorruptState {
            slot: FULL_RANGE_STEPS_SLOT.to_string(),
            value: steps.to_string(),
        })?;
        let direction = if self.store.exists(CALIBRATION_DIRECTION_SLOT) {
            Direction::try_from(self.store.load(CALIBRATION_DIRECTION_SLOT)?)?
        } else {
            Direction::Cw
        };
        Ok(Some(CalibrationResult { direction, steps_traveled }))
    }

    pub fn inner(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_store_round_trips_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path().join("blinds"));
        assert!(!store.exists(GLOBAL_POSITION_SLOT));
        store.save(GLOBAL_POSITION_SLOT, -42).unwrap();
        store.save(GLOBAL_POSITION_SLOT, 17).unwrap();
        assert_eq!(store.load(GLOBAL_POSITION_SLOT).unwrap(), 17);

        let names: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["global_position.yaml".to_string()]);
    }

    #[test]
    fn replace_durably_overwrites_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("phase_index.yaml");
        let tmp = dir.path().join(".phase_index.yaml.tmp");
        fs::write(&path, "3\n").unwrap();
        replace_durably(&path, &tmp, b"4\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "4\n");
        assert!(!tmp.exists());

        let missing = dir.path().join("nope").join("x.yaml");
        let missing_tmp = dir.path().join("nope").join(".x.yaml.tmp");
        assert!(matches!(
            replace_durably(&missing, &missing_tmp, b"1"),
            Err(MotorError::Storage { .. })
        ));
    }

    #[test]
    fn poisoned_memory_store_refuses_to_save() {
        let mut store = MemoryStore::with_state(0, 0);
        let shared = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.slots.lock().unwrap();
            panic!("poison the slot map");
        })
        .join();
        assert!(matches!(store.save(GLOBAL_POSITION_SLOT, 9), Err(MotorError::Storage { .. })));
    }

    #[test]
    fn file_store_missing_slot_is_missing_state() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        match store.load(PHASE_INDEX_SLOT) {
            Err(MotorError::MissingState { slot, .. }) => assert_eq!(slot, PHASE_INDEX_SLOT),
            other => panic!("expected MissingState, got {:?}", other),
        }
    }

    #[test]
    fn file_store_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("phase_index.yaml"), "not a number").unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(store.load(PHASE_INDEX_SLOT), Err(MotorError::CorruptState { .. })));
    }

    #[test]
    fn adapter_requires_both_counters() {
        let mut raw = MemoryStore::new();
        raw.save(PHASE_INDEX_SLOT, 3).unwrap();
        let adapter = MotorStateStore::new(raw);
        match adapter.load(DirectionMapping::Direct) {
            Err(MotorError::MissingState { slot, .. }) => assert_eq!(slot, GLOBAL_POSITION_SLOT),
            other => panic!("expected MissingState, got {:?}", other),
        }
    }

    #[test]
    fn adapter_wraps_phase_and_resets() {
        let raw = MemoryStore::with_state(11, -5);
        let mut adapter = MotorStateStore::new(raw.clone());
        let state = adapter.load(DirectionMapping::Inverted).unwrap();
        assert_eq!(state.phase.value(), 3);
        assert_eq!(state.position, -5);

        adapter.reset().unwrap();
        assert_eq!(raw.get(PHASE_INDEX_SLOT), Some(0));
        assert_eq!(raw.get(GLOBAL_POSITION_SLOT), Some(0));
    }

    #[test]
    fn calibration_result_persists_separately() {
        let raw = MemoryStore::with_state(0, 0);
        let mut adapter = MotorStateStore::new(raw.clone());
        assert!(adapter.load_calibration().unwrap().is_none());
        let result = CalibrationResult { direction: Direction::Ccw, steps_traveled: 1200 };
        adapter.save_calibration(&result).unwrap();
        assert_eq!(adapter.load_calibration().unwrap(), Some(result));
        assert_eq!(raw.get(GLOBAL_POSITION_SLOT), Some(0));
    }
}
