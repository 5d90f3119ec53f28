use std::error::Error as StdError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::media;
use crate::store::Store;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ScanPhase {
    Discover,
    Extract,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ScanState {
    Idle,
    Scanning { phase: ScanPhase, percent: u8 },
}

#[derive(Debug, Default)]
pub struct ScanStat {
    pub indexed: i32,
    pub unchanged: i32,
    pub pruned: i32,
}

impl ScanStat {
    fn add(&mut self, other: &ScanStat) {
        self.indexed += other.indexed;
        self.unchanged += other.unchanged;
        self.pruned += other.pruned;
    }
}

pub struct ScanThread {
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<ScanState>>,
    join_handle: Mutex<Option<JoinHandle<ScanStat>>>,
}

impl ScanThread {
    pub fn new() -> ScanThread {
        ScanThread {
            stop: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(ScanState::Idle)),
            join_handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() != ScanState::Idle
    }

    /// Launches a scan pass on a background thread. A pass already in
    /// progress is rejected; passes never run in parallel against the same
    /// store.
    pub fn start(&self, store: Store, extensions: Vec<String>) -> Result<()> {
        let mut join_handle = self.join_handle.lock().unwrap();

        if join_handle.is_some() {
            if *self.state.lock().unwrap() != ScanState::Idle {
                return Err(Error::ScanBusy);
            }

            // previous pass finished, reap it
            if let Some(handle) = join_handle.take() {
                let _ = handle.join();
            }
        }

        self.stop.store(false, Ordering::Relaxed);
        *self.state.lock().unwrap() = ScanState::Scanning {
            phase: ScanPhase::Discover,
            percent: 0,
        };

        let stop = self.stop.clone();
        let state = self.state.clone();

        *join_handle = Some(std::thread::spawn(move || {
            let mut scan = Scan {
                stop,
                stop_detected: false,
                state: state.clone(),
                store,
                extensions,
            };

            let stat = scan.run();

            *state.lock().unwrap() = ScanState::Idle;

            stat
        }));

        Ok(())
    }

    pub fn stop(&self) {
        let mut join_handle = self.join_handle.lock().unwrap();

        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = join_handle.take() {
            let _ = handle.join();
        }
    }
}

struct Scan {
    stop: Arc<AtomicBool>,
    stop_detected: bool,
    state: Arc<Mutex<ScanState>>,
    store: Store,
    extensions: Vec<String>,
}

impl Scan {
    fn interrupted(&mut self) -> bool {
        let stop = self.stop.load(Ordering::Relaxed);

        if stop && !self.stop_detected {
            self.stop_detected = true;
            debug!("interrupt noted, stopping");
        }

        stop
    }

    fn set_state(&self, phase: ScanPhase, percent: u8) {
        *self.state.lock().unwrap() = ScanState::Scanning { phase, percent };
    }

    fn run(&mut self) -> ScanStat {
        info!("started");

        let mut stat = ScanStat {
            ..Default::default()
        };

        let epoch = match self.store.next_epoch() {
            Ok(e) => e,
            Err(e) => {
                error!("can't allocate scan epoch: {}", e.description());
                return stat;
            }
        };

        debug!("scan epoch {}", epoch);

        let start_instant = Instant::now();

        let roots: Vec<(String, PathBuf)> = self
            .store
            .roots()
            .iter()
            .map(|r| (r.name.to_string(), r.path.to_path_buf()))
            .collect();

        let mut candidates: Vec<(PathBuf, PathBuf)> = Vec::new();

        for (name, path) in roots {
            if self.interrupted() {
                return stat;
            }

            debug!("root '{}' = '{}'", name, path.to_string_lossy());

            if let Err(e) = self.discover(&PathBuf::from(&name), &path, &mut candidates) {
                error!(
                    "can't scan root '{}' -> '{}': {}",
                    name,
                    path.to_string_lossy(),
                    e.description()
                );
            }
        }

        let total = candidates.len();

        self.set_state(ScanPhase::Extract, 0);

        for (done, (virtual_path, fs_path)) in candidates.iter().enumerate() {
            if self.interrupted() {
                return stat;
            }

            match self.process_file(virtual_path, fs_path, epoch) {
                Ok(s) => stat.add(&s),
                Err(e) => {
                    error!(
                        "can't process '{}': {}",
                        fs_path.to_string_lossy(),
                        e.description()
                    );
                }
            }

            self.set_state(
                ScanPhase::Extract,
                ((done + 1) * 100 / total.max(1)) as u8,
            );
        }

        stat.pruned = self.prune(epoch);

        info!("done in {}s: {:?}", start_instant.elapsed().as_secs(), stat);

        stat
    }

    /// Walks a directory collecting regular files whose extension is in the
    /// configured set. Unreadable entries are logged and skipped.
    fn discover(
        &mut self,
        virtual_dir: &Path,
        fs_dir: &Path,
        out: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<()> {
        trace!("directory '{}'", fs_dir.to_string_lossy());

        for entry in fs::read_dir(fs_dir)? {
            if self.interrupted() {
                return Ok(());
            }

            let entry = entry?;
            let file_name = entry.file_name();
            let fs_path = fs_dir.join(&file_name);
            let virtual_path = virtual_dir.join(&file_name);

            let metadata = match fs::metadata(&fs_path) {
                Ok(m) => m,
                Err(e) => {
                    error!(
                        "metadata error '{}': {}",
                        fs_path.to_string_lossy(),
                        e.description()
                    );
                    continue;
                }
            };

            if metadata.is_dir() {
                if let Err(e) = self.discover(&virtual_path, &fs_path, out) {
                    error!(
                        "can't read directory '{}': {}",
                        fs_path.to_string_lossy(),
                        e.description()
                    );
                }
            } else if metadata.is_file() {
                let extension = match fs_path.extension().and_then(|e| e.to_str()) {
                    Some(e) => e.to_ascii_lowercase(),
                    None => continue,
                };

                if self.extensions.iter().any(|e| *e == extension) {
                    out.push((virtual_path, fs_path));
                }
            }
        }

        Ok(())
    }

    fn process_file(&mut self, virtual_path: &Path, fs_path: &Path, epoch: i64) -> Result<ScanStat> {
        let metadata = fs::metadata(fs_path)?;

        let mtime = match metadata
            .modified()?
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
        {
            Ok(n) => n.as_secs() as i64,
            Err(_) => {
                error!("invalid modified '{}'", fs_path.to_string_lossy());
                return Err(Error::OtherError);
            }
        };

        let existing = self.store.file_by_path(virtual_path)?;

        if let Some(record) = existing {
            if record.mtime == mtime {
                // unchanged, touch the epoch and leave the facts alone
                self.store.upsert_file(virtual_path, mtime, epoch)?;

                return Ok(ScanStat {
                    unchanged: 1,
                    ..Default::default()
                });
            }
        }

        debug!("extract '{}'", fs_path.to_string_lossy());

        let facts = media::extract_facts(fs_path, virtual_path);
        self.store.index_file(virtual_path, mtime, epoch, &facts)?;

        Ok(ScanStat {
            indexed: 1,
            ..Default::default()
        })
    }

    /// Removes store entries for files that vanished from disk since the
    /// previous pass.
    fn prune(&mut self, epoch: i64) -> i32 {
        let stale = match self.store.files_with_epoch_not_equal(epoch) {
            Ok(s) => s,
            Err(e) => {
                error!("can't list stale files: {}", e.description());
                return 0;
            }
        };

        let mut pruned = 0;

        for (path, file_id) in stale {
            debug!("prune '{}'", path.to_string_lossy());

            match self.store.delete_file(file_id) {
                Ok(()) => pruned += 1,
                Err(e) => {
                    error!(
                        "can't prune '{}': {}",
                        path.to_string_lossy(),
                        e.description()
                    );
                }
            }
        }

        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Root;
    use crate::store::StoreSource;
    use rusqlite::NO_PARAMS;

    fn scan_fixture(dir: &Path) -> (StoreSource, Vec<String>) {
        let root = dir.join("library");
        fs::create_dir_all(root.join("sub")).unwrap();

        fs::write(root.join("a.mp3"), b"audio").unwrap();
        fs::write(root.join("b.mp3"), b"audio").unwrap();
        fs::write(root.join("sub").join("c.mkv"), b"video").unwrap();
        fs::write(root.join("notes.txt"), b"text").unwrap();

        let roots = Arc::new(vec![Root {
            name: "library".to_string(),
            path: root,
        }]);

        let source = StoreSource::create(dir.join("store.db"), roots)
            .unwrap()
            .unwrap();

        (source, media::default_extensions())
    }

    fn run_pass(source: &StoreSource, extensions: &[String]) -> ScanStat {
        let mut scan = Scan {
            stop: Arc::new(AtomicBool::new(false)),
            stop_detected: false,
            state: Arc::new(Mutex::new(ScanState::Idle)),
            store: source.get().unwrap(),
            extensions: extensions.to_vec(),
        };

        scan.run()
    }

    fn assoc_value_ids(source: &StoreSource, file_id: i64) -> Vec<i64> {
        let store = source.get().unwrap();
        let conn = store.connection();
        let mut st = conn
            .prepare("SELECT value_id FROM Assoc WHERE file_id = ? ORDER BY value_id")
            .unwrap();
        let mut rows = st.query(&[file_id]).unwrap();

        let mut ids = Vec::new();
        while let Some(row) = rows.next().unwrap() {
            ids.push(row.get(0).unwrap());
        }
        ids
    }

    #[test]
    fn pass_indexes_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let (source, extensions) = scan_fixture(dir.path());

        let stat = run_pass(&source, &extensions);
        assert_eq!(stat.indexed, 3);
        assert_eq!(stat.pruned, 0);

        let store = source.get().unwrap();
        let a = store
            .file_by_path(Path::new("library/a.mp3"))
            .unwrap()
            .unwrap();
        assert_eq!(store.get_fact(a.file_id, "kind").unwrap(), Some("audio".to_string()));
        assert_eq!(store.get_fact(a.file_id, "name").unwrap(), Some("a".to_string()));
        assert_eq!(
            store.get_fact(a.file_id, "category").unwrap(),
            Some("library".to_string())
        );

        // the txt file was not picked up
        assert!(store
            .file_by_path(Path::new("library/notes.txt"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn unchanged_file_skips_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let (source, extensions) = scan_fixture(dir.path());

        run_pass(&source, &extensions);

        let store = source.get().unwrap();
        let a = store
            .file_by_path(Path::new("library/a.mp3"))
            .unwrap()
            .unwrap();
        let before = assoc_value_ids(&source, a.file_id);

        let stat = run_pass(&source, &extensions);
        assert_eq!(stat.unchanged, 3);
        assert_eq!(stat.indexed, 0);

        // same value rows, same epoch touch
        assert_eq!(assoc_value_ids(&source, a.file_id), before);
        let a = store
            .file_by_path(Path::new("library/a.mp3"))
            .unwrap()
            .unwrap();
        assert_eq!(a.scan_epoch, 2);
    }

    #[test]
    fn changed_file_is_reextracted() {
        let dir = tempfile::tempdir().unwrap();
        let (source, extensions) = scan_fixture(dir.path());

        run_pass(&source, &extensions);

        // falsify the stored mtime so the next pass sees a change
        let mut store = source.get().unwrap();
        let a = store
            .file_by_path(Path::new("library/a.mp3"))
            .unwrap()
            .unwrap();
        store.upsert_file(&a.path, a.mtime - 100, a.scan_epoch).unwrap();

        let stat = run_pass(&source, &extensions);
        assert_eq!(stat.indexed, 1);
        assert_eq!(stat.unchanged, 2);
    }

    #[test]
    fn deleted_file_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let (source, extensions) = scan_fixture(dir.path());

        run_pass(&source, &extensions);

        fs::remove_file(dir.path().join("library").join("b.mp3")).unwrap();

        let stat = run_pass(&source, &extensions);
        assert_eq!(stat.pruned, 1);

        let store = source.get().unwrap();
        assert!(store
            .file_by_path(Path::new("library/b.mp3"))
            .unwrap()
            .is_none());

        // no dangling associations or file rows
        let dangling: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM Assoc WHERE file_id NOT IN (SELECT file_id FROM File)",
                NO_PARAMS,
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dangling, 0);
    }

    #[test]
    fn concurrent_scan_is_rejected() {
        let scan_thread = ScanThread::new();

        *scan_thread.state.lock().unwrap() = ScanState::Scanning {
            phase: ScanPhase::Discover,
            percent: 0,
        };
        *scan_thread.join_handle.lock().unwrap() = Some(std::thread::spawn(ScanStat::default));

        let dir = tempfile::tempdir().unwrap();
        let (source, extensions) = scan_fixture(dir.path());

        match scan_thread.start(source.get().unwrap(), extensions) {
            Err(Error::ScanBusy) => {}
            other => panic!("expected ScanBusy, got {:?}", other.is_ok()),
        }

        *scan_thread.state.lock().unwrap() = ScanState::Idle;
        scan_thread.stop();
    }
}
