use std::error::Error as StdError;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Result, Row};

use crate::config::Root;
use crate::db_meta;
use crate::media::Fact;
use crate::schema;

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: i64,
    pub path: PathBuf,
    pub mtime: i64,
    pub scan_epoch: i64,
}

pub struct StoreSource {
    db_path: PathBuf,
    roots: Arc<Vec<Root>>,
}

pub struct Store {
    conn: Connection,
    roots: Arc<Vec<Root>>,
}

impl StoreSource {
    pub fn create(db_path: PathBuf, roots: Arc<Vec<Root>>) -> Result<Option<StoreSource>> {
        info!("using '{}'", db_path.to_string_lossy());

        let source = StoreSource { db_path, roots };

        let mut store = source.get()?;
        if !db_meta::ensure_schema(&mut store.conn, schema::STORE_SCHEMA)? {
            return Ok(None);
        }

        Ok(Some(source))
    }

    pub fn get(&self) -> Result<Store> {
        let conn = match Connection::open(&self.db_path) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    "can't open sqlite database '{}': {}",
                    self.db_path.to_string_lossy(),
                    e.description()
                );
                return Err(e);
            }
        };

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;",
        )?;

        Ok(Store {
            conn,
            roots: self.roots.clone(),
        })
    }
}

impl Store {
    pub fn roots(&self) -> &Vec<Root> {
        &self.roots
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Maps a virtual path (root name + relative components) to a
    /// filesystem path using the configured roots.
    pub fn map_fs_path(&self, path: &Path) -> Option<PathBuf> {
        let mut iter = path.iter();

        let root_name = match iter.next() {
            Some(name) => match name.to_str() {
                Some(name) => name,
                None => return None,
            },
            None => return None,
        };

        let root_dir = match self.roots.iter().find(|&r| r.name == root_name) {
            Some(name) => name,
            None => return None,
        };

        let mut result = PathBuf::from(&root_dir.path);

        for component in iter {
            result.push(component);
        }

        Some(result)
    }

    fn _get_file(row: &Row) -> Result<FileRecord> {
        let path_bytes: Vec<u8> = row.get(1)?;

        Ok(FileRecord {
            file_id: row.get(0)?,
            path: Path::new(OsStr::from_bytes(&path_bytes)).to_path_buf(),
            mtime: row.get(2)?,
            scan_epoch: row.get(3)?,
        })
    }

    pub fn file(&self, file_id: i64) -> Result<Option<FileRecord>> {
        trace!("get file file_id={}", file_id);

        let mut st = self.conn.prepare(
            "SELECT file_id, path, mtime, scan_epoch
            FROM File
            WHERE file_id = ?",
        )?;

        let mut rows = st.query(&[file_id])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::_get_file(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn file_by_path(&self, path: &Path) -> Result<Option<FileRecord>> {
        trace!("get file path='{}'", path.to_string_lossy());

        let mut st = self.conn.prepare(
            "SELECT file_id, path, mtime, scan_epoch
            FROM File
            WHERE path = ?",
        )?;

        let path_bytes = path.as_os_str().as_bytes();

        let mut rows = st.query(&[path_bytes])?;

        if let Some(row) = rows.next()? {
            Ok(Some(Self::_get_file(row)?))
        } else {
            Ok(None)
        }
    }

    /// Inserts a new file record or refreshes mtime and epoch of an
    /// existing one.
    pub fn upsert_file(&mut self, path: &Path, mtime: i64, epoch: i64) -> Result<i64> {
        let tran = self.conn.transaction()?;
        let file_id = upsert_file_conn(&tran, path, mtime, epoch)?;
        tran.commit()?;

        Ok(file_id)
    }

    /// Resolves or creates the fact name and value rows, then associates
    /// them with the file. Setting the same (file, name, value) twice is a
    /// no-op.
    pub fn set_fact(
        &mut self,
        file_id: i64,
        fact_name: &str,
        value: &str,
        lang_id: Option<i64>,
    ) -> Result<()> {
        let tran = self.conn.transaction()?;
        set_fact_conn(&tran, file_id, fact_name, value, lang_id)?;
        tran.commit()?;

        Ok(())
    }

    pub fn get_fact(&self, file_id: i64, fact_name: &str) -> Result<Option<String>> {
        trace!("get fact file_id={} name={}", file_id, fact_name);

        self.conn
            .query_row(
                "SELECT FactValue.value
                FROM Assoc
                INNER JOIN FactName ON FactName.fact_id = Assoc.fact_id
                INNER JOIN FactValue ON FactValue.value_id = Assoc.value_id
                WHERE Assoc.file_id = ? AND FactName.name = ?
                ORDER BY Assoc.value_id
                LIMIT 1",
                params![file_id, fact_name],
                |row| row.get(0),
            )
            .optional()
    }

    /// Multi-valued form of `get_fact`.
    pub fn facts(&self, file_id: i64, fact_name: &str) -> Result<Vec<String>> {
        trace!("get facts file_id={} name={}", file_id, fact_name);

        let mut st = self.conn.prepare(
            "SELECT FactValue.value
            FROM Assoc
            INNER JOIN FactName ON FactName.fact_id = Assoc.fact_id
            INNER JOIN FactValue ON FactValue.value_id = Assoc.value_id
            WHERE Assoc.file_id = ? AND FactName.name = ?
            ORDER BY Assoc.value_id",
        )?;

        let mut rows = st.query(params![file_id, fact_name])?;

        let mut result = Vec::new();

        while let Some(row) = rows.next()? {
            result.push(row.get(0)?);
        }

        Ok(result)
    }

    /// Files whose record was not touched by the given scan pass. After a
    /// completed pass these are exactly the files that vanished from disk.
    pub fn files_with_epoch_not_equal(&self, epoch: i64) -> Result<Vec<(PathBuf, i64)>> {
        trace!("list files with epoch != {}", epoch);

        let mut st = self.conn.prepare(
            "SELECT path, file_id
            FROM File
            WHERE scan_epoch != ?",
        )?;

        let mut rows = st.query(&[epoch])?;

        let mut result = Vec::new();

        while let Some(row) = rows.next()? {
            let path_bytes: Vec<u8> = row.get(0)?;
            result.push((
                Path::new(OsStr::from_bytes(&path_bytes)).to_path_buf(),
                row.get(1)?,
            ));
        }

        Ok(result)
    }

    /// Removes the file, its associations and any fact values no other
    /// association still references.
    pub fn delete_file(&mut self, file_id: i64) -> Result<()> {
        trace!("delete file file_id={}", file_id);

        let tran = self.conn.transaction()?;

        clear_assocs_conn(&tran, file_id)?;
        tran.execute("DELETE FROM File WHERE file_id = ?", &[file_id])?;

        tran.commit()?;

        Ok(())
    }

    /// Commits one scanned file atomically: the file record, the removal of
    /// its previous associations and all newly extracted facts land in a
    /// single transaction.
    pub fn index_file(
        &mut self,
        path: &Path,
        mtime: i64,
        epoch: i64,
        facts: &[Fact],
    ) -> Result<i64> {
        let tran = self.conn.transaction()?;

        let file_id = upsert_file_conn(&tran, path, mtime, epoch)?;

        clear_assocs_conn(&tran, file_id)?;

        for fact in facts {
            set_fact_conn(&tran, file_id, &fact.name, &fact.value, None)?;
        }

        tran.commit()?;

        debug!("indexed '{}' ({} facts)", path.to_string_lossy(), facts.len());

        Ok(file_id)
    }

    pub fn epoch(&self) -> Result<i64> {
        Ok(db_meta::get_meta_i64(&self.conn, "scan_epoch")?.unwrap_or(0))
    }

    /// Allocates the next scan epoch and persists it.
    pub fn next_epoch(&mut self) -> Result<i64> {
        let tran = self.conn.transaction()?;

        let epoch = db_meta::get_meta_i64(&tran, "scan_epoch")?.unwrap_or(0) + 1;
        db_meta::set_meta_i64(&tran, "scan_epoch", epoch)?;

        tran.commit()?;

        Ok(epoch)
    }
}

fn upsert_file_conn(conn: &Connection, path: &Path, mtime: i64, epoch: i64) -> Result<i64> {
    let path_bytes = path.as_os_str().as_bytes();

    let existing: Option<i64> = conn
        .query_row(
            "SELECT file_id FROM File WHERE path = ?",
            &[path_bytes],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(file_id) => {
            conn.execute(
                "UPDATE File SET mtime = ?, scan_epoch = ? WHERE file_id = ?",
                params![mtime, epoch, file_id],
            )?;
            Ok(file_id)
        }
        None => {
            conn.execute(
                "INSERT INTO File (path, mtime, scan_epoch) VALUES (?, ?, ?)",
                params![path_bytes, mtime, epoch],
            )?;

            let file_id = conn.last_insert_rowid();

            debug!("create file {} '{}'", file_id, path.to_string_lossy());

            Ok(file_id)
        }
    }
}

fn set_fact_conn(
    conn: &Connection,
    file_id: i64,
    fact_name: &str,
    value: &str,
    lang_id: Option<i64>,
) -> Result<()> {
    let fact_id: Option<i64> = conn
        .query_row(
            "SELECT fact_id FROM FactName WHERE name = ?",
            &[fact_name],
            |row| row.get(0),
        )
        .optional()?;

    let fact_id = match fact_id {
        Some(id) => id,
        None => {
            conn.execute("INSERT INTO FactName (name) VALUES (?)", &[fact_name])?;
            conn.last_insert_rowid()
        }
    };

    let value_id: Option<i64> = conn
        .query_row(
            "SELECT value_id FROM FactValue WHERE value = ?",
            &[value],
            |row| row.get(0),
        )
        .optional()?;

    let value_id = match value_id {
        Some(id) => id,
        None => {
            conn.execute(
                "INSERT INTO FactValue (value, lang_id) VALUES (?, ?)",
                params![value, lang_id],
            )?;
            conn.last_insert_rowid()
        }
    };

    conn.execute(
        "INSERT OR IGNORE INTO Assoc (file_id, fact_id, value_id) VALUES (?, ?, ?)",
        params![file_id, fact_id, value_id],
    )?;

    Ok(())
}

// Deletes the file's associations and then every fact value left without a
// referencing association, inside the caller's transaction.
fn clear_assocs_conn(conn: &Connection, file_id: i64) -> Result<()> {
    let mut value_ids: Vec<i64> = Vec::new();

    {
        let mut st = conn.prepare("SELECT DISTINCT value_id FROM Assoc WHERE file_id = ?")?;
        let mut rows = st.query(&[file_id])?;

        while let Some(row) = rows.next()? {
            value_ids.push(row.get(0)?);
        }
    }

    conn.execute("DELETE FROM Assoc WHERE file_id = ?", &[file_id])?;

    for value_id in value_ids {
        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM Assoc WHERE value_id = ?",
            &[value_id],
            |row| row.get(0),
        )?;

        if remaining == 0 {
            conn.execute("DELETE FROM FactValue WHERE value_id = ?", &[value_id])?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Fact;
    use rusqlite::NO_PARAMS;

    fn open_store(dir: &Path) -> Store {
        let source = StoreSource::create(dir.join("store.db"), Arc::new(Vec::new()))
            .unwrap()
            .unwrap();
        source.get().unwrap()
    }

    fn count(store: &Store, sql: &str) -> i64 {
        store
            .connection()
            .query_row(sql, NO_PARAMS, |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn set_fact_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());

        let f = store.upsert_file(Path::new("music/a.mp3"), 10, 1).unwrap();

        store.set_fact(f, "album", "X", None).unwrap();
        store.set_fact(f, "album", "X", None).unwrap();

        assert_eq!(count(&store, "SELECT COUNT(*) FROM Assoc"), 1);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM FactValue WHERE value = 'X'"),
            1
        );
        assert_eq!(store.get_fact(f, "album").unwrap(), Some("X".to_string()));
    }

    #[test]
    fn value_shared_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());

        let f = store.upsert_file(Path::new("music/a.mp3"), 10, 1).unwrap();
        let g = store.upsert_file(Path::new("music/b.mp3"), 10, 1).unwrap();

        store.set_fact(f, "album", "X", None).unwrap();
        store.set_fact(g, "album", "X", None).unwrap();

        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM FactValue WHERE value = 'X'"),
            1
        );
        assert_eq!(count(&store, "SELECT COUNT(*) FROM Assoc"), 2);
    }

    #[test]
    fn delete_file_collects_orphaned_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());

        let f = store.upsert_file(Path::new("music/a.mp3"), 10, 1).unwrap();
        let g = store.upsert_file(Path::new("music/b.mp3"), 10, 1).unwrap();

        store.set_fact(f, "album", "X", None).unwrap();
        store.set_fact(f, "artist", "only-f", None).unwrap();
        store.set_fact(g, "album", "X", None).unwrap();

        store.delete_file(f).unwrap();

        // "only-f" was referenced by f alone and is gone, "X" survives via g
        assert_eq!(
            count(
                &store,
                "SELECT COUNT(*) FROM FactValue WHERE value = 'only-f'"
            ),
            0
        );
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM FactValue WHERE value = 'X'"),
            1
        );
        assert_eq!(store.file(f).unwrap().is_none(), true);
        assert_eq!(store.get_fact(g, "album").unwrap(), Some("X".to_string()));
    }

    #[test]
    fn epoch_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());

        store.upsert_file(Path::new("music/a.mp3"), 10, 1).unwrap();
        let b = store.upsert_file(Path::new("music/b.mp3"), 10, 1).unwrap();
        store.upsert_file(Path::new("music/c.mp3"), 10, 1).unwrap();

        // second pass sees a and c only
        store.upsert_file(Path::new("music/a.mp3"), 10, 2).unwrap();
        store.upsert_file(Path::new("music/c.mp3"), 10, 2).unwrap();

        let stale = store.files_with_epoch_not_equal(2).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, Path::new("music/b.mp3"));
        assert_eq!(stale[0].1, b);

        store.delete_file(b).unwrap();
        assert!(store.file_by_path(Path::new("music/b.mp3")).unwrap().is_none());
    }

    #[test]
    fn index_file_replaces_previous_facts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());

        let facts = vec![Fact::new("name", "old"), Fact::new("kind", "audio")];
        let f = store
            .index_file(Path::new("music/a.mp3"), 10, 1, &facts)
            .unwrap();

        let facts = vec![Fact::new("name", "new"), Fact::new("kind", "audio")];
        let f2 = store
            .index_file(Path::new("music/a.mp3"), 20, 2, &facts)
            .unwrap();

        assert_eq!(f, f2);
        assert_eq!(store.get_fact(f, "name").unwrap(), Some("new".to_string()));
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM FactValue WHERE value = 'old'"),
            0
        );
    }

    #[test]
    fn epoch_counter_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());

        assert_eq!(store.epoch().unwrap(), 0);
        assert_eq!(store.next_epoch().unwrap(), 1);
        assert_eq!(store.next_epoch().unwrap(), 2);
        assert_eq!(store.epoch().unwrap(), 2);
    }

    #[test]
    fn multi_valued_facts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());

        let f = store.upsert_file(Path::new("music/a.mp3"), 10, 1).unwrap();
        store.set_fact(f, "artist", "A", None).unwrap();
        store.set_fact(f, "artist", "B", None).unwrap();

        assert_eq!(
            store.facts(f, "artist").unwrap(),
            vec!["A".to_string(), "B".to_string()]
        );
        assert_eq!(store.get_fact(f, "artist").unwrap(), Some("A".to_string()));
    }
}
