use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use rusqlite::types::ToSql;
use rusqlite::{Connection, Statement};

use crate::error::Result;
use crate::media::MediaKind;
use crate::proto::MediaHandle;
use crate::remote::NodeLink;
use crate::store::Store;

/// A declarative filter describing a subset of indexed media. Never
/// persisted; purely a query specification.
#[derive(Debug, Clone)]
pub struct Collection {
    pub kind: MediaKind,
    pub category: Option<String>,
    pub pattern: String,
}

impl Collection {
    pub fn new(kind: MediaKind, category: Option<&str>, pattern: &str) -> Collection {
        Collection {
            kind,
            category: category.map(|c| c.to_string()),
            pattern: pattern.to_string(),
        }
    }
}

/// The store a collection is evaluated against: the local index or a
/// connected peer. The caller contract is identical in both cases.
pub enum Target<'a> {
    Local(&'a Store),
    Remote(&'a NodeLink),
}

pub fn evaluate(target: &Target, collection: &Collection) -> Result<Vec<MediaHandle>> {
    match target {
        Target::Local(store) => evaluate_local(store, collection),
        Target::Remote(link) => link.get_collection(collection),
    }
}

struct QueryOptions {
    clauses: Vec<String>,
    values: Vec<Box<dyn ToSql>>,
    order_string: Option<String>,
}

impl QueryOptions {
    pub fn new() -> QueryOptions {
        QueryOptions {
            clauses: Vec::new(),
            values: Vec::new(),
            order_string: None,
        }
    }

    pub fn filter_values(&mut self, clause: &str, values: Vec<Box<dyn ToSql>>) {
        self.clauses.push(clause.to_string());

        for value in values {
            self.values.push(value);
        }
    }

    pub fn order_string(&mut self, order_string: &str) {
        self.order_string = Some(order_string.to_string());
    }

    pub fn into_items_query<'a>(
        self,
        conn: &'a Connection,
        select_from: &str,
    ) -> std::result::Result<(Statement<'a>, Vec<Box<dyn ToSql>>), rusqlite::Error> {
        let mut sql = select_from.to_string();

        if !self.clauses.is_empty() {
            sql += " WHERE ";
            sql += &self.clauses.join(" AND ");
        }

        if let Some(order) = self.order_string {
            sql += " ORDER BY ";
            sql += &order;
        }

        let st = conn.prepare(&sql)?;

        Ok((st, self.values))
    }
}

const FACT_EQUALS: &str = "EXISTS (
    SELECT 1 FROM Assoc
    INNER JOIN FactName ON FactName.fact_id = Assoc.fact_id
    INNER JOIN FactValue ON FactValue.value_id = Assoc.value_id
    WHERE Assoc.file_id = File.file_id AND FactName.name = ? AND FactValue.value = ?)";

const NAME_OR_PATH_LIKE: &str = "(File.path LIKE ? ESCAPE '\\' OR EXISTS (
    SELECT 1 FROM Assoc
    INNER JOIN FactName ON FactName.fact_id = Assoc.fact_id
    INNER JOIN FactValue ON FactValue.value_id = Assoc.value_id
    WHERE Assoc.file_id = File.file_id AND FactName.name = 'name'
        AND FactValue.value LIKE ? ESCAPE '\\'))";

/// Translates a glob pattern to a LIKE pattern. `*` and `?` are the only
/// glob metacharacters; LIKE metacharacters in the input are escaped.
fn glob_to_like(pattern: &str) -> String {
    let mut result = String::with_capacity(pattern.len());

    for c in pattern.chars() {
        match c {
            '*' => result.push('%'),
            '?' => result.push('_'),
            '%' | '_' | '\\' => {
                result.push('\\');
                result.push(c);
            }
            c => result.push(c),
        }
    }

    result
}

pub fn evaluate_local(store: &Store, collection: &Collection) -> Result<Vec<MediaHandle>> {
    trace!("evaluate {:?}", collection);

    let mut opts = QueryOptions::new();

    opts.filter_values(
        FACT_EQUALS,
        vec![
            Box::new("kind".to_string()),
            Box::new(collection.kind.as_str().to_string()),
        ],
    );

    if let Some(category) = &collection.category {
        opts.filter_values(
            FACT_EQUALS,
            vec![
                Box::new("category".to_string()),
                Box::new(category.to_string()),
            ],
        );
    }

    if !collection.pattern.is_empty() && collection.pattern != "*" {
        let like = glob_to_like(&collection.pattern);
        opts.filter_values(
            NAME_OR_PATH_LIKE,
            vec![Box::new(like.clone()), Box::new(like)],
        );
    }

    opts.order_string("File.path");

    let conn = store.connection();

    let (mut st, values) = opts.into_items_query(conn, "SELECT File.file_id, File.path FROM File")?;

    let mut rows = st.query(&values)?;

    let mut items: Vec<MediaHandle> = Vec::new();

    while let Some(row) = rows.next()? {
        let path: Vec<u8> = row.get(1)?;

        items.push(MediaHandle {
            file_id: row.get(0)?,
            path: OsStr::from_bytes(&path).to_string_lossy().to_string(),
        });
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreSource;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Arc;

    fn fixture_store(dir: &Path) -> Store {
        let source = StoreSource::create(dir.join("store.db"), Arc::new(Vec::new()))
            .unwrap()
            .unwrap();
        let mut store = source.get().unwrap();

        let files = [
            ("films/alpha.mkv", "video", "films", "alpha"),
            ("films/beta.mkv", "video", "films", "beta"),
            ("clips/alpha.mkv", "video", "clips", "alpha"),
            ("music/alpha.mp3", "audio", "music", "alpha"),
        ];

        for (path, kind, category, name) in files.iter() {
            let f = store.upsert_file(Path::new(path), 10, 1).unwrap();
            store.set_fact(f, "kind", kind, None).unwrap();
            store.set_fact(f, "category", category, None).unwrap();
            store.set_fact(f, "name", name, None).unwrap();
        }

        source.get().unwrap()
    }

    fn paths(items: &[MediaHandle]) -> Vec<String> {
        items.iter().map(|i| i.path.clone()).collect()
    }

    #[test]
    fn glob_translation() {
        assert_eq!(glob_to_like("*"), "%");
        assert_eq!(glob_to_like("al?ha*"), "al_ha%");
        assert_eq!(glob_to_like("50%_off"), "50\\%\\_off");
    }

    #[test]
    fn kind_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path());

        let collection = Collection::new(MediaKind::Video, None, "*");
        let items = evaluate_local(&store, &collection).unwrap();

        assert_eq!(
            paths(&items),
            vec!["clips/alpha.mkv", "films/alpha.mkv", "films/beta.mkv"]
        );
    }

    #[test]
    fn category_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path());

        let collection = Collection::new(MediaKind::Video, Some("films"), "*");
        let items = evaluate_local(&store, &collection).unwrap();

        assert_eq!(paths(&items), vec!["films/alpha.mkv", "films/beta.mkv"]);
    }

    #[test]
    fn pattern_matches_name_fact() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path());

        let collection = Collection::new(MediaKind::Video, None, "al*");
        let items = evaluate_local(&store, &collection).unwrap();

        assert_eq!(paths(&items), vec!["clips/alpha.mkv", "films/alpha.mkv"]);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path());

        let collection = Collection::new(MediaKind::Video, Some("films"), "*");

        let first: HashSet<i64> = evaluate_local(&store, &collection)
            .unwrap()
            .into_iter()
            .map(|i| i.file_id)
            .collect();

        for _ in 0..3 {
            let again: HashSet<i64> = evaluate_local(&store, &collection)
                .unwrap()
                .into_iter()
                .map(|i| i.file_id)
                .collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn no_matches_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path());

        let collection = Collection::new(MediaKind::Image, None, "*");
        assert!(evaluate_local(&store, &collection).unwrap().is_empty());
    }
}
