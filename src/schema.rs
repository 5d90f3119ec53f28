pub const SCHEMA_VERSION: u32 = 1;

pub const META_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Mediad (
    key TEXT PRIMARY KEY,
    value);
";

pub const STORE_SCHEMA: &str = "
CREATE TABLE File (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    mtime INTEGER NOT NULL,
    scan_epoch INTEGER NOT NULL);

CREATE INDEX File_scan_epoch ON File (scan_epoch);

CREATE TABLE FactName (
    fact_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE);

CREATE TABLE FactValue (
    value_id INTEGER PRIMARY KEY AUTOINCREMENT,
    value TEXT NOT NULL UNIQUE,
    lang_id INTEGER);

CREATE TABLE Assoc (
    file_id INTEGER NOT NULL,
    fact_id INTEGER NOT NULL,
    value_id INTEGER NOT NULL,
    PRIMARY KEY(file_id, fact_id, value_id),
    FOREIGN KEY(file_id) REFERENCES File(file_id) ON DELETE CASCADE,
    FOREIGN KEY(fact_id) REFERENCES FactName(fact_id),
    FOREIGN KEY(value_id) REFERENCES FactValue(value_id));

CREATE INDEX Assoc_fact_value ON Assoc (fact_id, value_id);
CREATE INDEX Assoc_value_id ON Assoc (value_id);
";
