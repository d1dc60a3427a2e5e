use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

/// Value of the `format` meta key in every profile we write
pub const FORMAT_NAME: &str = "cmemprof-heap";

/// Create all tables, dropping any left over from an earlier recording
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS callsite_frames;
        DROP TABLE IF EXISTS callsites;
        DROP TABLE IF EXISTS locations;
        DROP TABLE IF EXISTS meta;

        CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Unique locations (file, line, function)
        CREATE TABLE locations (
            id INTEGER PRIMARY KEY,
            file TEXT NOT NULL,
            line INTEGER NOT NULL,
            function TEXT NOT NULL,
            UNIQUE(file, line, function)
        );

        -- One row per unique call stack, charged to its attributed location
        CREATE TABLE callsites (
            id INTEGER PRIMARY KEY,
            stack_hash INTEGER NOT NULL,
            location_id INTEGER NOT NULL,
            alloc_count INTEGER NOT NULL,
            alloc_bytes INTEGER NOT NULL,
            samples INTEGER NOT NULL,
            FOREIGN KEY (location_id) REFERENCES locations(id)
        );

        CREATE INDEX idx_callsite_location ON callsites(location_id);

        -- Full stack of each callsite, depth 0 is the innermost frame
        CREATE TABLE callsite_frames (
            callsite_id INTEGER NOT NULL,
            depth INTEGER NOT NULL,
            address INTEGER NOT NULL,
            location_id INTEGER NOT NULL,
            PRIMARY KEY (callsite_id, depth),
            FOREIGN KEY (callsite_id) REFERENCES callsites(id),
            FOREIGN KEY (location_id) REFERENCES locations(id)
        );
        "#,
    )
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        [key, value],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
        row.get(0)
    })
    .optional()
}

/// Whether `conn` holds a profile written by this tool
pub fn is_profile(conn: &Connection) -> rusqlite::Result<bool> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meta')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(false);
    }
    Ok(get_meta(conn, "format")?.as_deref() == Some(FORMAT_NAME))
}

trait OptionalExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
