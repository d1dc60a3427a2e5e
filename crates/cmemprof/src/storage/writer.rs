use super::schema::{self, FORMAT_NAME, SCHEMA_VERSION};
use crate::error::{Error, Result};
use crate::process::ProcessInfo;
use crate::profile::{HeapProfile, stack_hash};
use crate::symbols::{Location, SymbolResolver};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;

/// Key for deduplicating locations: (file, line, function)
type LocationKey = (String, u32, String);

/// Storage writer for one recorded profile
pub struct Storage {
    conn: Connection,
    /// Cache: (file, line, function) -> location_id
    location_cache: HashMap<LocationKey, i64>,
}

impl Storage {
    /// Create a profile database, replacing whatever `path` held
    pub fn create(path: &Path, proc_info: &ProcessInfo, profile: &HeapProfile) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;

        schema::create_tables(&conn)?;

        let started_at = profile.started_at.unwrap_or_else(chrono::Utc::now);
        let meta = [
            ("format", FORMAT_NAME.to_string()),
            ("version", SCHEMA_VERSION.to_string()),
            ("pid", proc_info.pid().to_string()),
            ("process_name", proc_info.name().to_string()),
            ("exe_path", proc_info.exe_path().display().to_string()),
            ("start_time", started_at.to_rfc3339()),
            ("duration_ms", profile.duration.as_millis().to_string()),
            ("sampling_rate", profile.sampling_rate().to_string()),
            ("policy", profile.policy().to_string()),
            ("sample_count", profile.sample_count().to_string()),
            ("overwritten", profile.overwritten().to_string()),
        ];
        for (key, value) in &meta {
            schema::set_meta(&conn, key, value)?;
        }

        Ok(Storage {
            conn,
            location_cache: HashMap::new(),
        })
    }

    /// Symbolize every stack of `profile` and store it. Returns the number
    /// of callsites written.
    pub fn write_profile(
        &mut self,
        profile: &HeapProfile,
        resolver: &mut SymbolResolver,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let cache = &mut self.location_cache;
        let mut written = 0;

        for record in profile.records() {
            let attributed = resolver
                .attributed_frame(&record.stack)
                .unwrap_or_else(Location::unknown);
            let attributed_id = location_id(&tx, cache, &attributed)?;

            tx.prepare_cached(
                "INSERT INTO callsites (stack_hash, location_id, alloc_count, alloc_bytes, samples) VALUES (?, ?, ?, ?, ?)",
            )?
            .execute(rusqlite::params![
                stack_hash(&record.stack) as i64,
                attributed_id,
                record.count as i64,
                record.bytes as i64,
                record.samples as i64,
            ])?;
            let callsite_id = tx.last_insert_rowid();

            for (depth, &addr) in record.stack.iter().enumerate() {
                let frame = resolver.resolve_return_address(addr);
                let frame_location = location_id(&tx, cache, &frame)?;
                tx.prepare_cached(
                    "INSERT INTO callsite_frames (callsite_id, depth, address, location_id) VALUES (?, ?, ?, ?)",
                )?
                .execute(rusqlite::params![
                    callsite_id,
                    depth as i64,
                    addr as i64,
                    frame_location
                ])?;
            }
            written += 1;
        }

        tx.commit()?;
        tracing::debug!(
            callsites = written,
            locations = self.location_cache.len(),
            "profile written"
        );
        Ok(written)
    }

    pub fn query_top_heap(&self, limit: usize, filter: Option<&str>) -> Result<Vec<HeapEntry>> {
        Ok(query_top_heap(&self.conn, limit, filter)?)
    }

    pub fn query_totals(&self) -> Result<Totals> {
        Ok(query_totals(&self.conn)?)
    }
}

/// Get or create the id of `location`
fn location_id(
    conn: &Connection,
    cache: &mut HashMap<LocationKey, i64>,
    location: &Location,
) -> rusqlite::Result<i64> {
    let key = (
        location.file.clone(),
        location.line,
        location.function.clone(),
    );
    if let Some(&id) = cache.get(&key) {
        return Ok(id);
    }

    let line = location.line as i64;
    conn.prepare_cached("INSERT OR IGNORE INTO locations (file, line, function) VALUES (?, ?, ?)")?
        .execute(rusqlite::params![&location.file, line, &location.function])?;
    let id: i64 = conn
        .prepare_cached("SELECT id FROM locations WHERE file = ? AND line = ? AND function = ?")?
        .query_row(rusqlite::params![&location.file, line, &location.function], |row| {
            row.get(0)
        })?;

    cache.insert(key, id);
    Ok(id)
}

/// Open an existing profile for reading
pub fn open_profile(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(Error::InvalidArgument(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let conn = Connection::open(path)?;
    if !schema::is_profile(&conn)? {
        return Err(Error::NotAProfile(path.display().to_string()));
    }
    Ok(conn)
}

/// Estimated allocation charged to one source location
#[derive(Debug, Clone)]
pub struct HeapEntry {
    pub location_id: i64,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub alloc_bytes: u64,
    pub alloc_count: u64,
    pub samples: u64,
}

/// Whole-profile sums over all callsites
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub alloc_bytes: u64,
    pub alloc_count: u64,
    pub samples: u64,
    pub callsites: u64,
}

/// Recording metadata
#[derive(Debug, Clone, Default)]
pub struct ProfileSummary {
    pub process_name: String,
    pub pid: u32,
    pub start_time: String,
    pub duration_ms: u64,
    pub sampling_rate: i64,
    pub policy: String,
    pub sample_count: u64,
    pub overwritten: u64,
}

/// Top allocation sites by estimated bytes. `filter` matches a substring
/// of the file or function name.
pub fn query_top_heap(
    conn: &Connection,
    limit: usize,
    filter: Option<&str>,
) -> rusqlite::Result<Vec<HeapEntry>> {
    let pattern = filter.map(|f| format!("%{}%", f));
    let mut stmt = conn.prepare(
        r#"
        SELECT
            l.id, l.file, l.line, l.function,
            SUM(c.alloc_bytes) as total_bytes,
            SUM(c.alloc_count) as total_count,
            SUM(c.samples) as total_samples
        FROM callsites c
        JOIN locations l ON c.location_id = l.id
        WHERE ?1 IS NULL OR l.file LIKE ?1 OR l.function LIKE ?1
        GROUP BY l.id
        ORDER BY total_bytes DESC, total_count DESC
        LIMIT ?2
        "#,
    )?;

    let rows = stmt.query_map(rusqlite::params![pattern, limit as i64], |row| {
        Ok(HeapEntry {
            location_id: row.get(0)?,
            file: row.get(1)?,
            line: row.get::<_, i64>(2)? as u32,
            function: row.get(3)?,
            alloc_bytes: row.get::<_, i64>(4)? as u64,
            alloc_count: row.get::<_, i64>(5)? as u64,
            samples: row.get::<_, i64>(6)? as u64,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

pub fn query_totals(conn: &Connection) -> rusqlite::Result<Totals> {
    conn.query_row(
        r#"
        SELECT
            COALESCE(SUM(alloc_bytes), 0),
            COALESCE(SUM(alloc_count), 0),
            COALESCE(SUM(samples), 0),
            COUNT(*)
        FROM callsites
        "#,
        [],
        |row| {
            Ok(Totals {
                alloc_bytes: row.get::<_, i64>(0)? as u64,
                alloc_count: row.get::<_, i64>(1)? as u64,
                samples: row.get::<_, i64>(2)? as u64,
                callsites: row.get::<_, i64>(3)? as u64,
            })
        },
    )
}

/// Innermost-first frames of one callsite
pub fn query_callsite_frames(
    conn: &Connection,
    callsite_id: i64,
) -> rusqlite::Result<Vec<(u64, Location)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT f.address, l.file, l.line, l.function
        FROM callsite_frames f
        JOIN locations l ON f.location_id = l.id
        WHERE f.callsite_id = ?1
        ORDER BY f.depth
        "#,
    )?;
    let rows = stmt.query_map([callsite_id], |row| {
        Ok((
            row.get::<_, i64>(0)? as u64,
            Location {
                file: row.get(1)?,
                line: row.get::<_, i64>(2)? as u32,
                column: 0,
                function: row.get(3)?,
            },
        ))
    })?;
    rows.collect()
}

pub fn query_summary(conn: &Connection) -> rusqlite::Result<ProfileSummary> {
    let text = |key: &str| -> rusqlite::Result<String> {
        Ok(schema::get_meta(conn, key)?.unwrap_or_default())
    };
    let number = |key: &str| -> rusqlite::Result<u64> {
        Ok(text(key)?.parse().unwrap_or(0))
    };

    Ok(ProfileSummary {
        process_name: text("process_name")?,
        pid: number("pid")? as u32,
        start_time: text("start_time")?,
        duration_ms: number("duration_ms")?,
        sampling_rate: text("sampling_rate")?.parse().unwrap_or(0),
        policy: text("policy")?,
        sample_count: number("sample_count")?,
        overwritten: number("overwritten")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{AddressRange, DebugInfo, FunctionSymbol};
    use cmemprof_trace::SamplingPolicy;

    fn resolver() -> SymbolResolver {
        let info = DebugInfo::from_parts(
            vec![
                AddressRange {
                    start: 0x1000,
                    end: 0x1100,
                    file: "/work/app/src/cache.rs".to_string(),
                    line: 12,
                    column: 0,
                },
                AddressRange {
                    start: 0x2000,
                    end: 0x2100,
                    file: "/work/app/src/main.rs".to_string(),
                    line: 30,
                    column: 0,
                },
            ],
            vec![
                FunctionSymbol {
                    start: 0x1000,
                    size: 0x100,
                    name: "app::cache::fill".to_string(),
                },
                FunctionSymbol {
                    start: 0x2000,
                    size: 0x100,
                    name: "app::main".to_string(),
                },
            ],
        );
        SymbolResolver::new(info, 0)
    }

    fn profile() -> HeapProfile {
        let mut profile = HeapProfile::new(SamplingPolicy::SizeWeighted, 1024);
        profile.add_sample(&[0x1010, 0x2010], 256);
        profile.add_sample(&[0x1010, 0x2010], 4096);
        profile.add_sample(&[0x2020], 2048);
        profile
    }

    fn write(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("cmemprof.test.db");
        let proc_info = ProcessInfo::current().unwrap();
        let profile = profile();
        let mut storage = Storage::create(&path, &proc_info, &profile).unwrap();
        assert_eq!(storage.write_profile(&profile, &mut resolver()).unwrap(), 2);
        path
    }

    #[test]
    fn test_write_and_query_top() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_profile(&write(&dir)).unwrap();

        let entries = query_top_heap(&conn, 10, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].function, "app::cache::fill");
        assert_eq!(entries[0].file, "src/cache.rs");
        assert_eq!(entries[0].line, 12);
        assert_eq!(entries[0].alloc_bytes, 1024 + 4096);
        assert_eq!(entries[0].alloc_count, 4 + 1);
        assert_eq!(entries[0].samples, 2);
        assert_eq!(entries[1].function, "app::main");
        assert_eq!(entries[1].alloc_bytes, 2048);
    }

    #[test]
    fn test_query_filter_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_profile(&write(&dir)).unwrap();

        let filtered = query_top_heap(&conn, 10, Some("main")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].function, "app::main");

        assert_eq!(query_top_heap(&conn, 1, None).unwrap().len(), 1);
        assert!(query_top_heap(&conn, 10, Some("nothing")).unwrap().is_empty());
    }

    #[test]
    fn test_totals_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_profile(&write(&dir)).unwrap();

        let totals = query_totals(&conn).unwrap();
        assert_eq!(totals.alloc_bytes, 1024 + 4096 + 2048);
        assert_eq!(totals.alloc_count, 6);
        assert_eq!(totals.samples, 3);
        assert_eq!(totals.callsites, 2);

        let summary = query_summary(&conn).unwrap();
        assert_eq!(summary.pid, std::process::id());
        assert_eq!(summary.sampling_rate, 1024);
        assert_eq!(summary.policy, "size-weighted");
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.overwritten, 0);
    }

    #[test]
    fn test_callsite_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_profile(&write(&dir)).unwrap();

        let callsite: i64 = conn
            .query_row(
                "SELECT id FROM callsites ORDER BY alloc_bytes DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let frames = query_callsite_frames(&conn, callsite).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 0x1010);
        assert_eq!(frames[0].1.function, "app::cache::fill");
        assert_eq!(frames[1].1.function, "app::main");

        // Callsites and frames share one location row per source line
        let locations: i64 = conn
            .query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(locations, 2);
        let (charged, first_frame): (i64, i64) = conn
            .query_row(
                "SELECT c.location_id, f.location_id FROM callsites c
                 JOIN callsite_frames f ON f.callsite_id = c.id AND f.depth = 0
                 WHERE c.id = ?",
                [callsite],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(charged, first_frame);
    }

    #[test]
    fn test_open_rejects_foreign_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        drop(conn);

        assert!(matches!(open_profile(&path), Err(Error::NotAProfile(_))));
        assert!(matches!(
            open_profile(&dir.path().join("missing.db")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unresolvable_stack_charged_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmemprof.unknown.db");
        let mut profile = HeapProfile::new(SamplingPolicy::Uniform, 1);
        profile.add_sample(&[0xdead_0000], 64);

        let proc_info = ProcessInfo::current().unwrap();
        let mut storage = Storage::create(&path, &proc_info, &profile).unwrap();
        storage.write_profile(&profile, &mut resolver()).unwrap();

        let entries = storage.query_top_heap(10, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].function, "[unknown]");
        assert_eq!(storage.query_totals().unwrap().alloc_bytes, 64);
    }
}
