//! Versioned schema for the signal database.
//!
//! SQL files under `migrations/` are compiled in and applied in order, each
//! inside its own transaction together with its `schema_version` row. An
//! existing database is copied aside before its first pending step runs.

use rusqlite::Connection;

/// (version, sql) in ascending order.
const STEPS: &[(u32, &str)] = &[(1, include_str!("migrations/001_baseline.sql"))];

fn applied_version(conn: &Connection) -> Result<u32, String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("schema_version table: {}", e))?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|v| v.max(0) as u32)
    .map_err(|e| format!("schema_version read: {}", e))
}

/// Hot copy of a file-backed database to `<path>.v<version>.bak`.
fn snapshot_before_upgrade(conn: &Connection, from_version: u32) -> Result<(), String> {
    let path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("database path: {}", e))?;
    if path.is_empty() {
        return Ok(());
    }
    let target = format!("{}.v{}.bak", path, from_version);
    let mut dest = Connection::open(&target).map_err(|e| format!("open {}: {}", target, e))?;
    rusqlite::backup::Backup::new(conn, &mut dest)
        .and_then(|b| b.step(-1).map(|_| ()))
        .map_err(|e| format!("backup to {}: {}", target, e))?;
    log::info!("Schema v{} copied to {} before upgrade", from_version, target);
    Ok(())
}

/// Bring the schema up to date. Returns how many steps ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    let current = applied_version(conn)?;
    let latest = STEPS.last().map_or(0, |(v, _)| *v);
    if current > latest {
        return Err(format!(
            "database schema v{} is newer than the supported v{}",
            current, latest
        ));
    }

    let pending: Vec<&(u32, &str)> = STEPS.iter().filter(|(v, _)| *v > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot_before_upgrade(conn, current)?;
    }

    for (version, sql) in &pending {
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_version (version) VALUES ({});\nCOMMIT;",
            sql, version
        );
        if let Err(e) = conn.execute_batch(&batch) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(format!("schema v{} failed: {}", version, e));
        }
        log::info!("Schema upgraded to v{}", version);
    }
    Ok(pending.len())
}
