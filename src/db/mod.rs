//! SQLite persistence for the signal pipeline.
//!
//! The database lives at `~/.propintel/propintel.db` unless the config points
//! elsewhere. Summaries, profiles, baselines and control charts are stored as
//! JSON documents keyed by their natural identity; activity rows keep a few
//! indexed columns for range reads. Baselines and charts are replaced
//! wholesale per key, never patched.

use std::path::PathBuf;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::analysis::baseline::Baseline;
use crate::analysis::spc::ControlChart;
use crate::entity::{EntityProfile, EntityRef};
use crate::store::activity::ActivityRecord;
use crate::store::summary::MaterializedSignalSummary;

pub mod types;
pub use types::*;

pub struct SignalDb {
    conn: Connection,
}

impl SignalDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default location and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        Self::open_at(Self::db_path()?)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        log::debug!("Opened signal database at {}", path.display());
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.propintel/propintel.db`.
    pub fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".propintel").join("propintel.db"))
    }

    // -----------------------------------------------------------------------
    // Entity profiles
    // -----------------------------------------------------------------------

    pub fn upsert_profile(&self, profile: &EntityProfile) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO entity_profiles
                (entity_type, entity_id, property_id, segment, active, profile_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                property_id = excluded.property_id,
                segment = excluded.segment,
                active = excluded.active,
                profile_json = excluded.profile_json,
                updated_at = excluded.updated_at",
            params![
                profile.entity.entity_type.as_str(),
                profile.entity.entity_id,
                profile.property_id,
                profile.segment,
                profile.active,
                serde_json::to_string(profile)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_profiles(&self) -> Result<Vec<EntityProfile>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT profile_json FROM entity_profiles ORDER BY entity_type, entity_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Activity
    // -----------------------------------------------------------------------

    pub fn insert_activity(&self, entity: &EntityRef, record: &ActivityRecord) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO signal_activity
                (seq, entity_type, entity_id, signal_id, category, occurred_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.seq as i64,
                entity.entity_type.as_str(),
                entity.entity_id,
                record.signal_id,
                record.category,
                record.occurred_at.to_rfc3339(),
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    pub fn load_activity(&self, entity: &EntityRef) -> Result<Vec<ActivityRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT record_json FROM signal_activity
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY occurred_at, seq",
        )?;
        let rows = stmt.query_map(
            params![entity.entity_type.as_str(), entity.entity_id],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }

    pub fn has_activity(&self, entity: &EntityRef, signal_id: &str) -> Result<bool, DbError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM signal_activity
                 WHERE entity_type = ?1 AND entity_id = ?2 AND signal_id = ?3",
                params![entity.entity_type.as_str(), entity.entity_id, signal_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Highest activity sequence number on disk, 0 when empty.
    pub fn max_activity_seq(&self) -> Result<u64, DbError> {
        let seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM signal_activity",
            [],
            |row| row.get(0),
        )?;
        Ok(seq.max(0) as u64)
    }

    // -----------------------------------------------------------------------
    // Summaries
    // -----------------------------------------------------------------------

    pub fn upsert_summary(&self, summary: &MaterializedSignalSummary) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO signal_summaries
                (entity_type, entity_id, version, sentiment, sentiment_score, summary_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                version = excluded.version,
                sentiment = excluded.sentiment,
                sentiment_score = excluded.sentiment_score,
                summary_json = excluded.summary_json,
                updated_at = excluded.updated_at",
            params![
                summary.entity.entity_type.as_str(),
                summary.entity.entity_id,
                summary.version as i64,
                summary.sentiment.as_str(),
                summary.sentiment_score,
                serde_json::to_string(summary)?,
                summary.updated_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_summary(&self, entity: &EntityRef) -> Result<Option<MaterializedSignalSummary>, DbError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT summary_json FROM signal_summaries WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity.entity_type.as_str(), entity.entity_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn load_summaries(&self) -> Result<Vec<MaterializedSignalSummary>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT summary_json FROM signal_summaries ORDER BY entity_type, entity_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Baselines and control charts
    // -----------------------------------------------------------------------

    /// Replace every stored baseline for an entity with `baselines`.
    pub fn replace_baselines(&self, entity: &EntityRef, baselines: &[Baseline]) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM entity_baselines WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity.entity_type.as_str(), entity.entity_id],
        )?;
        for b in baselines {
            self.conn.execute(
                "INSERT INTO entity_baselines
                    (entity_type, entity_id, metric, baseline_json, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entity.entity_type.as_str(),
                    entity.entity_id,
                    b.metric.as_str(),
                    serde_json::to_string(b)?,
                    b.computed_at.to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn load_baselines(&self) -> Result<Vec<Baseline>, DbError> {
        let mut stmt = self.conn.prepare("SELECT baseline_json FROM entity_baselines")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }

    /// Replace every chart for a property.
    pub fn replace_control_charts(&self, property_id: &str, charts: &[ControlChart]) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM control_charts WHERE property_id = ?1",
            params![property_id],
        )?;
        for c in charts {
            self.conn.execute(
                "INSERT INTO control_charts (property_id, metric, chart_json, computed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    property_id,
                    c.metric.as_str(),
                    serde_json::to_string(c)?,
                    c.computed_at.to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn load_control_charts(&self) -> Result<Vec<ControlChart>, DbError> {
        let mut stmt = self.conn.prepare("SELECT chart_json FROM control_charts")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Cost ledger
    // -----------------------------------------------------------------------

    pub fn upsert_cost_ledger(&self, row: &DbCostLedgerRow) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO cost_ledger (scope, tier, period, count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(scope, tier, period) DO UPDATE SET
                count = excluded.count,
                updated_at = excluded.updated_at",
            params![
                row.scope,
                row.tier,
                row.period,
                row.count as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Ledger rows for one period.
    pub fn load_cost_ledger(&self, period: &str) -> Result<Vec<DbCostLedgerRow>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT scope, tier, period, count FROM cost_ledger WHERE period = ?1 ORDER BY scope, tier",
        )?;
        let rows = stmt.query_map(params![period], |row| {
            Ok(DbCostLedgerRow {
                scope: row.get(0)?,
                tier: row.get(1)?,
                period: row.get(2)?,
                count: row.get::<_, i64>(3)?.max(0) as u64,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;
    use crate::entity::EntityType;
    use crate::signals::bus::{MetricFamily, Polarity, SignalWeight};
    use chrono::TimeZone;

    fn person() -> EntityRef {
        EntityRef::new(EntityType::Person, "p-1")
    }

    fn record(seq: u64, day: u32) -> ActivityRecord {
        ActivityRecord {
            seq,
            signal_id: format!("sig-{}", seq),
            event_type: "rent_payment".to_string(),
            category: "financial".to_string(),
            weight: SignalWeight::Strong,
            polarity: Polarity::Negative,
            occurred_at: Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap(),
            payload: serde_json::json!({"daysLate": 9}),
            observations: Vec::new(),
        }
    }

    #[test]
    fn test_profile_roundtrip() {
        let db = test_db();
        let profile = EntityProfile::new(person()).with_property("prop-1").with_tag("lease", "active");
        db.upsert_profile(&profile).expect("upsert");
        db.upsert_profile(&profile.clone().inactive()).expect("update");
        let loaded = db.load_profiles().expect("load");
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].active);
    }

    #[test]
    fn test_activity_in_time_order_and_dedup() {
        let db = test_db();
        db.insert_activity(&person(), &record(2, 20)).expect("insert");
        db.insert_activity(&person(), &record(1, 5)).expect("insert");
        db.insert_activity(&person(), &record(1, 5)).expect("duplicate ignored");
        let rows = db.load_activity(&person()).expect("load");
        assert_eq!(rows.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(db.max_activity_seq().expect("max"), 2);
    }

    #[test]
    fn test_summary_roundtrip() {
        let db = test_db();
        let mut summary = MaterializedSignalSummary::new(person());
        summary.version = 4;
        summary.sentiment_score = -0.5;
        db.upsert_summary(&summary).expect("upsert");
        let loaded = db.get_summary(&person()).expect("get").expect("present");
        assert_eq!(loaded, summary);
        assert!(db.get_summary(&EntityRef::property("none")).expect("get").is_none());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.upsert_summary(&MaterializedSignalSummary::new(person()))?;
            Err(DbError::Migration("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(db.load_summaries().expect("load").is_empty());
    }

    #[test]
    fn test_baselines_replaced_wholesale() {
        let db = test_db();
        let now = Utc::now();
        let b = Baseline {
            entity: person(),
            metric: MetricFamily::PaymentTiming,
            median: 2.0,
            mad: 1.0,
            scaled_mad: 1.4826,
            observations: 8,
            window_start: now,
            window_end: now,
            computed_at: now,
        };
        let mut amount = b.clone();
        amount.metric = MetricFamily::PaymentAmount;
        db.replace_baselines(&person(), &[b.clone(), amount]).expect("replace");
        assert_eq!(db.load_baselines().expect("load").len(), 2);
        db.replace_baselines(&person(), &[b]).expect("replace");
        assert_eq!(db.load_baselines().expect("load").len(), 1);
    }

    #[test]
    fn test_cost_ledger_upsert() {
        let db = test_db();
        let mut row = DbCostLedgerRow {
            scope: "portfolio-1".to_string(),
            tier: "language_light".to_string(),
            period: "2026-03-01".to_string(),
            count: 3,
        };
        db.upsert_cost_ledger(&row).expect("insert");
        row.count = 7;
        db.upsert_cost_ledger(&row).expect("update");
        let rows = db.load_cost_ledger("2026-03-01").expect("load");
        assert_eq!(rows, vec![row]);
        assert!(db.load_cost_ledger("2026-03-02").expect("load").is_empty());
    }
}
