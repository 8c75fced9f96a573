use anyhow::Context;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use common::time_utils::utc_now_ms;

use crate::core::filter::{FilterRegistry, FilterSource, FilterState};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DowntimeClass {
    Scheduled = 0,
    Unscheduled = 1,
}

impl DowntimeClass {
    fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(DowntimeClass::Scheduled),
            1 => Some(DowntimeClass::Unscheduled),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DowntimeSeverity {
    Outage = 0,
    Severe = 1,
    IntermittentOutage = 2,
    NoSignificantOutageExpected = 3,
}

impl DowntimeSeverity {
    fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(DowntimeSeverity::Outage),
            1 => Some(DowntimeSeverity::Severe),
            2 => Some(DowntimeSeverity::IntermittentOutage),
            3 => Some(DowntimeSeverity::NoSignificantOutageExpected),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DowntimeSource {
    Topology,
    Local,
}

impl DowntimeSource {
    fn as_str(&self) -> &'static str {
        match self {
            DowntimeSource::Topology => "topology",
            DowntimeSource::Local => "local",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "topology" => Some(DowntimeSource::Topology),
            "local" => Some(DowntimeSource::Local),
            _ => None,
        }
    }
}

/// Time-bounded exclusion of one server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DowntimeRecord {
    pub server_name: String,
    pub class: DowntimeClass,
    pub severity: DowntimeSeverity,
    pub source: DowntimeSource,
    pub start_ms: i64,
    pub end_ms: i64,
    pub description: String,
    pub created_ms: i64,
    pub updated_ms: i64,
}

impl DowntimeRecord {
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.start_ms <= now_ms && now_ms < self.end_ms
    }
}

/// The only durable state the director keeps: locally declared downtimes in
/// a single SQLite file. Topology downtimes are soft, re-imported wholesale.
pub struct DowntimeDb {
    conn: Mutex<Connection>,
}

impl DowntimeDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open downtime db at {}", path.display()))?;
        Self::migrate(&conn)?;
        Ok(DowntimeDb {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(DowntimeDb {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> anyhow::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS downtime (
                server_name TEXT,
                class INT,
                severity INT,
                start_ms INT,
                end_ms INT,
                description TEXT,
                created_ms INT,
                updated_ms INT,
                source TEXT
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert a record, or update description/end/severity of an existing one
    /// with the same (server, source, start).
    pub fn upsert(&self, record: &DowntimeRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE downtime
             SET class = ?4, severity = ?5, end_ms = ?6, description = ?7, updated_ms = ?8
             WHERE server_name = ?1 AND source = ?2 AND start_ms = ?3",
            params![
                record.server_name,
                record.source.as_str(),
                record.start_ms,
                record.class as i64,
                record.severity as i64,
                record.end_ms,
                record.description,
                utc_now_ms() as i64,
            ],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO downtime
                 (server_name, class, severity, start_ms, end_ms, description, created_ms, updated_ms, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.server_name,
                    record.class as i64,
                    record.severity as i64,
                    record.start_ms,
                    record.end_ms,
                    record.description,
                    record.created_ms,
                    record.updated_ms,
                    record.source.as_str(),
                ],
            )?;
        }
        Ok(())
    }

    pub fn list(&self) -> anyhow::Result<Vec<DowntimeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT server_name, class, severity, start_ms, end_ms, description,
                    created_ms, updated_ms, source
             FROM downtime ORDER BY server_name, start_ms",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (server_name, class, severity, start_ms, end_ms, description, created_ms, updated_ms, source) =
                row?;
            // A row with a state this version does not know is skipped, not
            // allowed to poison routing.
            let (Some(class), Some(severity), Some(source)) = (
                DowntimeClass::from_i64(class),
                DowntimeSeverity::from_i64(severity),
                DowntimeSource::from_str(&source),
            ) else {
                warn!(server = %server_name, "skipping downtime row with unknown class/severity/source");
                continue;
            };
            out.push(DowntimeRecord {
                server_name,
                class,
                severity,
                source,
                start_ms,
                end_ms,
                description,
                created_ms,
                updated_ms,
            });
        }
        Ok(out)
    }

    pub fn active(&self, now_ms: i64) -> anyhow::Result<Vec<DowntimeRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.is_active(now_ms))
            .collect())
    }

    pub fn remove(&self, server_name: &str, start_ms: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM downtime WHERE server_name = ?1 AND start_ms = ?2",
            params![server_name, start_ms],
        )?;
        Ok(n)
    }
}

/// Re-derive `temp_filtered` entries from the local downtime table. The
/// registry entries owned by this source are replaced wholesale each pass so
/// an expired downtime clears itself.
pub fn apply_local_downtimes(db: &DowntimeDb, filter: &FilterRegistry) -> anyhow::Result<usize> {
    let active = db.active(utc_now_ms() as i64)?;
    filter.clear_source(FilterSource::Downtime);
    for record in &active {
        filter.set(
            &record.server_name,
            FilterState::TempFiltered,
            FilterSource::Downtime,
        );
    }
    Ok(active.len())
}

pub async fn downtime_sweep_loop(
    db: Arc<DowntimeDb>,
    filter: Arc<FilterRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {},
            _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
        }

        if let Err(e) = apply_local_downtimes(&db, &filter) {
            warn!("failed to apply local downtimes: {e:#}");
        }
    }

    info!("downtime sweeper stopped");
    Ok(())
}
