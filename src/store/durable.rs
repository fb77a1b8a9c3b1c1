use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::metrics::MetricPoint;
use crate::scheduler::job::{JobRecord, JobStatus, StatusRecord, StatusWrite};
use crate::store::schema::initialize_schema;
use crate::store::DurableStore;

const JOB_COLUMNS: &str = "id, name, status, config, workload_ref, error, \
                           created_at, updated_at, started_at, finished_at";

/// Durable store backed by SQLite.
///
/// Calls run on the blocking thread pool; a single connection is shared
/// behind a mutex.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| OrchestratorError::Internal("sqlite connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("sqlite task failed: {}", e)))?
    }
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    Ok(JobRecord {
        id: Uuid::parse_str(&id).map_err(|e| conversion_error(0, e))?,
        name: row.get(1)?,
        status: status.parse().map_err(|e| conversion_error(2, e))?,
        config: row.get(3)?,
        workload_ref: row.get(4)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

fn row_to_metric(row: &Row<'_>) -> rusqlite::Result<MetricPoint> {
    Ok(MetricPoint {
        job_id: row.get(0)?,
        step: row.get(1)?,
        epoch: row.get(2)?,
        name: row.get(3)?,
        value: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn insert_job_row(conn: &Connection, record: &JobRecord) -> Result<usize> {
    let sql = format!(
        "INSERT OR IGNORE INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        JOB_COLUMNS
    );
    let inserted = conn.execute(
        &sql,
        params![
            record.id.to_string(),
            record.name,
            record.status.as_str(),
            record.config,
            record.workload_ref,
            record.error,
            record.created_at,
            record.updated_at,
            record.started_at,
            record.finished_at,
        ],
    )?;
    Ok(inserted)
}

fn select_job(conn: &Connection, id: Uuid) -> Result<Option<JobRecord>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
    let record = conn
        .query_row(&sql, params![id.to_string()], row_to_job)
        .optional()?;
    Ok(record)
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert_job_if_absent(&self, record: JobRecord) -> Result<bool> {
        self.with_conn(move |conn| Ok(insert_job_row(conn, &record)? > 0))
            .await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        self.with_conn(move |conn| select_job(conn, id)).await
    }

    async fn update_status(&self, id: Uuid, update: StatusRecord) -> Result<StatusWrite> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut record) = select_job(&tx, id)? else {
                return Ok(StatusWrite::Missing);
            };
            if !record.status.can_transition_to(update.status) {
                return Ok(StatusWrite::Rejected {
                    current: record.status,
                });
            }
            record.apply(&update);
            tx.execute(
                "UPDATE jobs SET status = ?2, workload_ref = ?3, error = ?4, updated_at = ?5,
                     started_at = ?6, finished_at = ?7
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    record.status.as_str(),
                    record.workload_ref,
                    record.error,
                    record.updated_at,
                    record.started_at,
                    record.finished_at,
                ],
            )?;
            tx.commit()?;
            Ok(StatusWrite::Applied)
        })
        .await
    }

    async fn list_jobs(&self, limit: usize, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        self.with_conn(move |conn| {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let jobs = match status {
                Some(status) => {
                    let sql = format!(
                        "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                        JOB_COLUMNS
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![status.as_str(), limit], row_to_job)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let sql = format!(
                        "SELECT {} FROM jobs ORDER BY created_at DESC LIMIT ?1",
                        JOB_COLUMNS
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![limit], row_to_job)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(jobs)
        })
        .await
    }

    async fn insert_metric(&self, point: MetricPoint) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO metrics (job_id, step, epoch, name, value, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    point.job_id,
                    point.step,
                    point.epoch,
                    point.name,
                    point.value,
                    point.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn metrics(&self, job_id: &str, name: Option<&str>) -> Result<Vec<MetricPoint>> {
        let job_id = job_id.to_string();
        let name = name.map(str::to_string);
        self.with_conn(move |conn| {
            let base = "SELECT job_id, step, epoch, name, value, created_at FROM metrics
                        WHERE job_id = ?1";
            let points = match name {
                Some(name) => {
                    let sql = format!("{} AND name = ?2 ORDER BY step ASC, id ASC", base);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![job_id, name], row_to_metric)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let sql = format!("{} ORDER BY step ASC, id ASC", base);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params![job_id], row_to_metric)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(points)
        })
        .await
    }
}
