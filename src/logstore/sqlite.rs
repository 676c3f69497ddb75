use std::path::Path;

use async_trait::async_trait;
use rusqlite::params;
use tokio_rusqlite::Connection;

use crate::error::{CronError, Result};
use crate::logstore::{JobLog, LogStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS job_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    job_name      TEXT    NOT NULL,
    command       TEXT    NOT NULL,
    err           TEXT    NOT NULL,
    output        TEXT    NOT NULL,
    plan_time     INTEGER NOT NULL,
    schedule_time INTEGER NOT NULL,
    start_time    INTEGER NOT NULL,
    end_time      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_log_name_start ON job_log (job_name, start_time DESC);
";

/// SQLite-backed log store.
pub struct SqliteLogStore {
    conn: Connection,
}

impl SqliteLogStore {
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| CronError::LogStore(e.to_string()))?;
        Self::init(conn).await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path)
            .await
            .map_err(|e| CronError::LogStore(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| Ok(conn.execute_batch(SCHEMA)?))
            .await
            .map_err(|e| CronError::LogStore(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn insert_many(&self, logs: Vec<JobLog>) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO job_log (job_name, command, err, output, plan_time, schedule_time, start_time, end_time)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )?;
                    for log in &logs {
                        stmt.execute(params![
                            log.job_name,
                            log.command,
                            log.err,
                            log.output,
                            log.plan_time,
                            log.schedule_time,
                            log.start_time,
                            log.end_time,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| CronError::LogStore(e.to_string()))
    }

    async fn list_logs(&self, job_name: &str, skip: usize, limit: usize) -> Result<Vec<JobLog>> {
        let job_name = job_name.to_string();
        let skip = skip as i64;
        let limit = limit as i64;

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job_name, command, err, output, plan_time, schedule_time, start_time, end_time
                     FROM job_log WHERE job_name = ?1
                     ORDER BY start_time DESC, id ASC
                     LIMIT ?2 OFFSET ?3",
                )?;
                let logs = stmt
                    .query_map(params![job_name, limit, skip], |row| {
                        Ok(JobLog {
                            job_name: row.get(0)?,
                            command: row.get(1)?,
                            err: row.get(2)?,
                            output: row.get(3)?,
                            plan_time: row.get(4)?,
                            schedule_time: row.get(5)?,
                            start_time: row.get(6)?,
                            end_time: row.get(7)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(logs)
            })
            .await
            .map_err(|e| CronError::LogStore(e.to_string()))
    }
}
