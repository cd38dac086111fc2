//! Night-by-night history of sleep sessions, kept in SQLite.
//!
//! All access goes through a dedicated worker thread that owns the
//! connection; async callers hand it closures and await the reply.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, Row};
use tokio::sync::oneshot;

mod migrations;
mod models;

use migrations::run_migrations;
pub use models::{AlarmSource, JournalStatus, SleepSessionRecord};

type JournalTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Owns the worker thread. Dropping the last handle closes the task queue,
/// lets the worker finish what is queued, and joins it.
struct Worker {
    tasks: Option<mpsc::Sender<JournalTask>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        drop(self.tasks.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Journal thread panicked");
            }
        }
    }
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid {field} '{value}': {err}"))
}

fn parse_optional_datetime(value: Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    value.map(|raw| parse_datetime(&raw, field)).transpose()
}

fn row_to_record(row: &Row) -> Result<SleepSessionRecord> {
    let started_at: String = row.get("started_at")?;
    let alarm_time: String = row.get("alarm_time")?;
    let sleep_duration: String = row.get("sleep_duration")?;
    let status: String = row.get("status")?;
    let alarm_fired_at: Option<String> = row.get("alarm_fired_at")?;
    let alarm_source: Option<String> = row.get("alarm_source")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(SleepSessionRecord {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        alarm_time: alarm_time.parse()?,
        sleep_duration: serde_json::from_str(&sleep_duration)
            .with_context(|| format!("invalid sleep_duration '{sleep_duration}'"))?,
        status: JournalStatus::parse(&status)?,
        alarm_fired_at: parse_optional_datetime(alarm_fired_at, "alarm_fired_at")?,
        alarm_source: alarm_source.as_deref().map(AlarmSource::parse).transpose()?,
        stopped_at: parse_optional_datetime(stopped_at, "stopped_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

#[derive(Clone)]
pub struct Journal {
    worker: Arc<Worker>,
    path: Option<Arc<PathBuf>>,
}

impl Journal {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create journal directory {}", parent.display())
            })?;
        }

        let mut conn = Connection::open(&path).context("failed to open SQLite journal")?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!("Failed to enable WAL mode: {err}");
        }
        run_migrations(&mut conn).context("failed to run journal migrations")?;

        info!("Journal initialized at {}", path.display());
        let mut journal = Self::start(conn)?;
        journal.path = Some(Arc::new(path));
        Ok(journal)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn =
            Connection::open_in_memory().context("failed to open in-memory journal")?;
        run_migrations(&mut conn).context("failed to run journal migrations")?;
        Self::start(conn)
    }

    /// Hand a ready connection to its own thread; it is used from nowhere else.
    fn start(mut conn: Connection) -> Result<Self> {
        let (tasks, queue) = mpsc::channel::<JournalTask>();
        let thread = thread::Builder::new()
            .name("sleepalarm-journal".into())
            .spawn(move || {
                for task in queue {
                    task(&mut conn);
                }
                info!("Journal thread shutting down");
            })
            .context("failed to spawn journal worker thread")?;

        Ok(Self {
            worker: Arc::new(Worker {
                tasks: Some(tasks),
                thread: Some(thread),
            }),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let tasks = self
            .worker
            .tasks
            .as_ref()
            .ok_or_else(|| anyhow!("journal is closed"))?;

        tasks
            .send(Box::new(move |conn: &mut Connection| {
                let _ = reply_tx.send(task(conn));
            }))
            .map_err(|_| anyhow!("journal thread is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("journal thread terminated unexpectedly"))?
    }

    pub async fn record_started(&self, record: &SleepSessionRecord) -> Result<()> {
        let record = record.clone();
        let sleep_duration = serde_json::to_string(&record.sleep_duration)?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sleep_sessions (id, started_at, alarm_time, sleep_duration, status, alarm_fired_at, alarm_source, stopped_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.started_at.to_rfc3339(),
                    record.alarm_time.to_string(),
                    sleep_duration,
                    record.status.as_str(),
                    record.alarm_fired_at.map(|dt| dt.to_rfc3339()),
                    record.alarm_source.map(|source| source.as_str()),
                    record.stopped_at.map(|dt| dt.to_rfc3339()),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .context("failed to insert sleep session")?;
            Ok(())
        })
        .await
    }

    pub async fn record_alarm(
        &self,
        session_id: &str,
        source: AlarmSource,
        fired_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sleep_sessions
                 SET status = ?1,
                     alarm_fired_at = ?2,
                     alarm_source = ?3,
                     updated_at = ?2
                 WHERE id = ?4",
                params![
                    JournalStatus::AlarmFired.as_str(),
                    fired_at.to_rfc3339(),
                    source.as_str(),
                    session_id,
                ],
            )
            .context("failed to record alarm")?;
            Ok(())
        })
        .await
    }

    pub async fn record_finished(
        &self,
        session_id: &str,
        status: JournalStatus,
        stopped_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sleep_sessions
                 SET status = ?1,
                     stopped_at = ?2,
                     updated_at = ?2
                 WHERE id = ?3",
                params![status.as_str(), stopped_at.to_rfc3339(), session_id],
            )
            .context("failed to finish sleep session")?;
            Ok(())
        })
        .await
    }

    /// Mark sessions a crash left open as interrupted. Returns how many were touched.
    pub async fn interrupt_unfinished(&self, at: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let touched = conn
                .execute(
                    "UPDATE sleep_sessions
                     SET status = ?1,
                         stopped_at = ?2,
                         updated_at = ?2
                     WHERE status IN (?3, ?4)",
                    params![
                        JournalStatus::Interrupted.as_str(),
                        at.to_rfc3339(),
                        JournalStatus::Running.as_str(),
                        JournalStatus::AlarmFired.as_str(),
                    ],
                )
                .context("failed to interrupt unfinished sessions")?;
            Ok(touched)
        })
        .await
    }

    /// Most recent sessions first.
    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SleepSessionRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, alarm_time, sleep_duration, status, alarm_fired_at, alarm_source, stopped_at, updated_at
                 FROM sleep_sessions
                 ORDER BY started_at DESC
                 LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![limit])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AlarmTime, SleepDuration};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn record(id: &str, started_at: DateTime<Utc>) -> SleepSessionRecord {
        SleepSessionRecord::started(
            id.to_string(),
            started_at,
            AlarmTime::new(6, 45).unwrap(),
            SleepDuration::Minutes(15),
        )
    }

    #[tokio::test]
    async fn full_night_is_recorded() {
        let journal = Journal::open_in_memory().unwrap();
        let started = Utc::now();
        journal.record_started(&record("night-1", started)).await.unwrap();

        let fired = started + Duration::hours(7);
        journal
            .record_alarm("night-1", AlarmSource::Notification, fired)
            .await
            .unwrap();
        let stopped = fired + Duration::minutes(2);
        journal
            .record_finished("night-1", JournalStatus::Completed, stopped)
            .await
            .unwrap();

        let sessions = journal.list_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let night = &sessions[0];
        assert_eq!(night.status, JournalStatus::Completed);
        assert_eq!(night.alarm_source, Some(AlarmSource::Notification));
        assert_eq!(night.alarm_time.to_string(), "06:45");
        assert_eq!(night.sleep_duration, SleepDuration::Minutes(15));
        assert_eq!(night.stopped_at.map(|dt| dt.timestamp()), Some(stopped.timestamp()));
    }

    #[tokio::test]
    async fn unfinished_sessions_become_interrupted() {
        let journal = Journal::open_in_memory().unwrap();
        let now = Utc::now();
        journal.record_started(&record("a", now - Duration::days(1))).await.unwrap();
        journal.record_started(&record("b", now)).await.unwrap();
        journal
            .record_finished("a", JournalStatus::Completed, now)
            .await
            .unwrap();

        assert_eq!(journal.interrupt_unfinished(now).await.unwrap(), 1);

        let sessions = journal.list_sessions(10).await.unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(sessions[0].status, JournalStatus::Interrupted);
        assert_eq!(sessions[1].status, JournalStatus::Completed);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history").join("journal.sqlite3");
        {
            let journal = Journal::open(path.clone()).unwrap();
            assert_eq!(journal.path(), Some(path.as_path()));
            journal.record_started(&record("kept", Utc::now())).await.unwrap();
        }

        let reopened = Journal::open(path).unwrap();
        let sessions = reopened.list_sessions(5).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "kept");
    }

    #[tokio::test]
    async fn clones_share_one_worker_until_the_last_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.sqlite3");
        let journal = Journal::open(path.clone()).unwrap();
        let writer = journal.clone();
        drop(journal);

        writer.record_started(&record("late", Utc::now())).await.unwrap();
        drop(writer);

        let reopened = Journal::open(path).unwrap();
        let sessions = reopened.list_sessions(5).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "late");
    }
}
