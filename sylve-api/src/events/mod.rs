//! Durable event and progress store.
//!
//! Append-only rows for backup and replication runs, with an in-memory
//! cache of the currently-running event per job/policy. Writers are the
//! backup and replication workers; readers are the REST surface,
//! including server-side pagination for remote table widgets.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sylve_common::model::{BackupEvent, EventKind, EventStatus, GuestType, ReplicationEvent};
use sylve_common::{Error, Result};
use tokio::sync::Mutex;

use crate::db::Database;

/// Live progress snapshot for one event.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventProgress {
    pub moved_bytes: Option<i64>,
    pub total_bytes: Option<i64>,
    pub percent: Option<f64>,
}

/// One page of events plus the unpaginated total.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventPage {
    pub events: Vec<BackupEvent>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

/// Sort fields the paginated listing accepts. Everything else falls back
/// to `id` instead of reaching the SQL layer.
fn sort_column(field: &str) -> &'static str {
    match field {
        "startedAt" | "started_at" => "started_at",
        "completedAt" | "completed_at" => "completed_at",
        "status" => "status",
        _ => "id",
    }
}

fn sort_direction(dir: &str) -> &'static str {
    if dir.eq_ignore_ascii_case("asc") {
        "ASC"
    } else {
        "DESC"
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

fn row_to_backup_event(row: &sqlx::sqlite::SqliteRow) -> BackupEvent {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    BackupEvent {
        id: row.get("id"),
        job_id: row.get("job_id"),
        target_id: row.get("target_id"),
        kind: if kind == "restore" {
            EventKind::Restore
        } else {
            EventKind::Backup
        },
        status: status.parse().unwrap_or(EventStatus::Failed),
        started_at: from_ts(row.get("started_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_ts),
        total_bytes: row.get("total_bytes"),
        moved_bytes: row.get("moved_bytes"),
        percent: row.get("percent"),
        output: row.get("output"),
        error: row.get("error"),
        last_snapshot: row.get("last_snapshot"),
    }
}

fn row_to_replication_event(row: &sqlx::sqlite::SqliteRow) -> ReplicationEvent {
    let guest_type: String = row.get("guest_type");
    let status: String = row.get("status");
    ReplicationEvent {
        id: row.get("id"),
        policy_id: row.get("policy_id"),
        guest_type: guest_type.parse().unwrap_or(GuestType::Vm),
        guest_id: row.get::<i64, _>("guest_id") as u32,
        source_node_id: row.get("source_node_id"),
        target_node_id: row.get("target_node_id"),
        status: status.parse().unwrap_or(EventStatus::Failed),
        started_at: from_ts(row.get("started_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_ts),
        total_bytes: row.get("total_bytes"),
        moved_bytes: row.get("moved_bytes"),
        percent: row.get("percent"),
        output: row.get("output"),
        error: row.get("error"),
        last_snapshot: row.get("last_snapshot"),
    }
}

/// Event store over the local SQLite database.
pub struct EventStore {
    db: Arc<Database>,
    current_backup: Mutex<HashMap<i64, i64>>,
    current_replication: Mutex<HashMap<i64, i64>>,
}

impl EventStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            current_backup: Mutex::new(HashMap::new()),
            current_replication: Mutex::new(HashMap::new()),
        }
    }

    // ----- backup events -----

    /// Open a new running backup/restore event.
    pub async fn start_backup_event(
        &self,
        job_id: Option<i64>,
        target_id: Option<i64>,
        kind: EventKind,
    ) -> Result<BackupEvent> {
        let started_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO backup_events (job_id, target_id, kind, status, started_at)
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(job_id)
        .bind(target_id)
        .bind(kind.to_string())
        .bind(started_at.timestamp())
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        let id = result.last_insert_rowid();
        if let Some(job_id) = job_id {
            self.current_backup.lock().await.insert(job_id, id);
        }

        self.get_backup_event(id)
            .await?
            .ok_or_else(|| Error::Database("event vanished after insert".to_string()))
    }

    /// Throttled progress upsert for the running event. Idempotent: the
    /// newest sample simply overwrites the previous one.
    pub async fn update_backup_progress(
        &self,
        event_id: i64,
        moved_bytes: i64,
        total_bytes: Option<i64>,
    ) -> Result<()> {
        let percent = total_bytes
            .filter(|t| *t > 0)
            .map(|t| (moved_bytes as f64 / t as f64 * 100.0).min(100.0));
        sqlx::query(
            "UPDATE backup_events SET moved_bytes = ?, total_bytes = ?, percent = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(moved_bytes)
        .bind(total_bytes)
        .bind(percent)
        .bind(event_id)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Move an event to its terminal state.
    pub async fn finish_backup_event(
        &self,
        event_id: i64,
        status: EventStatus,
        output: &str,
        error: &str,
        last_snapshot: &str,
    ) -> Result<()> {
        let percent_fill = match status {
            EventStatus::Success => Some(100.0),
            _ => None,
        };
        sqlx::query(
            "UPDATE backup_events SET
                status = ?, completed_at = ?, output = ?, error = ?, last_snapshot = ?,
                percent = COALESCE(?, percent),
                moved_bytes = CASE WHEN ? = 'success' THEN COALESCE(total_bytes, moved_bytes)
                                   ELSE moved_bytes END
             WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(Utc::now().timestamp())
        .bind(output)
        .bind(error)
        .bind(last_snapshot)
        .bind(percent_fill)
        .bind(status.to_string())
        .bind(event_id)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        let mut cache = self.current_backup.lock().await;
        cache.retain(|_, v| *v != event_id);
        Ok(())
    }

    pub async fn get_backup_event(&self, id: i64) -> Result<Option<BackupEvent>> {
        let row = sqlx::query("SELECT * FROM backup_events WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_backup_event(&r)))
    }

    /// Newest-first listing, optionally filtered by job, capped at `limit`.
    pub async fn list_backup_events(
        &self,
        limit: u32,
        job_id: Option<i64>,
    ) -> Result<Vec<BackupEvent>> {
        let rows = match job_id {
            Some(job_id) => {
                sqlx::query(
                    "SELECT * FROM backup_events WHERE job_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(job_id)
                .bind(limit as i64)
                .fetch_all(self.db.pool())
                .await
            }
            None => {
                sqlx::query("SELECT * FROM backup_events ORDER BY id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(self.db.pool())
                    .await
            }
        }
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_backup_event).collect())
    }

    /// Server-side pagination for remote table widgets. The sort field is
    /// allow-listed; search matches output, error and last snapshot.
    pub async fn list_backup_events_paginated(
        &self,
        page: u32,
        size: u32,
        sort_field: &str,
        sort_dir: &str,
        job_id: Option<i64>,
        search: &str,
    ) -> Result<EventPage> {
        let page = page.max(1);
        let size = size.clamp(1, 500);
        let column = sort_column(sort_field);
        let direction = sort_direction(sort_dir);

        let mut where_clauses = Vec::new();
        if job_id.is_some() {
            where_clauses.push("job_id = ?");
        }
        if !search.is_empty() {
            where_clauses.push("(output LIKE ? OR error LIKE ? OR last_snapshot LIKE ?)");
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clauses.join(" AND "))
        };

        let pattern = format!("%{}%", search);

        let count_sql = format!("SELECT COUNT(*) AS count FROM backup_events{}", where_sql);
        let mut count_query = sqlx::query(&count_sql);
        if let Some(job_id) = job_id {
            count_query = count_query.bind(job_id);
        }
        if !search.is_empty() {
            count_query = count_query.bind(&pattern).bind(&pattern).bind(&pattern);
        }
        let total: i64 = count_query
            .fetch_one(self.db.pool())
            .await
            .map_err(db_err)?
            .get("count");

        let list_sql = format!(
            "SELECT * FROM backup_events{} ORDER BY {} {}, id DESC LIMIT ? OFFSET ?",
            where_sql, column, direction
        );
        let mut list_query = sqlx::query(&list_sql);
        if let Some(job_id) = job_id {
            list_query = list_query.bind(job_id);
        }
        if !search.is_empty() {
            list_query = list_query.bind(&pattern).bind(&pattern).bind(&pattern);
        }
        let rows = list_query
            .bind(size as i64)
            .bind(((page - 1) * size) as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;

        Ok(EventPage {
            events: rows.iter().map(row_to_backup_event).collect(),
            total,
            page,
            size,
        })
    }

    /// Progress snapshot: terminal successes pin percent at 100, terminal
    /// failures preserve the last reported value.
    pub async fn backup_event_progress(
        &self,
        id: i64,
    ) -> Result<Option<(BackupEvent, EventProgress)>> {
        let Some(event) = self.get_backup_event(id).await? else {
            return Ok(None);
        };
        let percent = match event.status {
            EventStatus::Success => Some(100.0),
            _ => event.percent,
        };
        let progress = EventProgress {
            moved_bytes: event.moved_bytes,
            total_bytes: event.total_bytes,
            percent,
        };
        Ok(Some((event, progress)))
    }

    pub async fn current_backup_event(&self, job_id: i64) -> Option<i64> {
        self.current_backup.lock().await.get(&job_id).copied()
    }

    // ----- replication events -----

    pub async fn start_replication_event(
        &self,
        policy_id: i64,
        guest_type: GuestType,
        guest_id: u32,
        source_node_id: &str,
        target_node_id: &str,
    ) -> Result<ReplicationEvent> {
        let started_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO replication_events
                (policy_id, guest_type, guest_id, source_node_id, target_node_id, status, started_at)
             VALUES (?, ?, ?, ?, ?, 'running', ?)",
        )
        .bind(policy_id)
        .bind(guest_type.to_string())
        .bind(guest_id as i64)
        .bind(source_node_id)
        .bind(target_node_id)
        .bind(started_at.timestamp())
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        let id = result.last_insert_rowid();
        self.current_replication.lock().await.insert(policy_id, id);

        self.get_replication_event(id)
            .await?
            .ok_or_else(|| Error::Database("event vanished after insert".to_string()))
    }

    pub async fn update_replication_progress(
        &self,
        event_id: i64,
        moved_bytes: i64,
        total_bytes: Option<i64>,
    ) -> Result<()> {
        let percent = total_bytes
            .filter(|t| *t > 0)
            .map(|t| (moved_bytes as f64 / t as f64 * 100.0).min(100.0));
        sqlx::query(
            "UPDATE replication_events SET moved_bytes = ?, total_bytes = ?, percent = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(moved_bytes)
        .bind(total_bytes)
        .bind(percent)
        .bind(event_id)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn finish_replication_event(
        &self,
        event_id: i64,
        status: EventStatus,
        output: &str,
        error: &str,
        last_snapshot: &str,
    ) -> Result<()> {
        let percent_fill = match status {
            EventStatus::Success => Some(100.0),
            _ => None,
        };
        sqlx::query(
            "UPDATE replication_events SET
                status = ?, completed_at = ?, output = ?, error = ?, last_snapshot = ?,
                percent = COALESCE(?, percent),
                moved_bytes = CASE WHEN ? = 'success' THEN COALESCE(total_bytes, moved_bytes)
                                   ELSE moved_bytes END
             WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(Utc::now().timestamp())
        .bind(output)
        .bind(error)
        .bind(last_snapshot)
        .bind(percent_fill)
        .bind(status.to_string())
        .bind(event_id)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        let mut cache = self.current_replication.lock().await;
        cache.retain(|_, v| *v != event_id);
        Ok(())
    }

    pub async fn get_replication_event(&self, id: i64) -> Result<Option<ReplicationEvent>> {
        let row = sqlx::query("SELECT * FROM replication_events WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_replication_event(&r)))
    }

    pub async fn list_replication_events(
        &self,
        limit: u32,
        policy_id: Option<i64>,
    ) -> Result<Vec<ReplicationEvent>> {
        let rows = match policy_id {
            Some(policy_id) => {
                sqlx::query(
                    "SELECT * FROM replication_events WHERE policy_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(policy_id)
                .bind(limit as i64)
                .fetch_all(self.db.pool())
                .await
            }
            None => {
                sqlx::query("SELECT * FROM replication_events ORDER BY id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(self.db.pool())
                    .await
            }
        }
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_replication_event).collect())
    }

    pub async fn replication_event_progress(
        &self,
        id: i64,
    ) -> Result<Option<(ReplicationEvent, EventProgress)>> {
        let Some(event) = self.get_replication_event(id).await? else {
            return Ok(None);
        };
        let percent = match event.status {
            EventStatus::Success => Some(100.0),
            _ => event.percent,
        };
        let progress = EventProgress {
            moved_bytes: event.moved_bytes,
            total_bytes: event.total_bytes,
            percent,
        };
        Ok(Some((event, progress)))
    }

    /// Latest successful backup event of a job (restore source lookup).
    pub async fn last_successful_backup(&self, job_id: i64) -> Result<Option<BackupEvent>> {
        let row = sqlx::query(
            "SELECT * FROM backup_events
             WHERE job_id = ? AND status = 'success' AND kind = 'backup'
             ORDER BY id DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| row_to_backup_event(&r)))
    }
}
