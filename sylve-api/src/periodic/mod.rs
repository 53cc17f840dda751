//! Periodic snapshot scheduler.
//!
//! A 5-second ticker walks the periodic snapshot jobs and fires any whose
//! boundary-aligned due time has passed. Cron boundaries are computed in
//! local time (cron library convention) while `last_run_at` persists UTC;
//! this produces DST discontinuities, documented and deliberately not
//! fixed here. Snapshot names carry the boundary, not the wall clock, so
//! cadence survives slow ticks.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Local, Timelike, Utc};
use cron::Schedule;
use sylve_common::model::{PeriodicSnapshotJob, SnapshotRetention};
use sylve_common::{Error, Result};
use tracing::{error, info, warn};

use crate::db::{self, Database};
use crate::zfs::ZfsManager;

const TICK_SECS: u64 = 5;
const CRON_LOOKBACK_HOURS: i64 = 48;

/// The `cron` crate wants a seconds field; operator expressions are the
/// classic 5-field form.
pub fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Latest cron boundary at or before `now`, looking back 48 hours.
pub fn latest_cron_boundary(expr: &str, now: DateTime<Local>) -> Result<Option<DateTime<Local>>> {
    let schedule = Schedule::from_str(&normalize_cron(expr))
        .map_err(|e| Error::validation(format!("invalid cron expression '{}': {}", expr, e)))?;

    let start = now - Duration::hours(CRON_LOOKBACK_HOURS);
    let mut latest = None;
    for boundary in schedule.after(&start) {
        if boundary > now {
            break;
        }
        latest = Some(boundary);
    }
    Ok(latest)
}

/// Boundary-aligned snapshot name: `<prefix>-YYYY-MM-DD-HH-MM`.
pub fn boundary_snapshot_name(prefix: &str, boundary: DateTime<Local>) -> String {
    format!("{}-{}", prefix, boundary.format("%Y-%m-%d-%H-%M"))
}

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// The boundary a job is due to fire for, or `None` when nothing is due.
pub fn due_boundary(job: &PeriodicSnapshotJob, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if !job.cron_expr.is_empty() {
        let boundary = latest_cron_boundary(&job.cron_expr, now.with_timezone(&Local))?;
        let Some(boundary) = boundary else {
            return Ok(None);
        };
        let boundary_utc = boundary.with_timezone(&Utc);
        if job.last_run_at.map(|last| last < boundary_utc).unwrap_or(true) {
            return Ok(Some(boundary_utc));
        }
        return Ok(None);
    }

    if job.interval_seconds > 0 {
        return Ok(match job.last_run_at {
            None => Some(truncate_to_minute(now)),
            Some(last) => {
                let due = last + Duration::seconds(job.interval_seconds as i64);
                if now >= due {
                    Some(due)
                } else {
                    None
                }
            }
        });
    }

    Ok(None)
}

/// One snapshot as seen by retention: its name and creation time.
#[derive(Debug, Clone)]
pub struct RetainedSnapshot {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

fn bucket_key(ts: DateTime<Utc>, bucket: Bucket) -> String {
    match bucket {
        Bucket::Hourly => format!("{}", ts.format("%Y-%m-%d-%H")),
        Bucket::Daily => format!("{}", ts.format("%Y-%m-%d")),
        Bucket::Weekly => {
            let week = ts.iso_week();
            format!("W{}-{}", week.year(), week.week())
        }
        Bucket::Monthly => format!("{}", ts.format("%Y-%m")),
        Bucket::Yearly => format!("{}", ts.format("%Y")),
    }
}

#[derive(Debug, Clone, Copy)]
enum Bucket {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Compute the names retention keeps. Input must be sorted newest-first;
/// buckets keep their newest member, `keep_last` keeps a head run, and
/// `max_age_days` keeps everything young enough.
pub fn compute_keepers(
    snapshots: &[RetainedSnapshot],
    retention: &SnapshotRetention,
    now: DateTime<Utc>,
) -> HashSet<String> {
    let mut keepers = HashSet::new();

    if retention.keep_last > 0 {
        for snap in snapshots.iter().take(retention.keep_last as usize) {
            keepers.insert(snap.name.clone());
        }
    }

    let gfs: [(Bucket, u32); 5] = [
        (Bucket::Hourly, retention.keep_hourly),
        (Bucket::Daily, retention.keep_daily),
        (Bucket::Weekly, retention.keep_weekly),
        (Bucket::Monthly, retention.keep_monthly),
        (Bucket::Yearly, retention.keep_yearly),
    ];

    for (bucket, count) in gfs {
        if count == 0 {
            continue;
        }
        let mut seen = HashSet::new();
        for snap in snapshots {
            let key = bucket_key(snap.created_at, bucket);
            if seen.contains(&key) {
                continue;
            }
            seen.insert(key);
            keepers.insert(snap.name.clone());
            if seen.len() >= count as usize {
                break;
            }
        }
    }

    if retention.max_age_days > 0 {
        let cutoff = now - Duration::days(retention.max_age_days as i64);
        for snap in snapshots {
            if snap.created_at > cutoff {
                keepers.insert(snap.name.clone());
            }
        }
    }

    keepers
}

/// Periodic snapshot scheduler
pub struct PeriodicSnapshotScheduler {
    db: Arc<Database>,
    zfs: Arc<ZfsManager>,
}

impl PeriodicSnapshotScheduler {
    pub fn new(db: Arc<Database>, zfs: Arc<ZfsManager>) -> Self {
        Self { db, zfs }
    }

    /// Validate and persist a new job; the dataset GUID keys the job so it
    /// survives renames.
    pub async fn create_job(&self, mut job: PeriodicSnapshotJob) -> Result<PeriodicSnapshotJob> {
        job.retention.validate()?;
        if job.cron_expr.is_empty() && job.interval_seconds == 0 {
            return Err(Error::validation(
                "periodic snapshot job needs a cron expression or an interval",
            ));
        }
        if !job.cron_expr.is_empty() {
            Schedule::from_str(&normalize_cron(&job.cron_expr)).map_err(|e| {
                Error::validation(format!("invalid cron expression '{}': {}", job.cron_expr, e))
            })?;
        }
        if job.prefix.is_empty() {
            return Err(Error::validation("periodic snapshot job needs a name prefix"));
        }

        job.id = db::periodic_snapshots::insert(self.db.pool(), &job).await?;
        info!("Created periodic snapshot job {} for {}", job.id, job.dataset);
        Ok(job)
    }

    pub async fn delete_job(&self, id: i64) -> Result<()> {
        db::periodic_snapshots::delete(self.db.pool(), id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<PeriodicSnapshotJob>> {
        db::periodic_snapshots::list(self.db.pool()).await
    }

    /// Spawn the ticker.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            info!("Periodic snapshot scheduler started");
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(TICK_SECS));
            loop {
                ticker.tick().await;
                if let Err(e) = self.tick().await {
                    error!("Periodic snapshot tick failed: {}", e);
                }
            }
        });
    }

    async fn tick(&self) -> Result<()> {
        let jobs = self.list_jobs().await?;
        let now = Utc::now();

        for job in jobs {
            match due_boundary(&job, now) {
                Ok(Some(boundary)) => {
                    if let Err(e) = self.run_job(&job, boundary).await {
                        error!("Periodic snapshot job {} failed: {}", job.id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping periodic job {}: {}", job.id, e),
            }
        }
        Ok(())
    }

    async fn run_job(&self, job: &PeriodicSnapshotJob, boundary: DateTime<Utc>) -> Result<()> {
        let name = boundary_snapshot_name(&job.prefix, boundary.with_timezone(&Local));
        let full = format!("{}@{}", job.dataset, name);

        let existing = self.zfs.list_snapshots(&job.dataset, false).await?;
        if existing.iter().any(|s| s.name == name) {
            // Collision: keep cadence, skip the duplicate.
            info!("Snapshot {} already exists, advancing cadence", full);
        } else {
            self.zfs.snapshot(&full, job.recursive).await?;
            info!("Created periodic snapshot {}", full);
        }

        db::periodic_snapshots::update_last_run(self.db.pool(), job.id, boundary).await?;
        self.apply_retention(job).await
    }

    async fn apply_retention(&self, job: &PeriodicSnapshotJob) -> Result<()> {
        let retention = &job.retention;
        if !retention.uses_simple() && !retention.uses_gfs() {
            return Ok(());
        }

        let prefix = format!("{}-", job.prefix);
        let mut snapshots: Vec<RetainedSnapshot> = self
            .zfs
            .list_snapshots(&job.dataset, false)
            .await?
            .into_iter()
            .filter(|s| s.name.starts_with(&prefix))
            .map(|s| RetainedSnapshot {
                name: s.name,
                created_at: DateTime::from_timestamp(s.creation, 0).unwrap_or_else(Utc::now),
            })
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let keepers = compute_keepers(&snapshots, retention, Utc::now());

        for snap in &snapshots {
            if keepers.contains(&snap.name) {
                continue;
            }
            let full = format!("{}@{}", job.dataset, snap.name);
            if let Err(e) = self.zfs.destroy(&full, job.recursive).await {
                warn!("Retention failed to destroy {}: {}", full, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(name: &str, ts: DateTime<Utc>) -> RetainedSnapshot {
        RetainedSnapshot {
            name: name.to_string(),
            created_at: ts,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 2 * * 1"), "0 0 2 * * 1");
        // Six-field expressions pass through
        assert_eq!(normalize_cron("30 0 2 * * 1"), "30 0 2 * * 1");
    }

    #[test]
    fn test_latest_cron_boundary_hourly() {
        let now = Local::now();
        let boundary = latest_cron_boundary("0 * * * *", now).unwrap().unwrap();
        assert!(boundary <= now);
        assert!(now - boundary < Duration::hours(1));
        assert_eq!(boundary.minute(), 0);
        assert_eq!(boundary.second(), 0);
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        assert!(latest_cron_boundary("not a cron", Local::now()).is_err());
    }

    #[test]
    fn test_due_boundary_interval() {
        let job = PeriodicSnapshotJob {
            id: 1,
            guid: "g".to_string(),
            dataset: "tank/ds".to_string(),
            prefix: "auto".to_string(),
            recursive: false,
            interval_seconds: 3600,
            cron_expr: String::new(),
            last_run_at: Some(at(1_700_000_000)),
            retention: SnapshotRetention::default(),
        };

        // Not yet due
        assert_eq!(due_boundary(&job, at(1_700_000_000 + 3599)).unwrap(), None);

        // Due exactly at the boundary; the boundary is last + interval,
        // not the wall clock
        let due = due_boundary(&job, at(1_700_000_000 + 4000)).unwrap().unwrap();
        assert_eq!(due, at(1_700_000_000 + 3600));

        // Never run: due immediately at minute alignment
        let fresh = PeriodicSnapshotJob {
            last_run_at: None,
            ..job
        };
        let due = due_boundary(&fresh, at(1_700_000_030)).unwrap().unwrap();
        assert_eq!(due.second(), 0);
    }

    #[test]
    fn test_keep_last_retention() {
        let snapshots: Vec<RetainedSnapshot> = (0..10)
            .map(|i| snap(&format!("auto-{}", i), at(1_700_000_000 - i * 3600)))
            .collect();

        let retention = SnapshotRetention {
            keep_last: 3,
            ..Default::default()
        };
        let keepers = compute_keepers(&snapshots, &retention, at(1_700_000_100));
        assert_eq!(keepers.len(), 3);
        assert!(keepers.contains("auto-0"));
        assert!(keepers.contains("auto-2"));
        assert!(!keepers.contains("auto-3"));
    }

    #[test]
    fn test_gfs_retention_hourly_and_daily() {
        // Hourly snapshots for 72 hours, newest first
        let base = at(1_700_000_000);
        let snapshots: Vec<RetainedSnapshot> = (0..72)
            .map(|i| snap(&format!("auto-{}", i), base - Duration::hours(i)))
            .collect();

        let retention = SnapshotRetention {
            keep_hourly: 2,
            keep_daily: 2,
            ..Default::default()
        };
        let keepers = compute_keepers(&snapshots, &retention, base);

        // 2 distinct-hour keepers (the two newest hours)
        assert!(keepers.contains("auto-0"));
        assert!(keepers.contains("auto-1"));

        // 2 distinct-day keepers, bucket-newest; the newest snapshot is
        // also its day's newest so the union is 3
        assert_eq!(keepers.len(), 3);

        let second_day_keeper = snapshots
            .iter()
            .filter(|s| {
                bucket_key(s.created_at, Bucket::Daily)
                    != bucket_key(base, Bucket::Daily)
            })
            .max_by_key(|s| s.created_at)
            .unwrap();
        assert!(keepers.contains(&second_day_keeper.name));
    }

    #[test]
    fn test_max_age_retention() {
        let base = at(1_700_000_000);
        let snapshots: Vec<RetainedSnapshot> = (0..10)
            .map(|i| snap(&format!("auto-{}", i), base - Duration::days(i)))
            .collect();

        let retention = SnapshotRetention {
            max_age_days: 3,
            ..Default::default()
        };
        let keepers = compute_keepers(&snapshots, &retention, base);
        // Days 0, 1, 2 are younger than the 3-day cutoff
        assert_eq!(keepers.len(), 3);
        assert!(keepers.contains("auto-0"));
        assert!(keepers.contains("auto-2"));
        assert!(!keepers.contains("auto-3"));
    }

    #[test]
    fn test_retention_floor_invariant() {
        // Retention never keeps fewer than the greater of keep_last and
        // the active GFS bucket sum (given enough snapshots).
        let base = at(1_700_000_000);
        let snapshots: Vec<RetainedSnapshot> = (0..100)
            .map(|i| snap(&format!("auto-{}", i), base - Duration::hours(i * 7)))
            .collect();

        let retention = SnapshotRetention {
            keep_hourly: 3,
            keep_daily: 4,
            keep_weekly: 2,
            ..Default::default()
        };
        let keepers = compute_keepers(&snapshots, &retention, base);
        assert!(keepers.len() >= 4);
    }

    #[test]
    fn test_boundary_snapshot_name_format() {
        let boundary = Local.with_ymd_and_hms(2026, 3, 5, 14, 30, 0).unwrap();
        assert_eq!(
            boundary_snapshot_name("auto", boundary),
            "auto-2026-03-05-14-30"
        );
    }

    use chrono::TimeZone;

    #[tokio::test]
    async fn test_create_job_validations() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let scheduler = PeriodicSnapshotScheduler::new(db, Arc::new(ZfsManager::new()));

        let job = PeriodicSnapshotJob {
            id: 0,
            guid: "123".to_string(),
            dataset: "tank/ds".to_string(),
            prefix: "auto".to_string(),
            recursive: true,
            interval_seconds: 0,
            cron_expr: String::new(),
            last_run_at: None,
            retention: SnapshotRetention::default(),
        };

        // Needs a schedule
        assert!(scheduler.create_job(job.clone()).await.is_err());

        // Mixed retention is rejected
        let mixed = PeriodicSnapshotJob {
            interval_seconds: 3600,
            retention: SnapshotRetention {
                keep_last: 2,
                keep_daily: 2,
                ..Default::default()
            },
            ..job.clone()
        };
        assert!(scheduler.create_job(mixed).await.is_err());

        // Valid interval job persists
        let valid = PeriodicSnapshotJob {
            interval_seconds: 3600,
            retention: SnapshotRetention {
                keep_last: 5,
                ..Default::default()
            },
            ..job
        };
        let created = scheduler.create_job(valid).await.unwrap();
        assert!(created.id > 0);
        assert_eq!(scheduler.list_jobs().await.unwrap().len(), 1);
    }
}
