///! Database migrations

use sqlx::SqlitePool;
use sylve_common::{Error, Result};

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Database(format!("Failed to create migrations table: {}", e)))?;

    // Run migrations in order
    run_migration(pool, "001_create_cluster_table", MIGRATION_001_CLUSTER).await?;
    run_migration(pool, "002_create_nodes_table", MIGRATION_002_NODES).await?;
    run_migration(pool, "003_create_backup_targets_table", MIGRATION_003_BACKUP_TARGETS).await?;
    run_migration(pool, "004_create_backup_jobs_table", MIGRATION_004_BACKUP_JOBS).await?;
    run_migration(pool, "005_create_backup_events_table", MIGRATION_005_BACKUP_EVENTS).await?;
    run_migration(pool, "006_create_replication_policies_table", MIGRATION_006_REPLICATION_POLICIES).await?;
    run_migration(pool, "007_create_replication_events_table", MIGRATION_007_REPLICATION_EVENTS).await?;
    run_migration(pool, "008_create_replication_leases_table", MIGRATION_008_REPLICATION_LEASES).await?;
    run_migration(pool, "009_create_cluster_ssh_identities_table", MIGRATION_009_SSH_IDENTITIES).await?;
    run_migration(pool, "010_create_vm_snapshots_table", MIGRATION_010_VM_SNAPSHOTS).await?;
    run_migration(pool, "011_create_periodic_snapshots_table", MIGRATION_011_PERIODIC_SNAPSHOTS).await?;
    run_migration(pool, "012_create_raft_tables", MIGRATION_012_RAFT).await?;
    run_migration(pool, "013_create_guest_tables", MIGRATION_013_GUESTS).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    // Check if migration already ran
    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    // SQLite executes one statement per query call
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Migration {} failed: {}", name, e)))?;
    }

    // Record migration
    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record migration: {}", e)))?;

    tracing::info!("Migration {} completed", name);

    Ok(())
}

const MIGRATION_001_CLUSTER: &str = "
CREATE TABLE cluster (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    cluster_key TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
";

const MIGRATION_002_NODES: &str = "
CREATE TABLE nodes (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    raft_addr TEXT NOT NULL,
    api_addr TEXT NOT NULL,
    guest_ids TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX idx_nodes_hostname ON nodes(hostname);
";

const MIGRATION_003_BACKUP_TARGETS: &str = "
CREATE TABLE backup_targets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    ssh_host TEXT NOT NULL,
    ssh_port INTEGER NOT NULL DEFAULT 22,
    ssh_user TEXT NOT NULL,
    ssh_key TEXT NOT NULL,
    ssh_key_path TEXT NOT NULL,
    backup_root TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX idx_backup_targets_name ON backup_targets(name);
";

const MIGRATION_004_BACKUP_JOBS: &str = "
CREATE TABLE backup_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id INTEGER NOT NULL,
    runner_node_id TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL,
    source_dataset TEXT NOT NULL DEFAULT '',
    jail_root_dataset TEXT NOT NULL DEFAULT '',
    dest_suffix TEXT NOT NULL DEFAULT '',
    prune_keep_last INTEGER NOT NULL DEFAULT 0,
    prune_target INTEGER NOT NULL DEFAULT 0,
    stop_before_backup INTEGER NOT NULL DEFAULT 0,
    cron_expr TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (target_id) REFERENCES backup_targets(id)
);

CREATE INDEX idx_backup_jobs_target ON backup_jobs(target_id);
CREATE INDEX idx_backup_jobs_runner ON backup_jobs(runner_node_id);
";

const MIGRATION_005_BACKUP_EVENTS: &str = "
CREATE TABLE backup_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER,
    target_id INTEGER,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    total_bytes INTEGER,
    moved_bytes INTEGER,
    percent REAL,
    output TEXT NOT NULL DEFAULT '',
    error TEXT NOT NULL DEFAULT '',
    last_snapshot TEXT NOT NULL DEFAULT ''
);

CREATE INDEX idx_backup_events_job ON backup_events(job_id);
CREATE INDEX idx_backup_events_started ON backup_events(started_at);
CREATE INDEX idx_backup_events_status ON backup_events(status);
";

const MIGRATION_006_REPLICATION_POLICIES: &str = "
CREATE TABLE replication_policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    guest_type TEXT NOT NULL,
    guest_id INTEGER NOT NULL,
    source_node_id TEXT NOT NULL,
    active_node_id TEXT,
    destination_node_ids TEXT NOT NULL DEFAULT '[]',
    mode TEXT NOT NULL,
    cron_expr TEXT NOT NULL DEFAULT '',
    frequency_seconds INTEGER,
    keep_last INTEGER NOT NULL DEFAULT 1,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX idx_replication_policies_guest ON replication_policies(guest_type, guest_id);
";

const MIGRATION_007_REPLICATION_EVENTS: &str = "
CREATE TABLE replication_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    policy_id INTEGER NOT NULL,
    guest_type TEXT NOT NULL,
    guest_id INTEGER NOT NULL,
    source_node_id TEXT NOT NULL,
    target_node_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    total_bytes INTEGER,
    moved_bytes INTEGER,
    percent REAL,
    output TEXT NOT NULL DEFAULT '',
    error TEXT NOT NULL DEFAULT '',
    last_snapshot TEXT NOT NULL DEFAULT ''
);

CREATE INDEX idx_replication_events_policy ON replication_events(policy_id);
CREATE INDEX idx_replication_events_started ON replication_events(started_at);
";

const MIGRATION_008_REPLICATION_LEASES: &str = "
CREATE TABLE replication_leases (
    policy_id INTEGER PRIMARY KEY,
    owner_node_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    token TEXT NOT NULL
);
";

const MIGRATION_009_SSH_IDENTITIES: &str = "
CREATE TABLE cluster_ssh_identities (
    node_id TEXT PRIMARY KEY,
    public_key TEXT NOT NULL
);
";

const MIGRATION_010_VM_SNAPSHOTS: &str = "
CREATE TABLE vm_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vm_id INTEGER NOT NULL,
    rid INTEGER NOT NULL,
    parent_snapshot_id INTEGER,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    snapshot_name TEXT NOT NULL,
    root_datasets TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
);

CREATE INDEX idx_vm_snapshots_vm ON vm_snapshots(vm_id);
CREATE INDEX idx_vm_snapshots_created ON vm_snapshots(created_at);
";

const MIGRATION_011_PERIODIC_SNAPSHOTS: &str = "
CREATE TABLE periodic_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    dataset TEXT NOT NULL,
    prefix TEXT NOT NULL,
    recursive INTEGER NOT NULL DEFAULT 0,
    interval_seconds INTEGER NOT NULL DEFAULT 0,
    cron_expr TEXT NOT NULL DEFAULT '',
    last_run_at INTEGER,
    keep_last INTEGER NOT NULL DEFAULT 0,
    max_age_days INTEGER NOT NULL DEFAULT 0,
    keep_hourly INTEGER NOT NULL DEFAULT 0,
    keep_daily INTEGER NOT NULL DEFAULT 0,
    keep_weekly INTEGER NOT NULL DEFAULT 0,
    keep_monthly INTEGER NOT NULL DEFAULT 0,
    keep_yearly INTEGER NOT NULL DEFAULT 0
);
";

const MIGRATION_012_RAFT: &str = "
CREATE TABLE raft_log (
    log_index INTEGER PRIMARY KEY,
    term INTEGER NOT NULL,
    proposal TEXT NOT NULL
);

CREATE TABLE raft_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const MIGRATION_013_GUESTS: &str = "
CREATE TABLE vms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rid INTEGER NOT NULL UNIQUE,
    data TEXT NOT NULL
);

CREATE TABLE jails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rid INTEGER NOT NULL UNIQUE,
    data TEXT NOT NULL
);
";
