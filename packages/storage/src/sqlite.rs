// ABOUTME: SQLite implementation of the repository traits
// ABOUTME: Timestamps are stored as fixed-width RFC3339 text so they compare lexicographically

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sandchest_core::{format_timestamp, parse_timestamp};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

use crate::models::{
    Artifact, CollectedArtifact, Exec, ExecStatus, Node, ResourceUsage, Sandbox, SandboxFilter,
    SandboxStatus, Session, SessionStatus,
};
use crate::repository::{
    ArtifactRepository, ExecRepository, NodeRepository, SandboxRepository, SessionRepository,
};
use crate::{Result, StorageError};

const SANDBOX_COLUMNS: &str = "id, org_id, node_id, slot, image, profile, status, env, \
     forked_from, fork_depth, fork_count, ttl_seconds, queue_timeout_seconds, failure_reason, \
     replay_public, replay_expires_at, replay_purged_at, last_activity_at, created_at, \
     started_at, ended_at, expires_at, queue_deadline_at, ttl_warned_at";

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let repo = Self::new(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    /// Private in-memory database on a single connection, for tests and local runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let repo = Self::new(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_sandboxes(&self, sql: &str, binds: Vec<String>) -> Result<Vec<Sandbox>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_sandbox).collect()
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    format_timestamp(dt)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).map_err(|_| StorageError::InvalidTimestamp(raw.to_string()))
}

fn opt_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.get::<Option<String>, _>(column)
        .as_deref()
        .map(parse_ts)
        .transpose()
}

fn row_to_sandbox(row: SqliteRow) -> Result<Sandbox> {
    let env: HashMap<String, String> = serde_json::from_str(&row.get::<String, _>("env"))?;

    Ok(Sandbox {
        id: row.get("id"),
        org_id: row.get("org_id"),
        node_id: row.get("node_id"),
        slot: row.get::<Option<i64>, _>("slot").map(|s| s as u32),
        image: row.get("image"),
        profile: row.get("profile"),
        status: SandboxStatus::from_str(&row.get::<String, _>("status"))?,
        env,
        forked_from: row.get("forked_from"),
        fork_depth: row.get::<i64, _>("fork_depth") as i32,
        fork_count: row.get::<i64, _>("fork_count") as i32,
        ttl_seconds: row.get("ttl_seconds"),
        queue_timeout_seconds: row.get("queue_timeout_seconds"),
        failure_reason: row.get("failure_reason"),
        replay_public: row.get::<i64, _>("replay_public") != 0,
        replay_expires_at: opt_ts(&row, "replay_expires_at")?,
        replay_purged_at: opt_ts(&row, "replay_purged_at")?,
        last_activity_at: opt_ts(&row, "last_activity_at")?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        started_at: opt_ts(&row, "started_at")?,
        ended_at: opt_ts(&row, "ended_at")?,
        expires_at: opt_ts(&row, "expires_at")?,
        queue_deadline_at: parse_ts(&row.get::<String, _>("queue_deadline_at"))?,
        ttl_warned_at: opt_ts(&row, "ttl_warned_at")?,
    })
}

fn row_to_exec(row: SqliteRow) -> Result<Exec> {
    let cpu_ms: Option<i64> = row.get("cpu_ms");
    let peak_memory_bytes: Option<i64> = row.get("peak_memory_bytes");
    let usage = match (cpu_ms, peak_memory_bytes) {
        (None, None) => None,
        (cpu, mem) => Some(ResourceUsage {
            cpu_ms: cpu.unwrap_or_default(),
            peak_memory_bytes: mem.unwrap_or_default(),
        }),
    };

    Ok(Exec {
        id: row.get("id"),
        sandbox_id: row.get("sandbox_id"),
        org_id: row.get("org_id"),
        session_id: row.get("session_id"),
        seq: row.get("seq"),
        cmd: serde_json::from_str(&row.get::<String, _>("cmd"))?,
        cwd: row.get("cwd"),
        status: ExecStatus::from_str(&row.get::<String, _>("status"))?,
        exit_code: row.get::<Option<i64>, _>("exit_code").map(|c| c as i32),
        usage,
        duration_ms: row.get("duration_ms"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        started_at: opt_ts(&row, "started_at")?,
        ended_at: opt_ts(&row, "ended_at")?,
    })
}

fn row_to_session(row: SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        sandbox_id: row.get("sandbox_id"),
        org_id: row.get("org_id"),
        shell: row.get("shell"),
        status: SessionStatus::from_str(&row.get::<String, _>("status"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        destroyed_at: opt_ts(&row, "destroyed_at")?,
    })
}

fn row_to_artifact(row: SqliteRow) -> Result<Artifact> {
    Ok(Artifact {
        id: row.get("id"),
        sandbox_id: row.get("sandbox_id"),
        org_id: row.get("org_id"),
        path: row.get("path"),
        name: row.get("name"),
        mime: row.get("mime"),
        bytes: row.get("bytes"),
        sha256: row.get("sha256"),
        object_ref: row.get("object_ref"),
        exec_id: row.get("exec_id"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        collected_at: opt_ts(&row, "collected_at")?,
    })
}

fn row_to_node(row: SqliteRow) -> Result<Node> {
    Ok(Node {
        id: row.get("id"),
        address: row.get("address"),
        slots_total: row.get::<i64, _>("slots_total") as u32,
        last_heartbeat_at: parse_ts(&row.get::<String, _>("last_heartbeat_at"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

async fn insert_sandbox(conn: &mut SqliteConnection, sandbox: &Sandbox) -> Result<()> {
    let sql = format!(
        "INSERT INTO sandboxes ({}, status_changed_at) VALUES ({})",
        SANDBOX_COLUMNS,
        placeholders(25)
    );

    sqlx::query(&sql)
        .bind(&sandbox.id)
        .bind(&sandbox.org_id)
        .bind(&sandbox.node_id)
        .bind(sandbox.slot.map(i64::from))
        .bind(&sandbox.image)
        .bind(&sandbox.profile)
        .bind(sandbox.status.as_str())
        .bind(serde_json::to_string(&sandbox.env)?)
        .bind(&sandbox.forked_from)
        .bind(sandbox.fork_depth as i64)
        .bind(sandbox.fork_count as i64)
        .bind(sandbox.ttl_seconds)
        .bind(sandbox.queue_timeout_seconds)
        .bind(&sandbox.failure_reason)
        .bind(sandbox.replay_public as i64)
        .bind(sandbox.replay_expires_at.as_ref().map(ts))
        .bind(sandbox.replay_purged_at.as_ref().map(ts))
        .bind(sandbox.last_activity_at.as_ref().map(ts))
        .bind(ts(&sandbox.created_at))
        .bind(sandbox.started_at.as_ref().map(ts))
        .bind(sandbox.ended_at.as_ref().map(ts))
        .bind(sandbox.expires_at.as_ref().map(ts))
        .bind(ts(&sandbox.queue_deadline_at))
        .bind(sandbox.ttl_warned_at.as_ref().map(ts))
        .bind(ts(&sandbox.created_at))
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[async_trait]
impl SandboxRepository for SqliteRepository {
    async fn create_sandbox(&self, sandbox: &Sandbox) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_sandbox(&mut conn, sandbox).await
    }

    async fn create_fork(&self, child: &Sandbox, parent_id: &str) -> Result<i32> {
        let mut tx = self.pool.begin().await?;
        insert_sandbox(&mut tx, child).await?;
        let row = sqlx::query(
            "UPDATE sandboxes SET fork_count = fork_count + 1 WHERE id = ? RETURNING fork_count",
        )
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StorageError::NotFound(parent_id.to_string()))?;
        tx.commit().await?;

        Ok(row.get::<i64, _>("fork_count") as i32)
    }

    async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let sql = format!("SELECT {} FROM sandboxes WHERE id = ?", SANDBOX_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        row_to_sandbox(row)
    }

    async fn list_sandboxes(&self, org_id: &str, filter: &SandboxFilter) -> Result<Vec<Sandbox>> {
        let mut sql = format!(
            "SELECT {} FROM sandboxes WHERE org_id = ? AND status != 'deleted'",
            SANDBOX_COLUMNS
        );
        let mut binds = vec![org_id.to_string()];

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(image) = &filter.image {
            sql.push_str(" AND image = ?");
            binds.push(image.clone());
        }
        if let Some(parent) = &filter.forked_from {
            sql.push_str(" AND forked_from = ?");
            binds.push(parent.clone());
        }
        if let Some(cursor) = &filter.cursor {
            sql.push_str(" AND id < ?");
            binds.push(cursor.clone());
        }

        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", limit));

        self.fetch_sandboxes(&sql, binds).await
    }

    async fn transition_status(
        &self,
        id: &str,
        from: &[SandboxStatus],
        to: SandboxStatus,
        failure_reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let ended_at = to.is_terminal().then(|| ts(&at));
        let sql = format!(
            "UPDATE sandboxes
             SET status = ?,
                 status_changed_at = ?,
                 ended_at = COALESCE(ended_at, ?),
                 failure_reason = COALESCE(failure_reason, ?)
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(ts(&at))
            .bind(ended_at)
            .bind(failure_reason)
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_node(
        &self,
        id: &str,
        node_id: &str,
        slot: u32,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sandboxes
             SET node_id = ?, slot = ?, status = 'provisioning', status_changed_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(node_id)
        .bind(i64::from(slot))
        .bind(ts(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let sandbox = self.get_sandbox(id).await?;
        let expires_at = started_at + Duration::seconds(sandbox.ttl_seconds);

        let result = sqlx::query(
            "UPDATE sandboxes
             SET status = 'running', started_at = ?, expires_at = ?, last_activity_at = ?,
                 status_changed_at = ?
             WHERE id = ? AND status IN ('queued', 'provisioning')",
        )
        .bind(ts(&started_at))
        .bind(ts(&expires_at))
        .bind(ts(&started_at))
        .bind(ts(&started_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET last_activity_at = ? WHERE id = ?")
            .bind(ts(&at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_replay_public(&self, id: &str, public: bool) -> Result<()> {
        let result = sqlx::query("UPDATE sandboxes SET replay_public = ? WHERE id = ?")
            .bind(public as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_fork_tree(&self, root_id: &str) -> Result<Vec<Sandbox>> {
        // Lineage is acyclic by construction: a child always references an
        // already-existing parent, so the recursion terminates.
        let sql = format!(
            "WITH RECURSIVE tree(id) AS (
                 SELECT id FROM sandboxes WHERE id = ?
                 UNION ALL
                 SELECT s.id FROM sandboxes s JOIN tree t ON s.forked_from = t.id
             )
             SELECT {} FROM sandboxes WHERE id IN (SELECT id FROM tree)
             ORDER BY fork_depth, id",
            SANDBOX_COLUMNS
        );

        self.fetch_sandboxes(&sql, vec![root_id.to_string()]).await
    }

    async fn list_queued(&self, limit: u32) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes WHERE status = 'queued' ORDER BY id LIMIT {}",
            SANDBOX_COLUMNS, limit
        );
        self.fetch_sandboxes(&sql, vec![]).await
    }

    async fn list_on_nodes(&self) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes
             WHERE status IN ('provisioning', 'running', 'stopping') AND node_id IS NOT NULL
             ORDER BY id",
            SANDBOX_COLUMNS
        );
        self.fetch_sandboxes(&sql, vec![]).await
    }

    async fn find_stuck_transitions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes
             WHERE status IN ('provisioning', 'stopping')
               AND COALESCE(status_changed_at, created_at) <= ?
             ORDER BY id",
            SANDBOX_COLUMNS
        );
        self.fetch_sandboxes(&sql, vec![ts(&cutoff)]).await
    }

    async fn find_expired_ttl(&self, now: DateTime<Utc>) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes
             WHERE status = 'running' AND expires_at IS NOT NULL AND expires_at <= ?",
            SANDBOX_COLUMNS
        );
        self.fetch_sandboxes(&sql, vec![ts(&now)]).await
    }

    async fn find_near_ttl_expiry(
        &self,
        now: DateTime<Utc>,
        window_secs: i64,
    ) -> Result<Vec<Sandbox>> {
        let horizon = now + Duration::seconds(window_secs);
        let sql = format!(
            "SELECT {} FROM sandboxes
             WHERE status = 'running' AND ttl_warned_at IS NULL
               AND expires_at > ? AND expires_at <= ?",
            SANDBOX_COLUMNS
        );
        self.fetch_sandboxes(&sql, vec![ts(&now), ts(&horizon)])
            .await
    }

    async fn mark_ttl_warned(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET ttl_warned_at = COALESCE(ttl_warned_at, ?) WHERE id = ?")
            .bind(ts(&at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes
             WHERE status = 'running' AND COALESCE(last_activity_at, started_at, created_at) < ?",
            SANDBOX_COLUMNS
        );
        self.fetch_sandboxes(&sql, vec![ts(&cutoff)]).await
    }

    async fn find_queued_before(&self, now: DateTime<Utc>) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes WHERE status = 'queued' AND queue_deadline_at <= ?",
            SANDBOX_COLUMNS
        );
        self.fetch_sandboxes(&sql, vec![ts(&now)]).await
    }

    async fn find_missing_replay_expiry(&self, limit: u32) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes
             WHERE status IN ('stopped', 'failed', 'deleted') AND replay_expires_at IS NULL
             ORDER BY id LIMIT {}",
            SANDBOX_COLUMNS, limit
        );
        self.fetch_sandboxes(&sql, vec![]).await
    }

    async fn set_replay_expiry(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE sandboxes SET replay_expires_at = ? WHERE id = ? AND replay_expires_at IS NULL",
        )
        .bind(ts(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_purgable_replays(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Sandbox>> {
        let sql = format!(
            "SELECT {} FROM sandboxes
             WHERE replay_expires_at IS NOT NULL AND replay_expires_at <= ?
               AND replay_purged_at IS NULL
             ORDER BY replay_expires_at LIMIT {}",
            SANDBOX_COLUMNS, limit
        );
        self.fetch_sandboxes(&sql, vec![ts(&now)]).await
    }

    async fn mark_replay_purged(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET replay_purged_at = ? WHERE id = ?")
            .bind(ts(&at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecRepository for SqliteRepository {
    async fn create_exec(&self, exec: &Exec) -> Result<Exec> {
        let row = sqlx::query(
            "INSERT INTO execs (id, sandbox_id, org_id, session_id, seq, cmd, cwd, status, created_at)
             SELECT ?1, ?2, ?3, ?4, COALESCE(MAX(seq), 0) + 1, ?5, ?6, ?7, ?8
             FROM execs WHERE sandbox_id = ?2
             RETURNING seq",
        )
        .bind(&exec.id)
        .bind(&exec.sandbox_id)
        .bind(&exec.org_id)
        .bind(&exec.session_id)
        .bind(serde_json::to_string(&exec.cmd)?)
        .bind(&exec.cwd)
        .bind(exec.status.as_str())
        .bind(ts(&exec.created_at))
        .fetch_one(&self.pool)
        .await?;

        let mut created = exec.clone();
        created.seq = row.get("seq");
        Ok(created)
    }

    async fn get_exec(&self, sandbox_id: &str, exec_id: &str) -> Result<Exec> {
        let row = sqlx::query("SELECT * FROM execs WHERE id = ? AND sandbox_id = ?")
            .bind(exec_id)
            .bind(sandbox_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(exec_id.to_string()))?;

        row_to_exec(row)
    }

    async fn list_execs(&self, sandbox_id: &str) -> Result<Vec<Exec>> {
        let rows = sqlx::query("SELECT * FROM execs WHERE sandbox_id = ? ORDER BY seq")
            .bind(sandbox_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_exec).collect()
    }

    async fn mark_exec_running(&self, exec_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE execs SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(ts(&at))
        .bind(exec_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_exec(
        &self,
        exec_id: &str,
        status: ExecStatus,
        exit_code: Option<i32>,
        usage: Option<ResourceUsage>,
        duration_ms: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE execs
             SET status = ?, exit_code = ?, cpu_ms = ?, peak_memory_bytes = ?,
                 duration_ms = ?, ended_at = ?
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(status.as_str())
        .bind(exit_code.map(i64::from))
        .bind(usage.map(|u| u.cpu_ms))
        .bind(usage.map(|u| u.peak_memory_bytes))
        .bind(duration_ms)
        .bind(ts(&at))
        .bind(exec_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for SqliteRepository {
    async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, sandbox_id, org_id, shell, status, created_at, destroyed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.sandbox_id)
        .bind(&session.org_id)
        .bind(&session.shell)
        .bind(session.status.as_str())
        .bind(ts(&session.created_at))
        .bind(session.destroyed_at.as_ref().map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, sandbox_id: &str, session_id: &str) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ? AND sandbox_id = ?")
            .bind(session_id)
            .bind(sandbox_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;

        row_to_session(row)
    }

    async fn list_sessions(&self, sandbox_id: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE sandbox_id = ? ORDER BY id")
            .bind(sandbox_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    async fn destroy_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'destroyed', destroyed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(ts(&at))
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ArtifactRepository for SqliteRepository {
    async fn register_artifacts(&self, artifacts: &[Artifact]) -> Result<(usize, usize)> {
        let Some(first) = artifacts.first() else {
            return Ok((0, 0));
        };
        let sandbox_id = first.sandbox_id.clone();

        let mut tx = self.pool.begin().await?;
        let mut registered = 0usize;
        for artifact in artifacts {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO artifacts (id, sandbox_id, org_id, path, name, exec_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&artifact.id)
            .bind(&artifact.sandbox_id)
            .bind(&artifact.org_id)
            .bind(&artifact.path)
            .bind(&artifact.name)
            .bind(&artifact.exec_id)
            .bind(ts(&artifact.created_at))
            .execute(&mut *tx)
            .await?;
            registered += result.rows_affected() as usize;
        }

        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM artifacts WHERE sandbox_id = ?")
            .bind(&sandbox_id)
            .fetch_one(&mut *tx)
            .await?
            .get("total");

        tx.commit().await?;
        Ok((registered, total as usize))
    }

    async fn count_artifacts(&self, sandbox_id: &str) -> Result<usize> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM artifacts WHERE sandbox_id = ?")
            .bind(sandbox_id)
            .fetch_one(&self.pool)
            .await?
            .get("total");
        Ok(total as usize)
    }

    async fn list_artifacts(&self, sandbox_id: &str) -> Result<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE sandbox_id = ? ORDER BY id")
            .bind(sandbox_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_artifact).collect()
    }

    async fn list_uncollected_artifacts(&self, sandbox_id: &str) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            "SELECT * FROM artifacts WHERE sandbox_id = ? AND collected_at IS NULL ORDER BY id",
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_artifact).collect()
    }

    async fn mark_artifact_collected(
        &self,
        artifact_id: &str,
        collected: &CollectedArtifact,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE artifacts SET mime = ?, bytes = ?, sha256 = ?, object_ref = ?, collected_at = ?
             WHERE id = ?",
        )
        .bind(&collected.mime)
        .bind(collected.bytes)
        .bind(&collected.sha256)
        .bind(&collected.object_ref)
        .bind(ts(&at))
        .bind(artifact_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeRepository for SqliteRepository {
    async fn upsert_node(&self, node: &Node) -> Result<()> {
        sqlx::query(
            "INSERT INTO nodes (id, address, slots_total, last_heartbeat_at, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 address = COALESCE(excluded.address, nodes.address),
                 slots_total = excluded.slots_total,
                 last_heartbeat_at = excluded.last_heartbeat_at",
        )
        .bind(&node.id)
        .bind(&node.address)
        .bind(i64::from(node.slots_total))
        .bind(ts(&node.last_heartbeat_at))
        .bind(ts(&node.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Node> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        row_to_node(row)
    }

    async fn get_active_nodes(&self, since: DateTime<Utc>) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE last_heartbeat_at >= ? ORDER BY id")
            .bind(ts(&since))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_node).collect()
    }
}
