// ABOUTME: Coordination store over a shared SQL database
// ABOUTME: Upserts guarded by expiry give set-if-absent, compare-and-set and counter semantics

use async_trait::async_trait;
use sandchest_core::Clock;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use crate::rate_limit::{fixed_window, RateLimitDecision};
use crate::store::{
    heartbeat_key, leader_key, rate_key, slot_key, CoordinationStore, LiveReplayEvent,
    LIVE_REPLAY_MAX_EVENTS,
};
use crate::Result;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS coordination_keys (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS coordination_counters (
        key TEXT PRIMARY KEY,
        count INTEGER NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS coordination_replay (
        sandbox_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        event TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL,
        PRIMARY KEY (sandbox_id, seq)
    )",
];

#[derive(Clone)]
pub struct SqlCoordinationStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqlCoordinationStore {
    /// Wrap `pool`, creating the coordination tables if they are missing.
    pub async fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("Coordination tables ready");
        Ok(Self { pool, clock })
    }

    fn deadline(&self, ttl_secs: u64) -> i64 {
        self.clock.now_ms() + (ttl_secs as i64) * 1000
    }

    /// Insert `key`, or take it over when expired (or when `reentrant` and held by `value`).
    async fn set_if_free(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
        reentrant: bool,
    ) -> Result<bool> {
        let now = self.clock.now_ms();
        let result = sqlx::query(
            "INSERT INTO coordination_keys (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms
             WHERE coordination_keys.expires_at_ms <= ?4
                OR (?5 AND coordination_keys.value = excluded.value)",
        )
        .bind(key)
        .bind(value)
        .bind(self.deadline(ttl_secs))
        .bind(now)
        .bind(reentrant)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CoordinationStore for SqlCoordinationStore {
    async fn acquire_slot_lease(
        &self,
        node_id: &str,
        slot: u32,
        sandbox_id: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.set_if_free(&slot_key(node_id, slot), sandbox_id, ttl_secs, false)
            .await
    }

    async fn renew_slot_lease(
        &self,
        node_id: &str,
        slot: u32,
        sandbox_id: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE coordination_keys SET expires_at_ms = ?
             WHERE key = ? AND value = ? AND expires_at_ms > ?",
        )
        .bind(self.deadline(ttl_secs))
        .bind(slot_key(node_id, slot))
        .bind(sandbox_id)
        .bind(self.clock.now_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_slot_lease(&self, node_id: &str, slot: u32) -> Result<()> {
        sqlx::query("DELETE FROM coordination_keys WHERE key = ?")
            .bind(slot_key(node_id, slot))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_slot_holder(&self, node_id: &str, slot: u32) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT value FROM coordination_keys WHERE key = ? AND expires_at_ms > ?",
        )
        .bind(slot_key(node_id, slot))
        .bind(self.clock.now_ms())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn check_rate_limit(
        &self,
        org_id: &str,
        category: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitDecision> {
        let (start, reset_at_ms) = fixed_window(self.clock.now_ms(), window_secs);

        let row = sqlx::query(
            "INSERT INTO coordination_counters (key, count, expires_at_ms) VALUES (?, 1, ?)
             ON CONFLICT(key) DO UPDATE SET count = count + 1
             RETURNING count",
        )
        .bind(rate_key(org_id, category, start))
        .bind(reset_at_ms)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        Ok(RateLimitDecision::from_count(
            count.max(0) as u64,
            limit,
            reset_at_ms,
        ))
    }

    async fn push_replay_event(
        &self,
        sandbox_id: &str,
        seq: u64,
        event: &str,
        ttl_secs: u64,
    ) -> Result<()> {
        let expires_at_ms = self.deadline(ttl_secs);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO coordination_replay (sandbox_id, seq, event, expires_at_ms)
             VALUES (?, ?, ?, ?)",
        )
        .bind(sandbox_id)
        .bind(seq as i64)
        .bind(event)
        .bind(expires_at_ms)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE coordination_replay SET expires_at_ms = ? WHERE sandbox_id = ?")
            .bind(expires_at_ms)
            .bind(sandbox_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM coordination_replay WHERE sandbox_id = ?1 AND seq <= (
                 SELECT MAX(seq) - ?2 FROM coordination_replay WHERE sandbox_id = ?1
             )",
        )
        .bind(sandbox_id)
        .bind(LIVE_REPLAY_MAX_EVENTS as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_replay_events(
        &self,
        sandbox_id: &str,
        after_seq: u64,
    ) -> Result<Vec<LiveReplayEvent>> {
        let rows = sqlx::query(
            "SELECT seq, event FROM coordination_replay
             WHERE sandbox_id = ? AND seq > ? AND expires_at_ms > ?
             ORDER BY seq",
        )
        .bind(sandbox_id)
        .bind(after_seq as i64)
        .bind(self.clock.now_ms())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LiveReplayEvent {
                seq: row.get::<i64, _>("seq") as u64,
                event: row.get("event"),
            })
            .collect())
    }

    async fn delete_replay_events(&self, sandbox_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM coordination_replay WHERE sandbox_id = ?")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn acquire_leader_lock(
        &self,
        duty: &str,
        instance_id: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.set_if_free(&leader_key(duty), instance_id, ttl_secs, true)
            .await
    }

    async fn register_node_heartbeat(&self, node_id: &str, ttl_secs: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO coordination_keys (key, value, expires_at_ms) VALUES (?, '1', ?)
             ON CONFLICT(key) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
        )
        .bind(heartbeat_key(node_id))
        .bind(self.deadline(ttl_secs))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_node_heartbeat(&self, node_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS live FROM coordination_keys WHERE key = ? AND expires_at_ms > ?",
        )
        .bind(heartbeat_key(node_id))
        .bind(self.clock.now_ms())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut removed = 0u64;
        for table in [
            "coordination_keys",
            "coordination_counters",
            "coordination_replay",
        ] {
            let sql = format!("DELETE FROM {} WHERE expires_at_ms <= ?", table);
            removed += sqlx::query(&sql)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(removed as usize)
    }
}
