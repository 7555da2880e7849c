use crate::storage::bars::TargetTable;
use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

// Advisory locks belong to the session that took them, so the lock keeps its
// own pooled connection until release.
const LOCK_NAMESPACE: i64 = 0x454F_4453_594E; // "EODSYN"

/// Stable per-table key (FNV-1a over the lowercased name).
pub fn lock_key_for_table(table: &TargetTable) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in table.as_str().to_ascii_lowercase().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    LOCK_NAMESPACE ^ (hash as i64)
}

/// Held for the whole run so two schedules never load the same table at once.
pub struct RunLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl RunLock {
    /// `None` when another session already holds the lock for `table`.
    pub async fn try_acquire(pool: &sqlx::PgPool, table: &TargetTable) -> anyhow::Result<Option<Self>> {
        let key = lock_key_for_table(table);
        let mut conn = pool
            .acquire()
            .await
            .context("failed to acquire connection for run lock")?;

        let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

        Ok(acquired.0.then_some(Self { conn, key }))
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        let key = self.key;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(key)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={key})"))?;
        Ok(())
    }
}
