// Repository layer for database operations

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::{Arc, Mutex};

use spindle_core::traits::CursorStore;
use spindle_core::{nsid, StatusEvent};

use crate::models::*;

/// Hands out strictly-increasing unix-nano timestamps. Wall-clock reads can
/// repeat within a tick; event ordering must not.
#[derive(Clone, Default)]
struct MonotonicClock {
    last: Arc<Mutex<i64>>,
}

impl MonotonicClock {
    fn now_nanos(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last.lock().expect("clock lock poisoned");
        *last = now.max(*last + 1);
        *last
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    clock: MonotonicClock,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: MonotonicClock::default(),
        }
    }

    /// Open (creating if missing) the database file and run migrations
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to open database")?;
        sqlx::migrate!()
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        Ok(Self::new(pool))
    }

    /// In-memory database for tests
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!().run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============================================
    // Status events
    // ============================================

    /// Append a workflow status event. Returns the row's `created` nanos,
    /// which doubles as the subscriber cursor value.
    pub async fn add_status_event(&self, event: &StatusEvent) -> Result<i64> {
        let rkey = uuid::Uuid::now_v7().to_string();
        let created = self.clock.now_nanos();
        let payload = serde_json::to_string(event)?;

        sqlx::query("INSERT INTO events (rkey, nsid, event, created) VALUES ($1, $2, $3, $4)")
            .bind(&rkey)
            .bind(nsid::PIPELINE_STATUS)
            .bind(&payload)
            .bind(created)
            .execute(&self.pool)
            .await?;

        Ok(created)
    }

    /// Events past `cursor`, oldest first, capped at 100 per query.
    /// Subscribers page by passing the last row's `created` back in.
    pub async fn get_events(&self, cursor: i64) -> Result<Vec<EventRow>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, rkey, nsid, event, created
            FROM events
            WHERE created > $1
            ORDER BY created ASC
            LIMIT 100
            "#,
        )
        .bind(cursor)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ============================================
    // Cursors
    // ============================================

    pub async fn get_cursor(&self, source: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT cursor FROM cursors WHERE source = $1")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(cursor,)| cursor))
    }

    pub async fn set_cursor(&self, source: &str, cursor: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (source, cursor) VALUES ($1, $2)
            ON CONFLICT (source) DO UPDATE SET cursor = excluded.cursor
            "#,
        )
        .bind(source)
        .bind(cursor)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============================================
    // Knots
    // ============================================

    pub async fn add_knot(&self, hostname: &str, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO knots (hostname, owner, registered) VALUES ($1, $2, $3)
            ON CONFLICT (hostname) DO NOTHING
            "#,
        )
        .bind(hostname)
        .bind(owner)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_knots(&self) -> Result<Vec<KnotRow>> {
        let rows = sqlx::query_as::<_, KnotRow>(
            "SELECT hostname, owner, registered FROM knots ORDER BY hostname ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn knot_owner(&self, hostname: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT owner FROM knots WHERE hostname = $1")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(owner,)| owner).filter(|o| !o.is_empty()))
    }

    pub async fn add_knot_member(&self, knot: &str, did: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO knot_members (knot, did) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(knot)
        .bind(did)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_knot_member(&self, knot: &str, did: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM knot_members WHERE knot = $1 AND did = $2")
                .bind(knot)
                .bind(did)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    // ============================================
    // Repos
    // ============================================

    pub async fn upsert_repo(&self, repo: &RepoRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repos (at_uri, did, name, knot) VALUES ($1, $2, $3, $4)
            ON CONFLICT (at_uri) DO UPDATE SET did = excluded.did, name = excluded.name, knot = excluded.knot
            "#,
        )
        .bind(&repo.at_uri)
        .bind(&repo.did)
        .bind(&repo.name)
        .bind(&repo.knot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_repo(&self, at_uri: &str) -> Result<Option<RepoRow>> {
        let row = sqlx::query_as::<_, RepoRow>(
            "SELECT at_uri, did, name, knot FROM repos WHERE at_uri = $1",
        )
        .bind(at_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    // ============================================
    // Known DIDs
    // ============================================

    pub async fn add_known_did(&self, did: &str) -> Result<()> {
        sqlx::query("INSERT INTO known_dids (did) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(did)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn remove_known_did(&self, did: &str) -> Result<()> {
        sqlx::query("DELETE FROM known_dids WHERE did = $1")
            .bind(did)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn is_known_did(&self, did: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM known_dids WHERE did = $1")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    // ============================================
    // Spindle members
    // ============================================

    pub async fn add_member(&self, did: &str, added_by: &str, rkey: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO spindle_members (did, added_by, rkey, created_at) VALUES ($1, $2, $3, $4)
            ON CONFLICT (did) DO UPDATE SET added_by = excluded.added_by, rkey = excluded.rkey
            "#,
        )
        .bind(did)
        .bind(added_by)
        .bind(rkey)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        // Members are identities we accept records from
        sqlx::query("INSERT INTO known_dids (did) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(did)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn remove_member_by_rkey(&self, rkey: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM spindle_members WHERE rkey = $1")
            .bind(rkey)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn is_member(&self, did: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM spindle_members WHERE did = $1")
            .bind(did)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    pub async fn list_members(&self) -> Result<Vec<MemberRow>> {
        let rows = sqlx::query_as::<_, MemberRow>(
            "SELECT did, added_by, rkey, created_at FROM spindle_members ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl CursorStore for Database {
    async fn get(&self, source: &str) -> Result<Option<i64>> {
        self.get_cursor(source).await
    }

    async fn set(&self, source: &str, cursor: i64) -> Result<()> {
        self.set_cursor(source, cursor).await
    }
}
