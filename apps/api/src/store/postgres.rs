use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{
    Candidate, GenerationJob, GridId, GridRecord, QuotaEntry, ReferenceImage, ReferenceSlot,
    UserId, UserSettings,
};
use crate::store::{GridStore, QuotaStore, ReferenceStore, SettingsStore};

/// PostgreSQL-backed store. Tables are created by `db::ensure_schema`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct GridRow {
    grid_id: Uuid,
    job: Json<GenerationJob>,
    candidates: Json<Vec<Candidate>>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<GridRow> for GridRecord {
    fn from(row: GridRow) -> Self {
        GridRecord {
            grid_id: GridId(row.grid_id),
            job: row.job.0,
            candidates: row.candidates.0,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ReferenceRow {
    slot: i16,
    mime_type: String,
    image_data: String,
    filename: Option<String>,
    updated_at: DateTime<Utc>,
}

impl ReferenceRow {
    fn into_slot(self, user_id: UserId) -> Result<ReferenceSlot> {
        Ok(ReferenceSlot {
            user_id,
            slot: u8::try_from(self.slot).context("reference slot out of range")?,
            image: ReferenceImage {
                mime_type: self.mime_type,
                data: self.image_data,
            },
            filename: self.filename,
            updated_at: self.updated_at,
        })
    }
}

/// Discord snowflakes fit in 63 bits; Postgres has no unsigned BIGINT.
fn user_key(user_id: UserId) -> Result<i64> {
    i64::try_from(user_id.0).with_context(|| format!("user id {user_id} does not fit in BIGINT"))
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn load_quota(&self, user_id: UserId, day: NaiveDate) -> Result<Option<QuotaEntry>> {
        let count: Option<i32> =
            sqlx::query_scalar("SELECT count FROM daily_usage WHERE user_id = $1 AND day = $2")
                .bind(user_key(user_id)?)
                .bind(day)
                .fetch_optional(&self.pool)
                .await?;

        Ok(count.map(|count| QuotaEntry {
            user_id,
            day,
            count: count.max(0) as u32,
        }))
    }

    async fn save_quota(&self, entry: &QuotaEntry) -> Result<()> {
        let count = i32::try_from(entry.count).context("quota count overflow")?;
        sqlx::query(
            r#"
            INSERT INTO daily_usage (user_id, day, count)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, day)
            DO UPDATE SET count = GREATEST(daily_usage.count, EXCLUDED.count)
            "#,
        )
        .bind(user_key(entry.user_id)?)
        .bind(entry.day)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GridStore for PgStore {
    async fn load_grid(&self, grid_id: GridId) -> Result<Option<GridRecord>> {
        let row = sqlx::query_as::<_, GridRow>(
            "SELECT grid_id, job, candidates, created_at, expires_at FROM grids WHERE grid_id = $1",
        )
        .bind(grid_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(GridRecord::from))
    }

    async fn save_grid(&self, record: &GridRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO grids (grid_id, job_id, user_id, job, candidates, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (grid_id) DO NOTHING
            "#,
        )
        .bind(record.grid_id.0)
        .bind(record.job.id.0)
        .bind(user_key(record.job.user_id)?)
        .bind(Json(&record.job))
        .bind(Json(&record.candidates))
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<GridRecord>> {
        let rows = sqlx::query_as::<_, GridRow>(
            r#"
            DELETE FROM grids
            WHERE expires_at <= $1
            RETURNING grid_id, job, candidates, created_at, expires_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(GridRecord::from).collect())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn load_settings(&self, user_id: UserId) -> Result<Option<UserSettings>> {
        let settings: Option<Json<UserSettings>> =
            sqlx::query_scalar("SELECT settings FROM user_settings WHERE user_id = $1")
                .bind(user_key(user_id)?)
                .fetch_optional(&self.pool)
                .await?;

        Ok(settings.map(|s| s.0))
    }

    async fn save_settings(&self, settings: &UserSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (user_id, settings, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET settings = EXCLUDED.settings, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(user_key(settings.user_id)?)
        .bind(Json(settings))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for PgStore {
    async fn list_references(&self, user_id: UserId) -> Result<Vec<ReferenceSlot>> {
        let rows = sqlx::query_as::<_, ReferenceRow>(
            r#"
            SELECT slot, mime_type, image_data, filename, updated_at
            FROM user_references
            WHERE user_id = $1
            ORDER BY slot
            "#,
        )
        .bind(user_key(user_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| row.into_slot(user_id)).collect()
    }

    async fn save_reference(&self, reference: &ReferenceSlot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_references (user_id, slot, mime_type, image_data, filename, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, slot)
            DO UPDATE SET
                mime_type = EXCLUDED.mime_type,
                image_data = EXCLUDED.image_data,
                filename = EXCLUDED.filename,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(user_key(reference.user_id)?)
        .bind(i16::from(reference.slot))
        .bind(&reference.image.mime_type)
        .bind(&reference.image.data)
        .bind(&reference.filename)
        .bind(reference.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_reference(&self, user_id: UserId, slot: u8) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_references WHERE user_id = $1 AND slot = $2")
            .bind(user_key(user_id)?)
            .bind(i16::from(slot))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_references(&self, user_id: UserId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_references WHERE user_id = $1")
            .bind(user_key(user_id)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
