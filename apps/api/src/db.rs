use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Creates and returns a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Creates the quota, grid and user profile tables if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_usage (
            user_id BIGINT NOT NULL,
            day DATE NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, day)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS grids (
            grid_id UUID PRIMARY KEY,
            job_id UUID NOT NULL,
            user_id BIGINT NOT NULL,
            job JSONB NOT NULL,
            candidates JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS grids_expires_at_idx ON grids (expires_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_settings (
            user_id BIGINT PRIMARY KEY,
            settings JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_references (
            user_id BIGINT NOT NULL,
            slot SMALLINT NOT NULL CHECK (slot BETWEEN 1 AND 5),
            mime_type TEXT NOT NULL,
            image_data TEXT NOT NULL,
            filename TEXT,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (user_id, slot)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Database schema ready");
    Ok(())
}
