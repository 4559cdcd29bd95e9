pub mod alert_repo;
pub mod trade_repo;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::models::{Alert, Trade};
use crate::services::persistence::PersistenceSink;

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// True when the database answers a trivial query.
pub async fn ping(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

/// Postgres-backed persistence sink.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceSink for PgSink {
    async fn append_trade_if_absent(&self, trade: &Trade) -> anyhow::Result<bool> {
        trade_repo::insert_if_absent(&self.pool, trade).await
    }

    async fn append_alert_if_absent(&self, alert: &Alert) -> anyhow::Result<bool> {
        alert_repo::insert_if_absent(&self.pool, alert).await
    }
}
