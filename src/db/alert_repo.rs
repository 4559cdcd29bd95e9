use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::Alert;

/// Insert an alert unless its id is already stored. Trade copies are
/// persisted as their identity keys only.
pub async fn insert_if_absent(pool: &PgPool, alert: &Alert) -> anyhow::Result<bool> {
    let trade_keys: Vec<String> = alert.trades.iter().map(|t| t.key().to_string()).collect();

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        INSERT INTO alerts (
            alert_id, raised_at, alert_type, severity, tx_hash, asset_id,
            trade_count, volume, confidence, addresses, trade_keys, details
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (alert_id) DO NOTHING
        RETURNING alert_id
        "#,
    )
    .bind(&alert.alert_id)
    .bind(alert.timestamp)
    .bind(alert.alert_type.as_str())
    .bind(alert.severity.as_str())
    .bind(&alert.tx_hash)
    .bind(&alert.asset_id)
    .bind(alert.trade_count as i32)
    .bind(alert.volume)
    .bind(alert.confidence)
    .bind(&alert.addresses)
    .bind(&trade_keys)
    .bind(Json(&alert.details))
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}
