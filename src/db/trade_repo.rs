use sqlx::PgPool;

use crate::models::Trade;

/// Insert a trade unless its (tx_hash, log_index) is already stored.
/// Returns whether a row was written.
pub async fn insert_if_absent(pool: &PgPool, trade: &Trade) -> anyhow::Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        INSERT INTO trades (
            tx_hash, log_index, block_number, traded_at, contract, order_hash,
            maker, taker, asset_id, side, price, size, fee,
            is_wash, wash_type, wash_confidence
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (tx_hash, log_index) DO NOTHING
        RETURNING tx_hash
        "#,
    )
    .bind(&trade.tx_hash)
    .bind(trade.log_index as i64)
    .bind(trade.block_number as i64)
    .bind(trade.timestamp)
    .bind(&trade.contract)
    .bind(&trade.order_hash)
    .bind(&trade.maker)
    .bind(&trade.taker)
    .bind(&trade.asset_id)
    .bind(trade.side.as_str())
    .bind(trade.price)
    .bind(trade.size)
    .bind(trade.fee)
    .bind(trade.is_wash)
    .bind(trade.wash_type.map(|w| w.as_str()))
    .bind(trade.wash_confidence)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}
