use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::chain::{RawLog, ORDER_FILLED_TOPIC, POSITIONS_MERGE_TOPIC, POSITION_SPLIT_TOPIC};
use crate::models::{PositionEvent, PositionKind, Side, Trade};

/// USDC and CTF outcome tokens both use 6 decimals on Polygon.
const TOKEN_DECIMALS: u32 = 6;

/// Polygon block time used when a timestamp must be estimated.
const SECONDS_PER_BLOCK: i64 = 2;

/// One 32-byte word as hex.
const WORD: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown event topic {0}")]
    UnknownTopic(String),

    #[error("expected at least {expected} topics, got {got}")]
    MissingTopics { expected: usize, got: usize },

    #[error("payload too short: {0} hex chars")]
    ShortData(usize),

    #[error("invalid hex in payload")]
    BadHex,

    #[error("amount does not fit a decimal")]
    AmountOverflow,

    #[error("log was removed by a reorg")]
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLog {
    Trade(Trade),
    Position(PositionEvent),
}

// ---------------------------------------------------------------------------
// Block timestamps
// ---------------------------------------------------------------------------

/// Maps block numbers to approximate wall-clock times from one or two known
/// (block, time) anchors. Between two anchors the time is interpolated
/// linearly; outside them it is extrapolated at the nominal block time.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockClock {
    lo: (u64, DateTime<Utc>),
    hi: Option<(u64, DateTime<Utc>)>,
}

impl BlockClock {
    pub fn anchored(block: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lo: (block, timestamp),
            hi: None,
        }
    }

    pub fn between(a: (u64, DateTime<Utc>), b: (u64, DateTime<Utc>)) -> Self {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        if lo.0 == hi.0 {
            return Self::anchored(lo.0, lo.1);
        }
        Self { lo, hi: Some(hi) }
    }

    /// No fetched timestamps: assume `head_block` was produced at `now`.
    pub fn estimated(head_block: u64, now: DateTime<Utc>) -> Self {
        Self::anchored(head_block, now)
    }

    pub fn timestamp_for(&self, block: u64) -> DateTime<Utc> {
        let (lo_block, lo_ts) = self.lo;
        match self.hi {
            Some((hi_block, hi_ts)) if block >= lo_block && block <= hi_block => {
                let span_ms = (hi_ts - lo_ts).num_milliseconds() as i128;
                let offset = (block - lo_block) as i128;
                let width = (hi_block - lo_block) as i128;
                lo_ts + Duration::milliseconds((span_ms * offset / width) as i64)
            }
            Some((hi_block, hi_ts)) if block > hi_block => extrapolate(hi_block, hi_ts, block),
            _ => extrapolate(lo_block, lo_ts, block),
        }
    }
}

fn extrapolate(anchor_block: u64, anchor_ts: DateTime<Utc>, block: u64) -> DateTime<Utc> {
    let delta = block as i64 - anchor_block as i64;
    anchor_ts + Duration::seconds(delta * SECONDS_PER_BLOCK)
}

// ---------------------------------------------------------------------------
// Log decoding
// ---------------------------------------------------------------------------

/// Decode any monitored log. Unknown topics are an error the caller skips.
pub fn decode_log(log: &RawLog, clock: &BlockClock) -> Result<DecodedLog, DecodeError> {
    if log.removed {
        return Err(DecodeError::Removed);
    }
    payload(log)?;
    let topic = log
        .topics
        .first()
        .map(|t| t.to_lowercase())
        .ok_or(DecodeError::MissingTopics { expected: 1, got: 0 })?;

    match topic.as_str() {
        ORDER_FILLED_TOPIC => {
            decode_order_filled(log, clock.timestamp_for(log.block_number)).map(DecodedLog::Trade)
        }
        POSITION_SPLIT_TOPIC => decode_position_event(log, PositionKind::Split).map(DecodedLog::Position),
        POSITIONS_MERGE_TOPIC => decode_position_event(log, PositionKind::Merge).map(DecodedLog::Position),
        other => Err(DecodeError::UnknownTopic(other.to_string())),
    }
}

/// Decode an `OrderFilled` log into a trade seen from the maker's side.
///
/// Topics: `[sig, orderHash, maker, taker]`.
/// Data: `makerAssetId, takerAssetId, makerAmountFilled, takerAmountFilled, fee`.
pub fn decode_order_filled(log: &RawLog, timestamp: DateTime<Utc>) -> Result<Trade, DecodeError> {
    if log.topics.len() < 4 {
        return Err(DecodeError::MissingTopics {
            expected: 4,
            got: log.topics.len(),
        });
    }

    let data_hex = payload(log)?;
    if data_hex.len() < 5 * WORD {
        return Err(DecodeError::ShortData(data_hex.len()));
    }

    let maker_asset_id = word(data_hex, 0)?;
    let taker_asset_id = word(data_hex, 1)?;
    let maker_amount = parse_uint256_decimal(word(data_hex, 2)?, TOKEN_DECIMALS)?;
    let taker_amount = parse_uint256_decimal(word(data_hex, 3)?, TOKEN_DECIMALS)?;
    let fee = parse_uint256_decimal(word(data_hex, 4)?, TOKEN_DECIMALS)?;

    let (side, asset_id, size, price) =
        determine_trade_params(maker_asset_id, taker_asset_id, maker_amount, taker_amount)?;

    Ok(Trade {
        tx_hash: log.transaction_hash.to_lowercase(),
        log_index: log.log_index,
        block_number: log.block_number,
        timestamp,
        contract: log.address.to_lowercase(),
        order_hash: log.topics[1].to_lowercase(),
        maker: extract_address(&log.topics[2])?,
        taker: extract_address(&log.topics[3])?,
        asset_id,
        side,
        price,
        size,
        fee,
        is_wash: false,
        wash_type: None,
        wash_confidence: 0.0,
    })
}

/// Decode a `PositionSplit` / `PositionsMerge` log.
///
/// Topics: `[sig, stakeholder, parentCollectionId, conditionId]`.
/// Data: `collateralToken, partition offset, amount, partition...`.
pub fn decode_position_event(log: &RawLog, kind: PositionKind) -> Result<PositionEvent, DecodeError> {
    if log.topics.len() < 4 {
        return Err(DecodeError::MissingTopics {
            expected: 4,
            got: log.topics.len(),
        });
    }

    let data_hex = payload(log)?;
    let amount = if data_hex.len() >= 3 * WORD {
        parse_uint256_decimal(word(data_hex, 2)?, TOKEN_DECIMALS)?
    } else {
        Decimal::ZERO
    };

    Ok(PositionEvent {
        kind,
        tx_hash: log.transaction_hash.to_lowercase(),
        log_index: log.log_index,
        block_number: log.block_number,
        stakeholder: extract_address(&log.topics[1])?,
        condition_id: log.topics[3].to_lowercase(),
        amount,
    })
}

/// The log payload without its `0x` prefix. Anything but ASCII hex is
/// rejected before any word is sliced out of it.
fn payload(log: &RawLog) -> Result<&str, DecodeError> {
    let data_hex = log.data.strip_prefix("0x").unwrap_or(&log.data);
    if !data_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::BadHex);
    }
    Ok(data_hex)
}

fn word(data_hex: &str, index: usize) -> Result<&str, DecodeError> {
    data_hex
        .get(index * WORD..(index + 1) * WORD)
        .ok_or(DecodeError::ShortData(data_hex.len()))
}

/// Extract a 20-byte address from a 32-byte zero-padded hex topic.
fn extract_address(topic: &str) -> Result<String, DecodeError> {
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::BadHex);
    }
    let addr = hex.get(hex.len().saturating_sub(40)..).ok_or(DecodeError::BadHex)?;
    Ok(format!("0x{addr}").to_lowercase())
}

/// Parse a 64-char hex uint256 into a Decimal with the given decimal places.
fn parse_uint256_decimal(hex: &str, decimals: u32) -> Result<Decimal, DecodeError> {
    let digits = hex.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(Decimal::ZERO);
    }
    if digits.len() > 32 {
        return Err(DecodeError::AmountOverflow);
    }
    let value = u128::from_str_radix(digits, 16).map_err(|_| DecodeError::BadHex)?;
    let value = i128::try_from(value).map_err(|_| DecodeError::AmountOverflow)?;
    Decimal::try_from_i128_with_scale(value, decimals).map_err(|_| DecodeError::AmountOverflow)
}

/// Side, asset, size and price from the maker's perspective.
///
/// The maker gives `makerAssetId` and receives `takerAssetId`. Asset id 0 is
/// the USDC leg, so a zero maker asset means the maker paid cash and bought
/// outcome tokens.
fn determine_trade_params(
    maker_asset_id_hex: &str,
    taker_asset_id_hex: &str,
    maker_amount: Decimal,
    taker_amount: Decimal,
) -> Result<(Side, String, Decimal, Decimal), DecodeError> {
    if is_zero_asset(maker_asset_id_hex) {
        let asset_id = format_asset_id(taker_asset_id_hex)?;
        let price = safe_divide(maker_amount, taker_amount);
        Ok((Side::Buy, asset_id, taker_amount, price))
    } else {
        let asset_id = format_asset_id(maker_asset_id_hex)?;
        let price = safe_divide(taker_amount, maker_amount);
        Ok((Side::Sell, asset_id, maker_amount, price))
    }
}

fn is_zero_asset(hex: &str) -> bool {
    hex.trim_start_matches('0').is_empty()
}

/// Convert a 64-char hex uint256 to its full decimal string representation.
/// ERC-1155 token ids overflow u128, so this works digit by digit.
fn format_asset_id(hex: &str) -> Result<String, DecodeError> {
    let hex = hex.trim_start_matches('0');
    if hex.is_empty() {
        return Ok("0".to_string());
    }

    if hex.len() <= 32 {
        return u128::from_str_radix(hex, 16)
            .map(|v| v.to_string())
            .map_err(|_| DecodeError::BadHex);
    }

    // Little-endian base-10 digits.
    let mut digits: Vec<u8> = vec![0];
    for ch in hex.chars() {
        let mut carry = ch.to_digit(16).ok_or(DecodeError::BadHex)?;
        for d in digits.iter_mut() {
            let val = *d as u32 * 16 + carry;
            *d = (val % 10) as u8;
            carry = val / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    Ok(digits.iter().rev().map(|d| (d + b'0') as char).collect())
}

/// Safe division that returns ZERO on divide-by-zero.
fn safe_divide(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ZERO_WORD: &str = "0000000000000000000000000000000000000000000000000000000000000000";
    const TOKEN_WORD: &str = "0000000000000000000000000000000000000000000000000000000000000064"; // 100

    fn pad(value: u128) -> String {
        format!("{value:064x}")
    }

    fn topic_addr(addr: &str) -> String {
        format!("0x000000000000000000000000{}", addr.trim_start_matches("0x"))
    }

    fn fill_log(maker_asset: &str, taker_asset: &str, maker_amt: u128, taker_amt: u128) -> RawLog {
        RawLog {
            address: "0x4BFB41D5B3570DEFD03C39A9A4D8DE6BD8B8982E".into(),
            topics: vec![
                ORDER_FILLED_TOPIC.into(),
                "0x01".into(),
                topic_addr("1111111111111111111111111111111111111111"),
                topic_addr("2222222222222222222222222222222222222222"),
            ],
            data: format!(
                "0x{maker_asset}{taker_asset}{}{}{}",
                pad(maker_amt),
                pad(taker_amt),
                pad(20_000)
            ),
            block_number: 500,
            transaction_hash: "0xABC".into(),
            log_index: 7,
            removed: false,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_extract_address() {
        let topic = "0x0000000000000000000000004bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";
        assert_eq!(extract_address(topic).unwrap(), "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e");
    }

    #[test]
    fn test_extract_address_short() {
        assert_eq!(extract_address("0xabcd").unwrap(), "0xabcd");
        assert_eq!(extract_address("0x00zz"), Err(DecodeError::BadHex));
    }

    #[test]
    fn test_decode_rejects_non_hex_payload() {
        let clock = BlockClock::anchored(500, ts(0));
        let mut log = fill_log(ZERO_WORD, TOKEN_WORD, 1, 1);

        log.data = format!("0x{}", "€".repeat(200));
        assert_eq!(decode_log(&log, &clock), Err(DecodeError::BadHex));
        assert_eq!(decode_order_filled(&log, ts(0)), Err(DecodeError::BadHex));

        log.data = format!("0x{}", "g".repeat(5 * WORD));
        assert_eq!(decode_log(&log, &clock), Err(DecodeError::BadHex));
    }

    #[test]
    fn test_decode_rejects_non_hex_address_topic() {
        let mut log = fill_log(ZERO_WORD, TOKEN_WORD, 1, 1);
        log.topics[3] = format!("0x{}", "ü".repeat(32));
        assert_eq!(decode_order_filled(&log, ts(0)), Err(DecodeError::BadHex));
    }

    #[test]
    fn test_parse_uint256_decimal() {
        let hex = "00000000000000000000000000000000000000000000000000000000000f4240";
        assert_eq!(parse_uint256_decimal(hex, 6).unwrap(), Decimal::from(1));
        assert_eq!(parse_uint256_decimal(ZERO_WORD, 6).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_parse_uint256_decimal_overflow() {
        let hex = "7581b394f5a4dd19ec46e4ff36baa3a841c9eeb80af0f0850be552c0fece2d87";
        assert_eq!(parse_uint256_decimal(hex, 6), Err(DecodeError::AmountOverflow));
    }

    #[test]
    fn test_format_asset_id_uint256() {
        let hex = "7581b394f5a4dd19ec46e4ff36baa3a841c9eeb80af0f0850be552c0fece2d87";
        assert_eq!(
            format_asset_id(hex).unwrap(),
            "53149765984136093709083310870325314268796238675098813080656099381431327665543"
        );
    }

    #[test]
    fn test_format_asset_id_small_and_zero() {
        assert_eq!(format_asset_id(TOKEN_WORD).unwrap(), "100");
        assert_eq!(format_asset_id(ZERO_WORD).unwrap(), "0");
    }

    #[test]
    fn test_decode_maker_buy() {
        // Maker pays 50 USDC for 100 tokens.
        let log = fill_log(ZERO_WORD, TOKEN_WORD, 50_000_000, 100_000_000);
        let trade = decode_order_filled(&log, ts(1_700_000_000)).unwrap();

        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.asset_id, "100");
        assert_eq!(trade.size, Decimal::from(100));
        assert_eq!(trade.price, Decimal::new(5, 1));
        assert_eq!(trade.fee, Decimal::new(2, 2));
        assert_eq!(trade.maker, "0x1111111111111111111111111111111111111111");
        assert_eq!(trade.taker, "0x2222222222222222222222222222222222222222");
        assert_eq!(trade.tx_hash, "0xabc");
        assert_eq!(trade.contract, "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e");
        assert!(!trade.is_wash);
    }

    #[test]
    fn test_decode_maker_sell() {
        // Maker gives 100 tokens for 30 USDC.
        let log = fill_log(TOKEN_WORD, ZERO_WORD, 100_000_000, 30_000_000);
        let trade = decode_order_filled(&log, ts(0)).unwrap();

        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.size, Decimal::from(100));
        assert_eq!(trade.price, Decimal::new(3, 1));
    }

    #[test]
    fn test_decode_zero_token_amount_has_zero_price() {
        let log = fill_log(ZERO_WORD, TOKEN_WORD, 50_000_000, 0);
        let trade = decode_order_filled(&log, ts(0)).unwrap();
        assert_eq!(trade.price, Decimal::ZERO);
        assert_eq!(trade.size, Decimal::ZERO);
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let mut log = fill_log(ZERO_WORD, TOKEN_WORD, 1, 1);
        log.data = "0x1234".into();
        assert_eq!(decode_order_filled(&log, ts(0)), Err(DecodeError::ShortData(4)));
    }

    #[test]
    fn test_decode_rejects_missing_topics() {
        let mut log = fill_log(ZERO_WORD, TOKEN_WORD, 1, 1);
        log.topics.truncate(2);
        assert!(matches!(
            decode_order_filled(&log, ts(0)),
            Err(DecodeError::MissingTopics { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn test_decode_log_dispatches_positions() {
        let log = RawLog {
            address: crate::chain::CONDITIONAL_TOKENS.into(),
            topics: vec![
                POSITION_SPLIT_TOPIC.into(),
                topic_addr("3333333333333333333333333333333333333333"),
                format!("0x{ZERO_WORD}"),
                "0xCONDITION".into(),
            ],
            data: format!("0x{}{}{}", pad(1), pad(96), pad(5_000_000)),
            block_number: 10,
            transaction_hash: "0xtx".into(),
            log_index: 1,
            removed: false,
        };
        let clock = BlockClock::anchored(10, ts(0));

        match decode_log(&log, &clock).unwrap() {
            DecodedLog::Position(p) => {
                assert_eq!(p.kind, PositionKind::Split);
                assert_eq!(p.stakeholder, "0x3333333333333333333333333333333333333333");
                assert_eq!(p.condition_id, "0xcondition");
                assert_eq!(p.amount, Decimal::from(5));
            }
            other => panic!("expected position event, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_log_rejects_unknown_and_removed() {
        let clock = BlockClock::anchored(0, ts(0));
        let mut log = fill_log(ZERO_WORD, TOKEN_WORD, 1, 1);
        log.removed = true;
        assert_eq!(decode_log(&log, &clock), Err(DecodeError::Removed));

        log.removed = false;
        log.topics[0] = "0xfeed".into();
        assert!(matches!(decode_log(&log, &clock), Err(DecodeError::UnknownTopic(_))));
    }

    #[test]
    fn test_block_clock_interpolates_between_anchors() {
        let clock = BlockClock::between((100, ts(1_000)), (110, ts(1_020)));
        assert_eq!(clock.timestamp_for(100), ts(1_000));
        assert_eq!(clock.timestamp_for(105), ts(1_010));
        assert_eq!(clock.timestamp_for(110), ts(1_020));
    }

    #[test]
    fn test_block_clock_extrapolates_outside_anchors() {
        let clock = BlockClock::between((110, ts(1_020)), (100, ts(1_000)));
        assert_eq!(clock.timestamp_for(112), ts(1_024));
        assert_eq!(clock.timestamp_for(99), ts(998));

        let estimated = BlockClock::estimated(200, ts(10_000));
        assert_eq!(estimated.timestamp_for(190), ts(9_980));
    }
}
