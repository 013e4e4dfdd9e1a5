//! Market data types and wire-format parsing.

use std::collections::BTreeMap;

use chrono::DateTime;
use folio::{PricePoint, Symbol, Timestamp};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Fetched prices, one time-ordered series per symbol.
pub type PriceData = BTreeMap<Symbol, Vec<PricePoint>>;

/// Current holding of one asset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: f64,
}

/// Lists arrive either bare or wrapped in a `data` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse<T> {
    Bare(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> ListResponse<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(v) | Self::Wrapped { data: v } => v,
        }
    }
}

/// Numbers are sent either as JSON numbers or decimal strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Number(f64),
    Text(String),
}

impl WireNumber {
    fn value(&self) -> Result<f64, TransportError> {
        match self {
            Self::Number(v) => Ok(*v),
            Self::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| TransportError::Decode(format!("not a number: {s:?}"))),
        }
    }
}

/// Epoch milliseconds or an RFC 3339 string.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Rfc3339(String),
}

impl WireTimestamp {
    fn millis(&self) -> Result<Timestamp, TransportError> {
        match self {
            Self::Millis(ms) => Ok(*ms),
            Self::Rfc3339(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| TransportError::Decode(format!("bad timestamp {s:?}: {e}"))),
        }
    }
}

#[derive(Deserialize)]
struct PriceRow {
    symbol: String,
    price: WireNumber,
    timestamp: WireTimestamp,
}

#[derive(Deserialize)]
struct PositionRow {
    symbol: String,
    quantity: WireNumber,
}

/// Parse a price response, keeping only `assets`.
///
/// Series come back sorted by timestamp. Rows for symbols that were not
/// requested are dropped.
pub fn parse_prices(body: &[u8], assets: &[Symbol]) -> Result<PriceData, TransportError> {
    let rows = serde_json::from_slice::<ListResponse<PriceRow>>(body)?.into_vec();

    let mut data: PriceData = assets.iter().map(|s| (*s, Vec::new())).collect();
    for row in rows {
        // Matched by text so unrequested symbols never need to fit a `Symbol`.
        let Some((&symbol, series)) = data.iter_mut().find(|(s, _)| s.as_str() == row.symbol)
        else {
            debug!("ignoring price for unrequested symbol {:?}", row.symbol);
            continue;
        };
        let price = row.price.value()?;
        let ts = row.timestamp.millis()?;
        let point = PricePoint::new(ts, symbol, price)
            .ok_or_else(|| TransportError::Decode(format!("invalid price {price} for {symbol}")))?;
        series.push(point);
    }

    for series in data.values_mut() {
        series.sort_by_key(PricePoint::timestamp);
    }
    Ok(data)
}

/// Parse a positions response.
///
/// Holdings whose symbol cannot be represented as a [`Symbol`] are skipped.
pub fn parse_positions(body: &[u8]) -> Result<Vec<Position>, TransportError> {
    let rows = serde_json::from_slice::<ListResponse<PositionRow>>(body)?.into_vec();

    let mut positions = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(symbol) = Symbol::try_new(&row.symbol) else {
            debug!("skipping position with unsupported symbol {:?}", row.symbol);
            continue;
        };
        let quantity = row.quantity.value()?;
        if !quantity.is_finite() {
            return Err(TransportError::Decode(format!(
                "non-finite quantity for {symbol}"
            )));
        }
        positions.push(Position { symbol, quantity });
    }
    Ok(positions)
}
