//! Bounded rolling price history.
//!
//! Each symbol keeps an ordered series of [`PricePoint`]s. Once a series is
//! at capacity, appending evicts the oldest point (FIFO by time, never by
//! value). Points whose timestamp is not newer than the series tail are
//! ignored, so re-applying an overlapping fetch is idempotent.
//!
//! The optimizer never reads the history directly: [`PriceHistory::window`]
//! copies the most recent aligned observations into an owned [`PriceWindow`].

use std::collections::{BTreeMap, VecDeque};

use crate::error::OptimizationError;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::types::{Symbol, Timestamp};

/// Default history depth per symbol: two days of one-minute bars.
pub const DEFAULT_HISTORY_LIMIT: usize = 2 * 60 * 24;

/// A single observed price. Immutable once constructed.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PricePoint {
    timestamp: Timestamp,
    symbol: Symbol,
    price: f64,
}

impl PricePoint {
    /// Returns `None` unless `price` is finite and strictly positive.
    pub fn new(timestamp: Timestamp, symbol: Symbol, price: f64) -> Option<Self> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        Some(Self {
            timestamp,
            symbol,
            price,
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    pub fn price(&self) -> f64 {
        self.price
    }
}

/// Per-symbol, capacity-bounded price series.
#[derive(Clone, Debug)]
pub struct PriceHistory {
    capacity: usize,
    series: BTreeMap<Symbol, VecDeque<PricePoint>>,
}

impl PriceHistory {
    /// Create an empty history holding at most `capacity` points per symbol.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the per-symbol capacity, evicting the oldest points if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for points in self.series.values_mut() {
            while points.len() > self.capacity {
                points.pop_front();
            }
        }
    }

    /// Number of points held for `symbol`.
    pub fn len(&self, symbol: &Symbol) -> usize {
        self.series.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(VecDeque::is_empty)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.series.keys()
    }

    /// Points for `symbol`, oldest first.
    pub fn series(&self, symbol: &Symbol) -> impl Iterator<Item = &PricePoint> {
        self.series.get(symbol).into_iter().flatten()
    }

    /// Most recent point for `symbol`.
    pub fn latest(&self, symbol: &Symbol) -> Option<&PricePoint> {
        self.series.get(symbol).and_then(VecDeque::back)
    }

    /// Append one point. Returns `false` if it was not newer than the tail.
    pub fn append(&mut self, point: PricePoint) -> bool {
        let points = self.series.entry(point.symbol).or_default();
        if let Some(last) = points.back() {
            if point.timestamp <= last.timestamp {
                return false;
            }
        }
        points.push_back(point);
        while points.len() > self.capacity {
            points.pop_front();
        }
        true
    }

    /// Append every point in order. Returns how many were recorded.
    pub fn extend<I: IntoIterator<Item = PricePoint>>(&mut self, points: I) -> usize {
        points
            .into_iter()
            .filter(|p| self.append(*p))
            .count()
    }

    /// Drop series for symbols not in `keep` (after an asset-set reload).
    pub fn retain_symbols(&mut self, keep: &[Symbol]) {
        self.series.retain(|sym, _| keep.contains(sym));
    }

    /// Copy out the most recent `periods` observations whose timestamps are
    /// present for every asset, aligned row by row.
    pub fn window(
        &self,
        assets: &[Symbol],
        periods: usize,
    ) -> Result<PriceWindow, OptimizationError> {
        if assets.is_empty() {
            return Err(OptimizationError::InvalidInput("no assets".into()));
        }

        let mut shortest: Option<&VecDeque<PricePoint>> = None;
        for sym in assets {
            let Some(points) = self.series.get(sym) else {
                return Err(OptimizationError::InsufficientData {
                    available: 0,
                    required: periods,
                });
            };
            if shortest.is_none_or(|s| points.len() < s.len()) {
                shortest = Some(points);
            }
        }
        let shortest = shortest.map(|s| s.iter()).into_iter().flatten();

        // Timestamps present in every series, oldest first.
        let common: Vec<Timestamp> = shortest
            .map(|p| p.timestamp)
            .filter(|ts| {
                assets.iter().all(|sym| {
                    self.series[sym]
                        .binary_search_by_key(ts, |p| p.timestamp)
                        .is_ok()
                })
            })
            .collect();

        if common.len() < periods || periods == 0 {
            return Err(OptimizationError::InsufficientData {
                available: common.len(),
                required: periods,
            });
        }

        let timestamps = common[common.len() - periods..].to_vec();
        let rows = timestamps
            .iter()
            .map(|ts| {
                assets
                    .iter()
                    .map(|sym| {
                        let points = &self.series[sym];
                        // Present by construction of `common`.
                        points
                            .binary_search_by_key(ts, |p| p.timestamp)
                            .map(|i| points[i].price)
                            .unwrap_or(f64::NAN)
                    })
                    .collect()
            })
            .collect();

        Ok(PriceWindow {
            assets: assets.to_vec(),
            timestamps,
            prices: rows,
        })
    }
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

/// Aligned price matrix copied out of a [`PriceHistory`].
///
/// `prices[t][j]` is the price of `assets[j]` at `timestamps[t]`.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceWindow {
    assets: Vec<Symbol>,
    timestamps: Vec<Timestamp>,
    prices: Vec<Vec<f64>>,
}

impl PriceWindow {
    /// Build a window from explicit rows (one row per timestamp).
    pub fn from_rows(
        assets: Vec<Symbol>,
        timestamps: Vec<Timestamp>,
        prices: Vec<Vec<f64>>,
    ) -> Result<Self, OptimizationError> {
        if assets.is_empty() {
            return Err(OptimizationError::InvalidInput("no assets".into()));
        }
        if timestamps.len() != prices.len() {
            return Err(OptimizationError::InvalidInput(format!(
                "{} timestamps for {} rows",
                timestamps.len(),
                prices.len()
            )));
        }
        for row in &prices {
            if row.len() != assets.len() {
                return Err(OptimizationError::InvalidInput(format!(
                    "row has {} prices for {} assets",
                    row.len(),
                    assets.len()
                )));
            }
            if row.iter().any(|p| !p.is_finite() || *p <= 0.0) {
                return Err(OptimizationError::InvalidInput(
                    "prices must be finite and positive".into(),
                ));
            }
        }
        Ok(Self {
            assets,
            timestamps,
            prices,
        })
    }

    pub fn assets(&self) -> &[Symbol] {
        &self.assets
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn prices(&self) -> &[Vec<f64>] {
        &self.prices
    }

    /// Number of observations (rows).
    pub fn periods(&self) -> usize {
        self.timestamps.len()
    }

    /// Simple returns, one row per consecutive pair of observations.
    pub fn returns(&self) -> Vec<Vec<f64>> {
        self.prices
            .windows(2)
            .map(|pair| {
                pair[0]
                    .iter()
                    .zip(&pair[1])
                    .map(|(prev, next)| next / prev - 1.0)
                    .collect()
            })
            .collect()
    }

    /// Fingerprint over assets, timestamps and exact price bits.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut fp = FingerprintBuilder::new();
        fp.count(self.assets.len());
        for sym in &self.assets {
            fp.symbol(sym);
        }
        fp.count(self.timestamps.len());
        for (ts, row) in self.timestamps.iter().zip(&self.prices) {
            fp.timestamp(*ts);
            for price in row {
                fp.value(*price);
            }
        }
        fp.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Symbol {
        Symbol::new("BTC")
    }
    fn eth() -> Symbol {
        Symbol::new("ETH")
    }

    fn pt(ts: Timestamp, sym: Symbol, price: f64) -> PricePoint {
        PricePoint::new(ts, sym, price).unwrap()
    }

    #[test]
    fn price_point_rejects_bad_prices() {
        assert!(PricePoint::new(0, btc(), 0.0).is_none());
        assert!(PricePoint::new(0, btc(), -1.0).is_none());
        assert!(PricePoint::new(0, btc(), f64::NAN).is_none());
        assert!(PricePoint::new(0, btc(), f64::INFINITY).is_none());
    }

    #[test]
    fn evicts_oldest_first() {
        let mut history = PriceHistory::new(3);
        for i in 0..5 {
            history.append(pt(i, btc(), 100.0 + i as f64));
        }
        let ts: Vec<_> = history.series(&btc()).map(|p| p.timestamp()).collect();
        assert_eq!(ts, vec![2, 3, 4]);
    }

    #[test]
    fn stale_points_are_ignored() {
        let mut history = PriceHistory::new(10);
        assert!(history.append(pt(5, btc(), 100.0)));
        assert!(!history.append(pt(5, btc(), 101.0)));
        assert!(!history.append(pt(4, btc(), 99.0)));
        assert_eq!(history.len(&btc()), 1);
        assert_eq!(history.latest(&btc()).unwrap().price(), 100.0);
    }

    #[test]
    fn extend_counts_recorded_points() {
        let mut history = PriceHistory::new(10);
        let first = vec![pt(1, btc(), 1.0), pt(2, btc(), 2.0)];
        assert_eq!(history.extend(first.clone()), 2);
        // Overlapping re-fetch only adds the new bar.
        let second = vec![pt(2, btc(), 2.0), pt(3, btc(), 3.0)];
        assert_eq!(history.extend(second), 1);
    }

    #[test]
    fn shrinking_capacity_evicts() {
        let mut history = PriceHistory::new(5);
        history.extend((0..5).map(|i| pt(i, btc(), 1.0)));
        history.set_capacity(2);
        assert_eq!(history.len(&btc()), 2);
        assert_eq!(history.series(&btc()).next().unwrap().timestamp(), 3);
    }

    #[test]
    fn window_aligns_on_common_timestamps() {
        let mut history = PriceHistory::new(100);
        history.extend((0..6).map(|i| pt(i, btc(), 100.0 + i as f64)));
        // ETH is missing timestamp 2.
        history.extend(
            [0, 1, 3, 4, 5]
                .iter()
                .map(|&i| pt(i, eth(), 10.0 + i as f64)),
        );

        let window = history.window(&[btc(), eth()], 4).unwrap();
        assert_eq!(window.timestamps(), &[1, 3, 4, 5]);
        assert_eq!(window.prices()[0], vec![101.0, 11.0]);
        assert_eq!(window.prices()[1], vec![103.0, 13.0]);
    }

    #[test]
    fn window_reports_insufficient_data() {
        let mut history = PriceHistory::new(100);
        history.extend((0..3).map(|i| pt(i, btc(), 1.0 + i as f64)));
        let err = history.window(&[btc()], 10).unwrap_err();
        assert_eq!(
            err,
            OptimizationError::InsufficientData {
                available: 3,
                required: 10
            }
        );

        let err = history.window(&[btc(), eth()], 2).unwrap_err();
        assert!(matches!(err, OptimizationError::InsufficientData { available: 0, .. }));
    }

    #[test]
    fn returns_are_simple_returns() {
        let window = PriceWindow::from_rows(
            vec![btc()],
            vec![0, 1, 2],
            vec![vec![100.0], vec![110.0], vec![99.0]],
        )
        .unwrap();
        let r = window.returns();
        assert_eq!(r.len(), 2);
        assert!((r[0][0] - 0.10).abs() < 1e-12);
        assert!((r[1][0] + 0.10).abs() < 1e-12);
    }

    #[test]
    fn fingerprint_tracks_data() {
        let a = PriceWindow::from_rows(vec![btc()], vec![0, 1], vec![vec![1.0], vec![2.0]])
            .unwrap();
        let b = PriceWindow::from_rows(vec![btc()], vec![0, 1], vec![vec![1.0], vec![2.0]])
            .unwrap();
        let c = PriceWindow::from_rows(vec![btc()], vec![0, 1], vec![vec![1.0], vec![2.5]])
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn from_rows_validates_shape() {
        assert!(PriceWindow::from_rows(vec![btc()], vec![0], vec![vec![1.0, 2.0]]).is_err());
        assert!(PriceWindow::from_rows(vec![btc()], vec![0, 1], vec![vec![1.0]]).is_err());
        assert!(PriceWindow::from_rows(vec![btc()], vec![0], vec![vec![-1.0]]).is_err());
    }
}
