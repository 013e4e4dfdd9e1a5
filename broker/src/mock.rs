//! Mock API for testing and offline mode: implements [`MarketApi`] with
//! scripted behavior.
//!
//! ```
//! use folio_broker::{MockApi, TransportError};
//!
//! let api = MockApi::builder()
//!     .synthetic(7)
//!     .fail_prices(2, TransportError::Timeout)
//!     .build();
//! assert_eq!(api.price_calls(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use folio::{PricePoint, Symbol, Timestamp};
use tokio::sync::Semaphore;

use crate::error::TransportError;
use crate::types::{PriceData, Position};
use crate::MarketApi;

/// Bar spacing of the synthetic market (5 minutes).
pub const SYNTHETIC_BAR_MS: i64 = 300_000;

/// Deterministic price generator. The price of a symbol at a bar index
/// depends only on the seed, the symbol and the index.
#[derive(Clone, Debug)]
pub struct SyntheticMarket {
    seed: u64,
    bars: usize,
    start_ms: Timestamp,
}

impl SyntheticMarket {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            bars: 64,
            start_ms: 1_700_000_000_000,
        }
    }

    /// Number of bars returned per fetch.
    pub fn with_bars(mut self, bars: usize) -> Self {
        self.bars = bars.max(1);
        self
    }

    pub fn price_at(&self, symbol: &Symbol, bar: u64) -> f64 {
        let h = fnv1a(symbol.as_str());
        let base = 10.0 + (h % 990) as f64;
        let drift = 1e-4 * (1 + h % 5) as f64;
        base * (1.0 + drift * bar as f64) * (1.0 + 0.01 * self.noise(h, bar))
    }

    /// The `bars` most recent points ending at bar `last`.
    pub fn series(&self, symbol: &Symbol, last: u64) -> Vec<PricePoint> {
        let first = (last + 1).saturating_sub(self.bars as u64);
        (first..=last)
            .filter_map(|bar| {
                let ts = self.start_ms + bar as i64 * SYNTHETIC_BAR_MS;
                PricePoint::new(ts, *symbol, self.price_at(symbol, bar))
            })
            .collect()
    }

    /// Uniform in `[-1, 1)` (splitmix64).
    fn noise(&self, symbol_hash: u64, bar: u64) -> f64 {
        let mut z = (self.seed ^ symbol_hash ^ bar.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

#[derive(Debug)]
enum PriceSource {
    Fixed(PriceData),
    Synthetic(SyntheticMarket),
}

/// Holds price fetches until the test releases them. `entered` counts
/// fetches that reached the gate and have not been waited for yet.
#[derive(Debug)]
struct Gate {
    permits: Semaphore,
    entered: Semaphore,
}

/// Builder for [`MockApi`].
pub struct MockApiBuilder {
    source: PriceSource,
    positions: Vec<Position>,
    price_failures: VecDeque<TransportError>,
    position_failures: VecDeque<TransportError>,
    gated: bool,
}

impl MockApiBuilder {
    /// Serve exactly `data` on every price fetch.
    pub fn with_prices(mut self, data: PriceData) -> Self {
        self.source = PriceSource::Fixed(data);
        self
    }

    /// Serve a deterministic synthetic market that advances one bar per fetch.
    pub fn synthetic(self, seed: u64) -> Self {
        self.with_market(SyntheticMarket::new(seed))
    }

    pub fn with_market(mut self, market: SyntheticMarket) -> Self {
        self.source = PriceSource::Synthetic(market);
        self
    }

    pub fn with_position(mut self, symbol: Symbol, quantity: f64) -> Self {
        self.positions.push(Position { symbol, quantity });
        self
    }

    /// Fail the next `times` price fetches with `err`.
    pub fn fail_prices(mut self, times: usize, err: TransportError) -> Self {
        self.price_failures
            .extend(std::iter::repeat_n(err, times));
        self
    }

    /// Fail the next `times` position fetches with `err`.
    pub fn fail_positions(mut self, times: usize, err: TransportError) -> Self {
        self.position_failures
            .extend(std::iter::repeat_n(err, times));
        self
    }

    /// Hold every price fetch until [`MockApi::release`] is called.
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn build(self) -> MockApi {
        MockApi {
            source: self.source,
            positions: self.positions,
            price_failures: Mutex::new(self.price_failures),
            position_failures: Mutex::new(self.position_failures),
            price_calls: AtomicUsize::new(0),
            position_calls: AtomicUsize::new(0),
            step: AtomicU64::new(0),
            gate: self.gated.then(|| Gate {
                permits: Semaphore::new(0),
                entered: Semaphore::new(0),
            }),
            closed: AtomicBool::new(false),
        }
    }
}

/// An in-memory [`MarketApi`] that counts calls and replays scripted failures.
#[derive(Debug)]
pub struct MockApi {
    source: PriceSource,
    positions: Vec<Position>,
    price_failures: Mutex<VecDeque<TransportError>>,
    position_failures: Mutex<VecDeque<TransportError>>,
    price_calls: AtomicUsize,
    position_calls: AtomicUsize,
    step: AtomicU64,
    gate: Option<Gate>,
    closed: AtomicBool,
}

impl MockApi {
    pub fn builder() -> MockApiBuilder {
        MockApiBuilder {
            source: PriceSource::Fixed(PriceData::new()),
            positions: Vec::new(),
            price_failures: VecDeque::new(),
            position_failures: VecDeque::new(),
            gated: false,
        }
    }

    /// Synthetic prices, no positions, no failures.
    pub fn synthetic(seed: u64) -> Self {
        Self::builder().synthetic(seed).build()
    }

    pub fn price_calls(&self) -> usize {
        self.price_calls.load(Ordering::SeqCst)
    }

    pub fn position_calls(&self) -> usize {
        self.position_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Let `n` held price fetches through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.permits.add_permits(n);
        }
    }

    /// Wait until another gated price fetch has reached the gate. Each
    /// fetch satisfies exactly one wait.
    pub async fn wait_for_fetch(&self) {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.entered.acquire().await {
                permit.forget();
            }
        }
    }

    fn next_failure(queue: &Mutex<VecDeque<TransportError>>) -> Option<TransportError> {
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn prices_for(&self, assets: &[Symbol]) -> PriceData {
        match &self.source {
            PriceSource::Fixed(data) => assets
                .iter()
                .map(|s| (*s, data.get(s).cloned().unwrap_or_default()))
                .collect(),
            PriceSource::Synthetic(market) => {
                let step = self.step.fetch_add(1, Ordering::SeqCst);
                let last = market.bars as u64 - 1 + step;
                assets.iter().map(|s| (*s, market.series(s, last))).collect()
            }
        }
    }
}

impl MarketApi for MockApi {
    async fn fetch_price_data(
        &self,
        _endpoint: &str,
        assets: &[Symbol],
    ) -> Result<PriceData, TransportError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(gate) = &self.gate {
            gate.entered.add_permits(1);
            gate.permits
                .acquire()
                .await
                .map_err(|_| TransportError::Closed)?
                .forget();
        }
        if let Some(err) = Self::next_failure(&self.price_failures) {
            return Err(err);
        }
        Ok(self.prices_for(assets))
    }

    async fn fetch_positions(&self, _endpoint: &str) -> Result<Vec<Position>, TransportError> {
        self.position_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(err) = Self::next_failure(&self.position_failures) {
            return Err(err);
        }
        Ok(self.positions.clone())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.permits.close();
            gate.entered.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Symbol {
        Symbol::new("BTC")
    }

    #[test]
    fn synthetic_prices_are_deterministic_and_positive() {
        let a = SyntheticMarket::new(1);
        let b = SyntheticMarket::new(1);
        for bar in 0..500 {
            let p = a.price_at(&btc(), bar);
            assert!(p > 0.0 && p.is_finite());
            assert_eq!(p, b.price_at(&btc(), bar));
        }
        assert_ne!(a.price_at(&btc(), 3), SyntheticMarket::new(2).price_at(&btc(), 3));
    }

    #[test]
    fn series_ends_at_requested_bar() {
        let m = SyntheticMarket::new(1).with_bars(10);
        let s = m.series(&btc(), 20);
        assert_eq!(s.len(), 10);
        assert_eq!(s[9].timestamp() - s[0].timestamp(), 9 * SYNTHETIC_BAR_MS);

        assert_eq!(m.series(&btc(), 3).len(), 4);
    }

    #[tokio::test]
    async fn synthetic_fetch_advances_one_bar() {
        let api = MockApi::builder()
            .with_market(SyntheticMarket::new(3).with_bars(5))
            .build();
        let first = api.fetch_price_data("/p", &[btc()]).await.unwrap();
        let second = api.fetch_price_data("/p", &[btc()]).await.unwrap();
        let (a, b) = (&first[&btc()], &second[&btc()]);
        assert_eq!(b[0].timestamp(), a[1].timestamp());
        assert_eq!(b[4].timestamp(), a[4].timestamp() + SYNTHETIC_BAR_MS);
        assert_eq!(api.price_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let api = MockApi::builder()
            .with_position(btc(), 0.5)
            .fail_positions(2, TransportError::Timeout)
            .build();
        assert_eq!(api.fetch_positions("/pos").await, Err(TransportError::Timeout));
        assert_eq!(api.fetch_positions("/pos").await, Err(TransportError::Timeout));
        let positions = api.fetch_positions("/pos").await.unwrap();
        assert_eq!(positions, vec![Position { symbol: btc(), quantity: 0.5 }]);
        assert_eq!(api.position_calls(), 3);
    }

    #[tokio::test]
    async fn gate_holds_fetch_until_released() {
        let api = std::sync::Arc::new(MockApi::builder().synthetic(1).gated().build());
        let fetch = tokio::spawn({
            let api = std::sync::Arc::clone(&api);
            async move { api.fetch_price_data("/p", &[Symbol::new("BTC")]).await }
        });

        api.wait_for_fetch().await;
        assert!(!fetch.is_finished());
        api.release(1);
        assert!(fetch.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_rejects_later_fetches() {
        let api = MockApi::synthetic(0);
        api.close();
        assert!(api.is_closed());
        assert_eq!(
            api.fetch_price_data("/p", &[btc()]).await,
            Err(TransportError::Closed)
        );
    }
}
