//! Trading API access for folio.
//!
//! Provides the [`MarketApi`] trait the rebalancer is generic over, plus:
//!
//! - [`SecureApiClient`]: signed requests over a verified, pooled TLS connection
//! - [`MockApi`]: scripted failures and synthetic prices for tests and offline mode
//! - [`with_retry`]: the backoff primitive every fetch goes through

pub mod auth;
pub mod client;
pub mod error;
pub mod mock;
pub mod retry;
pub mod types;

use std::future::Future;

pub use client::{ApiSettings, SecureApiClient};
pub use error::TransportError;
pub use mock::{MockApi, SyntheticMarket};
pub use retry::{RetryPolicy, with_retry};
pub use types::{PriceData, Position};

use folio::Symbol;

/// A source of prices and positions.
pub trait MarketApi: Send + Sync + 'static {
    /// Recent prices for `assets` from `endpoint`. Every requested symbol
    /// has an entry, possibly empty.
    fn fetch_price_data(
        &self,
        endpoint: &str,
        assets: &[Symbol],
    ) -> impl Future<Output = Result<PriceData, TransportError>> + Send;

    /// Current holdings from `endpoint`.
    fn fetch_positions(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Vec<Position>, TransportError>> + Send;

    /// Release connections. Later fetches fail with [`TransportError::Closed`].
    fn close(&self);
}
