//! Signed HTTPS client for the trading API.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use folio::Symbol;
use log::{debug, info};
use reqwest::{Certificate, Client, Identity, Url};
use zeroize::Zeroizing;

use crate::auth::SignedHeaders;
use crate::error::TransportError;
use crate::types::{PriceData, Position, parse_positions, parse_prices};
use crate::MarketApi;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings and credentials. Never logged or hashed.
#[derive(Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
    /// PEM client certificate for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM (PKCS#8) private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Extra PEM root certificate to trust.
    pub ca_cert: Option<PathBuf>,
    pub timeout: Duration,
}

impl ApiSettings {
    /// Read settings from `API_*` environment variables.
    pub fn from_env() -> Result<Self, TransportError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TransportError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| TransportError::InvalidSettings(format!("{key} is not set")))
        };

        let timeout = match lookup("API_TIMEOUT_SECS") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    TransportError::InvalidSettings(format!("API_TIMEOUT_SECS: invalid value {v:?}"))
                })?,
            None => DEFAULT_TIMEOUT,
        };

        let settings = Self {
            base_url: require("API_BASE_URL")?,
            api_key: require("API_KEY")?,
            api_secret: Zeroizing::new(require("API_SECRET")?),
            client_cert: lookup("API_CLIENT_CERT").map(PathBuf::from),
            client_key: lookup("API_CLIENT_KEY").map(PathBuf::from),
            ca_cert: lookup("API_CA_CERT").map(PathBuf::from),
            timeout,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if !self.base_url.starts_with("https://") {
            return Err(TransportError::InvalidSettings(
                "API_BASE_URL must use https".into(),
            ));
        }
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(TransportError::InvalidSettings(
                "API_CLIENT_CERT and API_CLIENT_KEY must be set together".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("client_cert", &self.client_cert)
            .field("ca_cert", &self.ca_cert)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path)
        .map_err(|e| TransportError::InvalidSettings(format!("{}: {e}", path.display())))
}

/// Authenticated trading API client over a pooled, verified TLS connection.
pub struct SecureApiClient {
    client: Mutex<Option<Client>>,
    base_url: String,
    api_key: String,
    api_secret: Zeroizing<String>,
}

impl SecureApiClient {
    /// Build the connection pool. No request is made.
    pub fn connect(settings: &ApiSettings) -> Result<Self, TransportError> {
        settings.validate()?;

        let mut builder = Client::builder()
            .use_native_tls()
            .https_only(true)
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8);

        if let Some(ca) = &settings.ca_cert {
            let cert = Certificate::from_pem(&read_pem(ca)?)
                .map_err(|e| TransportError::InvalidSettings(format!("CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&settings.client_cert, &settings.client_key) {
            let identity = Identity::from_pkcs8_pem(&read_pem(cert)?, &read_pem(key)?)
                .map_err(|e| TransportError::InvalidSettings(format!("client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::InvalidSettings(format!("TLS setup: {e}")))?;

        info!("API client ready for {}", settings.base_url);
        Ok(Self {
            client: Mutex::new(Some(client)),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn pool(&self) -> Result<Client, TransportError> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)
    }

    /// Signed GET of `path_and_query`; returns the raw body of a 2xx response.
    async fn get(&self, path_and_query: &str) -> Result<Vec<u8>, TransportError> {
        let client = self.pool()?;
        let (url, signed_path) = request_target(&self.base_url, path_and_query)?;
        let timestamp = chrono::Utc::now().timestamp_millis();
        let headers = SignedHeaders::new(
            &self.api_key,
            self.api_secret.as_bytes(),
            "GET",
            &signed_path,
            timestamp,
            "",
        );

        debug!("GET {signed_path}");
        let mut request = client.get(url);
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(TransportError::from_status(
                status.as_u16(),
                &String::from_utf8_lossy(&body),
            ));
        }
        Ok(body.to_vec())
    }
}

/// Join `path_and_query` onto the base URL. The second value is what gets
/// signed: the full request path, including any prefix in the base URL.
fn request_target(base_url: &str, path_and_query: &str) -> Result<(Url, String), TransportError> {
    let url = Url::parse(&format!("{base_url}{path_and_query}"))
        .map_err(|e| TransportError::InvalidSettings(format!("request URL: {e}")))?;
    let signed = match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    };
    Ok((url, signed))
}

/// `endpoint?symbols=A,B`, appending to an existing query if present.
pub fn price_query(endpoint: &str, assets: &[Symbol]) -> String {
    let symbols: Vec<&str> = assets.iter().map(Symbol::as_str).collect();
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{sep}symbols={}", symbols.join(","))
}

impl MarketApi for SecureApiClient {
    async fn fetch_price_data(
        &self,
        endpoint: &str,
        assets: &[Symbol],
    ) -> Result<PriceData, TransportError> {
        let body = self.get(&price_query(endpoint, assets)).await?;
        parse_prices(&body, assets)
    }

    async fn fetch_positions(&self, endpoint: &str) -> Result<Vec<Position>, TransportError> {
        let body = self.get(endpoint).await?;
        parse_positions(&body)
    }

    fn close(&self) {
        let pool = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            info!("API client closed");
        }
    }
}
