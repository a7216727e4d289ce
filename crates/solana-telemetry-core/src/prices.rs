// Numan Thabit 2025
//! Short-TTL price quotes for a fixed set of assets, served stale on error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

/// Default quote lifetime.
pub const DEFAULT_PRICE_TTL: Duration = Duration::from_secs(30);

/// Price service failures.
#[derive(Debug, Error)]
pub enum PriceError {
    /// The request never produced a response.
    #[error("price request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success HTTP status.
    #[error("price service returned status {0}")]
    Status(u16),
    /// The body did not carry the expected shape.
    #[error("undecodable price payload: {0}")]
    Decode(String),
    /// The last refresh failed recently and no earlier quotes exist.
    #[error("price service failed recently; next attempt within {0:?}")]
    Backoff(Duration),
}

/// Source of USD quotes keyed by asset id.
#[async_trait]
pub trait QuoteSource: Send + Sync + 'static {
    /// Fetch quotes for `assets`; entries may be missing or extra.
    async fn fetch_quotes(&self, assets: &[String]) -> Result<BTreeMap<String, f64>, PriceError>;
}

/// One asset quote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    /// Asset identifier.
    pub asset: String,
    /// Price in USD.
    pub price_usd: f64,
    /// When the quote was fetched.
    pub fetched_at: DateTime<Utc>,
}

/// Quotes as served to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceBoard {
    /// Quote per allow-listed asset that the service priced.
    pub quotes: BTreeMap<String, PriceQuote>,
    /// When the board was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Set when a refresh failed and an older board is being served.
    pub stale: bool,
}

/// Pause between refresh attempts after the price service fails.
pub const REFRESH_BACKOFF: Duration = Duration::from_secs(5);

struct Cached {
    board: PriceBoard,
    loaded_at: Instant,
}

#[derive(Default)]
struct PriceState {
    cached: Option<Cached>,
    failed_at: Option<Instant>,
}

impl PriceState {
    fn stale_board(&self) -> Option<PriceBoard> {
        self.cached.as_ref().map(|cached| PriceBoard {
            stale: true,
            ..cached.board.clone()
        })
    }
}

/// Price cache over a [`QuoteSource`].
pub struct PriceCache {
    assets: Vec<String>,
    ttl: Duration,
    source: Arc<dyn QuoteSource>,
    state: Mutex<PriceState>,
    refresh: tokio::sync::Mutex<()>,
}

impl PriceCache {
    /// Cache quotes for `assets` for `ttl`.
    pub fn new(assets: Vec<String>, ttl: Duration, source: Arc<dyn QuoteSource>) -> Self {
        Self {
            assets,
            ttl,
            source,
            state: Mutex::new(PriceState::default()),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Answer from memory when the board is fresh or a recent refresh failed.
    fn cached(&self) -> Option<Result<PriceBoard, PriceError>> {
        let state = self.state.lock();
        if let Some(cached) = state
            .cached
            .as_ref()
            .filter(|cached| cached.loaded_at.elapsed() < self.ttl)
        {
            return Some(Ok(cached.board.clone()));
        }
        if state
            .failed_at
            .is_some_and(|at| at.elapsed() < REFRESH_BACKOFF)
        {
            return Some(
                state
                    .stale_board()
                    .ok_or(PriceError::Backoff(REFRESH_BACKOFF)),
            );
        }
        None
    }

    /// Current quotes, refreshing once the cached board expires.
    ///
    /// Only one caller refreshes at a time; others get the previous board
    /// marked stale instead of waiting. A failed refresh is not retried for
    /// [`REFRESH_BACKOFF`].
    pub async fn quotes(&self) -> Result<PriceBoard, PriceError> {
        if let Some(answer) = self.cached() {
            return answer;
        }
        let _refresh = match self.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let stale = self.state.lock().stale_board();
                if let Some(board) = stale {
                    return Ok(board);
                }
                self.refresh.lock().await
            }
        };
        if let Some(answer) = self.cached() {
            return answer;
        }

        match self.source.fetch_quotes(&self.assets).await {
            Ok(prices) => {
                let now = Utc::now();
                let quotes = prices
                    .into_iter()
                    .filter(|(asset, _)| self.assets.contains(asset))
                    .map(|(asset, price_usd)| {
                        let quote = PriceQuote {
                            asset: asset.clone(),
                            price_usd,
                            fetched_at: now,
                        };
                        (asset, quote)
                    })
                    .collect();
                let board = PriceBoard {
                    quotes,
                    fetched_at: now,
                    stale: false,
                };
                *self.state.lock() = PriceState {
                    cached: Some(Cached {
                        board: board.clone(),
                        loaded_at: Instant::now(),
                    }),
                    failed_at: None,
                };
                Ok(board)
            }
            Err(err) => {
                let previous = {
                    let mut state = self.state.lock();
                    state.failed_at = Some(Instant::now());
                    state.stale_board()
                };
                match previous {
                    Some(board) => {
                        warn!(error = %err, "price refresh failed; serving stale quotes");
                        Ok(board)
                    }
                    None => Err(err),
                }
            }
        }
    }
}

/// Price service speaking `{"data": {id: {"price": ..}}}`.
pub struct HttpQuoteSource {
    client: reqwest::Client,
    url: String,
}

impl HttpQuoteSource {
    /// Query `url` with an `ids` parameter, bounded by `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PriceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch_quotes(&self, assets: &[String]) -> Result<BTreeMap<String, f64>, PriceError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("ids", assets.join(","))])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PriceError::Status(response.status().as_u16()));
        }
        let body: Value = response.json().await?;
        parse_quotes(&body)
    }
}

/// Extract numeric or string-encoded prices from a quote payload.
pub fn parse_quotes(body: &Value) -> Result<BTreeMap<String, f64>, PriceError> {
    let data = body
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| PriceError::Decode("missing data object".into()))?;
    let mut out = BTreeMap::new();
    for (asset, entry) in data {
        let price = match entry.get("price") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse::<f64>().ok(),
            _ => None,
        };
        if let Some(price) = price.filter(|p| p.is_finite()) {
            out.insert(asset.clone(), price);
        }
    }
    Ok(out)
}
