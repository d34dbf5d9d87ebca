//! USD price lookup for non-stable coins.
//!
//! ## Read phase
//!
//! Prices are never fetched inside a store transaction. Callers build a
//! [`PriceSnapshot`] first, which consults the oracle once for every coin the
//! decision needs and fills gaps from the configured fallback constants, then
//! pass the snapshot into the transactional phase.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::clock::TimeSource;
use crate::config::OracleSettings;
use crate::currency::{checked_value, Coin};
use crate::error::{LedgerError, Result};

pub type PriceMap = BTreeMap<Coin, Decimal>;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("price request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse price response: {0}")]
    Parse(String),
    #[error("{0}")]
    Other(String),
}

// =============================================================================
// Trait: PriceOracle
// =============================================================================

/// Best-effort USD unit prices.
///
/// `get_prices` returns whatever subset of `coins` the source could price.
/// Missing coins are not an error; a failed request is.
pub trait PriceOracle: Send + Sync + 'static {
    fn get_prices<'a>(
        &'a self,
        coins: &'a [Coin],
    ) -> Pin<Box<dyn Future<Output = Result<PriceMap, OracleError>> + Send + 'a>>;

    fn get_price<'a>(
        &'a self,
        coin: &'a Coin,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Decimal>, OracleError>> + Send + 'a>> {
        Box::pin(async move {
            let prices = self.get_prices(std::slice::from_ref(coin)).await?;
            Ok(prices.get(coin).copied())
        })
    }
}

// =============================================================================
// HttpPriceOracle
// =============================================================================

/// CoinGecko-compatible `simple/price` client.
pub struct HttpPriceOracle {
    client: reqwest::Client,
    base_url: String,
    coin_ids: BTreeMap<Coin, String>,
}

impl HttpPriceOracle {
    pub fn new(settings: &OracleSettings) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            coin_ids: settings.coin_ids.clone(),
        })
    }

    async fn fetch(&self, coins: &[Coin]) -> Result<PriceMap, OracleError> {
        let wanted: Vec<(&Coin, &str)> = coins
            .iter()
            .filter_map(|c| self.coin_ids.get(c).map(|id| (c, id.as_str())))
            .collect();
        if wanted.is_empty() {
            return Ok(PriceMap::new());
        }

        let ids = wanted
            .iter()
            .map(|(_, id)| *id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/simple/price", self.base_url);

        let body: BTreeMap<String, BTreeMap<String, serde_json::Value>> = self
            .client
            .get(&url)
            .query(&[("ids", ids.as_str()), ("vs_currencies", "usd")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut prices = PriceMap::new();
        for (coin, id) in wanted {
            let Some(value) = body.get(id).and_then(|quotes| quotes.get("usd")) else {
                tracing::debug!(%coin, oracle_id = id, "No USD quote in oracle response");
                continue;
            };
            prices.insert(coin.clone(), parse_quote(value)?);
        }
        Ok(prices)
    }
}

fn parse_quote(value: &serde_json::Value) -> Result<Decimal, OracleError> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => return Err(OracleError::Parse(format!("unexpected quote {other}"))),
    };
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| OracleError::Parse(format!("{text}: {e}")))
}

impl PriceOracle for HttpPriceOracle {
    fn get_prices<'a>(
        &'a self,
        coins: &'a [Coin],
    ) -> Pin<Box<dyn Future<Output = Result<PriceMap, OracleError>> + Send + 'a>> {
        Box::pin(self.fetch(coins))
    }
}

// =============================================================================
// CachedPriceOracle
// =============================================================================

/// TTL cache in front of another oracle.
///
/// Fresh entries are served without a request. Stale or missing coins are
/// fetched together; if that fetch fails, stale entries are served instead
/// and the error surfaces only when nothing at all is known.
pub struct CachedPriceOracle<O> {
    inner: O,
    ttl: chrono::Duration,
    clock: Arc<dyn TimeSource>,
    entries: DashMap<Coin, (Decimal, DateTime<Utc>)>,
}

impl<O: PriceOracle> CachedPriceOracle<O> {
    pub fn new(inner: O, ttl: std::time::Duration, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            inner,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
            entries: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    async fn lookup(&self, coins: &[Coin]) -> Result<PriceMap, OracleError> {
        let now = self.clock.now();
        let mut out = PriceMap::new();
        let mut stale = Vec::new();

        for coin in coins {
            match self.entries.get(coin) {
                Some(entry) if now - entry.1 < self.ttl => {
                    out.insert(coin.clone(), entry.0);
                }
                _ => stale.push(coin.clone()),
            }
        }
        if stale.is_empty() {
            return Ok(out);
        }

        match self.inner.get_prices(&stale).await {
            Ok(fetched) => {
                for (coin, price) in fetched {
                    self.entries.insert(coin.clone(), (price, now));
                    out.insert(coin, price);
                }
                Ok(out)
            }
            Err(e) => {
                for coin in &stale {
                    if let Some(entry) = self.entries.get(coin) {
                        out.insert(coin.clone(), entry.0);
                    }
                }
                if out.is_empty() {
                    return Err(e);
                }
                tracing::warn!(
                    error = %e,
                    stale = stale.len(),
                    "Price refresh failed, serving cached prices"
                );
                Ok(out)
            }
        }
    }
}

impl<O: PriceOracle> PriceOracle for CachedPriceOracle<O> {
    fn get_prices<'a>(
        &'a self,
        coins: &'a [Coin],
    ) -> Pin<Box<dyn Future<Output = Result<PriceMap, OracleError>> + Send + 'a>> {
        Box::pin(self.lookup(coins))
    }
}

// =============================================================================
// Mock: MockPriceOracle (test / testing feature)
// =============================================================================

#[cfg(any(test, feature = "testing"))]
pub struct MockPriceOracle {
    prices: parking_lot::Mutex<PriceMap>,
    failing: std::sync::atomic::AtomicBool,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "testing"))]
impl MockPriceOracle {
    pub fn new(prices: impl IntoIterator<Item = (Coin, Decimal)>) -> Self {
        Self {
            prices: parking_lot::Mutex::new(prices.into_iter().collect()),
            failing: std::sync::atomic::AtomicBool::new(false),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        let oracle = Self::new([]);
        oracle.set_failing(true);
        oracle
    }

    pub fn set_price(&self, coin: Coin, price: Decimal) {
        self.prices.lock().insert(coin, price);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of `get_prices` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "testing"))]
impl PriceOracle for MockPriceOracle {
    fn get_prices<'a>(
        &'a self,
        coins: &'a [Coin],
    ) -> Pin<Box<dyn Future<Output = Result<PriceMap, OracleError>> + Send + 'a>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Box::pin(async { Err(OracleError::Other("mock failure".to_string())) });
        }
        let prices = self.prices.lock();
        let out: PriceMap = coins
            .iter()
            .filter_map(|c| prices.get(c).map(|p| (c.clone(), *p)))
            .collect();
        Box::pin(async move { Ok(out) })
    }
}

// =============================================================================
// PriceSnapshot
// =============================================================================

/// Prices resolved ahead of a transaction.
#[derive(Debug, Clone, Default)]
pub struct PriceSnapshot {
    prices: PriceMap,
    fallbacks_used: BTreeSet<Coin>,
}

impl PriceSnapshot {
    /// Price every non-stable coin in `coins`.
    ///
    /// Oracle values above zero win. Missing, zero or failed values fall back
    /// to `fallbacks`. A coin with neither stays unpriced and
    /// [`PriceSnapshot::price`] reports it as unavailable.
    pub async fn resolve(
        oracle: &dyn PriceOracle,
        coins: &[Coin],
        fallbacks: &BTreeMap<Coin, Decimal>,
    ) -> Self {
        let wanted: Vec<Coin> = coins
            .iter()
            .filter(|c| !c.is_stable())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if wanted.is_empty() {
            return Self::default();
        }

        let quoted = match oracle.get_prices(&wanted).await {
            Ok(prices) => prices,
            Err(e) => {
                tracing::warn!(error = %e, "Price oracle unavailable, using fallback prices");
                PriceMap::new()
            }
        };

        let mut snapshot = Self::default();
        for coin in wanted {
            match quoted.get(&coin) {
                Some(price) if *price > Decimal::ZERO => {
                    snapshot.prices.insert(coin, *price);
                }
                _ => match fallbacks.get(&coin) {
                    Some(fallback) => {
                        tracing::warn!(%coin, price = %fallback, "Using fallback price");
                        snapshot.prices.insert(coin.clone(), *fallback);
                        snapshot.fallbacks_used.insert(coin);
                    }
                    None => {
                        tracing::warn!(%coin, "No oracle or fallback price available");
                    }
                },
            }
        }
        snapshot
    }

    /// A snapshot with fixed prices, no oracle involved.
    pub fn from_prices(prices: impl IntoIterator<Item = (Coin, Decimal)>) -> Self {
        Self {
            prices: prices.into_iter().collect(),
            fallbacks_used: BTreeSet::new(),
        }
    }

    /// USD unit price. Stable coins are always 1.
    pub fn price(&self, coin: &Coin) -> Result<Decimal> {
        if coin.is_stable() {
            return Ok(Decimal::ONE);
        }
        self.prices
            .get(coin)
            .copied()
            .ok_or_else(|| LedgerError::UpstreamUnavailable(format!("no USD price for {coin}")))
    }

    pub fn usd_value(&self, coin: &Coin, amount: Decimal) -> Result<Decimal> {
        checked_value(amount, self.price(coin)?)
    }

    pub fn used_fallback(&self, coin: &Coin) -> bool {
        self.fallbacks_used.contains(coin)
    }
}

// =============================================================================
// Tests
// =============================================================================
