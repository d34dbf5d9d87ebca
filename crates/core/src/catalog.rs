//! Purchasable contract tiers.
//!
//! Tier specs come from a TOML or JSON catalog file. Older specs carry an
//! `estimated_daily_earning` instead of a daily ROI band; [`TierSpec::resolve`]
//! turns both shapes into a [`RewardRate`] once, at load time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::Coin;
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierId(String);

impl TierId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TierId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Catalog file shape
// =============================================================================

/// A tier as written in the catalog file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSpec {
    pub id: TierId,
    pub name: String,
    /// Reward-producing capacity shown to buyers, e.g. `"110 TH/s"`.
    #[serde(default)]
    pub capacity: String,
    pub duration_days: u32,
    pub min_usd: Decimal,
    #[serde(default)]
    pub max_usd: Option<Decimal>,
    #[serde(default)]
    pub display_price: Option<Decimal>,
    pub supported_coins: Vec<Coin>,
    #[serde(default)]
    pub min_daily_roi: Option<Decimal>,
    #[serde(default)]
    pub max_daily_roi: Option<Decimal>,
    /// Legacy field: expected USD earned per day, regardless of funding.
    #[serde(default)]
    pub estimated_daily_earning: Option<Decimal>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub order: u32,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tiers: Vec<TierSpec>,
}

fn invalid(id: &TierId, msg: &str) -> LedgerError {
    LedgerError::InvalidAmount(format!("tier {id}: {msg}"))
}

impl TierSpec {
    pub fn resolve(self) -> Result<Tier> {
        let rate = match (self.min_daily_roi, self.max_daily_roi, self.estimated_daily_earning) {
            (Some(min), Some(max), _) => {
                if min.is_sign_negative() || min > max {
                    return Err(invalid(&self.id, "ROI band must satisfy 0 <= min <= max"));
                }
                RewardRate::Band { min, max }
            }
            (None, None, Some(daily_usd)) if daily_usd > Decimal::ZERO => {
                RewardRate::EstimatedEarning { daily_usd }
            }
            _ => {
                return Err(invalid(
                    &self.id,
                    "needs min_daily_roi and max_daily_roi, or a positive estimated_daily_earning",
                ))
            }
        };
        if self.duration_days == 0 {
            return Err(invalid(&self.id, "duration must be at least one day"));
        }
        if self.min_usd.is_sign_negative() || self.max_usd.is_some_and(|max| max < self.min_usd) {
            return Err(invalid(&self.id, "funding band must satisfy 0 <= min_usd <= max_usd"));
        }
        if !self.supported_coins.iter().any(Coin::is_mineable) {
            return Err(invalid(&self.id, "supports no mineable reward coin"));
        }
        Ok(Tier {
            display_price: self.display_price.unwrap_or(self.min_usd),
            id: self.id,
            name: self.name,
            capacity: self.capacity,
            duration_days: self.duration_days,
            min_usd: self.min_usd,
            max_usd: self.max_usd,
            supported_coins: self.supported_coins,
            rate,
            active: self.active,
            order: self.order,
        })
    }
}

// =============================================================================
// Resolved tiers
// =============================================================================

/// Daily reward rate, in percent of the funded USD amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewardRate {
    Band { min: Decimal, max: Decimal },
    /// Rate derived from a fixed daily USD earning and the amount funded.
    EstimatedEarning { daily_usd: Decimal },
}

impl RewardRate {
    /// Fix the daily rate for a contract funded with `consumed_usd`.
    pub fn sample(&self, consumed_usd: Decimal, sampler: &dyn RateSampler) -> Result<Decimal> {
        let rate = match self {
            Self::Band { min, max } => sampler.sample(*min, *max),
            Self::EstimatedEarning { daily_usd } => {
                if consumed_usd <= Decimal::ZERO {
                    return Err(LedgerError::InvalidAmount(
                        "cannot derive a rate from a zero funding amount".into(),
                    ));
                }
                *daily_usd / consumed_usd * Decimal::ONE_HUNDRED
            }
        };
        Ok(rate.round_dp(4))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub id: TierId,
    pub name: String,
    pub capacity: String,
    pub duration_days: u32,
    pub min_usd: Decimal,
    pub max_usd: Option<Decimal>,
    pub display_price: Decimal,
    pub supported_coins: Vec<Coin>,
    pub rate: RewardRate,
    pub active: bool,
    pub order: u32,
}

impl Tier {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.duration_days))
    }

    /// Band check, inclusive on both ends; no max means unbounded.
    pub fn contains(&self, usd: Decimal) -> bool {
        usd >= self.min_usd && self.max_usd.map_or(true, |max| usd <= max)
    }

    pub fn supports(&self, coin: &Coin) -> bool {
        self.supported_coins.contains(coin)
    }

    /// The deposited coin when mineable and supported, else the first
    /// mineable coin the tier lists.
    pub fn default_reward_coin(&self, preferred: &Coin) -> Option<Coin> {
        if preferred.is_mineable() && self.supports(preferred) {
            return Some(preferred.clone());
        }
        self.supported_coins.iter().find(|c| c.is_mineable()).cloned()
    }
}

// =============================================================================
// Rate sampling
// =============================================================================

pub trait RateSampler: Send + Sync + 'static {
    /// A value in `[min, max]`.
    fn sample(&self, min: Decimal, max: Decimal) -> Decimal;
}

/// Uniform draw on a 0.0001 grid.
#[derive(Debug, Default)]
pub struct UniformSampler;

impl RateSampler for UniformSampler {
    fn sample(&self, min: Decimal, max: Decimal) -> Decimal {
        let scale = Decimal::from(10_000);
        let lo = (min * scale).ceil().to_i64();
        let hi = (max * scale).floor().to_i64();
        match (lo, hi) {
            (Some(lo), Some(hi)) if lo < hi => Decimal::new(rand::rng().random_range(lo..=hi), 4),
            _ => min,
        }
    }
}

#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone, Copy)]
pub struct FixedRateSampler(pub Decimal);

#[cfg(any(test, feature = "testing"))]
impl RateSampler for FixedRateSampler {
    fn sample(&self, min: Decimal, max: Decimal) -> Decimal {
        self.0.clamp(min, max)
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tiers: BTreeMap<TierId, Tier>,
}

impl Catalog {
    pub fn from_specs(specs: impl IntoIterator<Item = TierSpec>) -> Result<Self> {
        let mut catalog = Self::default();
        for spec in specs {
            catalog.upsert(spec.resolve()?);
        }
        Ok(catalog)
    }

    /// Load a `.json` or TOML catalog file holding a `tiers` list.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: CatalogFile = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text)?
        } else {
            toml::from_str(&text).map_err(|e| LedgerError::Persistence(e.to_string()))?
        };
        let catalog = Self::from_specs(file.tiers)?;
        tracing::info!(
            path = %path.display(),
            tiers = catalog.tiers.len(),
            active = catalog.list_active().len(),
            "Loaded tier catalog"
        );
        Ok(catalog)
    }

    /// Insert or replace a tier. Returns the replaced tier, if any.
    pub fn upsert(&mut self, tier: Tier) -> Option<Tier> {
        self.tiers.insert(tier.id.clone(), tier)
    }

    pub fn set_active(&mut self, id: &TierId, active: bool) -> Result<&Tier> {
        let tier = self
            .tiers
            .get_mut(id)
            .ok_or_else(|| LedgerError::not_found("tier", id))?;
        tier.active = active;
        Ok(tier)
    }

    pub fn get(&self, id: &TierId) -> Result<&Tier> {
        self.tiers
            .get(id)
            .ok_or_else(|| LedgerError::not_found("tier", id))
    }

    /// Active tiers in ascending order.
    pub fn list_active(&self) -> Vec<&Tier> {
        let mut tiers: Vec<&Tier> = self.tiers.values().filter(|t| t.active).collect();
        tiers.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        tiers
    }

    /// Tier for a funding event worth `usd`.
    ///
    /// First active tier whose band contains `usd`. Otherwise the highest
    /// tier when `usd` is above every minimum, else the lowest.
    pub fn match_for_usd(&self, usd: Decimal) -> Result<&Tier> {
        let active = self.list_active();
        let (Some(lowest), Some(highest)) = (active.first(), active.last()) else {
            return Err(LedgerError::not_found("tier", format!("matching ${usd}")));
        };
        if let Some(tier) = active.iter().find(|t| t.contains(usd)) {
            return Ok(tier);
        }
        if active.iter().all(|t| usd > t.min_usd) {
            return Ok(highest);
        }
        Ok(lowest)
    }
}
