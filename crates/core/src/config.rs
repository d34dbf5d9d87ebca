//! Ledger configuration: built-in defaults, an optional TOML file, then
//! `HASHRENT_*` environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::{checked_value, Coin, SpendableBalance};
use crate::error::Result;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Price oracle endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    /// CoinGecko-compatible API root, e.g. `https://api.coingecko.com/api/v3`.
    pub base_url: String,
    pub http_timeout_secs: u64,
    /// How long a fetched price is served from cache.
    pub cache_ttl_secs: u64,
    /// Coin → oracle asset id.
    pub coin_ids: BTreeMap<Coin, String>,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            http_timeout_secs: 10,
            cache_ttl_secs: 60,
            coin_ids: BTreeMap::from([
                (Coin::Btc, "bitcoin".to_string()),
                (Coin::Eth, "ethereum".to_string()),
                (Coin::Ltc, "litecoin".to_string()),
            ]),
        }
    }
}

impl OracleSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Withdrawal fee for one currency: the larger of a flat minimum and a
/// percentage of the requested amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRule {
    pub min_flat: Decimal,
    #[serde(default)]
    pub percent: Option<Decimal>,
}

impl FeeRule {
    pub fn flat(min_flat: Decimal) -> Self {
        Self {
            min_flat,
            percent: None,
        }
    }

    pub fn fee_for(&self, amount: Decimal) -> Result<Decimal> {
        match self.percent {
            Some(pct) => {
                let scaled = checked_value(amount, pct)? / Decimal::ONE_HUNDRED;
                Ok(self.min_flat.max(scaled))
            }
            None => Ok(self.min_flat),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralSettings {
    pub bonus_amount: Decimal,
    pub bonus_currency: Coin,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            bonus_amount: Decimal::TEN,
            bonus_currency: Coin::Usdt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccrualSettings {
    pub interval_secs: u64,
    /// Running contracts are not credited for smaller deltas.
    pub min_credit_delta: Decimal,
}

impl Default for AccrualSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            min_credit_delta: Decimal::new(1, 8),
        }
    }
}

impl AccrualSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub oracle: OracleSettings,
    /// USD prices used when the oracle cannot price a coin.
    pub fallback_prices: BTreeMap<Coin, Decimal>,
    /// Registered deposit address per currency.
    pub intake_addresses: BTreeMap<Coin, String>,
    pub fees: BTreeMap<Coin, FeeRule>,
    /// Order in which purchase funding drains spendable currencies.
    pub debit_priority: Vec<Coin>,
    pub referral: ReferralSettings,
    pub accrual: AccrualSettings,
    pub catalog_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let stable_fee = FeeRule::flat(Decimal::TEN);
        Self {
            oracle: OracleSettings::default(),
            fallback_prices: BTreeMap::from([
                (Coin::Btc, Decimal::from(60_000)),
                (Coin::Eth, Decimal::from(3_000)),
                (Coin::Ltc, Decimal::from(80)),
            ]),
            intake_addresses: BTreeMap::new(),
            fees: BTreeMap::from([
                (Coin::Usd, stable_fee.clone()),
                (Coin::Usdt, stable_fee.clone()),
                (Coin::Usdc, stable_fee),
                (
                    Coin::Btc,
                    FeeRule {
                        min_flat: Decimal::new(5, 4),
                        percent: Some(Decimal::ONE),
                    },
                ),
                (
                    Coin::Eth,
                    FeeRule {
                        min_flat: Decimal::new(5, 3),
                        percent: Some(Decimal::ONE),
                    },
                ),
            ]),
            debit_priority: vec![Coin::Usdt, Coin::Usdc, Coin::Usd],
            referral: ReferralSettings::default(),
            accrual: AccrualSettings::default(),
            catalog_path: None,
            snapshot_path: None,
        }
    }
}

impl LedgerConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded ledger config");
        Ok(config)
    }

    /// Apply `HASHRENT_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HASHRENT_ORACLE_URL") {
            if !url.trim().is_empty() {
                self.oracle.base_url = url.trim().to_string();
            }
        }
        if let Some(secs) = lookup("HASHRENT_ACCRUAL_INTERVAL_SECS") {
            if let Ok(v) = secs.trim().parse::<u64>() {
                self.accrual.interval_secs = v;
            }
        }
        if let Some(bonus) = lookup("HASHRENT_REFERRAL_BONUS") {
            if let Ok(v) = bonus.trim().parse::<Decimal>() {
                self.referral.bonus_amount = v;
            }
        }
        if let Some(path) = lookup("HASHRENT_SNAPSHOT_PATH") {
            if !path.trim().is_empty() {
                self.snapshot_path = Some(PathBuf::from(path.trim()));
            }
        }
        if let Some(path) = lookup("HASHRENT_CATALOG_PATH") {
            if !path.trim().is_empty() {
                self.catalog_path = Some(PathBuf::from(path.trim()));
            }
        }
        for coin in SpendableBalance::CURRENCIES {
            let key = format!("HASHRENT_INTAKE_{}", coin.symbol());
            if let Some(address) = lookup(&key) {
                if !address.trim().is_empty() {
                    self.intake_addresses
                        .insert(coin.clone(), address.trim().to_string());
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debit_priority.is_empty() {
            return Err(ConfigError::Invalid("debit_priority is empty".into()));
        }
        if let Some(coin) = self
            .debit_priority
            .iter()
            .find(|c| !SpendableBalance::supports(c))
        {
            return Err(ConfigError::Invalid(format!(
                "debit_priority contains {coin}, which is not a spendable currency"
            )));
        }
        if self.referral.bonus_amount.is_sign_negative() {
            return Err(ConfigError::Invalid("referral bonus must not be negative".into()));
        }
        if !SpendableBalance::supports(&self.referral.bonus_currency) {
            return Err(ConfigError::Invalid(format!(
                "referral bonus currency {} is not spendable",
                self.referral.bonus_currency
            )));
        }
        for (coin, rule) in &self.fees {
            if rule.min_flat.is_sign_negative() || rule.percent.is_some_and(|p| p.is_sign_negative())
            {
                return Err(ConfigError::Invalid(format!("negative fee rule for {coin}")));
            }
        }
        for (coin, price) in &self.fallback_prices {
            if *price <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "fallback price for {coin} must be positive"
                )));
            }
        }
        if self.accrual.interval_secs == 0 {
            return Err(ConfigError::Invalid("accrual interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[test]
    fn test_ledger_config_defaults() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.accrual.interval(), Duration::from_secs(3600));
        assert_eq!(config.accrual.min_credit_delta, dec!(0.00000001));
        assert_eq!(
            config.debit_priority,
            vec![Coin::Usdt, Coin::Usdc, Coin::Usd]
        );
        assert_eq!(config.referral.bonus_currency, Coin::Usdt);
        assert!(config.intake_addresses.is_empty());
    }

    #[test]
    fn test_fee_rule_takes_larger_of_flat_and_percent() {
        let rule = FeeRule {
            min_flat: dec!(0.0005),
            percent: Some(dec!(1)),
        };
        assert_eq!(rule.fee_for(dec!(0.01)).unwrap(), dec!(0.0005));
        assert_eq!(rule.fee_for(dec!(1)).unwrap(), dec!(0.01));
        assert_eq!(FeeRule::flat(dec!(10)).fee_for(dec!(30)).unwrap(), dec!(10));
    }

    #[test]
    fn test_fee_rule_percent_overflow() {
        let rule = FeeRule {
            min_flat: dec!(0.0001),
            percent: Some(dec!(2)),
        };
        assert!(matches!(
            rule.fee_for(Decimal::MAX),
            Err(crate::error::LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HASHRENT_ORACLE_URL", " http://localhost:9000 "),
            ("HASHRENT_ACCRUAL_INTERVAL_SECS", "60"),
            ("HASHRENT_REFERRAL_BONUS", "25.5"),
            ("HASHRENT_INTAKE_USDT", "TQ123"),
            ("HASHRENT_INTAKE_BTC", "  "),
        ]);
        let mut config = LedgerConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.oracle.base_url, "http://localhost:9000");
        assert_eq!(config.accrual.interval_secs, 60);
        assert_eq!(config.referral.bonus_amount, dec!(25.5));
        assert_eq!(
            config.intake_addresses.get(&Coin::Usdt).map(String::as_str),
            Some("TQ123")
        );
        assert!(!config.intake_addresses.contains_key(&Coin::Btc));
    }

    #[test]
    fn test_env_ignores_unparseable_values() {
        let mut config = LedgerConfig::default();
        config.apply_env(|k| (k == "HASHRENT_ACCRUAL_INTERVAL_SECS").then(|| "soon".to_string()));
        assert_eq!(config.accrual.interval_secs, 3600);
    }

    #[test]
    fn test_from_toml() {
        let config = LedgerConfig::from_toml_str(
            r#"
            debit_priority = ["USD", "usdc"]

            [fallback_prices]
            BTC = 50000
            ETH = "2500.5"

            [intake_addresses]
            USDT = "TQ-intake"

            [fees.USDT]
            min_flat = 5

            [accrual]
            interval_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.debit_priority, vec![Coin::Usd, Coin::Usdc]);
        assert_eq!(config.fallback_prices[&Coin::Eth], dec!(2500.5));
        assert_eq!(config.fees[&Coin::Usdt], FeeRule::flat(dec!(5)));
        assert!(!config.fees.contains_key(&Coin::Btc));
        assert_eq!(config.accrual.interval_secs, 600);
        // Untouched sections keep their defaults.
        assert_eq!(config.referral.bonus_amount, dec!(10));
    }

    #[test]
    fn test_rejects_non_spendable_priority() {
        let err = LedgerConfig::from_toml_str(r#"debit_priority = ["LTC"]"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_fallback_price() {
        let err = LedgerConfig::from_toml_str(
            r#"
            [fallback_prices]
            BTC = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
