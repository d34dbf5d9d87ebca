//! Currencies and the two per-account balance maps.
//!
//! Known currencies are enum variants; anything else is carried as
//! [`Coin::Other`]. Both balance maps implement [`CurrencyLedger`], so callers
//! read, credit and debit them the same way whether a symbol lives in a fixed
//! field or in the open-ended `others` map.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// A currency symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Coin {
    /// Base currency.
    Usd,
    Usdt,
    Usdc,
    Btc,
    Eth,
    Ltc,
    /// Long-tail symbol, always upper-case and never one of the known symbols.
    Other(String),
}

impl Coin {
    /// The two coins contracts can produce.
    pub const MINEABLE: [Coin; 2] = [Coin::Btc, Coin::Eth];

    pub fn symbol(&self) -> &str {
        match self {
            Self::Usd => "USD",
            Self::Usdt => "USDT",
            Self::Usdc => "USDC",
            Self::Btc => "BTC",
            Self::Eth => "ETH",
            Self::Ltc => "LTC",
            Self::Other(s) => s,
        }
    }

    /// Pegged 1:1 to the base currency; never priced through the oracle.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Usd | Self::Usdt | Self::Usdc)
    }

    pub fn is_mineable(&self) -> bool {
        matches!(self, Self::Btc | Self::Eth)
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Coin {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let symbol = s.trim().to_ascii_uppercase();
        let coin = match symbol.as_str() {
            "" => return Err(LedgerError::InvalidAmount("empty currency symbol".into())),
            "USD" => Self::Usd,
            "USDT" => Self::Usdt,
            "USDC" => Self::Usdc,
            "BTC" => Self::Btc,
            "ETH" => Self::Eth,
            "LTC" => Self::Ltc,
            _ => Self::Other(symbol),
        };
        Ok(coin)
    }
}

impl From<Coin> for String {
    fn from(coin: Coin) -> Self {
        coin.symbol().to_string()
    }
}

impl TryFrom<String> for Coin {
    type Error = LedgerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Uniform access to a balance map.
///
/// `credit` and `debit` are the only ways a balance field changes. Both return
/// the new balance. Neither accepts a negative amount, and `debit` refuses to
/// take a field below zero.
pub trait CurrencyLedger {
    fn get(&self, coin: &Coin) -> Decimal;
    fn credit(&mut self, coin: &Coin, amount: Decimal) -> Result<Decimal>;
    fn debit(&mut self, coin: &Coin, amount: Decimal) -> Result<Decimal>;
    /// Non-zero balances, ordered by coin.
    fn holdings(&self) -> Vec<(Coin, Decimal)>;
}

fn check_amount(amount: Decimal) -> Result<()> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must not be negative, got {amount}"
        )));
    }
    Ok(())
}

fn apply_credit(slot: &mut Decimal, amount: Decimal) -> Result<Decimal> {
    check_amount(amount)?;
    *slot = slot.checked_add(amount).ok_or_else(|| {
        LedgerError::InvalidAmount(format!("crediting {amount} overflows balance {slot}"))
    })?;
    Ok(*slot)
}

/// `amount * price`, refusing results outside the `Decimal` range.
pub(crate) fn checked_value(amount: Decimal, price: Decimal) -> Result<Decimal> {
    amount.checked_mul(price).ok_or_else(|| {
        LedgerError::InvalidAmount(format!("{amount} at {price} is out of range"))
    })
}

fn apply_debit(slot: &mut Decimal, coin: &Coin, amount: Decimal) -> Result<Decimal> {
    check_amount(amount)?;
    if *slot < amount {
        return Err(LedgerError::InsufficientBalance {
            currency: coin.to_string(),
            available: *slot,
            requested: amount,
        });
    }
    *slot -= amount;
    Ok(*slot)
}

/// Funds usable for purchases and withdrawals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableBalance {
    usd: Decimal,
    usdt: Decimal,
    usdc: Decimal,
    btc: Decimal,
    eth: Decimal,
}

impl SpendableBalance {
    pub const CURRENCIES: [Coin; 5] = [Coin::Usd, Coin::Usdt, Coin::Usdc, Coin::Btc, Coin::Eth];

    pub fn supports(coin: &Coin) -> bool {
        Self::CURRENCIES.contains(coin)
    }

    fn slot(&mut self, coin: &Coin) -> Result<&mut Decimal> {
        match coin {
            Coin::Usd => Ok(&mut self.usd),
            Coin::Usdt => Ok(&mut self.usdt),
            Coin::Usdc => Ok(&mut self.usdc),
            Coin::Btc => Ok(&mut self.btc),
            Coin::Eth => Ok(&mut self.eth),
            other => Err(LedgerError::UnsupportedCurrency(other.clone())),
        }
    }
}

impl CurrencyLedger for SpendableBalance {
    fn get(&self, coin: &Coin) -> Decimal {
        match coin {
            Coin::Usd => self.usd,
            Coin::Usdt => self.usdt,
            Coin::Usdc => self.usdc,
            Coin::Btc => self.btc,
            Coin::Eth => self.eth,
            _ => Decimal::ZERO,
        }
    }

    fn credit(&mut self, coin: &Coin, amount: Decimal) -> Result<Decimal> {
        apply_credit(self.slot(coin)?, amount)
    }

    fn debit(&mut self, coin: &Coin, amount: Decimal) -> Result<Decimal> {
        apply_debit(self.slot(coin)?, coin, amount)
    }

    fn holdings(&self) -> Vec<(Coin, Decimal)> {
        Self::CURRENCIES
            .iter()
            .map(|c| (c.clone(), self.get(c)))
            .filter(|(_, v)| !v.is_zero())
            .collect()
    }
}

/// Accumulated production rewards, tracked apart from spendable funds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardBalance {
    btc: Decimal,
    eth: Decimal,
    ltc: Decimal,
    /// Any other symbol, keyed by upper-case symbol.
    #[serde(default)]
    others: BTreeMap<String, Decimal>,
}

impl CurrencyLedger for RewardBalance {
    fn get(&self, coin: &Coin) -> Decimal {
        match coin {
            Coin::Btc => self.btc,
            Coin::Eth => self.eth,
            Coin::Ltc => self.ltc,
            other => self
                .others
                .get(other.symbol())
                .copied()
                .unwrap_or(Decimal::ZERO),
        }
    }

    fn credit(&mut self, coin: &Coin, amount: Decimal) -> Result<Decimal> {
        let slot = match coin {
            Coin::Btc => &mut self.btc,
            Coin::Eth => &mut self.eth,
            Coin::Ltc => &mut self.ltc,
            other => self
                .others
                .entry(other.symbol().to_string())
                .or_insert(Decimal::ZERO),
        };
        apply_credit(slot, amount)
    }

    fn debit(&mut self, coin: &Coin, amount: Decimal) -> Result<Decimal> {
        match coin {
            Coin::Btc => apply_debit(&mut self.btc, coin, amount),
            Coin::Eth => apply_debit(&mut self.eth, coin, amount),
            Coin::Ltc => apply_debit(&mut self.ltc, coin, amount),
            other => {
                // Absent symbols behave as a zero balance without creating an entry.
                let mut current = self
                    .others
                    .get(other.symbol())
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                let remaining = apply_debit(&mut current, coin, amount)?;
                self.others.insert(other.symbol().to_string(), remaining);
                Ok(remaining)
            }
        }
    }

    fn holdings(&self) -> Vec<(Coin, Decimal)> {
        let mut out: Vec<(Coin, Decimal)> = [Coin::Btc, Coin::Eth, Coin::Ltc]
            .into_iter()
            .map(|c| {
                let v = self.get(&c);
                (c, v)
            })
            .collect();
        for (symbol, amount) in &self.others {
            if let Ok(coin) = symbol.parse::<Coin>() {
                out.push((coin, *amount));
            }
        }
        out.retain(|(_, v)| !v.is_zero());
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case("usd", Coin::Usd)]
    #[case(" USDT ", Coin::Usdt)]
    #[case("Btc", Coin::Btc)]
    #[case("doge", Coin::Other("DOGE".into()))]
    fn test_parse_coin(#[case] input: &str, #[case] expected: Coin) {
        assert_eq!(input.parse::<Coin>().unwrap(), expected);
    }

    #[test]
    fn test_parse_empty_symbol_rejected() {
        assert!("  ".parse::<Coin>().is_err());
    }

    #[test]
    fn test_coin_serde_as_symbol() {
        let json = serde_json::to_string(&Coin::Eth).unwrap();
        assert_eq!(json, "\"ETH\"");
        let back: Coin = serde_json::from_str("\"kas\"").unwrap();
        assert_eq!(back, Coin::Other("KAS".into()));
    }

    #[test]
    fn test_spendable_debit_cannot_go_negative() {
        let mut bal = SpendableBalance::default();
        bal.credit(&Coin::Usdt, dec!(30)).unwrap();

        let err = bal.debit(&Coin::Usdt, dec!(30.01)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(bal.get(&Coin::Usdt), dec!(30));

        assert_eq!(bal.debit(&Coin::Usdt, dec!(30)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_negative_amounts_rejected() {
        let mut bal = SpendableBalance::default();
        assert!(matches!(
            bal.credit(&Coin::Usd, dec!(-1)),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            bal.debit(&Coin::Usd, dec!(-1)),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_spendable_rejects_unknown_currency() {
        let mut bal = SpendableBalance::default();
        let err = bal.credit(&Coin::Ltc, dec!(1)).unwrap_err();
        assert!(matches!(err, LedgerError::UnsupportedCurrency(Coin::Ltc)));
        assert_eq!(bal.get(&Coin::Ltc), Decimal::ZERO);
    }

    #[test]
    fn test_reward_map_handles_long_tail_uniformly() {
        let mut rewards = RewardBalance::default();
        let kas: Coin = "KAS".parse().unwrap();

        rewards.credit(&Coin::Btc, dec!(0.1)).unwrap();
        rewards.credit(&kas, dec!(5)).unwrap();
        rewards.credit(&kas, dec!(2.5)).unwrap();
        assert_eq!(rewards.get(&kas), dec!(7.5));

        rewards.debit(&kas, dec!(7.5)).unwrap();
        assert_eq!(rewards.get(&kas), Decimal::ZERO);

        let unknown: Coin = "XMR".parse().unwrap();
        assert!(rewards.debit(&unknown, dec!(1)).is_err());
        assert_eq!(rewards.holdings(), vec![(Coin::Btc, dec!(0.1))]);
    }

    #[test]
    fn test_credit_overflow_rejected_without_mutation() {
        let mut bal = SpendableBalance::default();
        let big = Decimal::from_str("50000000000000000000000000000").unwrap();
        bal.credit(&Coin::Usdt, big).unwrap();

        let err = bal.credit(&Coin::Usdt, big).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(bal.get(&Coin::Usdt), big);
    }

    #[test]
    fn test_checked_value_overflow() {
        assert_eq!(checked_value(dec!(2), dec!(1.5)).unwrap(), dec!(3));
        assert!(matches!(
            checked_value(Decimal::MAX, dec!(2)),
            Err(LedgerError::InvalidAmount(_))
        ));
    }
}
