use crate::swap::{SwapError, SwapFailureReason};

/// Quantities and prices are always expressed with 8 decimals.
pub const COIN: i64 = 100_000_000;
const DISPLAY_DECIMALS: u32 = 8;

/// Decimals of the smallest base unit for each supported currency.
pub fn units_per_currency(currency: &str) -> Option<u32> {
    match currency {
        "BTC" | "LTC" | "XSN" => Some(8),
        "ETH" | "WETH" | "DAI" => Some(18),
        "USDT" | "USDC" => Some(6),
        _ => None,
    }
}

/// Splits `BASE_QUOTE` into its two tickers.
pub fn split_pair(pair_id: &str) -> Result<(&str, &str), SwapError> {
    match pair_id.split_once('_') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() && !quote.contains('_') => {
            Ok((base, quote))
        }
        _ => Err(SwapError::new(
            SwapFailureReason::InvalidSwapRequest,
            format!("malformed pair id {pair_id}"),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegAmount {
    pub currency: String,
    /// 10^-8 display units.
    pub amount: i64,
    pub units: u128,
}

/// What each side of a swap receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakerTakerAmounts {
    pub maker: LegAmount,
    pub taker: LegAmount,
}

impl MakerTakerAmounts {
    /// `is_buy` is the maker's side: a buying maker receives the base currency.
    pub fn calculate(
        quantity: i64,
        price: i64,
        is_buy: bool,
        pair_id: &str,
    ) -> Result<Self, SwapError> {
        let (base, quote) = split_pair(pair_id)?;
        let base_decimals = decimals(base)?;
        let quote_decimals = decimals(quote)?;
        if quantity <= 0 {
            return Err(SwapError::new(
                SwapFailureReason::InvalidSwapRequest,
                format!("invalid quantity {quantity}"),
            ));
        }

        let quantity_u = quantity as u128;
        // Price 0 (or saturated) is a market order: the quote side is unknown.
        let price_u = if price > 0 && price < i64::MAX {
            price as u128
        } else {
            0
        };

        let quote_amount = i64::try_from(quantity_u * price_u / COIN as u128).map_err(|_| {
            SwapError::new(SwapFailureReason::InvalidSwapRequest, "quote amount overflow")
        })?;

        let base_units = convert_denominations(quantity_u, DISPLAY_DECIMALS, base_decimals)?;
        // Keep the full product so small quantities on high-precision chains
        // do not round down to zero.
        let quote_units =
            convert_denominations(quantity_u * price_u, DISPLAY_DECIMALS * 2, quote_decimals)?;

        let base_leg = LegAmount {
            currency: base.to_string(),
            amount: quantity,
            units: base_units,
        };
        let quote_leg = LegAmount {
            currency: quote.to_string(),
            amount: quote_amount,
            units: quote_units,
        };

        Ok(if is_buy {
            Self {
                maker: base_leg,
                taker: quote_leg,
            }
        } else {
            Self {
                maker: quote_leg,
                taker: base_leg,
            }
        })
    }
}

impl std::fmt::Display for MakerTakerAmounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "taker: {} {}, maker: {} {}",
            self.taker.units, self.taker.currency, self.maker.units, self.maker.currency
        )
    }
}

fn decimals(currency: &str) -> Result<u32, SwapError> {
    units_per_currency(currency).ok_or_else(|| {
        SwapError::new(
            SwapFailureReason::SwapClientNotSetup,
            format!("unsupported currency {currency}"),
        )
    })
}

fn convert_denominations(value: u128, from: u32, to: u32) -> Result<u128, SwapError> {
    let overflow =
        || SwapError::new(SwapFailureReason::InvalidSwapRequest, "unit conversion overflow");
    if to >= from {
        value
            .checked_mul(10u128.checked_pow(to - from).ok_or_else(overflow)?)
            .ok_or_else(overflow)
    } else {
        Ok(value / 10u128.checked_pow(from - to).ok_or_else(overflow)?)
    }
}

const LOCK_CONFIDENCE: f64 = 0.9999;

/// Smallest `k` with `P(X <= k) >= p` for `X ~ Poisson(lambda)`.
fn poisson_quantile(p: f64, lambda: f64) -> u64 {
    if lambda <= 0.0 || !lambda.is_finite() {
        return 0;
    }
    // Work in log space; exp(-lambda) underflows for long locks.
    let ln_lambda = lambda.ln();
    let mut ln_pmf = -lambda;
    let mut cdf = ln_pmf.exp();
    let mut k: u64 = 0;
    let limit = (lambda + 20.0 * lambda.sqrt() + 50.0) as u64;
    while cdf < p && k < limit {
        k += 1;
        ln_pmf += ln_lambda - (k as f64).ln();
        cdf += ln_pmf.exp();
    }
    k
}

/// Blocks on the first-leg chain that will, with very high probability, take
/// longer than `second_leg_blocks` on the second-leg chain.
///
/// Both block arrival processes are modelled as Poisson: first an upper bound
/// on the second leg's lock duration in minutes, then that bound converted
/// into a count of first-leg blocks.
pub fn calculate_lock_buffer(
    second_leg_blocks: u32,
    second_leg_minutes_per_block: f64,
    first_leg_minutes_per_block: f64,
) -> u32 {
    if first_leg_minutes_per_block <= 0.0 {
        return 0;
    }
    let second_leg_minutes = poisson_quantile(LOCK_CONFIDENCE, f64::from(second_leg_blocks))
        as f64
        * second_leg_minutes_per_block;
    let buffer = poisson_quantile(
        LOCK_CONFIDENCE,
        second_leg_minutes / first_leg_minutes_per_block,
    );
    u32::try_from(buffer).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buying_maker_receives_base() {
        let amounts = MakerTakerAmounts::calculate(100, 20_000, true, "BTC_ETH").unwrap();
        assert_eq!(amounts.maker.currency, "BTC");
        assert_eq!(amounts.maker.amount, 100);
        assert_eq!(amounts.maker.units, 100);
        assert_eq!(amounts.taker.currency, "ETH");
        // 100 * 20_000 / 10^8 truncates in display units but not in wei.
        assert_eq!(amounts.taker.amount, 0);
        assert_eq!(amounts.taker.units, 200_000_000);
    }

    #[test]
    fn selling_maker_receives_quote() {
        let amounts =
            MakerTakerAmounts::calculate(2 * COIN, 50 * COIN, false, "LTC_USDT").unwrap();
        assert_eq!(amounts.maker.currency, "USDT");
        assert_eq!(amounts.maker.amount, 100 * COIN);
        assert_eq!(amounts.maker.units, 100_000_000);
        assert_eq!(amounts.taker.currency, "LTC");
        assert_eq!(amounts.taker.units, 200_000_000);
    }

    #[test]
    fn market_order_has_no_quote_amount() {
        let amounts = MakerTakerAmounts::calculate(COIN, 0, true, "BTC_DAI").unwrap();
        assert_eq!(amounts.taker.amount, 0);
        assert_eq!(amounts.taker.units, 0);
        assert_eq!(amounts.maker.units, 100_000_000);
    }

    #[test]
    fn rejects_unknown_currency_and_bad_pair() {
        let err = MakerTakerAmounts::calculate(1, 1, true, "BTC_DOGE").unwrap_err();
        assert_eq!(err.reason, SwapFailureReason::SwapClientNotSetup);
        let err = MakerTakerAmounts::calculate(1, 1, true, "BTCETH").unwrap_err();
        assert_eq!(err.reason, SwapFailureReason::InvalidSwapRequest);
    }

    #[test]
    fn poisson_quantile_bounds() {
        assert_eq!(poisson_quantile(0.9999, 0.0), 0);
        // P(X <= 1) for lambda = 1 is ~0.736.
        assert_eq!(poisson_quantile(0.5, 1.0), 1);
        let q = poisson_quantile(0.9999, 40.0);
        assert!(q > 60 && q < 70, "{q}");
        // No underflow for long locks.
        let q = poisson_quantile(0.9999, 2_000.0);
        assert!(q > 2_100 && q < 2_250, "{q}");
    }

    #[test]
    fn lock_buffer_exceeds_plain_conversion() {
        // 40 ethereum-ish blocks at 0.25 min vs bitcoin at 10 min per block.
        let buffer = calculate_lock_buffer(400, 0.25, 10.0);
        assert!(buffer > 10, "{buffer}");
        let same_chain = calculate_lock_buffer(144, 10.0, 10.0);
        assert!(same_chain > 144);
    }
}
