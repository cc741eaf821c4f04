//! # Decimal Money Helpers
//!
//! Amounts arrive from remote services as decimal strings and are handled as
//! [`Decimal`] throughout. Rounding happens only at division boundaries, always
//! toward zero, and whatever rounding leaves over is returned explicitly.

use rust_decimal::prelude::*;

use crate::error::{PipelineError, Result};

/// Parse a decimal amount string, naming the field on failure.
pub fn parse_amount(field: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value.trim()).map_err(|_| PipelineError::InvalidDecimal {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Like [`parse_amount`] but rejects negative values.
pub fn parse_non_negative(field: &str, value: &str) -> Result<Decimal> {
    let amount = parse_amount(field, value)?;
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(PipelineError::InvalidDecimal {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(amount)
}

/// Result of splitting a total across weighted recipients.
///
/// `shares.iter().sum() + remainder == total` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Apportionment {
    pub shares: Vec<Decimal>,
    pub remainder: Decimal,
}

impl Apportionment {
    pub fn distributed(&self) -> Decimal {
        self.shares.iter().copied().sum()
    }
}

/// Split `total` proportionally to `weights` out of `denominator`.
///
/// Each share is `total * weight / denominator`, rounded toward zero at
/// `scale` decimal places. Weights summing to less than the denominator leave
/// the unallocated part in the remainder together with rounding dust.
pub fn apportion(
    total: Decimal,
    weights: &[Decimal],
    denominator: Decimal,
    scale: u32,
) -> Result<Apportionment> {
    if denominator <= Decimal::ZERO {
        return Err(PipelineError::validation(format!(
            "apportion denominator must be positive, got {denominator}"
        )));
    }
    if total.is_sign_negative() && !total.is_zero() {
        return Err(PipelineError::validation(format!(
            "apportion total must not be negative, got {total}"
        )));
    }

    let mut weight_sum = Decimal::ZERO;
    for weight in weights {
        if weight.is_sign_negative() && !weight.is_zero() {
            return Err(PipelineError::validation(format!(
                "apportion weight must not be negative, got {weight}"
            )));
        }
        weight_sum = weight_sum
            .checked_add(*weight)
            .ok_or_else(|| PipelineError::validation("apportion weights overflow"))?;
    }
    if weight_sum > denominator {
        return Err(PipelineError::BusinessRule(format!(
            "allocated units {weight_sum} exceed total units {denominator}"
        )));
    }

    let mut shares = Vec::with_capacity(weights.len());
    for weight in weights {
        let share = total
            .checked_mul(*weight)
            .and_then(|v| v.checked_div(denominator))
            .ok_or_else(|| PipelineError::validation("apportion arithmetic overflow"))?
            .round_dp_with_strategy(scale, RoundingStrategy::ToZero);
        shares.push(share);
    }

    let distributed: Decimal = shares.iter().copied().sum();
    Ok(Apportionment {
        shares,
        remainder: total - distributed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("amount", "100").unwrap(), dec!(100));
        assert_eq!(parse_amount("amount", " 0.000001 ").unwrap(), dec!(0.000001));
        assert!(matches!(
            parse_amount("amount", "1,000"),
            Err(PipelineError::InvalidDecimal { field, .. }) if field == "amount"
        ));
        assert!(parse_amount("amount", "").is_err());
    }

    #[test]
    fn test_parse_non_negative() {
        assert!(parse_non_negative("reserved", "-1").is_err());
        assert_eq!(parse_non_negative("reserved", "0").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_apportion_by_good_total() {
        let result = apportion(dec!(1000), &[dec!(100), dec!(150)], dec!(500), 18).unwrap();
        assert_eq!(result.shares, vec![dec!(200), dec!(300)]);
        assert_eq!(result.distributed(), dec!(500));
        assert_eq!(result.remainder, dec!(500));
    }

    #[test]
    fn test_apportion_keeps_rounding_dust() {
        let result = apportion(dec!(10), &[dec!(1), dec!(1), dec!(1)], dec!(3), 2).unwrap();
        assert_eq!(result.shares, vec![dec!(3.33), dec!(3.33), dec!(3.33)]);
        assert_eq!(result.remainder, dec!(0.01));
    }

    #[test]
    fn test_apportion_rejects_over_allocation() {
        assert!(matches!(
            apportion(dec!(10), &[dec!(6), dec!(5)], dec!(10), 2),
            Err(PipelineError::BusinessRule(_))
        ));
        assert!(apportion(dec!(10), &[dec!(1)], Decimal::ZERO, 2).is_err());
    }

    proptest! {
        #[test]
        fn prop_shares_plus_remainder_equal_total(
            total_units in 0i64..1_000_000_000_000,
            weights in prop::collection::vec(0i64..1_000_000, 0..20),
            slack in 0i64..1_000_000,
            scale in 0u32..12,
        ) {
            let total = Decimal::new(total_units, 6);
            let weights: Vec<Decimal> = weights.into_iter().map(Decimal::from).collect();
            let denominator = weights.iter().copied().sum::<Decimal>() + Decimal::from(slack) + Decimal::ONE;

            let result = apportion(total, &weights, denominator, scale).unwrap();
            prop_assert_eq!(result.distributed() + result.remainder, total);
            prop_assert!(result.remainder >= Decimal::ZERO);
            for share in &result.shares {
                prop_assert!(*share >= Decimal::ZERO);
            }
        }
    }
}
