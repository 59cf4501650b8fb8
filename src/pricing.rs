//! Order pricing: subtotal, shipping, tax and the grand total.
//!
//! All money values are `rust_decimal::Decimal`. Intermediate sums keep full
//! precision; rounding happens once, at the tax computation.

use rust_decimal::{Decimal, RoundingStrategy};

/// Orders strictly above this subtotal ship for free.
pub fn free_shipping_threshold() -> Decimal {
    Decimal::from(1000)
}

/// Flat shipping fee below the free-shipping threshold.
pub fn flat_shipping_fee() -> Decimal {
    Decimal::from(50)
}

/// GST-style tax rate applied to the subtotal.
pub fn tax_rate() -> Decimal {
    // 0.18
    Decimal::new(18, 2)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTotals {
    pub total_items: i32,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax: Decimal,
    pub total_amount: Decimal,
}

/// Compute the financial fields for a set of (unit price, quantity) lines.
///
/// `total_amount == subtotal + shipping_cost + tax` holds exactly for the
/// returned value.
pub fn order_totals(lines: &[(Decimal, i32)]) -> OrderTotals {
    let subtotal: Decimal = lines
        .iter()
        .map(|(price, qty)| *price * Decimal::from(*qty))
        .sum();
    let total_items: i32 = lines.iter().map(|(_, qty)| *qty).sum();

    let shipping_cost = if subtotal > free_shipping_threshold() {
        Decimal::ZERO
    } else {
        flat_shipping_fee()
    };

    let tax = (subtotal * tax_rate())
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    OrderTotals {
        total_items,
        subtotal,
        shipping_cost,
        tax,
        total_amount: subtotal + shipping_cost + tax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn totals_identity_holds() {
        let totals = order_totals(&[(dec("19.99"), 3), (dec("4.50"), 1)]);
        assert_eq!(
            totals.total_amount,
            totals.subtotal + totals.shipping_cost + totals.tax
        );
        assert_eq!(totals.subtotal, dec("64.47"));
        assert_eq!(totals.total_items, 4);
    }

    #[test]
    fn flat_fee_applies_at_exactly_threshold() {
        // subtotal == 1000 is not strictly above the threshold
        let totals = order_totals(&[(dec("500"), 2)]);
        assert_eq!(totals.subtotal, dec("1000"));
        assert_eq!(totals.shipping_cost, dec("50"));
        assert_eq!(totals.tax, dec("180.00"));
        assert_eq!(totals.total_amount, dec("1230.00"));
    }

    #[test]
    fn free_shipping_above_threshold() {
        let totals = order_totals(&[(dec("1001"), 1)]);
        assert_eq!(totals.shipping_cost, Decimal::ZERO);
        assert_eq!(totals.tax, dec("180.18"));
        assert_eq!(totals.total_amount, dec("1181.18"));
    }

    #[test]
    fn tax_rounds_to_two_decimal_places() {
        // 3.33 * 0.18 = 0.5994 -> 0.60
        let totals = order_totals(&[(dec("3.33"), 1)]);
        assert_eq!(totals.tax, dec("0.60"));
        // 0.25 * 0.18 = 0.045 -> midpoint rounds away from zero
        let totals = order_totals(&[(dec("0.25"), 1)]);
        assert_eq!(totals.tax, dec("0.05"));
    }

    #[test]
    fn intermediate_precision_is_not_rounded() {
        // Two lines whose individually-rounded taxes would differ from
        // rounding once at the end.
        let totals = order_totals(&[(dec("0.03"), 1), (dec("0.03"), 1)]);
        assert_eq!(totals.subtotal, dec("0.06"));
        // 0.06 * 0.18 = 0.0108 -> 0.01, not 2 * round(0.0054)
        assert_eq!(totals.tax, dec("0.01"));
    }
}
