//! Bond Analytics
//!
//! The analytics stage: a pure function from a raw bond update to an
//! enriched record. The formulas are closed-form approximations (no
//! iterative solvers) chosen for throughput, not financial accuracy.
//!
//! Degenerate inputs never error: a bond at or past maturity
//! (`duration_days <= 0`) yields zero for every maturity-derived figure,
//! and a non-positive price yields a zero current yield.

use chrono::{DateTime, Utc};

use crate::domain::bond::{Bond, EnrichedBond};

/// Days per year used to convert maturity from days to years.
const DAYS_PER_YEAR: f64 = 365.0;

/// Compute the full set of derived analytics for one bond update.
///
/// Pure and total: no side effects, no failure modes. `now` is stamped
/// into the record as `last_updated`.
#[must_use]
pub fn enrich(bond: &Bond, now: DateTime<Utc>) -> EnrichedBond {
    let years = bond.duration_days as f64 / DAYS_PER_YEAR;

    let current_yield = if bond.price > 0 {
        bond.coupon as f64 / bond.price as f64
    } else {
        0.0
    };

    // A matured (or bad-data) bond has no forward-looking analytics.
    let (ytm, modified, dollar, convexity) = if years > 0.0 {
        let ytm = yield_to_maturity(bond, years);
        let modified = modified_duration(bond, years, ytm);
        let dollar = bond.price as f64 * modified / 100.0;
        let convexity = modified.mul_add(modified, modified) + years / 12.0;
        (ytm, modified, dollar, convexity)
    } else {
        (0.0, 0.0, 0.0, 0.0)
    };

    EnrichedBond {
        id: bond.id.clone(),
        price: bond.price,
        face_value: bond.face_value,
        coupon: bond.coupon,
        duration_days: bond.duration_days,
        current_yield,
        yield_to_maturity: ytm,
        modified_duration: modified,
        dollar_duration: dollar,
        convexity,
        last_updated: now,
    }
}

/// YTM by the standard approximation formula.
///
/// `(coupon + (face - price) / years) / ((face + price) / 2)`
fn yield_to_maturity(bond: &Bond, years: f64) -> f64 {
    let denominator = (bond.face_value + bond.price) as f64 / 2.0;
    if denominator == 0.0 {
        return 0.0;
    }

    let numerator = bond.coupon as f64 + (bond.face_value - bond.price) as f64 / years;
    numerator / denominator
}

/// Modified duration = Macaulay duration / (1 + YTM).
fn modified_duration(bond: &Bond, years: f64, ytm: f64) -> f64 {
    let macaulay = macaulay_duration(bond, years);
    if ytm == 0.0 {
        macaulay
    } else {
        macaulay / (1.0 + ytm)
    }
}

/// Macaulay duration approximation.
///
/// A zero-coupon bond's duration equals its maturity. Coupon bonds use a
/// linear approximation clamped to `[0.1, years]`.
fn macaulay_duration(bond: &Bond, years: f64) -> f64 {
    if bond.coupon == 0 {
        return years;
    }

    let approximate = years.mul_add(0.75, 0.25);
    approximate.min(years).max(0.1)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn make_bond(price: i64, coupon: i64, duration_days: i64) -> Bond {
        Bond {
            id: "UST-000042".to_string(),
            price,
            face_value: 100,
            coupon,
            duration_days,
        }
    }

    fn enrich_now(bond: &Bond) -> EnrichedBond {
        enrich(bond, Utc::now())
    }

    #[test_case(1000, 4, 0.004; "treasury coupon")]
    #[test_case(800, 12, 0.015; "junk coupon")]
    #[test_case(500, 5, 0.01; "floor price")]
    fn current_yield_is_coupon_over_price(price: i64, coupon: i64, expected: f64) {
        let enriched = enrich_now(&make_bond(price, coupon, 730));
        assert!((enriched.current_yield - expected).abs() < 1e-12);
    }

    #[test_case(0; "at maturity")]
    #[test_case(-30; "past maturity")]
    fn matured_bond_has_zero_analytics(duration_days: i64) {
        let enriched = enrich_now(&make_bond(1000, 4, duration_days));
        assert_eq!(enriched.yield_to_maturity, 0.0);
        assert_eq!(enriched.modified_duration, 0.0);
        assert_eq!(enriched.dollar_duration, 0.0);
        assert_eq!(enriched.convexity, 0.0);
        // Current yield is price-derived and still defined.
        assert!(enriched.current_yield > 0.0);
    }

    #[test]
    fn non_positive_price_clamps_current_yield() {
        let enriched = enrich_now(&make_bond(0, 4, 730));
        assert_eq!(enriched.current_yield, 0.0);
    }

    #[test]
    fn ytm_matches_approximation_formula() {
        let bond = make_bond(1000, 4, 730);
        let enriched = enrich_now(&bond);

        let years = 2.0;
        let expected = (4.0 + (100.0 - 1000.0) / years) / ((100.0 + 1000.0) / 2.0);
        assert!((enriched.yield_to_maturity - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_coupon_duration_equals_maturity() {
        let bond = make_bond(900, 0, 1825); // 5 years
        let years = 5.0;
        let enriched = enrich_now(&bond);

        let ytm = enriched.yield_to_maturity;
        let expected_modified = years / (1.0 + ytm);
        assert!((enriched.modified_duration - expected_modified).abs() < 1e-9);
    }

    #[test]
    fn coupon_duration_clamped_to_maturity() {
        // years = 0.5: linear approximation 0.625 exceeds maturity, so
        // duration clamps down to the maturity itself.
        let bond = make_bond(1000, 4, 183);
        let enriched = enrich_now(&bond);
        let years = 183.0 / 365.0;

        let expected = years / (1.0 + enriched.yield_to_maturity);
        assert!((enriched.modified_duration - expected).abs() < 1e-9);
    }

    #[test]
    fn dollar_duration_and_convexity_identities() {
        let bond = make_bond(1100, 6, 3650);
        let enriched = enrich_now(&bond);

        let md = enriched.modified_duration;
        assert!((enriched.dollar_duration - 1100.0 * md / 100.0).abs() < 1e-9);

        let years = 10.0;
        assert!((enriched.convexity - (md * md + md + years / 12.0)).abs() < 1e-9);
    }

    #[test]
    fn enrichment_preserves_raw_fields() {
        let bond = make_bond(1234, 7, 999);
        let enriched = enrich_now(&bond);
        assert_eq!(enriched.id, bond.id);
        assert_eq!(enriched.price, 1234);
        assert_eq!(enriched.face_value, 100);
        assert_eq!(enriched.coupon, 7);
        assert_eq!(enriched.duration_days, 999);
    }
}
