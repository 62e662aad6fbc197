#![cfg_attr(not(feature = "std"), no_std)]

use shp_traits::UpdateStoragePrice;
use sp_arithmetic::{
    traits::{CheckedDiv, One, Saturating, Zero},
    FixedPointNumber, FixedU128, PerThing, Perbill,
};

/// Number of terms of the Taylor series used to approximate `e^x - 1` for `x` in `[0, 1]`.
/// The 20th term is below `1 / 20!`, far under the precision of [`FixedU128`].
const EXP_SERIES_TERMS: u32 = 20;

/// Approximates `e^x - 1` with the Taylor series `sum(x^k / k!)` for `k >= 1`.
pub fn exp_minus_one(x: FixedU128) -> FixedU128 {
    let mut sum = FixedU128::zero();
    let mut term = FixedU128::one();
    for k in 1..=EXP_SERIES_TERMS {
        term = term
            .saturating_mul(x)
            .checked_div(&FixedU128::saturating_from_integer(k))
            .unwrap_or_else(FixedU128::zero);
        if term.is_zero() {
            break;
        }
        sum = sum.saturating_add(term);
    }
    sum
}

/// An updater where the price never changes.
pub struct NoUpdatePriceIndexUpdater;

impl UpdateStoragePrice for NoUpdatePriceIndexUpdater {
    type Price = u128;
    type StorageDataUnit = u64;

    fn update_storage_price(
        &self,
        current_price: Self::Price,
        _used_capacity: Self::StorageDataUnit,
        _total_capacity: Self::StorageDataUnit,
    ) -> Self::Price {
        current_price
    }
}

/// An updater that keeps the price mostly stable.
///
/// The price is only moved away from `mostly_stable_price` when the system utilisation leaves
/// the `[lower_threshold, upper_threshold]` band:
///
/// ```ignore
/// price(u) = {
///     u < lower:  mostly_stable_price - lower_exponent_factor * (e^(lower - u) - 1),
///     u > upper:  mostly_stable_price + upper_exponent_factor * (e^(u - upper) - 1),
///     otherwise:  mostly_stable_price,
/// }
/// ```
///
/// and the result is always kept within `[min_price, max_price]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MostlyStablePriceIndexUpdater {
    pub lower_threshold: Perbill,
    pub upper_threshold: Perbill,
    pub mostly_stable_price: u128,
    pub max_price: u128,
    pub min_price: u128,
    pub lower_exponent_factor: u128,
    pub upper_exponent_factor: u128,
}

impl MostlyStablePriceIndexUpdater {
    fn perbill_to_fixed(p: Perbill) -> FixedU128 {
        FixedU128::from_rational(p.deconstruct() as u128, Perbill::ACCURACY as u128)
    }

    pub fn price_for_utilisation(&self, utilisation: Perbill) -> u128 {
        let price = if utilisation < self.lower_threshold {
            let x = Self::perbill_to_fixed(self.lower_threshold.saturating_sub(utilisation));
            let decrease = exp_minus_one(x).saturating_mul_int(self.lower_exponent_factor);
            self.mostly_stable_price.saturating_sub(decrease)
        } else if utilisation > self.upper_threshold {
            let x = Self::perbill_to_fixed(utilisation.saturating_sub(self.upper_threshold));
            let increase = exp_minus_one(x).saturating_mul_int(self.upper_exponent_factor);
            self.mostly_stable_price.saturating_add(increase)
        } else {
            self.mostly_stable_price
        };

        price.clamp(self.min_price, self.max_price.max(self.min_price))
    }
}

impl UpdateStoragePrice for MostlyStablePriceIndexUpdater {
    type Price = u128;
    type StorageDataUnit = u64;

    fn update_storage_price(
        &self,
        current_price: Self::Price,
        used_capacity: Self::StorageDataUnit,
        total_capacity: Self::StorageDataUnit,
    ) -> Self::Price {
        // Without any capacity in the system the utilisation is undefined, keep the price.
        if total_capacity == 0 {
            return current_price;
        }

        let utilisation = Perbill::from_rational(used_capacity.min(total_capacity), total_capacity);
        self.price_for_utilisation(utilisation)
    }
}
