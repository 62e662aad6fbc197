#![cfg_attr(not(feature = "std"), no_std)]

//! Functions to calculate the amount of tokens that will be transferred to the treasury from
//! each charge of a payment stream.

use shp_traits::TreasuryCutCalculator;
use sp_arithmetic::{
    traits::{One, Saturating, Zero},
    FixedPointNumber, FixedU128, PerThing, Perbill,
};

const LOG_TARGET: &str = "treasury-funding";

/// `2^(-1 / 2^i)` for `i` in `1..=20`, as inner values of a [`FixedU128`].
const INV_POW2_ROOTS: [u128; 20] = [
    707_106_781_186_547_524,
    840_896_415_253_714_543,
    917_004_043_204_671_231,
    957_603_280_698_573_646,
    978_572_062_087_700_134,
    989_228_013_193_975_484,
    994_599_423_483_633_175,
    997_296_056_085_470_126,
    998_647_112_890_970_173,
    999_323_327_502_650_752,
    999_661_606_496_243_683,
    999_830_788_931_929_063,
    999_915_390_886_613_497,
    999_957_694_548_431_132,
    999_978_847_050_491_929,
    999_989_423_469_314_464,
    999_994_711_720_674_283,
    999_997_355_856_841_394,
    999_998_677_927_546_759,
    999_999_338_963_554_895,
];

/// A calculator where the cut is always 0%.
pub struct NoCutTreasuryCutCalculator;

impl TreasuryCutCalculator for NoCutTreasuryCutCalculator {
    type Balance = u128;
    type ProvidedUnit = u64;

    fn calculate_treasury_cut(
        &self,
        _provided_amount: Self::ProvidedUnit,
        _used_amount: Self::ProvidedUnit,
        _amount_to_charge: Self::Balance,
    ) -> Self::Balance {
        0
    }
}

/// A calculator where the cut is determined by [`compute_adjustment_over_minimum_cut`].
///
/// ```ignore
/// treasury_cut = minimum_cut + (maximum_cut - minimum_cut) * adjustment(x)
///
/// adjustment(x) = {
///     for x between 0 and x_ideal: 1 - x / x_ideal,
///     for x between x_ideal and 1: 1 - 2^((x_ideal - x) / d)
/// }
/// ```
///
/// where `x` is the fraction of the provided capacity currently used, `x_ideal` is the
/// `ideal_utilisation_rate` and `d` is the `decay_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearThenPowerOfTwoTreasuryCutCalculator {
    pub ideal_utilisation_rate: Perbill,
    /// Must be at least 1%, otherwise the adjustment above the ideal rate is zero.
    pub decay_rate: Perbill,
    pub minimum_cut: Perbill,
    pub maximum_cut: Perbill,
}

impl LinearThenPowerOfTwoTreasuryCutCalculator {
    /// Percentage of the charged amount that goes to the treasury at the given utilisation.
    pub fn treasury_cut(&self, provided_amount: u64, used_amount: u64) -> Perbill {
        let system_utilisation = if provided_amount == 0 {
            Perbill::zero()
        } else {
            Perbill::from_rational(used_amount, provided_amount)
        };
        let adjustment = compute_adjustment_over_minimum_cut(
            system_utilisation,
            self.ideal_utilisation_rate,
            self.decay_rate,
        );
        let delta_cut = self.maximum_cut.saturating_sub(self.minimum_cut);
        self.minimum_cut.saturating_add(delta_cut * adjustment)
    }
}

impl TreasuryCutCalculator for LinearThenPowerOfTwoTreasuryCutCalculator {
    type Balance = u128;
    type ProvidedUnit = u64;

    fn calculate_treasury_cut(
        &self,
        provided_amount: Self::ProvidedUnit,
        used_amount: Self::ProvidedUnit,
        amount_to_charge: Self::Balance,
    ) -> Self::Balance {
        self.treasury_cut(provided_amount, used_amount)
            .mul_floor(amount_to_charge)
    }
}

/// Fraction of the delta between minimum and maximum cut that is added to the minimum cut.
///
/// Below the ideal utilisation the adjustment decreases linearly from 1 to 0. Above it, the
/// adjustment grows towards 1 at a speed given by `falloff`.
pub fn compute_adjustment_over_minimum_cut(
    system_utilisation: Perbill,
    ideal_system_utilisation: Perbill,
    falloff: Perbill,
) -> Perbill {
    if system_utilisation < ideal_system_utilisation {
        // ideal_system_utilisation > 0 since it is strictly greater than system_utilisation.
        return (system_utilisation / ideal_system_utilisation).left_from_one();
    }

    if system_utilisation == ideal_system_utilisation {
        return Perbill::zero();
    }

    if falloff < Perbill::from_percent(1) {
        log::error!(
            target: LOG_TARGET,
            "Invalid treasury cut calculation: falloff less than 1% is not supported"
        );
        return Perbill::zero();
    }

    let exponent = FixedU128::saturating_from_rational(
        (system_utilisation.deconstruct() - ideal_system_utilisation.deconstruct()) as u128,
        falloff.deconstruct() as u128,
    );
    let decay = inverse_power_of_two(exponent);

    // 1 - 2^(-exponent), with the decay converted back to parts per billion.
    let decay_parts = decay
        .saturating_mul_int(Perbill::ACCURACY as u128)
        .min(Perbill::ACCURACY as u128);
    Perbill::from_parts(Perbill::ACCURACY - decay_parts as u32)
}

/// Computes `2^(-y)`.
///
/// The integer part of `y` is applied as a right shift, and each binary digit of the
/// fractional part multiplies the result by the matching root in [`INV_POW2_ROOTS`].
pub fn inverse_power_of_two(y: FixedU128) -> FixedU128 {
    let whole = y.into_inner() / FixedU128::accuracy();
    if whole >= 64 {
        return FixedU128::zero();
    }

    let mut result = FixedU128::from_inner(FixedU128::accuracy() >> whole);
    let mut frac = y.frac();

    for root in INV_POW2_ROOTS {
        if frac.is_zero() {
            break;
        }
        frac = frac.saturating_mul(FixedU128::saturating_from_integer(2u32));
        if frac >= FixedU128::one() {
            result = result.saturating_mul(FixedU128::from_inner(root));
            frac = frac.frac();
        }
    }

    result
}
