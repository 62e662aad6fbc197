//! Eligibility of BSPs to volunteer for a storage request.
//!
//! Every BSP gets a pseudorandom value per storage request, derived from the request's seed, the
//! BSP id and the file key. A BSP can volunteer once the request's threshold reaches its value.
//! The threshold starts at a fraction of the maximum proportional to the BSP's share of the
//! global reputation weight (times the number of BSPs required) and grows linearly until it hits
//! the maximum `TickRangeToMaximumThreshold` ticks after the request was issued, when every BSP
//! is eligible.

use crate::types::{hash_concat, FileKey, ProviderId, RandomnessSeed, ReputationWeight, ThresholdType, TickNumber};

/// The value a BSP's threshold has to reach for it to volunteer for `file_key`.
pub fn bsp_volunteer_value(seed: RandomnessSeed, bsp_id: &ProviderId, file_key: &FileKey) -> ThresholdType {
    let hash = hash_concat(&[seed.as_bytes(), bsp_id.as_bytes(), file_key.as_bytes()]);
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&hash.as_bytes()[..4]);
    ThresholdType::from_le_bytes(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolunteerWindow {
    pub starting_threshold: ThresholdType,
    /// Increase of the threshold per tick since the request was issued.
    pub slope: ThresholdType,
}

impl VolunteerWindow {
    pub fn new(
        reputation_weight: ReputationWeight,
        global_reputation_weight: ReputationWeight,
        bsps_required: u32,
        tick_range_to_maximum_threshold: TickNumber,
    ) -> Self {
        let max = u128::from(ThresholdType::MAX);
        let global = u128::from(global_reputation_weight.max(1));

        let starting = (max
            .saturating_mul(u128::from(reputation_weight))
            .saturating_mul(u128::from(bsps_required))
            / global)
            .min(max);

        let range = u128::from(tick_range_to_maximum_threshold.max(1));
        let slope = (max - starting).div_ceil(range);

        Self {
            starting_threshold: ThresholdType::try_from(starting).unwrap_or(ThresholdType::MAX),
            slope: ThresholdType::try_from(slope).unwrap_or(ThresholdType::MAX),
        }
    }

    pub fn threshold_at(&self, ticks_since_issuance: TickNumber) -> ThresholdType {
        let ticks = ThresholdType::try_from(ticks_since_issuance).unwrap_or(ThresholdType::MAX);
        self.starting_threshold
            .saturating_add(self.slope.saturating_mul(ticks))
    }

    /// Ticks after the issuance of the request from which a BSP with `value` is eligible.
    pub fn ticks_until_eligible(&self, value: ThresholdType) -> TickNumber {
        if value <= self.starting_threshold || self.slope == 0 {
            return 0;
        }
        TickNumber::from((value - self.starting_threshold).div_ceil(self.slope))
    }
}

pub fn is_eligible_to_volunteer(
    seed: RandomnessSeed,
    bsp_id: &ProviderId,
    file_key: &FileKey,
    window: &VolunteerWindow,
    ticks_since_issuance: TickNumber,
) -> bool {
    bsp_volunteer_value(seed, bsp_id, file_key) <= window.threshold_at(ticks_since_issuance)
}
