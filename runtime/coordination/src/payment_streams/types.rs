//! Various types to use in the Payment Streams module.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use crate::types::{Balance, PriceIndex, StorageData, TickNumber};

/// A payment stream with a fixed rate per tick, used to bill users for the buckets an MSP stores.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct FixedRatePaymentStream {
    pub rate: Balance,
    pub last_charged_tick: TickNumber,
    /// Part of the user's held payment stream deposit backing this stream.
    pub user_deposit: Balance,
    /// First tick in which a charge of this stream could not be paid in full.
    pub out_of_funds_tick: Option<TickNumber>,
    pub outstanding_debt: Balance,
}

/// A payment stream whose charge follows the accumulated price index, used to bill users for
/// the data BSPs store for them.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone)]
pub struct DynamicRatePaymentStream {
    /// Bytes provided to the user.
    pub amount_provided: StorageData,
    pub price_index_when_last_charged: PriceIndex,
    pub last_charged_tick: TickNumber,
    pub user_deposit: Balance,
    pub out_of_funds_tick: Option<TickNumber>,
    pub outstanding_debt: Balance,
}

/// Up to where a provider can charge its users.
///
/// MSPs advance it every tick. BSPs advance it by submitting proofs of storage, so they can't
/// charge for periods they have not proven.
#[derive(Encode, Decode, TypeInfo, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct ProviderLastChargeableInfo {
    pub last_chargeable_tick: TickNumber,
    pub price_index: PriceIndex,
}
