//! Tunables of the coordination core.
//!
//! A [`RuntimeConfig`] can be loaded from TOML, every missing field taking its default. During a
//! tick the runtime only reads an immutable snapshot of it. Governance changes arrive as
//! [`RuntimeParameter`]s, which are queued and applied at the start of the next tick.

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use serde::{Deserialize, Deserializer};
use shp_data_price_updater::MostlyStablePriceIndexUpdater;
use shp_treasury_funding::LinearThenPowerOfTwoTreasuryCutCalculator;
use sp_arithmetic::Perbill;
use thiserror::Error;

use crate::types::{AccountId, Balance, StorageData, TickNumber};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("minimum challenge period ({min}) is greater than the checkpoint challenge period ({checkpoint})")]
    ChallengePeriodBounds { min: TickNumber, checkpoint: TickNumber },
    #[error("prices must satisfy min ({min}) <= mostly stable ({stable}) <= max ({max})")]
    PriceBounds {
        min: Balance,
        stable: Balance,
        max: Balance,
    },
    #[error("lower utilisation threshold must be below the upper one")]
    UtilisationThresholds,
    #[error("minimum treasury cut must not exceed the maximum one")]
    TreasuryCutBounds,
    #[error("{0} must be greater than zero")]
    MustBeNonZero(&'static str),
}

/// Reads a whole percentage (0 to 100) into a [`Perbill`].
fn percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Perbill, D::Error> {
    let percent = u32::deserialize(deserializer)?;
    if percent > 100 {
        return Err(serde::de::Error::custom(format!(
            "percentage {percent} is greater than 100"
        )));
    }
    Ok(Perbill::from_percent(percent))
}

fn default_treasury_account() -> AccountId {
    AccountId::new(*b"modlsh/treasury\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Deposit held for the minimum capacity of a provider.
    pub sp_min_deposit: Balance,
    /// Minimum capacity a provider can sign up or change to.
    pub sp_min_capacity: StorageData,
    /// Deposit held for every unit of data above the minimum capacity.
    pub deposit_per_data: Balance,
    pub max_multi_addresses: u32,
    /// Ticks a sign up request can wait for its confirmation.
    pub max_ticks_for_randomness: TickNumber,
    pub min_ticks_between_capacity_changes: TickNumber,
    pub slash_amount_per_max_file_size: Balance,
    /// Grace period a slashed provider has to top up its deposit.
    pub provider_top_up_ttl: TickNumber,
    pub starting_reputation_weight: u32,
    pub bucket_deposit: Balance,
    pub max_buckets_per_msp: u32,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            sp_min_deposit: 100,
            sp_min_capacity: 2,
            deposit_per_data: 2,
            max_multi_addresses: 5,
            max_ticks_for_randomness: 10,
            min_ticks_between_capacity_changes: 10,
            slash_amount_per_max_file_size: 20,
            provider_top_up_ttl: 20,
            starting_reputation_weight: 1,
            bucket_deposit: 10,
            max_buckets_per_msp: 1_000,
        }
    }
}

/// Number of BSPs required by each of the named replication targets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicationTargetsConfig {
    pub basic: u32,
    pub standard: u32,
    pub high_security: u32,
    pub super_high_security: u32,
    pub ultra_high_security: u32,
}

impl Default for ReplicationTargetsConfig {
    fn default() -> Self {
        Self {
            basic: 7,
            standard: 12,
            high_security: 17,
            super_high_security: 22,
            ultra_high_security: 26,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileSystemConfig {
    pub replication_targets: ReplicationTargetsConfig,
    pub max_replication_target: u32,
    pub storage_request_ttl: TickNumber,
    pub max_expired_items_in_tick: u32,
    pub tick_range_to_maximum_threshold: TickNumber,
    pub storage_request_creation_deposit: Balance,
    pub max_file_size: StorageData,
    pub min_wait_for_stop_storing: TickNumber,
    pub bsp_stop_storing_file_penalty: Balance,
    pub move_bucket_request_ttl: TickNumber,
    pub max_file_deletions_per_extrinsic: u32,
    pub max_batch_confirm_storage_requests: u32,
    pub max_peer_ids_per_storage_request: u32,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            replication_targets: ReplicationTargetsConfig::default(),
            max_replication_target: 32,
            storage_request_ttl: 40,
            max_expired_items_in_tick: 10,
            tick_range_to_maximum_threshold: 30,
            storage_request_creation_deposit: 10,
            max_file_size: 2u64.pow(30),
            min_wait_for_stop_storing: 15,
            bsp_stop_storing_file_penalty: 50,
            move_bucket_request_ttl: 20,
            max_file_deletions_per_extrinsic: 10,
            max_batch_confirm_storage_requests: 10,
            max_peer_ids_per_storage_request: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProofsDealerConfig {
    pub challenges_fee: Balance,
    pub random_challenges_per_tick: u32,
    pub max_custom_challenges_per_tick: u32,
    pub challenges_queue_length: u32,
    pub priority_challenges_queue_length: u32,
    /// Number of ticks a challenge seed is kept for.
    pub challenge_history_length: TickNumber,
    pub checkpoint_challenge_period: TickNumber,
    pub min_challenge_period: TickNumber,
    pub challenge_ticks_tolerance: TickNumber,
    pub stake_to_challenge_period: Balance,
}

impl Default for ProofsDealerConfig {
    fn default() -> Self {
        Self {
            challenges_fee: 10,
            random_challenges_per_tick: 4,
            max_custom_challenges_per_tick: 5,
            challenges_queue_length: 20,
            priority_challenges_queue_length: 20,
            challenge_history_length: 40,
            checkpoint_challenge_period: 20,
            min_challenge_period: 4,
            challenge_ticks_tolerance: 5,
            stake_to_challenge_period: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PaymentStreamsConfig {
    /// Ticks of the current rate held as deposit when a stream is opened.
    pub new_stream_deposit: TickNumber,
    pub max_users_to_charge: u32,
    pub zero_size_bucket_fixed_rate: Balance,
    pub mostly_stable_price: Balance,
    pub max_price: Balance,
    pub min_price: Balance,
    pub upper_exponent_factor: u128,
    pub lower_exponent_factor: u128,
    #[serde(deserialize_with = "percent")]
    pub system_utilisation_lower_threshold_percentage: Perbill,
    #[serde(deserialize_with = "percent")]
    pub system_utilisation_upper_threshold_percentage: Perbill,
    #[serde(deserialize_with = "percent")]
    pub ideal_utilisation_rate: Perbill,
    #[serde(deserialize_with = "percent")]
    pub decay_rate: Perbill,
    #[serde(deserialize_with = "percent")]
    pub minimum_treasury_cut: Perbill,
    #[serde(deserialize_with = "percent")]
    pub maximum_treasury_cut: Perbill,
}

impl Default for PaymentStreamsConfig {
    fn default() -> Self {
        Self {
            new_stream_deposit: 10,
            max_users_to_charge: 10,
            zero_size_bucket_fixed_rate: 1,
            mostly_stable_price: 50,
            max_price: 500,
            min_price: 10,
            upper_exponent_factor: 100,
            lower_exponent_factor: 20,
            system_utilisation_lower_threshold_percentage: Perbill::from_percent(30),
            system_utilisation_upper_threshold_percentage: Perbill::from_percent(95),
            ideal_utilisation_rate: Perbill::from_percent(85),
            decay_rate: Perbill::from_percent(5),
            minimum_treasury_cut: Perbill::from_percent(1),
            maximum_treasury_cut: Perbill::from_percent(5),
        }
    }
}

impl PaymentStreamsConfig {
    pub fn price_updater(&self) -> MostlyStablePriceIndexUpdater {
        MostlyStablePriceIndexUpdater {
            lower_threshold: self.system_utilisation_lower_threshold_percentage,
            upper_threshold: self.system_utilisation_upper_threshold_percentage,
            mostly_stable_price: self.mostly_stable_price,
            max_price: self.max_price,
            min_price: self.min_price,
            lower_exponent_factor: self.lower_exponent_factor,
            upper_exponent_factor: self.upper_exponent_factor,
        }
    }

    pub fn treasury_cut_calculator(&self) -> LinearThenPowerOfTwoTreasuryCutCalculator {
        LinearThenPowerOfTwoTreasuryCutCalculator {
            ideal_utilisation_rate: self.ideal_utilisation_rate,
            decay_rate: self.decay_rate,
            minimum_cut: self.minimum_treasury_cut,
            maximum_cut: self.maximum_treasury_cut,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub providers: ProvidersConfig,
    pub file_system: FileSystemConfig,
    pub proofs_dealer: ProofsDealerConfig,
    pub payment_streams: PaymentStreamsConfig,
    /// Receives slashes, penalties, challenge fees and the treasury cut of payments.
    #[serde(skip, default = "default_treasury_account")]
    pub treasury_account: AccountId,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            providers: ProvidersConfig::default(),
            file_system: FileSystemConfig::default(),
            proofs_dealer: ProofsDealerConfig::default(),
            payment_streams: PaymentStreamsConfig::default(),
            treasury_account: default_treasury_account(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn with_treasury_account(mut self, treasury_account: AccountId) -> Self {
        self.treasury_account = treasury_account;
        self
    }

    /// Checks the constraints that span more than one field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dealer = &self.proofs_dealer;
        if dealer.min_challenge_period > dealer.checkpoint_challenge_period {
            return Err(ConfigError::ChallengePeriodBounds {
                min: dealer.min_challenge_period,
                checkpoint: dealer.checkpoint_challenge_period,
            });
        }
        if dealer.min_challenge_period == 0 {
            return Err(ConfigError::MustBeNonZero("min_challenge_period"));
        }
        if dealer.challenge_history_length == 0 {
            return Err(ConfigError::MustBeNonZero("challenge_history_length"));
        }

        let payments = &self.payment_streams;
        if !(payments.min_price <= payments.mostly_stable_price
            && payments.mostly_stable_price <= payments.max_price)
        {
            return Err(ConfigError::PriceBounds {
                min: payments.min_price,
                stable: payments.mostly_stable_price,
                max: payments.max_price,
            });
        }
        if payments.system_utilisation_lower_threshold_percentage
            >= payments.system_utilisation_upper_threshold_percentage
        {
            return Err(ConfigError::UtilisationThresholds);
        }
        if payments.minimum_treasury_cut > payments.maximum_treasury_cut {
            return Err(ConfigError::TreasuryCutBounds);
        }

        let file_system = &self.file_system;
        if file_system.max_replication_target == 0 {
            return Err(ConfigError::MustBeNonZero("max_replication_target"));
        }
        if file_system.max_expired_items_in_tick == 0 {
            return Err(ConfigError::MustBeNonZero("max_expired_items_in_tick"));
        }
        if self.providers.sp_min_capacity == 0 {
            return Err(ConfigError::MustBeNonZero("sp_min_capacity"));
        }

        Ok(())
    }

    pub fn apply(&mut self, parameter: &RuntimeParameter) {
        use RuntimeParameter::*;

        match *parameter {
            SpMinDeposit(value) => self.providers.sp_min_deposit = value,
            DepositPerData(value) => self.providers.deposit_per_data = value,
            SlashAmountPerMaxFileSize(value) => {
                self.providers.slash_amount_per_max_file_size = value
            }
            ProviderTopUpTtl(value) => self.providers.provider_top_up_ttl = value,
            BucketDeposit(value) => self.providers.bucket_deposit = value,
            BasicReplicationTarget(value) => {
                self.file_system.replication_targets.basic = value
            }
            StandardReplicationTarget(value) => {
                self.file_system.replication_targets.standard = value
            }
            HighSecurityReplicationTarget(value) => {
                self.file_system.replication_targets.high_security = value
            }
            SuperHighSecurityReplicationTarget(value) => {
                self.file_system.replication_targets.super_high_security = value
            }
            UltraHighSecurityReplicationTarget(value) => {
                self.file_system.replication_targets.ultra_high_security = value
            }
            MaxReplicationTarget(value) => self.file_system.max_replication_target = value,
            TickRangeToMaximumThreshold(value) => {
                self.file_system.tick_range_to_maximum_threshold = value
            }
            StorageRequestTtl(value) => self.file_system.storage_request_ttl = value,
            MinWaitForStopStoring(value) => self.file_system.min_wait_for_stop_storing = value,
            BspStopStoringFilePenalty(value) => {
                self.file_system.bsp_stop_storing_file_penalty = value
            }
            StakeToChallengePeriod(value) => self.proofs_dealer.stake_to_challenge_period = value,
            CheckpointChallengePeriod(value) => {
                self.proofs_dealer.checkpoint_challenge_period = value
            }
            MinChallengePeriod(value) => self.proofs_dealer.min_challenge_period = value,
            ChallengeTicksTolerance(value) => self.proofs_dealer.challenge_ticks_tolerance = value,
            SystemUtilisationLowerThresholdPercentage(value) => {
                self.payment_streams
                    .system_utilisation_lower_threshold_percentage = value
            }
            SystemUtilisationUpperThresholdPercentage(value) => {
                self.payment_streams
                    .system_utilisation_upper_threshold_percentage = value
            }
            MostlyStablePrice(value) => self.payment_streams.mostly_stable_price = value,
            MaxPrice(value) => self.payment_streams.max_price = value,
            MinPrice(value) => self.payment_streams.min_price = value,
            UpperExponentFactor(value) => self.payment_streams.upper_exponent_factor = value,
            LowerExponentFactor(value) => self.payment_streams.lower_exponent_factor = value,
            ZeroSizeBucketFixedRate(value) => {
                self.payment_streams.zero_size_bucket_fixed_rate = value
            }
            IdealUtilisationRate(value) => self.payment_streams.ideal_utilisation_rate = value,
            DecayRate(value) => self.payment_streams.decay_rate = value,
            MinimumTreasuryCut(value) => self.payment_streams.minimum_treasury_cut = value,
            MaximumTreasuryCut(value) => self.payment_streams.maximum_treasury_cut = value,
        }
    }
}

/// A governance-mutable tunable together with its new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub enum RuntimeParameter {
    SpMinDeposit(Balance),
    DepositPerData(Balance),
    SlashAmountPerMaxFileSize(Balance),
    ProviderTopUpTtl(TickNumber),
    BucketDeposit(Balance),
    BasicReplicationTarget(u32),
    StandardReplicationTarget(u32),
    HighSecurityReplicationTarget(u32),
    SuperHighSecurityReplicationTarget(u32),
    UltraHighSecurityReplicationTarget(u32),
    MaxReplicationTarget(u32),
    TickRangeToMaximumThreshold(TickNumber),
    StorageRequestTtl(TickNumber),
    MinWaitForStopStoring(TickNumber),
    BspStopStoringFilePenalty(Balance),
    StakeToChallengePeriod(Balance),
    CheckpointChallengePeriod(TickNumber),
    MinChallengePeriod(TickNumber),
    ChallengeTicksTolerance(TickNumber),
    SystemUtilisationLowerThresholdPercentage(Perbill),
    SystemUtilisationUpperThresholdPercentage(Perbill),
    MostlyStablePrice(Balance),
    MaxPrice(Balance),
    MinPrice(Balance),
    UpperExponentFactor(u128),
    LowerExponentFactor(u128),
    ZeroSizeBucketFixedRate(Balance),
    IdealUtilisationRate(Perbill),
    DecayRate(Perbill),
    MinimumTreasuryCut(Perbill),
    MaximumTreasuryCut(Perbill),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_fields_take_their_default() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [providers]
            sp_min_deposit = 500

            [payment_streams]
            ideal_utilisation_rate = 70
            "#,
        )
        .unwrap();

        assert_eq!(config.providers.sp_min_deposit, 500);
        assert_eq!(config.providers.deposit_per_data, 2);
        assert_eq!(
            config.payment_streams.ideal_utilisation_rate,
            Perbill::from_percent(70)
        );
        assert_eq!(config.file_system, FileSystemConfig::default());
    }

    #[test]
    fn percentages_above_one_hundred_are_rejected() {
        let result = RuntimeConfig::from_toml_str(
            r#"
            [payment_streams]
            decay_rate = 101
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn cross_field_constraints_are_checked() {
        let result = RuntimeConfig::from_toml_str(
            r#"
            [proofs_dealer]
            min_challenge_period = 30
            checkpoint_challenge_period = 20
            "#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::ChallengePeriodBounds {
                min: 30,
                checkpoint: 20
            })
        ));

        let mut config = RuntimeConfig::default();
        config.apply(&RuntimeParameter::MinPrice(1_000));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PriceBounds { .. })
        ));
    }

    #[test]
    fn parameters_update_their_field() {
        let mut config = RuntimeConfig::default();
        config.apply(&RuntimeParameter::StakeToChallengePeriod(42));
        config.apply(&RuntimeParameter::BasicReplicationTarget(3));
        config.apply(&RuntimeParameter::DecayRate(Perbill::from_percent(10)));

        assert_eq!(config.proofs_dealer.stake_to_challenge_period, 42);
        assert_eq!(config.file_system.replication_targets.basic, 3);
        assert_eq!(config.payment_streams.decay_rate, Perbill::from_percent(10));
    }
}
