use shp_constants::GIGAUNIT;

use crate::{
    error::DispatchError,
    mock::*,
    payment_streams::{Error, Event},
    types::{AccountId, Balance, HoldReason, Origin, ProviderId, StorageData},
};

/// Two gigaunits: at the stable price of 50 this is charged 100 per tick.
const TWO_GIGAUNITS: StorageData = 2 * GIGAUNIT;

/// Alice registered as an MSP with no BSPs in the system, so the price stays stable.
fn setup_msp() -> (Test, ProviderId) {
    let mut rt = new_test_ext();
    let (msp_id, _) = register_msp(&mut rt, &alice());
    (rt, msp_id)
}

fn poor_user(rt: &mut Test, balance: Balance) -> AccountId {
    let who = AccountId::new([7; 32]);
    rt.ledger_mut().deposit_creating(&who, balance);
    who
}

fn stream_deposit(rt: &Test, who: &AccountId) -> Balance {
    held_balance(rt, HoldReason::PaymentStreamDeposit, who)
}

mod fixed_rate_streams {
    use super::*;

    #[test]
    fn create_holds_a_deposit_and_starts_at_the_current_tick() {
        let (mut rt, msp_id) = setup_msp();
        let charlie_before = free_balance(&rt, &charlie());

        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));

        assert_last_event(
            &rt,
            Event::FixedRatePaymentStreamCreated {
                user_account: charlie(),
                provider_id: msp_id,
                rate: 10,
            },
        );
        // NewStreamDeposit is 10 ticks of the rate
        assert_eq!(stream_deposit(&rt, &charlie()), 100);
        assert_eq!(free_balance(&rt, &charlie()), charlie_before - 100);

        let stream = rt
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .get(&(msp_id, charlie()))
            .cloned()
            .unwrap();
        assert_eq!(stream.last_charged_tick, rt.current_tick());
        assert_eq!(stream.outstanding_debt, 0);
        assert!(rt.provider_has_payment_streams(&msp_id));
    }

    #[test]
    fn create_failures() {
        let (mut rt, msp_id) = setup_msp();

        assert_noop!(
            rt,
            rt.create_fixed_rate_payment_stream(Origin::signed(&alice()), msp_id, charlie(), 10),
            DispatchError::BadOrigin
        );
        assert_noop!(
            rt,
            rt.create_fixed_rate_payment_stream(Origin::Root, ProviderId::repeat_byte(9), charlie(), 10),
            Error::NotAProvider
        );
        assert_noop!(
            rt,
            rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 0),
            Error::RateCantBeZero
        );
        assert_noop!(
            rt,
            rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, penniless(), 10),
            Error::CannotHoldDeposit
        );

        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));
        assert_noop!(
            rt,
            rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 20),
            Error::PaymentStreamAlreadyExists
        );
    }

    #[test]
    fn update_charges_the_old_rate_and_resizes_the_deposit() {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));

        roll_to(&mut rt, start + 3);
        assert_ok!(rt.update_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 20));

        assert_has_event(
            &rt,
            Event::PaymentStreamCharged {
                user_account: charlie(),
                provider_id: msp_id,
                amount: 30,
                last_tick_charged: start + 3,
                charged_at_tick: start + 3,
            },
        );
        assert_last_event(
            &rt,
            Event::FixedRatePaymentStreamUpdated {
                user_account: charlie(),
                provider_id: msp_id,
                new_rate: 20,
            },
        );
        assert_eq!(stream_deposit(&rt, &charlie()), 200);

        // Lowering the rate releases part of the deposit
        assert_ok!(rt.update_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 5));
        assert_eq!(stream_deposit(&rt, &charlie()), 50);
    }

    #[test]
    fn update_failures() {
        let (mut rt, msp_id) = setup_msp();

        assert_noop!(
            rt,
            rt.update_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10),
            Error::PaymentStreamNotFound
        );

        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));
        assert_noop!(
            rt,
            rt.update_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10),
            Error::UpdateRateToSameRate
        );
        assert_noop!(
            rt,
            rt.update_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 0),
            Error::RateCantBeZero
        );
        assert_noop!(
            rt,
            rt.update_fixed_rate_payment_stream(Origin::signed(&charlie()), msp_id, charlie(), 20),
            DispatchError::BadOrigin
        );
    }

    #[test]
    fn delete_charges_and_releases_the_deposit() {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        let charlie_before = free_balance(&rt, &charlie());
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));

        roll_to(&mut rt, start + 4);
        assert_ok!(rt.delete_fixed_rate_payment_stream(Origin::Root, msp_id, charlie()));

        assert_last_event(
            &rt,
            Event::FixedRatePaymentStreamDeleted {
                user_account: charlie(),
                provider_id: msp_id,
            },
        );
        assert_eq!(stream_deposit(&rt, &charlie()), 0);
        // Only the 4 ticks of service were paid
        assert_eq!(free_balance(&rt, &charlie()), charlie_before - 40);
        assert!(!rt.provider_has_payment_streams(&msp_id));

        assert_noop!(
            rt,
            rt.delete_fixed_rate_payment_stream(Origin::Root, msp_id, charlie()),
            Error::PaymentStreamNotFound
        );
    }
}

mod dynamic_rate_streams {
    use super::*;

    #[test]
    fn create_update_and_delete() {
        let (mut rt, msp_id) = setup_msp();

        assert_ok!(rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), TWO_GIGAUNITS));
        assert_last_event(
            &rt,
            Event::DynamicRatePaymentStreamCreated {
                user_account: charlie(),
                provider_id: msp_id,
                amount_provided: TWO_GIGAUNITS,
            },
        );
        // 100 per tick at the current price, times NewStreamDeposit
        assert_eq!(stream_deposit(&rt, &charlie()), 1_000);

        assert_ok!(rt.update_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), GIGAUNIT));
        assert_last_event(
            &rt,
            Event::DynamicRatePaymentStreamUpdated {
                user_account: charlie(),
                provider_id: msp_id,
                new_amount_provided: GIGAUNIT,
            },
        );
        assert_eq!(stream_deposit(&rt, &charlie()), 500);

        assert_ok!(rt.delete_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie()));
        assert_last_event(
            &rt,
            Event::DynamicRatePaymentStreamDeleted {
                user_account: charlie(),
                provider_id: msp_id,
            },
        );
        assert_eq!(stream_deposit(&rt, &charlie()), 0);
    }

    #[test]
    fn dynamic_stream_failures() {
        let (mut rt, msp_id) = setup_msp();

        assert_noop!(
            rt,
            rt.create_dynamic_rate_payment_stream(Origin::Root, ProviderId::repeat_byte(9), charlie(), GIGAUNIT),
            Error::NotAProvider
        );
        assert_noop!(
            rt,
            rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), 0),
            Error::AmountProvidedCantBeZero
        );
        assert_noop!(
            rt,
            rt.update_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), GIGAUNIT),
            Error::PaymentStreamNotFound
        );
        assert_noop!(
            rt,
            rt.delete_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie()),
            Error::PaymentStreamNotFound
        );

        assert_ok!(rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), GIGAUNIT));
        assert_noop!(
            rt,
            rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), GIGAUNIT),
            Error::PaymentStreamAlreadyExists
        );
        assert_noop!(
            rt,
            rt.update_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), GIGAUNIT),
            Error::UpdateAmountToSameAmount
        );
        assert_noop!(
            rt,
            rt.update_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), 0),
            Error::AmountProvidedCantBeZero
        );
    }
}

mod charging {
    use super::*;

    #[test]
    fn fixed_rate_charge_is_split_between_provider_and_treasury() {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));

        roll_to(&mut rt, start + 5);
        let alice_before = free_balance(&rt, &alice());
        let treasury_before = free_balance(&rt, &treasury());
        let charlie_before = free_balance(&rt, &charlie());

        assert_ok!(rt.charge_payment_streams(Origin::signed(&alice()), charlie()));

        assert_last_event(
            &rt,
            Event::PaymentStreamCharged {
                user_account: charlie(),
                provider_id: msp_id,
                amount: 50,
                last_tick_charged: start + 5,
                charged_at_tick: start + 5,
            },
        );
        // Paid from the deposit, the free balance of the user is untouched
        assert_eq!(free_balance(&rt, &charlie()), charlie_before);
        assert_eq!(stream_deposit(&rt, &charlie()), 50);

        let provider_gain = free_balance(&rt, &alice()) - alice_before;
        let treasury_gain = free_balance(&rt, &treasury()) - treasury_before;
        assert!(treasury_gain > 0);
        assert_eq!(provider_gain + treasury_gain, 50);

        // Charging again in the same tick charges nothing
        assert_ok!(rt.charge_payment_streams(Origin::signed(&alice()), charlie()));
        assert_eq!(stream_deposit(&rt, &charlie()), 50);
    }

    #[test]
    fn dynamic_rate_charge_follows_the_price_index() {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        let index_before = rt.state.payment_streams.accumulated_price_index;
        assert_ok!(rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), TWO_GIGAUNITS));

        roll_to(&mut rt, start + 5);
        // Without BSPs the utilisation is undefined and the price stays at 50
        assert_eq!(rt.get_current_price_per_giga_unit_per_tick(), 50);
        assert_eq!(
            rt.state.payment_streams.accumulated_price_index,
            index_before + 5 * 50
        );

        assert_ok!(rt.charge_payment_streams(Origin::signed(&alice()), charlie()));

        assert_last_event(
            &rt,
            Event::PaymentStreamCharged {
                user_account: charlie(),
                provider_id: msp_id,
                amount: 500,
                last_tick_charged: start + 5,
                charged_at_tick: start + 5,
            },
        );
        assert_eq!(stream_deposit(&rt, &charlie()), 500);
    }

    #[test]
    fn both_streams_are_charged_together() {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));
        assert_ok!(rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), TWO_GIGAUNITS));

        roll_to(&mut rt, start + 2);
        assert_ok!(rt.charge_payment_streams(Origin::signed(&alice()), charlie()));

        assert_last_event(
            &rt,
            Event::PaymentStreamCharged {
                user_account: charlie(),
                provider_id: msp_id,
                amount: 20 + 200,
                last_tick_charged: start + 2,
                charged_at_tick: start + 2,
            },
        );
    }

    #[test]
    fn bsps_charge_up_to_their_last_chargeable_tick() {
        let mut rt = new_test_ext();
        let bsp_id = register_bsp(&mut rt, &bob());
        assert_ok!(rt.create_dynamic_rate_payment_stream(Origin::Root, bsp_id, charlie(), TWO_GIGAUNITS));
        let stream_index = rt
            .state
            .payment_streams
            .dynamic_rate_payment_streams
            .get(&(bsp_id, charlie()))
            .map(|stream| stream.price_index_when_last_charged)
            .unwrap();

        let signed_up_at = rt.current_tick();
        roll_to(&mut rt, signed_up_at + 5);

        // Nothing was proven since the sign up, so nothing can be charged
        assert_ok!(rt.charge_payment_streams(Origin::signed(&bob()), charlie()));
        assert!(matches!(
            last_event(&rt),
            crate::events::Event::PaymentStreams(Event::PaymentStreamCharged { amount: 0, .. })
        ));

        let tick = rt.current_tick();
        let index = rt.state.payment_streams.accumulated_price_index;
        assert_ok!(rt.update_last_chargeable_info(bsp_id, tick, index));
        assert_last_event(
            &rt,
            Event::LastChargeableInfoUpdated {
                provider_id: bsp_id,
                last_chargeable_tick: tick,
                last_chargeable_price_index: index,
            },
        );

        assert_ok!(rt.charge_payment_streams(Origin::signed(&bob()), charlie()));
        let expected =
            Balance::from(TWO_GIGAUNITS) * (index - stream_index) / Balance::from(GIGAUNIT);
        assert!(expected > 0);
        assert_last_event(
            &rt,
            Event::PaymentStreamCharged {
                user_account: charlie(),
                provider_id: bsp_id,
                amount: expected,
                last_tick_charged: tick,
                charged_at_tick: tick,
            },
        );
    }

    #[test]
    fn last_chargeable_info_only_moves_forward() {
        let mut rt = new_test_ext();
        let bsp_id = register_bsp(&mut rt, &bob());
        let signed_up_at = rt.current_tick();
        roll_to(&mut rt, signed_up_at + 3);
        let tick = rt.current_tick();
        let index = rt.state.payment_streams.accumulated_price_index;

        assert_eq!(
            rt.update_last_chargeable_info(bsp_id, tick + 1, index),
            Err(Error::InvalidLastChargeableBlockNumber.into())
        );

        assert_ok!(rt.update_last_chargeable_info(bsp_id, tick, index));
        assert_eq!(
            rt.update_last_chargeable_info(bsp_id, tick - 1, index),
            Err(Error::InvalidLastChargeableBlockNumber.into())
        );
        assert_eq!(
            rt.update_last_chargeable_info(bsp_id, tick, index - 1),
            Err(Error::InvalidLastChargeablePriceIndex.into())
        );
    }

    #[test]
    fn charge_failures() {
        let (mut rt, msp_id) = setup_msp();

        assert_noop!(
            rt,
            rt.charge_payment_streams(Origin::signed(&charlie()), dave()),
            Error::NotAProvider
        );
        assert_noop!(
            rt,
            rt.charge_payment_streams(Origin::signed(&alice()), dave()),
            Error::PaymentStreamNotFound
        );
        assert_noop!(
            rt,
            rt.charge_payment_streams(Origin::Root, dave()),
            DispatchError::BadOrigin
        );

        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));
        let too_many: Vec<AccountId> = (0..11u8).map(|i| AccountId::new([i; 32])).collect();
        assert_noop!(
            rt,
            rt.charge_multiple_users_payment_streams(Origin::signed(&alice()), too_many),
            Error::TooManyUsersToCharge
        );
    }

    #[test]
    fn charge_multiple_users() {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, dave(), 2));

        roll_to(&mut rt, start + 3);
        assert_ok!(rt.charge_multiple_users_payment_streams(
            Origin::signed(&alice()),
            vec![charlie(), dave()]
        ));

        assert_has_event(
            &rt,
            Event::PaymentStreamCharged {
                user_account: dave(),
                provider_id: msp_id,
                amount: 6,
                last_tick_charged: start + 3,
                charged_at_tick: start + 3,
            },
        );
        assert_last_event(
            &rt,
            Event::UsersCharged {
                user_accounts: vec![charlie(), dave()],
                provider_id: msp_id,
                charged_at_tick: start + 3,
            },
        );

        // A failed charge reverts the whole batch
        assert_noop!(
            rt,
            rt.charge_multiple_users_payment_streams(Origin::signed(&alice()), vec![charlie(), eve()]),
            Error::PaymentStreamNotFound
        );
    }
}

mod debt {
    use super::*;

    /// A user with 150 and a stream of rate 10 to Alice's MSP, charged after 20 ticks.
    fn setup_user_in_debt() -> (Test, ProviderId, AccountId) {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        let user = poor_user(&mut rt, 150);
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, user.clone(), 10));

        roll_to(&mut rt, start + 20);
        assert_ok!(rt.charge_payment_streams(Origin::signed(&alice()), user.clone()));

        (rt, msp_id, user)
    }

    #[test]
    fn unpaid_charges_become_debt() {
        let (rt, msp_id, user) = setup_user_in_debt();
        let tick = rt.current_tick();

        // 200 charged: 100 from the deposit, 50 from the free balance, 50 left as debt
        assert_has_event(
            &rt,
            Event::UserWithoutFunds {
                who: user.clone(),
                out_of_funds_tick: tick,
            },
        );
        assert_last_event(
            &rt,
            Event::PaymentStreamCharged {
                user_account: user.clone(),
                provider_id: msp_id,
                amount: 150,
                last_tick_charged: tick,
                charged_at_tick: tick,
            },
        );
        assert!(rt.is_user_without_funds(&user));
        assert_eq!(free_balance(&rt, &user), 0);
        assert_eq!(stream_deposit(&rt, &user), 0);

        let stream = rt
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .get(&(msp_id, user.clone()))
            .cloned()
            .unwrap();
        assert_eq!(stream.outstanding_debt, 50);
        assert_eq!(stream.out_of_funds_tick, Some(tick));
    }

    #[test]
    fn users_without_funds_get_no_more_service() {
        let (mut rt, msp_id, user) = setup_user_in_debt();
        rt.ledger_mut().deposit_creating(&user, 1_000);

        assert_noop!(
            rt,
            rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, user.clone(), GIGAUNIT),
            Error::UserWithoutFunds
        );
        assert_noop!(
            rt,
            rt.update_fixed_rate_payment_stream(Origin::Root, msp_id, user.clone(), 20),
            Error::UserWithoutFunds
        );
        // Less service is always allowed
        assert_ok!(rt.update_fixed_rate_payment_stream(Origin::Root, msp_id, user.clone(), 5));
    }

    #[test]
    fn paying_all_debt_makes_the_user_solvent() {
        let (mut rt, msp_id, user) = setup_user_in_debt();
        rt.ledger_mut().deposit_creating(&user, 100);
        let alice_before = free_balance(&rt, &alice());
        let treasury_before = free_balance(&rt, &treasury());

        assert_ok!(rt.pay_outstanding_debt(Origin::signed(&user), vec![msp_id]));

        assert_has_event(&rt, Event::UserPaidAllDebts { who: user.clone() });
        assert_last_event(&rt, Event::UserSolvent { who: user.clone() });
        assert!(!rt.is_user_without_funds(&user));
        assert_eq!(free_balance(&rt, &user), 50);
        assert_eq!(
            free_balance(&rt, &alice()) - alice_before + free_balance(&rt, &treasury())
                - treasury_before,
            50
        );

        let stream = rt
            .state
            .payment_streams
            .fixed_rate_payment_streams
            .get(&(msp_id, user.clone()))
            .cloned()
            .unwrap();
        assert_eq!(stream.outstanding_debt, 0);
        assert_eq!(stream.out_of_funds_tick, None);
    }

    #[test]
    fn paying_part_of_the_debt() {
        let (mut rt, msp_id, user) = setup_user_in_debt();
        rt.ledger_mut().deposit_creating(&user, 20);

        assert_ok!(rt.pay_outstanding_debt(Origin::signed(&user), vec![msp_id]));

        assert_last_event(&rt, Event::UserPaidSomeDebts { who: user.clone() });
        assert!(rt.is_user_without_funds(&user));
        assert_eq!(
            rt.state
                .payment_streams
                .fixed_rate_payment_streams
                .get(&(msp_id, user))
                .map(|stream| stream.outstanding_debt),
            Some(30)
        );
    }

    #[test]
    fn no_debt_to_pay() {
        let (mut rt, msp_id) = setup_msp();
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));

        assert_noop!(
            rt,
            rt.pay_outstanding_debt(Origin::signed(&charlie()), vec![msp_id]),
            Error::NoDebtToPay
        );
    }

    #[test]
    fn debt_is_forgiven_when_the_streams_of_a_provider_are_removed() {
        let (mut rt, msp_id, user) = setup_user_in_debt();

        assert_ok!(rt.remove_payment_streams_of_provider(msp_id));

        assert_has_event(&rt, Event::UserSolvent { who: user.clone() });
        assert_last_event(
            &rt,
            Event::FixedRatePaymentStreamDeleted {
                user_account: user.clone(),
                provider_id: msp_id,
            },
        );
        assert!(!rt.is_user_without_funds(&user));
        assert!(!rt.provider_has_payment_streams(&msp_id));
    }
}

mod queries {
    use super::*;

    #[test]
    fn users_of_a_provider() {
        let (mut rt, msp_id) = setup_msp();
        assert!(rt.get_users_of_payment_streams_of_provider(&msp_id).is_empty());

        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, dave(), 1));
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 1));
        assert_ok!(rt.create_dynamic_rate_payment_stream(Origin::Root, msp_id, charlie(), GIGAUNIT));

        let mut expected = vec![charlie(), dave()];
        expected.sort();
        assert_eq!(rt.get_users_of_payment_streams_of_provider(&msp_id), expected);
    }

    #[test]
    fn users_with_debt_over_threshold() {
        let (mut rt, msp_id) = setup_msp();
        let start = rt.current_tick();
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, charlie(), 10));
        assert_ok!(rt.create_fixed_rate_payment_stream(Origin::Root, msp_id, dave(), 1));

        roll_to(&mut rt, start + 5);

        // Charlie owes 50 and Dave 5
        assert_eq!(
            rt.get_users_with_debt_over_threshold(&msp_id, 10),
            Ok(vec![charlie()])
        );
        assert_eq!(rt.get_users_with_debt_over_threshold(&msp_id, 50), Ok(vec![]));

        assert_ok!(rt.charge_payment_streams(Origin::signed(&alice()), charlie()));
        assert_eq!(rt.get_users_with_debt_over_threshold(&msp_id, 1), Ok(vec![dave()]));
    }

    #[test]
    fn price_drops_when_bsps_are_underused() {
        let mut rt = new_test_ext();
        assert_eq!(rt.get_current_price_per_giga_unit_per_tick(), 50);

        register_bsp(&mut rt, &bob());
        roll_one_tick(&mut rt);

        let price = rt.get_current_price_per_giga_unit_per_tick();
        assert!(price < 50);
        assert!(price >= 10);
    }
}
