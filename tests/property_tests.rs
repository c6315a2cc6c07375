//! Property-based tests for the core math.
//!
//! These tests verify invariants hold under random inputs.

use margin_engine::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $0.01 to $10,000
}

fn size_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..100_000i64).prop_map(|x| Decimal::new(x, 2)) // 0.01 to 1,000
}

fn leverage_strategy() -> impl Strategy<Value = u32> {
    1u32..=100u32
}

fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2))
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

const RATE: Decimal = dec!(0.005);

proptest! {
    /// PnL is zero when the exit price equals the open price
    #[test]
    fn pnl_zero_at_open(
        side in side_strategy(),
        size in size_strategy(),
        open in price_strategy(),
    ) {
        let price = Price::new_unchecked(open);
        let pnl = calculate_pnl(side, Size::new_unchecked(size), price, price);
        prop_assert!(pnl.is_zero());
    }

    /// A long and a short of the same size mirror each other
    #[test]
    fn pnl_long_short_mirror(
        size in size_strategy(),
        open in price_strategy(),
        exit in price_strategy(),
    ) {
        let size = Size::new_unchecked(size);
        let long = calculate_pnl(Side::Buy, size, Price::new_unchecked(open), Price::new_unchecked(exit));
        let short = calculate_pnl(Side::Sell, size, Price::new_unchecked(open), Price::new_unchecked(exit));
        prop_assert_eq!(long.value(), -short.value());

        if exit > open {
            prop_assert!(long.is_positive(), "long should profit when price rises");
        }
    }

    /// At the liquidation price, equity equals the maintenance margin
    #[test]
    fn equity_at_liquidation_price_is_maintenance(
        side in side_strategy(),
        size in size_strategy(),
        open in price_strategy(),
        leverage in leverage_strategy(),
    ) {
        let size = Size::new_unchecked(size);
        let open = Price::new_unchecked(open);
        let margin = Leverage::new(leverage).unwrap().margin_for(size.notional(open));
        let liq = calculate_liquidation_price(side, size, open, margin, RATE);

        // longs floored at zero never reach maintenance
        prop_assume!(liq > Decimal::ZERO);

        let equity = margin.value() + (liq - open.value()) * size.value() * side.sign();
        let maintenance = size.value() * open.value() * RATE;
        prop_assert!((equity - maintenance).abs() < dec!(0.000001), "equity {} vs maintenance {}", equity, maintenance);
    }

    /// Liquidation sits on the losing side of the open price
    #[test]
    fn liquidation_price_on_losing_side(
        side in side_strategy(),
        size in size_strategy(),
        open in price_strategy(),
        leverage in 1u32..=100u32,
    ) {
        let size = Size::new_unchecked(size);
        let open = Price::new_unchecked(open);
        let margin = Leverage::new(leverage).unwrap().margin_for(size.notional(open));
        let liq = calculate_liquidation_price(side, size, open, margin, RATE);

        match side {
            Side::Buy => prop_assert!(liq < open.value() && liq >= Decimal::ZERO),
            Side::Sell => prop_assert!(liq > open.value()),
        }
    }

    /// Higher leverage never moves the liquidation price further away
    #[test]
    fn more_leverage_liquidates_sooner(
        side in side_strategy(),
        size in size_strategy(),
        open in price_strategy(),
        low in 1u32..50u32,
        extra in 1u32..50u32,
    ) {
        let size = Size::new_unchecked(size);
        let open = Price::new_unchecked(open);
        let liq_at = |lev: u32| {
            let margin = Leverage::new(lev).unwrap().margin_for(size.notional(open));
            calculate_liquidation_price(side, size, open, margin, RATE)
        };
        let (safe, risky) = (liq_at(low), liq_at(low + extra));

        match side {
            Side::Buy => prop_assert!(risky >= safe),
            Side::Sell => prop_assert!(risky <= safe),
        }
    }

    /// Locking and releasing the same amount with no pnl restores the balance exactly
    #[test]
    fn lock_release_round_trip(
        deposit in (1i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2)),
        fraction in 0u32..=100u32,
    ) {
        let user = UserId::from("u");
        let mut ledger = BalanceLedger::new();
        let now = Timestamp::from_millis(1);
        ledger.deposit(&user, Quote::new(deposit), now).unwrap();

        let amount = Quote::new(deposit * Decimal::from(fraction) / dec!(100));
        ledger.lock_margin(&user, amount, now).unwrap();
        let locked = ledger.balance(&user).unwrap().clone();
        prop_assert_eq!(locked.available.add(locked.locked), Quote::new(deposit));

        let release = ledger.release_margin(&user, amount, Quote::zero(), now);
        prop_assert_eq!(release.released, amount);

        let after = ledger.balance(&user).unwrap();
        prop_assert_eq!(after.available, Quote::new(deposit));
        prop_assert!(after.locked.is_zero());
        prop_assert!(after.total.is_zero());
    }

    /// A lock larger than available fails and changes nothing
    #[test]
    fn over_lock_is_all_or_nothing(
        deposit in amount_strategy(),
        excess in (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)),
    ) {
        let user = UserId::from("u");
        let mut ledger = BalanceLedger::new();
        let now = Timestamp::from_millis(1);
        ledger.initialize(&user, Quote::new(deposit), now).unwrap();
        let before = ledger.balance(&user).unwrap().clone();

        let result = ledger.lock_margin(&user, Quote::new(deposit + excess), now);
        let is_insufficient = matches!(result, Err(LedgerError::InsufficientBalance { .. }));
        prop_assert!(is_insufficient);
        prop_assert_eq!(ledger.balance(&user).unwrap(), &before);
    }

    /// Release never leaves available negative and books any shortfall as bad debt
    #[test]
    fn release_floors_available_and_tracks_bad_debt(
        free in amount_strategy(),
        margin in amount_strategy(),
        pnl in (-20_000_000i64..20_000_000i64).prop_map(|x| Decimal::new(x, 2)),
    ) {
        let user = UserId::from("u");
        let mut ledger = BalanceLedger::new();
        let now = Timestamp::from_millis(1);
        ledger.initialize(&user, Quote::new(free + margin), now).unwrap();
        ledger.lock_margin(&user, Quote::new(margin), now).unwrap();

        let release = ledger.release_margin(&user, Quote::new(margin), Quote::new(pnl), now);
        let after = ledger.balance(&user).unwrap();

        prop_assert!(!after.available.is_negative());
        prop_assert!(!release.bad_debt.is_negative());
        prop_assert_eq!(after.available.value() - release.bad_debt.value(), free + margin + pnl);
        prop_assert_eq!(after.total, release.credited_pnl);
        prop_assert_eq!(ledger.total_bad_debt(), release.bad_debt);
    }

    /// Buy limits fill at or below the limit, sell limits at or above
    #[test]
    fn limit_cross_direction(
        side in side_strategy(),
        limit in price_strategy(),
        price in price_strategy(),
    ) {
        let order = Order::new_limit(
            OrderId::from("o"),
            UserId::from("u"),
            Symbol::from("BTC"),
            side,
            Size::new_unchecked(dec!(1)),
            Leverage::new(1).unwrap(),
            Price::new_unchecked(limit),
            Timestamp::from_millis(1),
        );
        let expected = match side {
            Side::Buy => price <= limit,
            Side::Sell => price >= limit,
        };
        prop_assert_eq!(order.crosses(Price::new_unchecked(price)), expected);
    }
}
