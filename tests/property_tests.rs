//! Property tests for the risk calculator
//!
//! The supervisor trusts these functions blindly, so their invariants get
//! hammered across the input space rather than spot-checked.

use proptest::prelude::*;

use trade_sentinel::risk;
use trade_sentinel::Side;

proptest! {
    /// Sizing never spends more than the allocation and never strands a
    /// whole affordable share.
    #[test]
    fn sizing_is_floor_division(
        allocation in 1.0f64..1_000_000.0,
        price in 0.01f64..100_000.0,
    ) {
        let qty = risk::position_size(allocation, price);
        prop_assert!(qty >= 0.0);
        prop_assert_eq!(qty.fract(), 0.0);
        prop_assert!(qty * price <= allocation * (1.0 + 1e-12));
        prop_assert!((qty + 1.0) * price > allocation * (1.0 - 1e-12));
    }

    /// Stop and take always bracket the entry in the profitable direction
    #[test]
    fn protective_prices_bracket_the_entry(
        entry in 0.01f64..100_000.0,
        stop_pct in 0.01f64..99.9,
        take_pct in 0.01f64..500.0,
    ) {
        let long_stop = risk::stop_from_percent(entry, stop_pct, Side::Long);
        let long_take = risk::take_from_percent(entry, take_pct, Side::Long);
        prop_assert!(long_stop < entry);
        prop_assert!(long_take > entry);

        let short_stop = risk::stop_from_percent(entry, stop_pct, Side::Short);
        let short_take = risk::take_from_percent(entry, take_pct, Side::Short);
        prop_assert!(short_stop > entry);
        prop_assert!(short_take < entry);
    }

    /// For any mark trajectory the trailing stop never decreases on a long
    /// position and never increases on a short.
    #[test]
    fn trailing_ratchet_is_monotonic(
        entry in 1.0f64..10_000.0,
        pct in 0.1f64..50.0,
        moves in prop::collection::vec(-0.2f64..0.2, 1..50),
    ) {
        let initial_long = risk::stop_from_percent(entry, pct, Side::Long);
        let initial_short = risk::stop_from_percent(entry, pct, Side::Short);

        let mut mark = entry;
        let mut long_stop = initial_long;
        let mut short_stop = initial_short;

        for step in moves {
            mark = (mark * (1.0 + step)).max(0.01);

            if let Some(next) = risk::trailing_stop(mark, pct, Side::Long, entry, long_stop) {
                prop_assert!(next > long_stop);
                long_stop = next;
            }
            if let Some(next) = risk::trailing_stop(mark, pct, Side::Short, entry, short_stop) {
                prop_assert!(next < short_stop);
                short_stop = next;
            }
        }

        prop_assert!(long_stop >= initial_long);
        prop_assert!(short_stop <= initial_short);
    }

    /// An adopted trailing stop always stays the trail distance away from
    /// the mark that produced it, and only fires once armed.
    #[test]
    fn trailing_candidate_tracks_the_mark(
        entry in 1.0f64..10_000.0,
        pct in 0.1f64..50.0,
        ratio in 0.5f64..3.0,
    ) {
        let mark = entry * ratio;
        let current = risk::stop_from_percent(entry, pct, Side::Long);

        match risk::trailing_stop(mark, pct, Side::Long, entry, current) {
            Some(stop) => {
                prop_assert!(mark >= entry * (1.0 + pct / 100.0));
                prop_assert!((stop - mark * (1.0 - pct / 100.0)).abs() < 1e-9);
                prop_assert!(stop > current);
            }
            None => {
                let armed = mark >= entry * (1.0 + pct / 100.0);
                let candidate = mark * (1.0 - pct / 100.0);
                prop_assert!(!armed || candidate <= current);
            }
        }
    }
}
