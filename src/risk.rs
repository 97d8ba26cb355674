//! Position sizing and protective-price math
//!
//! Every function here is pure; the supervisor and planner own all state.
//! Percentages are expressed as whole numbers (5.0 = 5%).

use crate::types::Side;

/// Whole-share quantity purchasable with `allocation` at `price`.
///
/// Fractional shares are not issued. Returns 0.0 for a non-positive price;
/// callers validate prices before sizing.
pub fn position_size(allocation: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    (allocation / price).floor()
}

/// Stop-loss price at `pct` percent adverse to the entry
pub fn stop_from_percent(entry: f64, pct: f64, side: Side) -> f64 {
    match side {
        Side::Long => entry * (1.0 - pct / 100.0),
        Side::Short => entry * (1.0 + pct / 100.0),
    }
}

/// Take-profit price at `pct` percent favorable to the entry
pub fn take_from_percent(entry: f64, pct: f64, side: Side) -> f64 {
    match side {
        Side::Long => entry * (1.0 + pct / 100.0),
        Side::Short => entry * (1.0 - pct / 100.0),
    }
}

/// Partial-exit trigger price; favorable direction, like a take-profit
pub fn partial_exit_trigger(entry: f64, pct: f64, side: Side) -> f64 {
    take_from_percent(entry, pct, side)
}

/// Trailing-stop candidate for the current mark.
///
/// The trail arms once the mark has moved `pct` percent in the favorable
/// direction from the fill price; before that the original stop stands.
/// Once armed, the candidate `mark * (1 -/+ pct/100)` is adopted only when
/// it is strictly better than the current stop (higher for long, lower for
/// short). The ratchet never loosens a stop.
pub fn trailing_stop(mark: f64, pct: f64, side: Side, entry: f64, current_stop: f64) -> Option<f64> {
    if mark <= 0.0 || pct <= 0.0 {
        return None;
    }
    match side {
        Side::Long => {
            if mark < entry * (1.0 + pct / 100.0) {
                return None;
            }
            let candidate = mark * (1.0 - pct / 100.0);
            (candidate > current_stop).then_some(candidate)
        }
        Side::Short => {
            if mark > entry * (1.0 - pct / 100.0) {
                return None;
            }
            let candidate = mark * (1.0 + pct / 100.0);
            (candidate < current_stop).then_some(candidate)
        }
    }
}
