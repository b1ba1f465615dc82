//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round to tick size (e.g., 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).round() * tick_size
}

/// Round down to lot size (quantity quantization).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Relative bid-ask spread: `(ask - bid) / ask`.
pub fn relative_spread(bid: Decimal, ask: Decimal) -> Decimal {
    if ask == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (ask - bid) / ask
}

/// Safe division that returns zero if the divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Clamp a value into `[0, 1]`.
pub fn clamp_unit(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO).min(Decimal::ONE)
}

/// Convert a multiplicative cycle rate into a profit percentage.
pub fn rate_to_profit_pct(rate: Decimal) -> Decimal {
    (rate - Decimal::ONE) * dec!(100)
}
