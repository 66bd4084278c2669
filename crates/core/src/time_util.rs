//! Minimal-increment arithmetic on instants.

use crate::Timestamp;

/// The smallest instant strictly after `t`: one microsecond later.
///
/// `None` when `t` is already the largest representable instant.
pub fn next_instant(t: Timestamp) -> Option<Timestamp> {
    t.as_micros().checked_add(1).map(Timestamp::from_micros)
}

/// The float-seconds counterpart of [`next_instant`], for hosts whose
/// instants are stored as `f64` seconds.
///
/// Adds one microsecond; when the magnitude of `t` is too large for that to
/// change the value, steps to the next representable double instead.
pub fn next_float_instant(t: f64) -> f64 {
    let next = t + 1e-6;
    if next != t {
        return next;
    }
    next_up(t)
}

// `f64::next_up` equivalent for finite values.
fn next_up(t: f64) -> f64 {
    if t.is_nan() || t == f64::INFINITY {
        return t;
    }
    if t == 0.0 {
        return f64::from_bits(1);
    }
    let bits = t.to_bits();
    if t > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}
