//! Numeric corrections applied to computed slots during evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest magnitude a slot may hold when clipping is enabled.
pub const CLIP_BOUND: f64 = 1e38;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericPolicy {
    pub clip_large_nums: bool,
    pub nans_to_zeros: bool,
    pub log_corrections: bool,
}

impl Default for NumericPolicy {
    fn default() -> Self {
        Self {
            clip_large_nums: true,
            nans_to_zeros: true,
            log_corrections: true,
        }
    }
}

/// What a policy did to a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    NanToZero,
    /// An infinity replaced by the signed bound.
    InfToBound(f64),
    /// A finite value beyond the bound; carries the value before clipping.
    Clipped(f64),
}

impl Correction {
    /// Human-readable description for the value named `name` at time `t`.
    pub fn describe(&self, name: &str, t: f64) -> String {
        match self {
            Correction::NanToZero => format!("{} is NaN at time {}; replaced with 0", name, t),
            Correction::InfToBound(v) => {
                format!("{} is {} at time {}; replaced with {:e}", name, v, t, CLIP_BOUND.copysign(*v))
            }
            Correction::Clipped(v) => {
                format!("{} = {:e} at time {} exceeds {:e}; clipped", name, v, t, CLIP_BOUND)
            }
        }
    }
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Correction::NanToZero => f.write_str("nan -> 0"),
            Correction::InfToBound(v) => write!(f, "{} -> {:e}", v, CLIP_BOUND.copysign(*v)),
            Correction::Clipped(v) => write!(f, "{:e} -> {:e}", v, CLIP_BOUND.copysign(*v)),
        }
    }
}

impl NumericPolicy {
    /// Returns the corrected value and the correction made, if any.
    #[inline]
    pub fn apply(&self, value: f64) -> (f64, Option<Correction>) {
        if value.is_nan() {
            if self.nans_to_zeros {
                return (0.0, Some(Correction::NanToZero));
            }
            return (value, None);
        }
        if value.is_infinite() {
            if self.nans_to_zeros || self.clip_large_nums {
                return (CLIP_BOUND.copysign(value), Some(Correction::InfToBound(value)));
            }
            return (value, None);
        }
        if self.clip_large_nums && value.abs() > CLIP_BOUND {
            return (CLIP_BOUND.copysign(value), Some(Correction::Clipped(value)));
        }
        (value, None)
    }

    /// Corrects an incoming state vector in place and returns how many values
    /// were clipped and how many NaNs were zeroed.
    pub fn correct_state(&self, y: &mut [f64]) -> (usize, usize) {
        let (mut clipped, mut zeroed) = (0, 0);
        for v in y.iter_mut() {
            if v.is_nan() {
                if self.nans_to_zeros {
                    *v = 0.0;
                    zeroed += 1;
                }
            } else if self.clip_large_nums && v.abs() > CLIP_BOUND {
                *v = CLIP_BOUND.copysign(*v);
                clipped += 1;
            }
        }
        (clipped, zeroed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(clip: bool, zeros: bool) -> NumericPolicy {
        NumericPolicy { clip_large_nums: clip, nans_to_zeros: zeros, log_corrections: true }
    }

    #[rstest]
    #[case(policy(true, true), f64::NAN, 0.0)]
    #[case(policy(true, true), f64::INFINITY, 1e38)]
    #[case(policy(false, true), f64::NEG_INFINITY, -1e38)]
    #[case(policy(true, false), f64::INFINITY, 1e38)]
    #[case(policy(true, false), -3e40, -1e38)]
    #[case(policy(false, false), 3e40, 3e40)]
    #[case(policy(true, true), 12.5, 12.5)]
    fn test_apply(#[case] policy: NumericPolicy, #[case] input: f64, #[case] expected: f64) {
        assert_eq!(policy.apply(input).0, expected);
    }

    #[test]
    fn test_nan_kept_without_nans_to_zeros() {
        let (value, correction) = policy(true, false).apply(f64::NAN);
        assert!(value.is_nan());
        assert!(correction.is_none());
    }

    #[test]
    fn test_correct_state_counts() {
        let mut y = [1.0, 2e38, f64::NEG_INFINITY, f64::NAN];
        assert_eq!(policy(true, true).correct_state(&mut y), (2, 1));
        assert_eq!(y, [1.0, 1e38, -1e38, 0.0]);

        let mut kept = [5e40, f64::NAN];
        assert_eq!(policy(false, false).correct_state(&mut kept), (0, 0));
        assert_eq!(kept[0], 5e40);
        assert!(kept[1].is_nan());
    }

    #[test]
    fn test_describe_names_value_and_time() {
        let message = Correction::NanToZero.describe("dy[0]", 3.0);
        assert_eq!(message, "dy[0] is NaN at time 3; replaced with 0");
    }
}
