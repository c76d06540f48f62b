// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping between hardware backlight levels and user-facing percentages.

use crate::backlight::BacklightError;
use crate::common::MAX_PERCENT;

/// Dimmed brightness as a fraction of the maximum percentage.
pub const IDLE_BRIGHTNESS_FRACTION: f64 = 0.1;

/// Hardware-derived lower bound for the minimum visible level, as a fraction
/// of the maximum level.
pub const DEFAULT_MIN_VISIBLE_BRIGHTNESS_FRACTION: f64 = 0.0065;

/// Maximum number of increase/decrease steps, including the step between the
/// minimum visible level and 0.
pub const MAX_BRIGHTNESS_STEPS: i64 = 16;

/// Number of levels needed before a non-linear mapping is used.
pub const MIN_LEVELS_FOR_NON_LINEAR_MAPPING: i64 = 100;

pub const NON_LINEAR_EXPONENT: f64 = 0.5;

const DEFAULT_MIN_VISIBLE_LEVEL: i64 = 1;

#[derive(Clone, Debug, PartialEq)]
pub struct BrightnessCurve {
    max_level: i64,
    min_visible_level: i64,
    exponent: f64,
    step_percent: f64,
    idle_brightness_percent: f64,
}

impl BrightnessCurve {
    /// `min_visible_level_pref` is raised to a fraction of `max_level` and to
    /// at least 1, then capped at `max_level`.
    pub fn new(max_level: i64, min_visible_level_pref: Option<i64>) -> Result<Self, BacklightError> {
        if max_level <= 0 {
            return Err(BacklightError::InvalidMaxLevel(max_level));
        }

        let exponent = if max_level >= MIN_LEVELS_FOR_NON_LINEAR_MAPPING {
            NON_LINEAR_EXPONENT
        } else {
            1.0
        };
        let hardware_min =
            (DEFAULT_MIN_VISIBLE_BRIGHTNESS_FRACTION * max_level as f64).round() as i64;
        let min_visible_level = hardware_min
            .max(min_visible_level_pref.unwrap_or(DEFAULT_MIN_VISIBLE_LEVEL))
            .max(DEFAULT_MIN_VISIBLE_LEVEL)
            .min(max_level);

        let mut curve = BrightnessCurve {
            max_level,
            min_visible_level,
            exponent,
            step_percent: MAX_PERCENT,
            idle_brightness_percent: 0.0,
        };
        if max_level != min_visible_level {
            let steps = (MAX_BRIGHTNESS_STEPS - 1).min(max_level - min_visible_level);
            curve.step_percent = (MAX_PERCENT - curve.min_visible_percent()) / steps as f64;
        }
        curve.idle_brightness_percent =
            curve.clamp_to_visible_range(IDLE_BRIGHTNESS_FRACTION * MAX_PERCENT);
        Ok(curve)
    }

    pub fn max_level(&self) -> i64 {
        self.max_level
    }

    pub fn min_visible_level(&self) -> i64 {
        self.min_visible_level
    }

    pub fn exponent(&self) -> f64 {
        self.exponent
    }

    pub fn step_percent(&self) -> f64 {
        self.step_percent
    }

    pub fn idle_brightness_percent(&self) -> f64 {
        self.idle_brightness_percent
    }

    pub fn level_to_percent(&self, level: i64) -> f64 {
        if level <= 0 {
            return 0.0;
        }
        if level >= self.max_level {
            return MAX_PERCENT;
        }
        MAX_PERCENT * (level as f64 / self.max_level as f64).powf(self.exponent)
    }

    pub fn percent_to_level(&self, percent: f64) -> i64 {
        if percent <= 0.0 {
            return 0;
        }
        if percent >= MAX_PERCENT {
            return self.max_level;
        }
        let fraction = (percent / MAX_PERCENT).powf(1.0 / self.exponent);
        ((fraction * self.max_level as f64).round() as i64).clamp(0, self.max_level)
    }

    pub fn min_visible_percent(&self) -> f64 {
        self.level_to_percent(self.min_visible_level)
    }

    pub fn clamp_to_visible_range(&self, percent: f64) -> f64 {
        percent.max(self.min_visible_percent()).min(MAX_PERCENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_near(expected: f64, actual: f64) {
        assert!(
            (expected - actual).abs() < 1e-9,
            "expected {} but got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_round_trip() {
        for max_level in [1, 10, 99, 100, 255, 937, 1000] {
            let curve = BrightnessCurve::new(max_level, None).unwrap();
            assert_eq!(curve.level_to_percent(0), 0.0);
            assert_eq!(curve.level_to_percent(max_level), 100.0);
            for level in 0..=max_level {
                let round_trip = curve.percent_to_level(curve.level_to_percent(level));
                assert!(
                    (round_trip - level).abs() <= 1,
                    "max {} level {} became {}",
                    max_level,
                    level,
                    round_trip
                );
            }
        }
    }

    #[test]
    fn test_monotonic() {
        for max_level in [10, 100, 1000] {
            let curve = BrightnessCurve::new(max_level, None).unwrap();
            let mut last = curve.level_to_percent(0);
            for level in 1..=max_level {
                let percent = curve.level_to_percent(level);
                assert!(percent >= last);
                last = percent;
            }
        }
    }

    #[test]
    fn test_linear_mapping_for_small_range() {
        let curve = BrightnessCurve::new(10, None).unwrap();
        assert_eq!(curve.exponent(), 1.0);
        for level in 0..=10 {
            let percent = 100.0 * level as f64 / 10.0;
            assert_near(percent, curve.level_to_percent(level));
            assert_eq!(curve.percent_to_level(percent), level);
        }
    }

    #[test]
    fn test_non_linear_mapping_for_large_range() {
        let curve = BrightnessCurve::new(1000, None).unwrap();
        assert_eq!(curve.exponent(), NON_LINEAR_EXPONENT);
        assert!(curve.level_to_percent(500) > 50.0);
        assert!(curve.percent_to_level(50.0) < 500);
        assert_eq!(curve.percent_to_level(0.0), 0);
        assert_eq!(curve.percent_to_level(100.0), 1000);
    }

    #[test]
    fn test_min_visible_level() {
        // Hardware fraction wins over a smaller pref.
        let curve = BrightnessCurve::new(1000, Some(1)).unwrap();
        assert_eq!(curve.min_visible_level(), 7);

        let curve = BrightnessCurve::new(100, Some(10)).unwrap();
        assert_eq!(curve.min_visible_level(), 10);

        let curve = BrightnessCurve::new(100, Some(0)).unwrap();
        assert_eq!(curve.min_visible_level(), 1);

        let curve = BrightnessCurve::new(50, Some(80)).unwrap();
        assert_eq!(curve.min_visible_level(), 50);
        assert_eq!(curve.step_percent(), 100.0);
    }

    #[test]
    fn test_step_and_idle_percent() {
        let curve = BrightnessCurve::new(100, Some(1)).unwrap();
        assert_near(10.0, curve.min_visible_percent());
        assert_near(6.0, curve.step_percent());
        assert_near(10.0, curve.idle_brightness_percent());

        // Fewer levels than steps.
        let curve = BrightnessCurve::new(5, Some(1)).unwrap();
        assert_near(20.0, curve.min_visible_percent());
        assert_near(20.0, curve.step_percent());
        assert_near(20.0, curve.idle_brightness_percent());
    }

    #[test]
    fn test_clamp_to_visible_range() {
        let curve = BrightnessCurve::new(100, Some(4)).unwrap();
        assert_near(20.0, curve.clamp_to_visible_range(3.0));
        assert_near(55.0, curve.clamp_to_visible_range(55.0));
        assert_near(100.0, curve.clamp_to_visible_range(140.0));
    }

    #[test]
    fn test_invalid_max_level() {
        assert!(matches!(
            BrightnessCurve::new(0, None),
            Err(BacklightError::InvalidMaxLevel(0))
        ));
        assert!(BrightnessCurve::new(-3, Some(1)).is_err());
    }
}
