// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ambient light sensor support: the level and temporal hysteresis applied to
//! sensor samples, and the sysfs illuminance reader feeding it.

use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;

use crate::common::read_file_to_string;
use crate::common::TransitionStyle;
use crate::common::MAX_PERCENT;

/// Deviation from the baseline (in percent) needed to count a sample.
pub const ALS_HYST_PERCENT: f64 = 5.0;

/// Consecutive same-direction samples needed to accept an adjustment.
pub const ALS_HYST_SAMPLES: u32 = 4;

/// Illuminance mapped to 100%.
const MAX_LUX: f64 = 5000.0;

const IIO_DEVICES_PATTERNS: [&str; 2] = [
    "sys/bus/iio/devices/*/in_illuminance*_input",
    "sys/bus/iio/devices/*/illuminance0_input",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TemporalState {
    Idle,
    Down,
    Up,
    Immediate,
}

#[derive(Debug)]
pub struct AlsFilter {
    offset_percent: f64,
    hysteresis_percent: f64,
    temporal_state: TemporalState,
    temporal_count: u32,
    adjustment_count: u32,
}

impl Default for AlsFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl AlsFilter {
    pub fn new() -> Self {
        AlsFilter {
            offset_percent: 0.0,
            hysteresis_percent: 0.0,
            temporal_state: TemporalState::Immediate,
            temporal_count: 0,
            adjustment_count: 0,
        }
    }

    /// Last accepted sensor-driven offset.
    pub fn offset_percent(&self) -> f64 {
        self.offset_percent
    }

    pub fn adjustment_count(&self) -> u32 {
        self.adjustment_count
    }

    /// Moves the comparison baseline to the accepted offset. Called whenever
    /// brightness is written.
    pub fn update_baseline(&mut self) {
        self.hysteresis_percent = self.offset_percent;
    }

    /// Accept the next sample without hysteresis.
    pub fn request_immediate(&mut self) {
        self.temporal_state = TemporalState::Immediate;
    }

    /// Feeds a sample. Returns the transition to use when the sample was
    /// accepted as the new offset, or None when it was absorbed.
    pub fn filter(&mut self, sample_percent: f64) -> Option<TransitionStyle> {
        let sample = sample_percent.max(0.0);

        if self.temporal_state == TemporalState::Immediate {
            self.temporal_state = TemporalState::Idle;
            self.accept(sample);
            info!("Immediate ALS-triggered brightness adjustment to {}%", sample);
            return Some(TransitionStyle::Fast);
        }

        let diff = sample - self.hysteresis_percent;
        let direction = if diff < -ALS_HYST_PERCENT {
            TemporalState::Down
        } else if diff > ALS_HYST_PERCENT {
            TemporalState::Up
        } else {
            self.temporal_state = TemporalState::Idle;
            return None;
        };

        if self.temporal_state == direction {
            self.temporal_count += 1;
        } else {
            self.temporal_state = direction;
            self.temporal_count = 1;
        }
        debug!(
            "ALS sample {}% is {:?} of {}% ({} in a row)",
            sample, direction, self.hysteresis_percent, self.temporal_count
        );

        if self.temporal_count >= ALS_HYST_SAMPLES {
            self.temporal_count = 0;
            self.accept(sample);
            info!("Ambient light sensor-triggered brightness adjustment to {}%", sample);
            return Some(TransitionStyle::Slow);
        }
        None
    }

    fn accept(&mut self, sample: f64) {
        self.offset_percent = sample;
        self.adjustment_count += 1;
    }
}

/// Converts illuminance to a brightness offset on a log scale.
pub fn lux_to_percent(lux: f64) -> f64 {
    if lux <= 0.0 {
        return 0.0;
    }
    (MAX_PERCENT * (1.0 + lux).ln() / (1.0 + MAX_LUX).ln()).min(MAX_PERCENT)
}

#[derive(Debug)]
pub struct AmbientLightSensor {
    path: PathBuf,
}

impl AmbientLightSensor {
    pub fn new(path: PathBuf) -> Self {
        AmbientLightSensor { path }
    }

    /// Finds the first IIO illuminance input under `root`.
    pub fn find(root: &Path) -> Result<Self> {
        for pattern in IIO_DEVICES_PATTERNS {
            let pattern = root.join(pattern);
            let pattern = pattern.to_str().context("Non UTF-8 sysfs path")?;
            let mut paths: Vec<PathBuf> = glob::glob(pattern)
                .context("Invalid illuminance glob pattern")?
                .filter_map(|path| path.ok())
                .collect();
            paths.sort();
            if let Some(path) = paths.into_iter().next() {
                return Ok(AmbientLightSensor::new(path));
            }
        }
        bail!("No ambient light sensor found under {}", root.display())
    }

    pub fn read_lux(&self) -> Result<f64> {
        let value = read_file_to_string(&self.path)?;
        value
            .parse()
            .with_context(|| format!("Couldn't parse \"{}\" as illuminance", value))
    }

    pub fn read_percent(&self) -> Result<f64> {
        Ok(lux_to_percent(self.read_lux()?))
    }
}
