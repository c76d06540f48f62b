// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use ctor::ctor;

use crate::backlight::Backlight;
use crate::backlight_controller::BacklightControllerObserver;
use crate::clock::Clock;
use crate::common::BrightnessChangeCause;
use crate::prefs::Prefs;

#[ctor]
fn global_init() {
    let _ = stderrlog::new().verbosity(log::Level::Debug).init();
}

pub struct FakeClock {
    now: Mutex<Instant>,
}

impl FakeClock {
    pub fn new() -> Arc<FakeClock> {
        Arc::new(FakeClock {
            now: Mutex::new(Instant::now()),
        })
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub struct FakePrefs {
    values: Mutex<HashMap<String, String>>,
}

impl FakePrefs {
    pub fn new() -> Arc<FakePrefs> {
        Arc::new(FakePrefs::default())
    }

    pub fn set(&self, name: &str, value: impl ToString) {
        self.values
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.values.lock().unwrap().remove(name);
    }
}

impl Prefs for FakePrefs {
    fn get_int64(&self, name: &str) -> Option<i64> {
        self.values.lock().unwrap().get(name)?.parse().ok()
    }

    fn get_double(&self, name: &str) -> Option<f64> {
        self.values.lock().unwrap().get(name)?.parse().ok()
    }

    fn set_int64(&self, name: &str, value: i64) -> Result<()> {
        self.set(name, value);
        Ok(())
    }

    fn set_double(&self, name: &str, value: f64) -> Result<()> {
        self.set(name, value);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeBacklightState {
    pub max_level: i64,
    pub level: i64,
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub writes: Vec<i64>,
}

/// Backlight whose state stays inspectable after the device is handed over.
#[derive(Clone)]
pub struct FakeBacklight {
    pub state: Arc<Mutex<FakeBacklightState>>,
}

impl FakeBacklight {
    pub fn new(max_level: i64, level: i64) -> FakeBacklight {
        FakeBacklight {
            state: Arc::new(Mutex::new(FakeBacklightState {
                max_level,
                level,
                ..Default::default()
            })),
        }
    }

    pub fn level(&self) -> i64 {
        self.state.lock().unwrap().level
    }

    pub fn writes(&self) -> Vec<i64> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub fn set_range(&self, max_level: i64, level: i64) {
        let mut state = self.state.lock().unwrap();
        state.max_level = max_level;
        state.level = level;
    }
}

impl Backlight for FakeBacklight {
    fn max_level(&self) -> Result<i64> {
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            bail!("max_brightness unreadable");
        }
        Ok(state.max_level)
    }

    fn current_level(&self) -> Result<i64> {
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            bail!("brightness unreadable");
        }
        Ok(state.level)
    }

    fn set_level(&mut self, level: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            bail!("brightness not writable");
        }
        state.level = level;
        state.writes.push(level);
        Ok(())
    }
}

/// Observer recording every brightness change.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub changes: Arc<Mutex<Vec<(f64, BrightnessChangeCause)>>>,
}

impl RecordingObserver {
    pub fn take(&self) -> Vec<(f64, BrightnessChangeCause)> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

impl BacklightControllerObserver for RecordingObserver {
    fn on_brightness_changed(&self, brightness_percent: f64, cause: BrightnessChangeCause) {
        self.changes
            .lock()
            .unwrap()
            .push((brightness_percent, cause));
    }
}

pub fn assert_percent_eq(expected: f64, actual: f64) {
    assert!(
        (expected - actual).abs() < 1e-6,
        "expected {}% but got {}%",
        expected,
        actual
    );
}
