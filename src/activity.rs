// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video and audio activity reported by other processes.

use std::sync::Arc;
use std::time::Instant;

use log::debug;
use log::info;

use crate::clock::Clock;

/// Audio played within this window still counts as playing.
pub const AUDIO_ACTIVITY_THRESHOLD_MS: i64 = 5000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Activity {
    /// Time since the activity was last seen, or `i64::MAX` if never.
    pub time_since_ms: i64,
    pub is_active: bool,
}

pub trait ActivityDetector: Send {
    /// Reports whether activity was seen within `threshold_ms`.
    fn get_activity(&self, threshold_ms: i64) -> Activity;
    fn enable(&mut self);
    fn disable(&mut self);
}

pub struct ActivityTracker {
    name: &'static str,
    clock: Arc<dyn Clock>,
    last_activity: Option<Instant>,
    // Activity that is still going on, e.g. open audio streams.
    ongoing: bool,
    enabled: bool,
}

impl ActivityTracker {
    pub fn new(name: &'static str, clock: Arc<dyn Clock>, enabled: bool) -> Self {
        ActivityTracker {
            name,
            clock,
            last_activity: None,
            ongoing: false,
            enabled,
        }
    }

    pub fn handle_activity(&mut self, when: Instant) {
        let when = when.min(self.clock.now());
        if self.last_activity.map_or(true, |last| when > last) {
            self.last_activity = Some(when);
        }
    }

    pub fn set_ongoing(&mut self, ongoing: bool) {
        if self.ongoing == ongoing {
            return;
        }
        debug!("{} activity ongoing: {}", self.name, ongoing);
        self.ongoing = ongoing;
        self.last_activity = Some(self.clock.now());
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl ActivityDetector for ActivityTracker {
    fn get_activity(&self, threshold_ms: i64) -> Activity {
        if !self.enabled {
            return Activity {
                time_since_ms: i64::MAX,
                is_active: false,
            };
        }
        if self.ongoing {
            return Activity {
                time_since_ms: 0,
                is_active: true,
            };
        }
        match self.last_activity {
            Some(last) => {
                let time_since_ms = self
                    .clock
                    .now()
                    .saturating_duration_since(last)
                    .as_millis() as i64;
                Activity {
                    time_since_ms,
                    is_active: time_since_ms < threshold_ms,
                }
            }
            None => Activity {
                time_since_ms: i64::MAX,
                is_active: false,
            },
        }
    }

    fn enable(&mut self) {
        if !self.enabled {
            info!("Enabling {} activity detection", self.name);
            self.enabled = true;
        }
    }

    fn disable(&mut self) {
        if self.enabled {
            info!("Disabling {} activity detection", self.name);
            self.enabled = false;
        }
    }
}
