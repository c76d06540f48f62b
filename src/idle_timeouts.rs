// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dim, screen-off, suspend and lock thresholds derived from preferences.

use anyhow::bail;
use anyhow::Result;
use log::info;

use crate::common::PluggedState;
use crate::prefs;
use crate::prefs::Prefs;

/// A threshold that is never reached.
pub const NEVER_MS: i64 = i64::MAX;

/// Idle timeouts are multiplied by this while projecting to an external display.
pub const PROJECTION_TIMEOUT_FACTOR: i64 = 2;

/// Alarm used for "notify me on the next idle" requests.
pub const MIN_TIME_FOR_IDLE_MS: i64 = 10;

const DEFAULT_PLUGGED_DIM_MS: i64 = 480_000;
const DEFAULT_PLUGGED_OFF_MS: i64 = 540_000;
const DEFAULT_PLUGGED_SUSPEND_MS: i64 = 1_800_000;
const DEFAULT_UNPLUGGED_DIM_MS: i64 = 300_000;
const DEFAULT_UNPLUGGED_OFF_MS: i64 = 360_000;
const DEFAULT_UNPLUGGED_SUSPEND_MS: i64 = 600_000;
const DEFAULT_REACT_MS: i64 = 30_000;
const DEFAULT_FUZZ_MS: i64 = 5_000;
const DEFAULT_LOCK_MS: i64 = 600_000;

/// The idle stage that triggered a recomputation. Thresholds for this stage and
/// the ones before it keep their previous values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleOffsetFrom {
    Normal,
    Dim,
    ScreenOff,
    Suspend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTimeouts {
    pub dim_ms: i64,
    pub off_ms: i64,
    pub suspend_ms: i64,
}

impl StageTimeouts {
    fn scaled(&self, factor: i64) -> StageTimeouts {
        StageTimeouts {
            dim_ms: scale(self.dim_ms, factor),
            off_ms: scale(self.off_ms, factor),
            suspend_ms: scale(self.suspend_ms, factor),
        }
    }
}

fn scale(value_ms: i64, factor: i64) -> i64 {
    if value_ms == NEVER_MS {
        NEVER_MS
    } else {
        value_ms.saturating_mul(factor)
    }
}

fn read_ms(prefs: &dyn Prefs, name: &str, default_ms: i64) -> i64 {
    prefs.get_int64(name).unwrap_or(default_ms)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdleTimeoutPrefs {
    pub plugged: StageTimeouts,
    pub unplugged: StageTimeouts,
    pub react_ms: i64,
    pub fuzz_ms: i64,
    pub enforce_lock: bool,
    pub lock_on_idle_suspend: bool,
    /// `NEVER_MS` unless `lock_on_idle_suspend` is set.
    pub lock_ms: i64,
    pub disable_idle_suspend: bool,

    // Suspend thresholds as configured, kept while idle suspend is disabled.
    configured_plugged_suspend_ms: i64,
    configured_unplugged_suspend_ms: i64,
}

impl Default for IdleTimeoutPrefs {
    fn default() -> Self {
        IdleTimeoutPrefs {
            plugged: StageTimeouts {
                dim_ms: DEFAULT_PLUGGED_DIM_MS,
                off_ms: DEFAULT_PLUGGED_OFF_MS,
                suspend_ms: DEFAULT_PLUGGED_SUSPEND_MS,
            },
            unplugged: StageTimeouts {
                dim_ms: DEFAULT_UNPLUGGED_DIM_MS,
                off_ms: DEFAULT_UNPLUGGED_OFF_MS,
                suspend_ms: DEFAULT_UNPLUGGED_SUSPEND_MS,
            },
            react_ms: DEFAULT_REACT_MS,
            fuzz_ms: DEFAULT_FUZZ_MS,
            enforce_lock: false,
            lock_on_idle_suspend: false,
            lock_ms: NEVER_MS,
            disable_idle_suspend: false,
            configured_plugged_suspend_ms: DEFAULT_PLUGGED_SUSPEND_MS,
            configured_unplugged_suspend_ms: DEFAULT_UNPLUGGED_SUSPEND_MS,
        }
    }
}

impl IdleTimeoutPrefs {
    /// Reads every timeout pref and rejects inconsistent combinations.
    pub fn load(prefs: &dyn Prefs) -> Result<Self> {
        let mut timeouts = IdleTimeoutPrefs {
            plugged: StageTimeouts {
                dim_ms: read_ms(prefs, prefs::PLUGGED_DIM_MS_PREF, DEFAULT_PLUGGED_DIM_MS),
                off_ms: read_ms(prefs, prefs::PLUGGED_OFF_MS_PREF, DEFAULT_PLUGGED_OFF_MS),
                suspend_ms: NEVER_MS,
            },
            unplugged: StageTimeouts {
                dim_ms: read_ms(prefs, prefs::UNPLUGGED_DIM_MS_PREF, DEFAULT_UNPLUGGED_DIM_MS),
                off_ms: read_ms(prefs, prefs::UNPLUGGED_OFF_MS_PREF, DEFAULT_UNPLUGGED_OFF_MS),
                suspend_ms: NEVER_MS,
            },
            react_ms: read_ms(prefs, prefs::REACT_MS_PREF, DEFAULT_REACT_MS),
            fuzz_ms: read_ms(prefs, prefs::FUZZ_MS_PREF, DEFAULT_FUZZ_MS),
            enforce_lock: prefs.get_bool(prefs::ENFORCE_LOCK_PREF).unwrap_or(false),
            ..Default::default()
        };
        timeouts.reload_suspend_settings(prefs);
        timeouts.reload_lock_settings(prefs);
        timeouts.validate()?;
        Ok(timeouts)
    }

    pub fn reload_lock_settings(&mut self, prefs: &dyn Prefs) {
        self.lock_on_idle_suspend = prefs
            .get_bool(prefs::LOCK_ON_IDLE_SUSPEND_PREF)
            .unwrap_or(false);
        if self.lock_on_idle_suspend {
            info!("Enabling screen lock on idle and suspend");
            self.lock_ms = read_ms(prefs, prefs::LOCK_MS_PREF, DEFAULT_LOCK_MS);
        } else {
            info!("Disabling screen lock on idle and suspend");
            self.lock_ms = NEVER_MS;
        }
    }

    pub fn reload_suspend_settings(&mut self, prefs: &dyn Prefs) {
        self.configured_plugged_suspend_ms = read_ms(
            prefs,
            prefs::PLUGGED_SUSPEND_MS_PREF,
            DEFAULT_PLUGGED_SUSPEND_MS,
        );
        self.configured_unplugged_suspend_ms = read_ms(
            prefs,
            prefs::UNPLUGGED_SUSPEND_MS_PREF,
            DEFAULT_UNPLUGGED_SUSPEND_MS,
        );
        self.disable_idle_suspend = prefs
            .get_bool(prefs::DISABLE_IDLE_SUSPEND_PREF)
            .unwrap_or(false);
        if self.disable_idle_suspend {
            info!("Idle suspend disabled");
            self.plugged.suspend_ms = NEVER_MS;
            self.unplugged.suspend_ms = NEVER_MS;
        } else {
            self.plugged.suspend_ms = self.configured_plugged_suspend_ms;
            self.unplugged.suspend_ms = self.configured_unplugged_suspend_ms;
            info!(
                "Idle suspend enabled: plugged {} ms, unplugged {} ms",
                self.plugged.suspend_ms, self.unplugged.suspend_ms
            );
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.react_ms < 0 || self.fuzz_ms < 0 {
            bail!(
                "react_ms ({}) and fuzz_ms ({}) must not be negative",
                self.react_ms,
                self.fuzz_ms
            );
        }
        for (name, stage, configured_suspend_ms) in [
            ("plugged", &self.plugged, self.configured_plugged_suspend_ms),
            ("unplugged", &self.unplugged, self.configured_unplugged_suspend_ms),
        ] {
            if stage.dim_ms < self.react_ms {
                bail!("{} dim timeout {} ms is below react_ms", name, stage.dim_ms);
            }
            if stage.off_ms < stage.dim_ms.saturating_add(self.react_ms) {
                bail!(
                    "{} off timeout {} ms must be at least dim + react ({} ms)",
                    name,
                    stage.off_ms,
                    stage.dim_ms + self.react_ms
                );
            }
            if configured_suspend_ms < stage.off_ms.saturating_add(self.react_ms) {
                bail!(
                    "{} suspend timeout {} ms must be at least off + react ({} ms)",
                    name,
                    configured_suspend_ms,
                    stage.off_ms + self.react_ms
                );
            }
            if self.lock_on_idle_suspend && self.lock_ms < stage.off_ms.saturating_add(self.react_ms)
            {
                bail!(
                    "lock timeout {} ms must be at least {} off + react ({} ms)",
                    self.lock_ms,
                    name,
                    stage.off_ms + self.react_ms
                );
            }
        }
        Ok(())
    }

    fn base(&self, plugged_state: PluggedState, is_projecting: bool) -> (StageTimeouts, i64) {
        let stage = match plugged_state {
            PluggedState::Connected => self.plugged,
            _ => self.unplugged,
        };
        if is_projecting {
            (
                stage.scaled(PROJECTION_TIMEOUT_FACTOR),
                scale(self.lock_ms, PROJECTION_TIMEOUT_FACTOR),
            )
        } else {
            (stage, self.lock_ms)
        }
    }

    /// Unextended suspend threshold for the power source.
    pub fn base_suspend_ms(&self, plugged_state: PluggedState, is_projecting: bool) -> i64 {
        self.base(plugged_state, is_projecting).0.suspend_ms
    }

    pub fn base_dim_ms(&self, plugged_state: PluggedState, is_projecting: bool) -> i64 {
        self.base(plugged_state, is_projecting).0.dim_ms
    }
}

/// Thresholds currently in effect, all measured from the start of idleness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleTimeoutSet {
    pub dim_ms: i64,
    pub off_ms: i64,
    pub suspend_ms: i64,
    pub lock_ms: i64,
    pub offset_ms: i64,
}

impl IdleTimeoutSet {
    /// Thresholds in effect before the power source is known.
    pub fn initial(prefs: &IdleTimeoutPrefs) -> Self {
        IdleTimeoutSet {
            dim_ms: prefs.unplugged.dim_ms,
            off_ms: prefs.unplugged.off_ms,
            suspend_ms: prefs.unplugged.suspend_ms,
            lock_ms: prefs.lock_ms,
            offset_ms: 0,
        }
    }

    /// Recomputes the thresholds with `offset_ms` of idle time already
    /// accumulated. Stages up to `from` keep their values from `self`.
    pub fn with_offset(
        &self,
        prefs: &IdleTimeoutPrefs,
        plugged_state: PluggedState,
        is_projecting: bool,
        offset_ms: i64,
        from: IdleOffsetFrom,
    ) -> IdleTimeoutSet {
        let (stage, base_lock_ms) = prefs.base(plugged_state, is_projecting);
        let add = |value: i64| value.max(value.saturating_add(offset_ms));

        let mut next = IdleTimeoutSet {
            dim_ms: add(stage.dim_ms),
            off_ms: add(stage.off_ms),
            suspend_ms: add(stage.suspend_ms),
            lock_ms: base_lock_ms,
            offset_ms,
        };

        if prefs.enforce_lock {
            // The screen dims, then turns off, before it locks.
            next.off_ms = next.off_ms.min(next.lock_ms.saturating_sub(prefs.react_ms));
            next.dim_ms = next
                .dim_ms
                .min(next.lock_ms.saturating_sub(2 * prefs.react_ms));
        } else {
            next.lock_ms = add(next.lock_ms);
        }

        match from {
            IdleOffsetFrom::Suspend => {
                next.off_ms = self.off_ms;
                next.dim_ms = self.dim_ms;
            }
            IdleOffsetFrom::ScreenOff => next.dim_ms = self.dim_ms,
            IdleOffsetFrom::Dim | IdleOffsetFrom::Normal => {}
        }
        next
    }

    /// Idle durations at which the idle detector should raise an event.
    pub fn alarms(&self, prefs: &IdleTimeoutPrefs, notification_thresholds: &[i64]) -> Vec<i64> {
        let mut alarms = Vec::new();
        if self.offset_ms > prefs.fuzz_ms {
            alarms.push(prefs.fuzz_ms);
        }
        alarms.push(self.dim_ms);
        alarms.push(self.off_ms);
        // Starts audio polling shortly before suspend. When equal to the off
        // threshold it is redundant.
        let audio_ms = self.suspend_ms.saturating_sub(prefs.react_ms);
        if self.suspend_ms != NEVER_MS && audio_ms > self.off_ms {
            alarms.push(audio_ms);
        }
        if self.lock_ms < self.suspend_ms.saturating_sub(prefs.fuzz_ms)
            || self.lock_ms.saturating_sub(prefs.fuzz_ms) > self.suspend_ms
        {
            alarms.push(self.lock_ms);
            alarms.push(self.suspend_ms);
        } else {
            alarms.push(self.lock_ms.max(self.suspend_ms));
        }
        for threshold in notification_thresholds {
            match *threshold {
                0 => alarms.push(MIN_TIME_FOR_IDLE_MS),
                t if t > 0 => alarms.push(t),
                _ => {}
            }
        }
        alarms.retain(|alarm| *alarm != NEVER_MS);
        alarms.sort_unstable();
        alarms.dedup();
        alarms
    }
}
