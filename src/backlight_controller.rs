// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backlight brightness policy: user steps, plugged/unplugged offsets, ambient
//! light adjustments and idle dimming, written through gradual transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::als::AlsFilter;
use crate::backlight::Backlight;
use crate::backlight::BacklightError;
use crate::brightness_curve::BrightnessCurve;
use crate::clock::Clock;
use crate::common::BrightnessChangeCause;
use crate::common::PluggedState;
use crate::common::PowerState;
use crate::common::TransitionStyle;
use crate::prefs;
use crate::prefs::Prefs;
use crate::timer::OneShotTimer;

pub const FAST_TRANSITION_FRAMES: i64 = 8;
pub const SLOW_TRANSITION_FRAMES: i64 = 66;
pub const TRANSITION_FRAME_INTERVAL: Duration = Duration::from_millis(30);

const DEFAULT_PLUGGED_BRIGHTNESS_PERCENT: f64 = 70.0;
const DEFAULT_UNPLUGGED_BRIGHTNESS_PERCENT: f64 = 30.0;

// Percentages closer than this are treated as equal to a bound.
const EPSILON_PERCENT: f64 = 0.001;

// Plug transitions keep at least this much combined brightness.
const MIN_PLUG_TRANSITION_PERCENT: f64 = 1.0;

pub trait BacklightControllerObserver: Send {
    fn on_brightness_changed(&self, brightness_percent: f64, cause: BrightnessChangeCause);
}

/// Capability interface shared by the controllers selected at startup.
pub trait BacklightController: Send {
    /// Reads the hardware range and preferences. May be called again after
    /// the backlight device changes.
    fn init(&mut self) -> bool;
    fn is_initialized(&self) -> bool;
    fn set_observer(&mut self, observer: Option<Box<dyn BacklightControllerObserver>>);

    fn power_state(&self) -> PowerState;
    fn set_power_state(&mut self, state: PowerState) -> bool;
    fn on_plug_event(&mut self, is_plugged: bool) -> bool;

    fn target_brightness_percent(&self) -> f64;
    fn current_brightness_percent(&self) -> Result<f64, BacklightError>;
    fn set_current_brightness_percent(
        &mut self,
        percent: f64,
        cause: BrightnessChangeCause,
        style: TransitionStyle,
    ) -> bool;
    fn increase_brightness(&mut self, cause: BrightnessChangeCause) -> bool;
    fn decrease_brightness(&mut self, allow_off: bool, cause: BrightnessChangeCause) -> bool;
    fn set_als_brightness_offset_percent(&mut self, percent: f64);

    /// True when the user turned the backlight to 0 while active.
    fn is_backlight_active_off(&self) -> bool;
    fn on_backlight_device_changed(&mut self);

    fn als_adjustment_count(&self) -> u32;
    fn user_adjustment_count(&self) -> u32;

    /// Deadline of the next pending transition frame.
    fn next_deadline(&self) -> Option<Instant>;
    fn handle_timeout(&mut self);
}

#[derive(Debug)]
struct GradualTransition {
    start_time: Instant,
    total_time: Duration,
    start_level: i64,
    target_level: i64,
}

pub struct InternalBacklightController {
    backlight: Box<dyn Backlight>,
    prefs: Arc<dyn Prefs>,
    clock: Arc<dyn Clock>,
    observer: Option<Box<dyn BacklightControllerObserver>>,

    curve: Option<BrightnessCurve>,
    als: AlsFilter,
    has_als: bool,
    has_seen_als_event: bool,

    offsets: HashMap<PluggedState, f64>,
    last_active_offset_percent: f64,
    state: PowerState,
    plugged_state: PluggedState,

    target_percent: f64,
    target_level: i64,
    // Hardware levels per controller level, or 0 when levels map 1:1.
    controller_factor: i64,
    instant_transitions_below_min_level: bool,
    user_adjustment_count: u32,

    transition: Option<GradualTransition>,
    transition_timer: OneShotTimer,
}

impl InternalBacklightController {
    pub fn new(
        backlight: Box<dyn Backlight>,
        prefs: Arc<dyn Prefs>,
        clock: Arc<dyn Clock>,
        has_als: bool,
    ) -> Self {
        InternalBacklightController {
            backlight,
            prefs,
            clock,
            observer: None,
            curve: None,
            als: AlsFilter::new(),
            has_als,
            has_seen_als_event: false,
            offsets: HashMap::from([
                (PluggedState::Connected, 0.0),
                (PluggedState::Disconnected, 0.0),
            ]),
            last_active_offset_percent: 0.0,
            state: PowerState::Uninitialized,
            plugged_state: PluggedState::Unknown,
            target_percent: 0.0,
            target_level: 0,
            controller_factor: 0,
            instant_transitions_below_min_level: false,
            user_adjustment_count: 0,
            transition: None,
            transition_timer: OneShotTimer::new(),
        }
    }

    pub fn curve(&self) -> Option<&BrightnessCurve> {
        self.curve.as_ref()
    }

    pub fn offset_percent(&self, plugged_state: PluggedState) -> f64 {
        self.offsets
            .get(&Self::offset_key(plugged_state))
            .copied()
            .unwrap_or(0.0)
    }

    // Before the first plug event the plugged offset is in effect.
    fn offset_key(plugged_state: PluggedState) -> PluggedState {
        match plugged_state {
            PluggedState::Disconnected => PluggedState::Disconnected,
            _ => PluggedState::Connected,
        }
    }

    fn current_offset(&self) -> f64 {
        self.offset_percent(self.plugged_state)
    }

    fn set_offset(&mut self, plugged_state: PluggedState, percent: f64) {
        self.offsets.insert(Self::offset_key(plugged_state), percent);
    }

    fn set_current_offset(&mut self, percent: f64) {
        self.set_offset(self.plugged_state, percent);
    }

    fn try_init(&mut self) -> Result<(), BacklightError> {
        let hardware_max = self.backlight.max_level().map_err(BacklightError::Device)?;

        let mut max_level = hardware_max;
        let mut controller_factor = 0;
        if let Some(levels) = self
            .prefs
            .get_int64(prefs::INTERNAL_BACKLIGHT_CONTROLLER_LEVELS_PREF)
            .filter(|levels| *levels > 0)
        {
            if levels > hardware_max / 2 {
                warn!(
                    "Unable to implement {} controller backlight levels with max_brightness {}",
                    levels, hardware_max
                );
            } else {
                info!(
                    "Using {} controller backlight levels with max_brightness {}",
                    levels, hardware_max
                );
                controller_factor = hardware_max / levels;
                max_level = levels - 1;
            }
        }

        let curve = BrightnessCurve::new(
            max_level,
            self.prefs
                .get_int64(prefs::MIN_VISIBLE_BACKLIGHT_LEVEL_PREF),
        )?;
        let hardware_level = self
            .backlight
            .current_level()
            .map_err(BacklightError::Device)?;

        self.controller_factor = controller_factor;
        self.target_level = self.to_controller_level(hardware_level);
        self.target_percent = curve.level_to_percent(self.target_level);

        let min_percent = curve.min_visible_percent();
        let plugged = self
            .prefs
            .get_double(prefs::PLUGGED_BRIGHTNESS_OFFSET_PREF)
            .unwrap_or(DEFAULT_PLUGGED_BRIGHTNESS_PERCENT);
        let unplugged = self
            .prefs
            .get_double(prefs::UNPLUGGED_BRIGHTNESS_OFFSET_PREF)
            .unwrap_or(DEFAULT_UNPLUGGED_BRIGHTNESS_PERCENT);
        self.set_offset(PluggedState::Connected, plugged.max(min_percent));
        self.set_offset(PluggedState::Disconnected, unplugged.max(min_percent));
        self.instant_transitions_below_min_level = self
            .prefs
            .get_bool(prefs::INSTANT_TRANSITIONS_BELOW_MIN_LEVEL_PREF)
            .unwrap_or(false);

        info!(
            "Backlight has range [0, {}] with {}% step and minimum-visible level of {}; \
             current level is {} ({}%)",
            curve.max_level(),
            curve.step_percent(),
            curve.min_visible_level(),
            self.target_level,
            self.target_percent
        );
        self.curve = Some(curve);
        Ok(())
    }

    fn to_controller_level(&self, hardware_level: i64) -> i64 {
        if self.controller_factor > 0 && hardware_level != 0 {
            (hardware_level - self.controller_factor / 2) / self.controller_factor
        } else {
            hardware_level
        }
    }

    fn to_hardware_level(&self, level: i64) -> i64 {
        if self.controller_factor > 0 && level != 0 {
            level * self.controller_factor + self.controller_factor / 2
        } else {
            level
        }
    }

    fn current_controller_level(&self) -> anyhow::Result<i64> {
        Ok(self.to_controller_level(self.backlight.current_level()?))
    }

    fn set_brightness_hard(&mut self, level: i64) {
        let hardware_level = self.to_hardware_level(level);
        if let Err(e) = self.backlight.set_level(hardware_level) {
            warn!("Could not set brightness to {}: {:#}", hardware_level, e);
        }
    }

    fn write_prefs(&self) {
        let (name, plugged_state) = match self.plugged_state {
            PluggedState::Connected => {
                (prefs::PLUGGED_BRIGHTNESS_OFFSET_PREF, PluggedState::Connected)
            }
            PluggedState::Disconnected => (
                prefs::UNPLUGGED_BRIGHTNESS_OFFSET_PREF,
                PluggedState::Disconnected,
            ),
            PluggedState::Unknown => return,
        };
        if let Err(e) = self
            .prefs
            .set_double(name, self.offset_percent(plugged_state))
        {
            warn!("Failed to persist {}: {:#}", name, e);
        }
    }

    /// Recomputes the target from the current state and offsets and sends it
    /// to the hardware.
    fn write_brightness(
        &mut self,
        adjust_offset: bool,
        cause: BrightnessChangeCause,
        style: TransitionStyle,
    ) -> bool {
        let Some(curve) = self.curve.clone() else {
            return false;
        };

        if cause == BrightnessChangeCause::UserInitiated {
            self.user_adjustment_count += 1;
        }

        let old_percent = self.target_percent;
        let als_offset = self.als.offset_percent();
        match self.state {
            PowerState::Active | PowerState::AlreadyDimmed => {
                let new_percent = als_offset + self.current_offset();
                self.target_percent = if new_percent <= EPSILON_PERCENT {
                    0.0
                } else {
                    curve.clamp_to_visible_range(new_percent)
                };

                // Automated changes that don't move the offset never switch
                // the backlight between off and on.
                if self.state == PowerState::AlreadyDimmed
                    || (!adjust_offset && cause == BrightnessChangeCause::Automated)
                {
                    if self.target_percent == 0.0 && old_percent > 0.0 {
                        self.target_percent = curve.min_visible_percent().max(1.0);
                    } else if self.target_percent > 0.0 && old_percent == 0.0 {
                        self.target_percent = 0.0;
                    }
                }

                if adjust_offset {
                    self.set_current_offset(self.target_percent - als_offset);
                }
            }
            PowerState::Dim => {
                if old_percent > curve.idle_brightness_percent() {
                    self.target_percent = curve.idle_brightness_percent();
                } else {
                    info!("Not dimming because backlight is already dim");
                    self.target_percent = curve.clamp_to_visible_range(self.target_percent);
                }
            }
            PowerState::IdleOff | PowerState::Suspended => {
                self.target_percent = 0.0;
            }
            PowerState::Uninitialized => {}
        }

        self.als.update_baseline();
        let level = curve.percent_to_level(self.target_percent);
        info!(
            "Writing brightness: {}% -> {}% (level {})",
            old_percent, self.target_percent, level
        );
        self.set_brightness(&curve, level, style);
        self.write_prefs();
        if let Some(observer) = &self.observer {
            observer.on_brightness_changed(self.target_percent, cause);
        }
        true
    }

    fn set_brightness(&mut self, curve: &BrightnessCurve, target_level: i64, style: TransitionStyle) {
        let current_level = match self.current_controller_level() {
            Ok(level) => level,
            Err(e) => {
                warn!("Failed to read current brightness: {:#}", e);
                0
            }
        };
        debug!(
            "Setting brightness level to {} (currently {}, previous target was {})",
            target_level, current_level, self.target_level
        );

        if target_level == self.target_level {
            return;
        }
        self.target_level = target_level;
        self.transition = None;
        self.transition_timer.cancel();

        let diff = target_level - current_level;
        if diff == 0 {
            return;
        }

        let mut style = style;
        if current_level < target_level
            && target_level == curve.min_visible_level()
            && self.instant_transitions_below_min_level
        {
            style = TransitionStyle::Instant;
        }

        let frames = match style {
            TransitionStyle::Instant => {
                self.set_brightness_hard(target_level);
                return;
            }
            TransitionStyle::Fast => FAST_TRANSITION_FRAMES,
            TransitionStyle::Slow => SLOW_TRANSITION_FRAMES,
        };
        let num_steps = diff.abs().min(frames);
        if num_steps <= 1 {
            self.set_brightness_hard(target_level);
            return;
        }

        // The first step is written right away.
        let now = self.clock.now();
        let start_level = current_level + (diff as f64 / num_steps as f64).round() as i64;
        self.transition = Some(GradualTransition {
            start_time: now,
            total_time: TRANSITION_FRAME_INTERVAL * (num_steps - 1) as u32,
            start_level,
            target_level,
        });
        self.set_brightness_hard(start_level);
        self.transition_timer.arm_after(now, TRANSITION_FRAME_INTERVAL);
    }

    fn step_transition(&mut self, now: Instant) {
        let Some(transition) = self.transition.as_ref() else {
            return;
        };
        if transition.target_level != self.target_level {
            debug!(
                "Dropping frame of superseded transition to level {}",
                transition.target_level
            );
            self.transition = None;
            return;
        }

        let elapsed = now.saturating_duration_since(transition.start_time);
        let fraction = (elapsed.as_secs_f64() / transition.total_time.as_secs_f64()).min(1.0);
        let level = (transition.start_level as f64
            + fraction * (transition.target_level - transition.start_level) as f64)
            .round() as i64;

        // Skip the range below the visible floor so the screen goes straight
        // to off at the end of the transition.
        let min_visible_level = self
            .curve
            .as_ref()
            .map_or(0, BrightnessCurve::min_visible_level);
        let skip = self.instant_transitions_below_min_level
            && level != 0
            && level < min_visible_level;
        if !skip {
            self.set_brightness_hard(level);
        }

        if fraction >= 1.0 {
            self.transition = None;
        } else {
            self.transition_timer.arm_after(now, TRANSITION_FRAME_INTERVAL);
        }
    }
}

impl BacklightController for InternalBacklightController {
    fn init(&mut self) -> bool {
        match self.try_init() {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to initialize backlight controller: {}", e);
                false
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.curve.is_some()
    }

    fn set_observer(&mut self, observer: Option<Box<dyn BacklightControllerObserver>>) {
        self.observer = observer;
    }

    fn power_state(&self) -> PowerState {
        self.state
    }

    fn set_power_state(&mut self, new_state: PowerState) -> bool {
        let Some(curve) = self.curve.clone() else {
            return false;
        };
        if new_state == self.state {
            return false;
        }
        if new_state == PowerState::Uninitialized {
            warn!("Refusing to return the backlight to {}", new_state);
            return false;
        }
        // From active-off only Active and Suspended are reachable.
        if self.is_backlight_active_off()
            && matches!(
                new_state,
                PowerState::IdleOff | PowerState::Dim | PowerState::AlreadyDimmed
            )
        {
            return false;
        }

        let old_state = self.state;
        self.state = new_state;

        let mut style = TransitionStyle::Fast;
        let als_offset = self.als.offset_percent();
        if old_state == PowerState::Active {
            self.last_active_offset_percent = self.current_offset();
        } else if old_state != PowerState::Uninitialized && new_state == PowerState::Active {
            let new_percent =
                curve.clamp_to_visible_range(self.last_active_offset_percent + als_offset);
            self.set_current_offset(new_percent - als_offset);
            self.als.request_immediate();

            // Whatever level the kernel restored on resume, ramp up from off.
            if old_state == PowerState::Suspended {
                self.set_brightness_hard(0);
                style = TransitionStyle::Instant;
            }
        } else if old_state == PowerState::Uninitialized
            && new_state == PowerState::Active
            && self.target_percent < curve.min_visible_percent()
        {
            self.set_current_brightness_percent(
                curve.min_visible_percent(),
                BrightnessChangeCause::Automated,
                TransitionStyle::Fast,
            );
        }

        if new_state == PowerState::Suspended {
            style = TransitionStyle::Instant;
        }

        if self.has_als && old_state == PowerState::Uninitialized && !self.has_seen_als_event {
            info!("Skipping initial brightness adjustment until an ALS sample arrives");
        } else {
            self.write_brightness(true, BrightnessChangeCause::Automated, style);
        }

        if new_state == PowerState::Dim && self.target_percent < curve.idle_brightness_percent() {
            self.state = PowerState::AlreadyDimmed;
        }

        info!("{} -> {}", old_state, self.state);
        true
    }

    fn on_plug_event(&mut self, is_plugged: bool) -> bool {
        let new_plugged_state = PluggedState::from_plugged(is_plugged);
        if new_plugged_state == self.plugged_state || !self.is_initialized() {
            return false;
        }

        let is_first_event = self.plugged_state == PluggedState::Unknown;
        let active_off = self.is_backlight_active_off();
        self.plugged_state = new_plugged_state;

        let plugged = self.offset_percent(PluggedState::Connected);
        let unplugged = self.offset_percent(PluggedState::Disconnected);
        if !is_first_event {
            // Switching power sources never makes the screen noticeably
            // darker on AC or brighter on battery.
            if is_plugged && (active_off || unplugged > plugged) {
                self.set_offset(PluggedState::Connected, unplugged);
            } else if !is_plugged && plugged < unplugged {
                self.set_offset(PluggedState::Disconnected, plugged);
            }
        }

        let als_offset = self.als.offset_percent();
        if !active_off && self.current_offset() + als_offset < MIN_PLUG_TRANSITION_PERCENT {
            self.set_current_offset(MIN_PLUG_TRANSITION_PERCENT - als_offset);
        }

        if is_first_event && self.has_als && !self.has_seen_als_event {
            info!("Skipping initial plug brightness adjustment until an ALS sample arrives");
            return true;
        }
        self.write_brightness(true, BrightnessChangeCause::Automated, TransitionStyle::Fast)
    }

    fn target_brightness_percent(&self) -> f64 {
        self.target_percent
    }

    fn current_brightness_percent(&self) -> Result<f64, BacklightError> {
        let curve = self.curve.as_ref().ok_or(BacklightError::NotInitialized)?;
        let level = self
            .current_controller_level()
            .map_err(BacklightError::Device)?;
        Ok(curve.level_to_percent(level))
    }

    fn set_current_brightness_percent(
        &mut self,
        percent: f64,
        cause: BrightnessChangeCause,
        style: TransitionStyle,
    ) -> bool {
        let Some(curve) = self.curve.clone() else {
            return false;
        };
        let percent = if percent < EPSILON_PERCENT {
            0.0
        } else {
            curve.clamp_to_visible_range(percent)
        };
        if percent == self.target_percent {
            return false;
        }
        self.set_current_offset(percent - self.als.offset_percent());
        self.write_brightness(true, cause, style)
    }

    fn increase_brightness(&mut self, cause: BrightnessChangeCause) -> bool {
        let Some(curve) = self.curve.clone() else {
            return false;
        };
        let min_percent = curve.min_visible_percent();
        let new_percent = if self.target_percent < min_percent - EPSILON_PERCENT {
            min_percent
        } else {
            curve.clamp_to_visible_range(self.target_percent + curve.step_percent())
        };
        if new_percent == self.target_percent {
            return false;
        }
        self.set_current_offset(new_percent - self.als.offset_percent());
        self.write_brightness(true, cause, TransitionStyle::Fast)
    }

    fn decrease_brightness(&mut self, allow_off: bool, cause: BrightnessChangeCause) -> bool {
        let Some(curve) = self.curve.clone() else {
            return false;
        };
        // Turn the backlight off once it is at the visible floor.
        let new_percent = if self.target_percent <= curve.min_visible_percent() + EPSILON_PERCENT {
            0.0
        } else {
            curve.clamp_to_visible_range(self.target_percent - curve.step_percent())
        };
        if new_percent == self.target_percent || (!allow_off && new_percent == 0.0) {
            return false;
        }
        self.set_current_offset(new_percent - self.als.offset_percent());
        self.write_brightness(true, cause, TransitionStyle::Fast)
    }

    fn set_als_brightness_offset_percent(&mut self, percent: f64) {
        if !self.is_initialized() {
            return;
        }
        if self.state == PowerState::IdleOff || self.is_backlight_active_off() {
            return;
        }
        self.has_seen_als_event = true;
        if let Some(style) = self.als.filter(percent) {
            // Sensor adjustments leave the user's offset alone.
            self.write_brightness(false, BrightnessChangeCause::Automated, style);
        }
    }

    fn is_backlight_active_off(&self) -> bool {
        self.state == PowerState::Active && self.target_percent == 0.0
    }

    fn on_backlight_device_changed(&mut self) {
        info!("Backlight device changed; reinitializing controller");
        if self.init() {
            self.write_brightness(true, BrightnessChangeCause::Automated, TransitionStyle::Fast);
        }
    }

    fn als_adjustment_count(&self) -> u32 {
        self.als.adjustment_count()
    }

    fn user_adjustment_count(&self) -> u32 {
        self.user_adjustment_count
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.transition_timer.deadline()
    }

    fn handle_timeout(&mut self) {
        let now = self.clock.now();
        if self.transition_timer.fire_if_due(now) {
            self.step_transition(now);
        }
    }
}

/// Controller for systems without an internal panel. Tracks power and plug
/// state but has no brightness to drive.
pub struct ExternalBacklightController {
    state: PowerState,
    plugged_state: PluggedState,
    observer: Option<Box<dyn BacklightControllerObserver>>,
}

impl Default for ExternalBacklightController {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalBacklightController {
    pub fn new() -> Self {
        ExternalBacklightController {
            state: PowerState::Uninitialized,
            plugged_state: PluggedState::Unknown,
            observer: None,
        }
    }

    pub fn plugged_state(&self) -> PluggedState {
        self.plugged_state
    }
}

impl BacklightController for ExternalBacklightController {
    fn init(&mut self) -> bool {
        true
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn set_observer(&mut self, observer: Option<Box<dyn BacklightControllerObserver>>) {
        self.observer = observer;
    }

    fn power_state(&self) -> PowerState {
        self.state
    }

    fn set_power_state(&mut self, state: PowerState) -> bool {
        if state == self.state || state == PowerState::Uninitialized {
            return false;
        }
        info!("{} -> {}", self.state, state);
        self.state = state;
        true
    }

    fn on_plug_event(&mut self, is_plugged: bool) -> bool {
        let plugged_state = PluggedState::from_plugged(is_plugged);
        if plugged_state == self.plugged_state {
            return false;
        }
        self.plugged_state = plugged_state;
        true
    }

    fn target_brightness_percent(&self) -> f64 {
        0.0
    }

    fn current_brightness_percent(&self) -> Result<f64, BacklightError> {
        Err(BacklightError::Device(anyhow!("No internal backlight")))
    }

    fn set_current_brightness_percent(
        &mut self,
        _percent: f64,
        _cause: BrightnessChangeCause,
        _style: TransitionStyle,
    ) -> bool {
        false
    }

    fn increase_brightness(&mut self, _cause: BrightnessChangeCause) -> bool {
        false
    }

    fn decrease_brightness(&mut self, _allow_off: bool, _cause: BrightnessChangeCause) -> bool {
        false
    }

    fn set_als_brightness_offset_percent(&mut self, _percent: f64) {}

    fn is_backlight_active_off(&self) -> bool {
        false
    }

    fn on_backlight_device_changed(&mut self) {}

    fn als_adjustment_count(&self) -> u32 {
        0
    }

    fn user_adjustment_count(&self) -> u32 {
        0
    }

    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn handle_timeout(&mut self) {}
}
