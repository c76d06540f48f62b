// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The power manager state machine. Routes idle, power, session and button
//! events to the backlight controller, the suspend barrier and the override
//! table, and recomputes idle thresholds as conditions change.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::debug;
use log::error;
use log::info;
use log::warn;
#[cfg(test)]
use mockall::automock;

use crate::activity::ActivityDetector;
use crate::activity::ActivityTracker;
use crate::activity::AUDIO_ACTIVITY_THRESHOLD_MS;
use crate::backlight::BacklightError;
use crate::backlight_controller::BacklightController;
use crate::clock::Clock;
use crate::common::BrightnessChangeCause;
use crate::common::PluggedState;
use crate::common::PowerState;
use crate::common::TransitionStyle;
use crate::idle::IdleDetector;
use crate::idle::IdleEvent;
use crate::idle_timeouts::IdleOffsetFrom;
use crate::idle_timeouts::IdleTimeoutPrefs;
use crate::idle_timeouts::IdleTimeoutSet;
use crate::idle_timeouts::MIN_TIME_FOR_IDLE_MS;
use crate::prefs;
use crate::prefs::Prefs;
use crate::state_control::StateControl;
use crate::state_control::StateControlError;
use crate::state_control::StateKind;
use crate::state_control::StateOverrideRequest;
use crate::suspender::SuspendDelegate;
use crate::suspender::SuspendState;
use crate::suspender::Suspender;
use crate::timer::earliest;

pub const POWER_BUTTON_NAME: &str = "power";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Started,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn parse(state: &str) -> Option<SessionState> {
        match state {
            "started" => Some(SessionState::Started),
            "stopping" => Some(SessionState::Stopping),
            "stopped" => Some(SessionState::Stopped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    UserRequest,
    Idle,
    LidClosed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            ShutdownReason::UserRequest => "user-request",
            ShutdownReason::Idle => "idle",
            ShutdownReason::LidClosed => "lid-closed",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownState {
    None,
    PowerOff,
    Restarting,
}

/// Outward actions of the daemon other than suspending.
#[cfg_attr(test, automock)]
pub trait DaemonDelegate: Send {
    fn emit_idle_notify(&mut self, threshold_ms: i64);
    fn emit_active_notify(&mut self);
    fn lock_screen(&mut self);
    fn shut_down(&mut self, reason: ShutdownReason);
    fn restart(&mut self);
    fn is_oobe_completed(&self) -> bool;
}

pub struct Daemon {
    prefs: Arc<dyn Prefs>,
    clock: Arc<dyn Clock>,
    backlight: Box<dyn BacklightController>,
    idle: Box<dyn IdleDetector>,
    video: ActivityTracker,
    audio: ActivityTracker,
    suspender: Suspender,
    state_control: StateControl,
    delegate: Box<dyn DaemonDelegate>,

    timeout_prefs: IdleTimeoutPrefs,
    timeouts: IdleTimeoutSet,
    // Pending idle notification thresholds. 0 asks for the next activity.
    thresholds: Vec<i64>,

    plugged_state: PluggedState,
    is_projecting: bool,
    session_state: SessionState,
    screen_locked: bool,
    lock_requested: bool,
    shutdown_state: ShutdownState,
}

impl Daemon {
    pub fn new(
        prefs: Arc<dyn Prefs>,
        clock: Arc<dyn Clock>,
        backlight: Box<dyn BacklightController>,
        idle: Box<dyn IdleDetector>,
        suspend_delegate: Box<dyn SuspendDelegate>,
        delegate: Box<dyn DaemonDelegate>,
    ) -> Result<Self> {
        let timeout_prefs = IdleTimeoutPrefs::load(prefs.as_ref())?;
        let mut state_control = StateControl::new(clock.clone());
        state_control.read_settings(prefs.as_ref());
        Ok(Daemon {
            video: ActivityTracker::new("video", clock.clone(), true),
            audio: ActivityTracker::new("audio", clock.clone(), false),
            suspender: Suspender::new(suspend_delegate, clock.clone()),
            timeouts: IdleTimeoutSet::initial(&timeout_prefs),
            timeout_prefs,
            state_control,
            prefs,
            clock,
            backlight,
            idle,
            delegate,
            thresholds: Vec::new(),
            plugged_state: PluggedState::Unknown,
            is_projecting: false,
            session_state: SessionState::Stopped,
            screen_locked: false,
            lock_requested: false,
            shutdown_state: ShutdownState::None,
        })
    }

    pub fn power_state(&self) -> PowerState {
        self.backlight.power_state()
    }

    pub fn plugged_state(&self) -> PluggedState {
        self.plugged_state
    }

    pub fn timeouts(&self) -> IdleTimeoutSet {
        self.timeouts
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn suspend_state(&self) -> SuspendState {
        self.suspender.state()
    }

    pub fn is_session_started(&self) -> bool {
        self.session_state == SessionState::Started
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.backlight.next_deadline(),
            self.state_control.next_deadline(),
            self.suspender.next_deadline(),
            self.idle.next_deadline(),
        ]
        .into_iter()
        .fold(None, earliest)
    }

    /// Dispatches every timer that is due.
    pub fn handle_timers(&mut self) {
        self.backlight.handle_timeout();
        if self.state_control.handle_timeout() {
            self.update_idle_states();
        }
        self.suspender.handle_timeout();
        self.dispatch_idle_events();
    }

    fn dispatch_idle_events(&mut self) {
        loop {
            let events = self.idle.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.on_idle_event(event);
            }
        }
    }

    fn update_idle_states(&mut self) {
        let idle_time_ms = self.idle.idle_time_ms();
        self.set_idle_state(idle_time_ms);
    }

    /// Recomputes the thresholds and re-registers the idle alarms.
    fn set_idle_offset(&mut self, offset_ms: i64, from: IdleOffsetFrom) {
        self.timeouts = self.timeouts.with_offset(
            &self.timeout_prefs,
            self.plugged_state,
            self.is_projecting,
            offset_ms,
            from,
        );
        info!(
            "Idle offset {} ms from {:?}: dim {} off {} suspend {} lock {}",
            offset_ms,
            from,
            self.timeouts.dim_ms,
            self.timeouts.off_ms,
            self.timeouts.suspend_ms,
            self.timeouts.lock_ms
        );

        self.idle.clear_timeouts();
        for alarm in self.timeouts.alarms(&self.timeout_prefs, &self.thresholds) {
            self.idle.add_idle_timeout(alarm);
        }
    }

    fn set_idle_state(&mut self, idle_time_ms: i64) {
        let old_state = self.backlight.power_state();
        let timeouts = self.timeouts;

        if idle_time_ms >= timeouts.suspend_ms
            && !self.state_control.is_state_disabled(StateKind::IdleSuspend)
        {
            self.backlight.set_power_state(PowerState::Suspended);
            self.audio.disable();
            self.suspend();
        } else if idle_time_ms >= timeouts.off_ms
            && !self.state_control.is_state_disabled(StateKind::IdleBlank)
        {
            if self.is_session_started() {
                self.backlight.set_power_state(PowerState::IdleOff);
            }
        } else if idle_time_ms >= timeouts.dim_ms
            && !self.state_control.is_state_disabled(StateKind::IdleDim)
        {
            self.backlight.set_power_state(PowerState::Dim);
        } else if old_state != PowerState::Active {
            if self.backlight.set_power_state(PowerState::Active)
                && old_state == PowerState::Suspended
            {
                self.suspender.cancel_suspend();
            }
            self.audio.disable();
        } else if idle_time_ms < self.timeout_prefs.react_ms && self.screen_locked {
            self.brighten_screen_if_off();
        }

        if idle_time_ms >= timeouts.lock_ms
            && self.is_session_started()
            && self.backlight.power_state() != PowerState::Suspended
        {
            self.lock_screen();
        }

        let new_state = self.backlight.power_state();
        if old_state != new_state {
            info!("Idle for {} ms: {} -> {}", idle_time_ms, old_state, new_state);
        }
    }

    fn on_idle_event(&mut self, event: IdleEvent) {
        let IdleEvent {
            is_idle,
            idle_time_ms,
        } = event;
        if self.plugged_state == PluggedState::Unknown {
            debug!("Dropping idle event before the power source is known");
            return;
        }
        if is_idle && idle_time_ms > self.idle.idle_time_ms() {
            debug!("Dropping stale idle event at {} ms", idle_time_ms);
            return;
        }

        let state = self.backlight.power_state();
        if is_idle
            && state == PowerState::Active
            && self.timeouts.dim_ms <= idle_time_ms
            && !self.screen_locked
        {
            let dim_ms = self
                .timeout_prefs
                .base_dim_ms(self.plugged_state, self.is_projecting);
            let video = self.video.get_activity(dim_ms);
            if video.is_active {
                info!("Video played {} ms ago; postponing dim", video.time_since_ms);
                self.set_idle_offset(idle_time_ms - video.time_since_ms, IdleOffsetFrom::Normal);
            }
        }

        if is_idle && state == PowerState::Dim && !self.delegate.is_oobe_completed() {
            info!("OOBE not complete; delaying screen off");
            self.set_idle_offset(idle_time_ms, IdleOffsetFrom::ScreenOff);
        }

        let suspend_ms = self.timeouts.suspend_ms;
        if is_idle
            && state != PowerState::Suspended
            && idle_time_ms >= suspend_ms.saturating_sub(self.timeout_prefs.react_ms)
        {
            self.audio.enable();
        }
        if is_idle && state != PowerState::Suspended && idle_time_ms >= suspend_ms {
            let audio = self.audio.get_activity(AUDIO_ACTIVITY_THRESHOLD_MS);
            if audio.is_active {
                info!("Delaying suspend because audio is playing");
                // The offset is relative to the unextended threshold.
                let base_suspend_ms = self
                    .timeout_prefs
                    .base_suspend_ms(self.plugged_state, self.is_projecting);
                self.set_idle_offset(
                    suspend_ms - base_suspend_ms + self.timeout_prefs.react_ms,
                    IdleOffsetFrom::Suspend,
                );
            }
        }

        self.set_idle_state(idle_time_ms);
        if !is_idle {
            self.lock_requested = false;
            if self.timeouts.offset_ms != 0 {
                self.set_idle_offset(0, IdleOffsetFrom::Normal);
            }
        }

        let mut notifications = Vec::new();
        self.thresholds.retain(|threshold| {
            let fire = if is_idle {
                *threshold != 0 && idle_time_ms >= *threshold
            } else {
                *threshold == 0
            };
            if fire {
                notifications.push(*threshold);
            }
            !fire
        });
        for threshold in notifications {
            if threshold == 0 {
                self.delegate.emit_active_notify();
            } else {
                self.delegate.emit_idle_notify(threshold);
            }
        }
    }

    fn lock_screen(&mut self) {
        if !self.timeout_prefs.lock_on_idle_suspend || self.screen_locked || self.lock_requested {
            return;
        }
        info!("Locking screen");
        self.lock_requested = true;
        self.delegate.lock_screen();
    }

    fn brighten_screen_if_off(&mut self) {
        if self.is_session_started() && self.backlight.is_backlight_active_off() {
            self.backlight
                .increase_brightness(BrightnessChangeCause::Automated);
        }
    }

    fn suspend(&mut self) {
        if self.shutdown_state != ShutdownState::None {
            info!("Ignoring suspend request during shutdown");
            return;
        }
        if self.is_session_started() {
            let lock = self.timeout_prefs.lock_on_idle_suspend && !self.screen_locked;
            self.suspender.request_suspend(lock);
            self.backlight.set_power_state(PowerState::Suspended);
        } else {
            let reason = if self.backlight.power_state() == PowerState::Suspended {
                ShutdownReason::Idle
            } else {
                ShutdownReason::LidClosed
            };
            info!("Not logged in; shutting down instead of suspending");
            self.start_shutdown(ShutdownState::PowerOff, reason);
        }
    }

    fn start_shutdown(&mut self, state: ShutdownState, reason: ShutdownReason) {
        if self.shutdown_state != ShutdownState::None {
            return;
        }
        self.shutdown_state = state;
        self.suspender.cancel_suspend();
        match state {
            ShutdownState::PowerOff => {
                info!("Shutting down, reason: {}", reason);
                self.delegate.shut_down(reason);
            }
            ShutdownState::Restarting => {
                info!("Restarting");
                self.delegate.restart();
            }
            ShutdownState::None => {}
        }
    }

    /// Treats the current moment as user activity.
    pub fn set_active(&mut self) {
        self.idle.handle_user_activity(self.clock.now());
        let idle_time_ms = self.idle.idle_time_ms();
        self.set_idle_offset(idle_time_ms, IdleOffsetFrom::Normal);
        self.set_idle_state(idle_time_ms);
        self.dispatch_idle_events();
    }

    pub fn set_plugged(&mut self, is_plugged: bool) {
        let plugged_state = PluggedState::from_plugged(is_plugged);
        if plugged_state == self.plugged_state {
            return;
        }
        info!("Line power {:?}", plugged_state);
        self.plugged_state = plugged_state;

        // Time already spent idle counts toward the new thresholds. With the
        // screen off, a full suspend timeout is granted again.
        let idle_time_ms = self.idle.idle_time_ms();
        match self.backlight.power_state() {
            PowerState::Uninitialized
            | PowerState::Active
            | PowerState::Dim
            | PowerState::AlreadyDimmed => {
                self.set_idle_offset(idle_time_ms, IdleOffsetFrom::Normal)
            }
            PowerState::IdleOff => self.set_idle_offset(idle_time_ms, IdleOffsetFrom::Suspend),
            PowerState::Suspended => self.set_idle_offset(0, IdleOffsetFrom::Normal),
        }

        self.backlight.on_plug_event(is_plugged);
        self.set_idle_state(idle_time_ms);
        self.dispatch_idle_events();
    }

    pub fn handle_user_activity(&mut self, when: Instant) {
        self.idle.handle_user_activity(when);
        self.dispatch_idle_events();
    }

    pub fn handle_video_activity(&mut self, when: Instant) {
        self.video.handle_activity(when);
    }

    pub fn set_active_audio_streams(&mut self, num_streams: i32) {
        self.audio.set_ongoing(num_streams > 0);
    }

    pub fn set_is_projecting(&mut self, is_projecting: bool) {
        if is_projecting == self.is_projecting {
            return;
        }
        info!("Projecting: {}", is_projecting);
        self.is_projecting = is_projecting;
        self.set_idle_offset(self.timeouts.offset_ms, IdleOffsetFrom::Normal);
    }

    pub fn get_idle_time_ms(&self) -> i64 {
        self.idle.idle_time_ms()
    }

    /// Asks for an `IdleNotify` once idle for `threshold_ms`, or for an
    /// `ActiveNotify` on the next activity when it is 0.
    pub fn request_idle_notification(&mut self, threshold_ms: i64) {
        if threshold_ms < 0 {
            warn!("Ignoring negative idle notification threshold {}", threshold_ms);
            return;
        }
        self.idle.add_idle_timeout(if threshold_ms == 0 {
            MIN_TIME_FOR_IDLE_MS
        } else {
            threshold_ms
        });
        self.thresholds.push(threshold_ms);
    }

    pub fn on_power_state_changed(&mut self, state: &str) {
        if state == "on" {
            info!("Resuming has commenced");
            self.on_resume();
        } else {
            debug!("Ignoring power state {}", state);
        }
    }

    /// The system came back from suspend, or the suspend attempt failed.
    pub fn on_resume(&mut self) {
        self.suspender.handle_resume();
        self.set_active();
    }

    pub fn on_session_state_changed(&mut self, state: &str) {
        let Some(session_state) = SessionState::parse(state) else {
            warn!("Changing to unknown session state: {}", state);
            return;
        };
        if session_state == self.session_state {
            if session_state == SessionState::Started {
                warn!("Session started while already started");
            }
            return;
        }
        info!("Session {}", state);
        self.session_state = session_state;
    }

    pub fn on_screen_locked(&mut self) {
        info!("Screen is locked");
        self.screen_locked = true;
        self.lock_requested = false;
        self.suspender.screen_locked();
    }

    pub fn on_screen_unlocked(&mut self) {
        info!("Screen is unlocked");
        self.screen_locked = false;
    }

    pub fn on_lid_closed(&mut self) {
        self.set_active();
        if self.state_control.is_state_disabled(StateKind::LidSuspend) {
            info!("Lid suspend is disabled by an override");
            return;
        }
        self.suspend();
    }

    pub fn on_lid_opened(&mut self) {
        self.set_active();
        self.suspender.cancel_suspend();
    }

    pub fn on_button_event(&mut self, button_name: &str, down: bool) {
        // A user who turned the backlight off gets it back with the button.
        if button_name == POWER_BUTTON_NAME && down && self.backlight.is_backlight_active_off() {
            self.backlight
                .increase_brightness(BrightnessChangeCause::UserInitiated);
        }
    }

    pub fn request_suspend(&mut self) {
        self.suspend();
    }

    pub fn request_shutdown(&mut self) {
        self.start_shutdown(ShutdownState::PowerOff, ShutdownReason::UserRequest);
    }

    pub fn request_restart(&mut self) {
        self.start_shutdown(ShutdownState::Restarting, ShutdownReason::UserRequest);
    }

    pub fn state_override_request(
        &mut self,
        request: StateOverrideRequest,
    ) -> Result<u32, StateControlError> {
        self.state_control.state_override_request(request)
    }

    pub fn state_override_cancel(&mut self, request_id: u32) {
        if self.state_control.remove_override(request_id) {
            self.update_idle_states();
        }
    }

    pub fn register_suspend_delay(&mut self, client: &str, delay_ms: u32) {
        self.suspender.register_suspend_delay(client, delay_ms);
    }

    pub fn unregister_suspend_delay(&mut self, client: &str) -> bool {
        self.suspender.unregister_suspend_delay(client)
    }

    pub fn suspend_ready(&mut self, client: &str, sequence_number: u32) {
        self.suspender.suspend_ready(client, sequence_number);
    }

    /// A bus client went away without unregistering.
    pub fn on_name_owner_lost(&mut self, name: &str) {
        if self.suspender.unregister_suspend_delay(name) {
            info!("Dropped suspend delay of vanished client {}", name);
        }
    }

    pub fn increase_screen_brightness(&mut self) -> bool {
        self.backlight
            .increase_brightness(BrightnessChangeCause::UserInitiated)
    }

    pub fn decrease_screen_brightness(&mut self, allow_off: bool) -> bool {
        self.backlight
            .decrease_brightness(allow_off, BrightnessChangeCause::UserInitiated)
    }

    pub fn set_screen_brightness_percent(&mut self, percent: f64, style: TransitionStyle) -> bool {
        self.backlight.set_current_brightness_percent(
            percent,
            BrightnessChangeCause::UserInitiated,
            style,
        )
    }

    pub fn get_screen_brightness_percent(&self) -> Result<f64, BacklightError> {
        self.backlight.current_brightness_percent()
    }

    pub fn on_als_sample(&mut self, percent: f64) {
        self.backlight.set_als_brightness_offset_percent(percent);
    }

    pub fn on_pref_changed(&mut self, name: &str) {
        match name {
            prefs::LOCK_ON_IDLE_SUSPEND_PREF | prefs::LOCK_MS_PREF => {
                self.timeout_prefs.reload_lock_settings(self.prefs.as_ref())
            }
            prefs::DISABLE_IDLE_SUSPEND_PREF => {
                self.timeout_prefs
                    .reload_suspend_settings(self.prefs.as_ref())
            }
            _ => return,
        }
        if let Err(e) = self.timeout_prefs.validate() {
            error!("Inconsistent idle timeouts after {} changed: {:#}", name, e);
        }
        self.set_idle_offset(0, IdleOffsetFrom::Normal);
    }
}
