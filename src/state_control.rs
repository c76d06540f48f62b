// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Time-bounded overrides that disable stages of the idle state machine on
//! behalf of other processes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::warn;
use thiserror::Error as ThisError;

use crate::clock::Clock;
use crate::prefs;
use crate::prefs::Prefs;
use crate::timer::OneShotTimer;

pub const DEFAULT_MAX_DISABLED_DURATION_SEC: u32 = 1800;

// Candidate ids tried before giving up on a new request.
const REQUEST_ID_PROBES: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateKind {
    IdleDim,
    IdleBlank,
    IdleSuspend,
    LidSuspend,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum StateControlError {
    #[error("disabling an idle stage requires disabling every later stage")]
    InvalidDisableCombination,
    #[error("override duration {0}s is outside [1, {1}]")]
    InvalidDuration(u32, u32),
    #[error("no free override request id")]
    NoFreeRequestId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateOverrideRequest {
    /// Existing id to replace, or 0 for a new override.
    pub request_id: u32,
    pub duration_sec: u32,
    pub disable_idle_dim: bool,
    pub disable_idle_blank: bool,
    pub disable_idle_suspend: bool,
    pub disable_lid_suspend: bool,
}

impl StateOverrideRequest {
    fn validate(&self, max_duration_sec: u32) -> Result<(), StateControlError> {
        if (self.disable_idle_dim && !(self.disable_idle_blank && self.disable_idle_suspend))
            || (self.disable_idle_blank && !self.disable_idle_suspend)
        {
            return Err(StateControlError::InvalidDisableCombination);
        }
        if self.duration_sec == 0 || self.duration_sec > max_duration_sec {
            return Err(StateControlError::InvalidDuration(
                self.duration_sec,
                max_duration_sec,
            ));
        }
        Ok(())
    }

    fn disables(&self, kind: StateKind) -> bool {
        match kind {
            StateKind::IdleDim => self.disable_idle_dim,
            StateKind::IdleBlank => self.disable_idle_blank,
            StateKind::IdleSuspend => self.disable_idle_suspend,
            StateKind::LidSuspend => self.disable_lid_suspend,
        }
    }
}

#[derive(Debug)]
struct Override {
    request: StateOverrideRequest,
    expires: Instant,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct DisabledStates {
    idle_dim: bool,
    idle_blank: bool,
    idle_suspend: bool,
    lid_suspend: bool,
}

pub struct StateControl {
    clock: Arc<dyn Clock>,
    overrides: BTreeMap<u32, Override>,
    disabled: DisabledStates,
    max_duration_sec: u32,
    last_request_id: u32,
    rescan_timer: OneShotTimer,
}

impl StateControl {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        StateControl {
            clock,
            overrides: BTreeMap::new(),
            disabled: DisabledStates::default(),
            max_duration_sec: DEFAULT_MAX_DISABLED_DURATION_SEC,
            last_request_id: 0,
            rescan_timer: OneShotTimer::new(),
        }
    }

    pub fn read_settings(&mut self, prefs: &dyn Prefs) {
        self.max_duration_sec = match prefs.get_int64(prefs::STATE_MAX_DISABLED_DURATION_SEC_PREF)
        {
            Some(value) if value > 0 => u32::try_from(value).unwrap_or(u32::MAX),
            Some(value) => {
                warn!("Ignoring invalid maximum override duration {}", value);
                DEFAULT_MAX_DISABLED_DURATION_SEC
            }
            None => DEFAULT_MAX_DISABLED_DURATION_SEC,
        };
    }

    pub fn max_duration_sec(&self) -> u32 {
        self.max_duration_sec
    }

    pub fn num_overrides(&self) -> usize {
        self.overrides.len()
    }

    /// Adds or replaces an override and returns its id.
    pub fn state_override_request(
        &mut self,
        request: StateOverrideRequest,
    ) -> Result<u32, StateControlError> {
        request.validate(self.max_duration_sec)?;

        let request_id = if request.request_id != 0 && self.overrides.contains_key(&request.request_id)
        {
            request.request_id
        } else {
            self.allocate_request_id()?
        };

        let now = self.clock.now();
        let expires = now + Duration::from_secs(request.duration_sec.into());
        info!(
            "Override {} for {}s: dim={} blank={} suspend={} lid={}",
            request_id,
            request.duration_sec,
            request.disable_idle_dim,
            request.disable_idle_blank,
            request.disable_idle_suspend,
            request.disable_lid_suspend
        );
        self.overrides.insert(
            request_id,
            Override {
                request: StateOverrideRequest {
                    request_id,
                    ..request
                },
                expires,
            },
        );
        self.update();
        Ok(request_id)
    }

    fn allocate_request_id(&mut self) -> Result<u32, StateControlError> {
        for _ in 0..REQUEST_ID_PROBES {
            self.last_request_id = self.last_request_id.wrapping_add(1);
            if self.last_request_id == 0 {
                continue;
            }
            if !self.overrides.contains_key(&self.last_request_id) {
                return Ok(self.last_request_id);
            }
        }
        Err(StateControlError::NoFreeRequestId)
    }

    /// Removes an override. Returns false if the id was unknown.
    pub fn remove_override(&mut self, request_id: u32) -> bool {
        if self.overrides.remove(&request_id).is_none() {
            warn!("No override with request id {}", request_id);
            return false;
        }
        info!("Removed override {}", request_id);
        self.update();
        true
    }

    pub fn is_state_disabled(&mut self, kind: StateKind) -> bool {
        let now = self.clock.now();
        if self.rescan_timer.fire_if_due(now) {
            debug!("Override expiry passed without a rescan");
            self.rescan_state(now);
        }
        match kind {
            StateKind::IdleDim => self.disabled.idle_dim,
            StateKind::IdleBlank => self.disabled.idle_blank,
            StateKind::IdleSuspend => self.disabled.idle_suspend,
            StateKind::LidSuspend => self.disabled.lid_suspend,
        }
    }

    /// Drops every override expired at `now`. Returns true if any was dropped.
    pub fn rescan_state(&mut self, now: Instant) -> bool {
        let before = self.overrides.len();
        self.overrides.retain(|request_id, entry| {
            let live = entry.expires > now;
            if !live {
                info!("Override {} expired", request_id);
            }
            live
        });
        let changed = self.overrides.len() != before;
        self.update();
        changed
    }

    fn update(&mut self) {
        let any = |kind| {
            self.overrides
                .values()
                .any(|entry| entry.request.disables(kind))
        };
        self.disabled = DisabledStates {
            idle_dim: any(StateKind::IdleDim),
            idle_blank: any(StateKind::IdleBlank),
            idle_suspend: any(StateKind::IdleSuspend),
            lid_suspend: any(StateKind::LidSuspend),
        };
        match self.overrides.values().map(|entry| entry.expires).min() {
            Some(expires) => self.rescan_timer.arm(expires),
            None => self.rescan_timer.cancel(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.rescan_timer.deadline()
    }

    /// Runs a due rescan. Returns true if overrides expired.
    pub fn handle_timeout(&mut self) -> bool {
        let now = self.clock.now();
        if self.rescan_timer.fire_if_due(now) {
            return self.rescan_state(now);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeClock;
    use crate::test_utils::FakePrefs;

    fn request(duration_sec: u32, dim: bool, blank: bool, suspend: bool, lid: bool) -> StateOverrideRequest {
        StateOverrideRequest {
            request_id: 0,
            duration_sec,
            disable_idle_dim: dim,
            disable_idle_blank: blank,
            disable_idle_suspend: suspend,
            disable_lid_suspend: lid,
        }
    }

    #[test]
    fn test_disable_combinations() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock);

        assert_eq!(
            control.state_override_request(request(60, true, false, false, false)),
            Err(StateControlError::InvalidDisableCombination)
        );
        assert_eq!(
            control.state_override_request(request(60, false, true, false, false)),
            Err(StateControlError::InvalidDisableCombination)
        );
        assert_eq!(
            control.state_override_request(request(60, true, false, true, true)),
            Err(StateControlError::InvalidDisableCombination)
        );
        assert_eq!(control.num_overrides(), 0);

        assert!(control
            .state_override_request(request(60, true, true, true, true))
            .is_ok());
        assert!(control
            .state_override_request(request(60, false, false, true, true))
            .is_ok());
        assert_eq!(control.num_overrides(), 2);
    }

    #[test]
    fn test_duration_bounds() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock);
        assert_eq!(
            control.state_override_request(request(0, false, false, true, false)),
            Err(StateControlError::InvalidDuration(0, 1800))
        );
        assert!(control
            .state_override_request(request(1801, false, false, true, false))
            .is_err());
        assert!(control
            .state_override_request(request(1800, false, false, true, false))
            .is_ok());

        let prefs = FakePrefs::new();
        prefs.set(prefs::STATE_MAX_DISABLED_DURATION_SEC_PREF, 120);
        control.read_settings(prefs.as_ref());
        assert_eq!(control.max_duration_sec(), 120);
        assert!(control
            .state_override_request(request(121, false, false, true, false))
            .is_err());
    }

    #[test]
    fn test_expiry() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock.clone());
        let start = clock.now();
        control
            .state_override_request(request(60, true, true, true, false))
            .unwrap();
        assert!(control.is_state_disabled(StateKind::IdleDim));
        assert!(!control.is_state_disabled(StateKind::LidSuspend));
        assert_eq!(control.next_deadline(), Some(start + Duration::from_secs(60)));

        assert!(!control.rescan_state(start + Duration::from_secs(59)));
        assert!(control.is_state_disabled(StateKind::IdleSuspend));

        assert!(control.rescan_state(start + Duration::from_secs(61)));
        assert!(!control.is_state_disabled(StateKind::IdleSuspend));
        assert_eq!(control.num_overrides(), 0);
        assert_eq!(control.next_deadline(), None);
    }

    #[test]
    fn test_timer_rescan() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock.clone());
        control
            .state_override_request(request(30, false, false, true, false))
            .unwrap();
        control
            .state_override_request(request(90, false, false, false, true))
            .unwrap();

        clock.advance(Duration::from_secs(29));
        assert!(!control.handle_timeout());
        clock.advance(Duration::from_secs(2));
        assert!(control.handle_timeout());
        assert!(!control.is_state_disabled(StateKind::IdleSuspend));
        assert!(control.is_state_disabled(StateKind::LidSuspend));
        assert!(control.next_deadline().is_some());
    }

    #[test]
    fn test_missed_timer_forces_rescan() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock.clone());
        control
            .state_override_request(request(10, false, false, true, false))
            .unwrap();
        clock.advance(Duration::from_secs(11));
        // No timer dispatch happened; the query rescans on its own.
        assert!(!control.is_state_disabled(StateKind::IdleSuspend));
        assert_eq!(control.num_overrides(), 0);
    }

    #[test]
    fn test_remove_and_replace() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock);
        let id = control
            .state_override_request(request(60, false, false, true, true))
            .unwrap();
        let other = control
            .state_override_request(request(60, false, false, true, false))
            .unwrap();
        assert_ne!(id, other);

        let replaced = control
            .state_override_request(StateOverrideRequest {
                request_id: id,
                ..request(60, false, false, false, false)
            })
            .unwrap();
        assert_eq!(replaced, id);
        assert_eq!(control.num_overrides(), 2);
        assert!(!control.is_state_disabled(StateKind::LidSuspend));

        assert!(control.remove_override(other));
        assert!(!control.is_state_disabled(StateKind::IdleSuspend));
        assert!(!control.remove_override(other));
    }

    #[test]
    fn test_request_ids_skip_live_entries() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock);
        for _ in 0..5 {
            control
                .state_override_request(request(60, false, false, true, false))
                .unwrap();
        }
        control.last_request_id = 0;
        // Ids 1 to 5 are live, so probing continues past them.
        let id = control
            .state_override_request(request(60, false, false, true, false))
            .unwrap();
        assert_eq!(id, 6);

        control.last_request_id = u32::MAX - 1;
        let id = control
            .state_override_request(request(60, false, false, true, false))
            .unwrap();
        assert_eq!(id, u32::MAX);
        // 0 is never handed out.
        let id = control
            .state_override_request(request(60, false, false, true, false))
            .unwrap();
        assert_eq!(id, 7);
    }

    #[test]
    fn test_id_space_exhausted() {
        let clock = FakeClock::new();
        let mut control = StateControl::new(clock);
        for _ in 0..REQUEST_ID_PROBES {
            control
                .state_override_request(request(60, false, false, true, false))
                .unwrap();
        }
        control.last_request_id = 0;
        assert_eq!(
            control.state_override_request(request(60, false, false, true, false)),
            Err(StateControlError::NoFreeRequestId)
        );
    }
}
