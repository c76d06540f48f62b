// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Two-phase suspend: announce the attempt to registered delay clients, wait
//! for their acknowledgements or a timeout, then suspend.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::debug;
use log::info;
use log::warn;
#[cfg(test)]
use mockall::automock;

use crate::clock::Clock;
use crate::timer::OneShotTimer;

/// Upper bound on how long delay clients can hold off a suspend.
pub const MAX_SUSPEND_DELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the screen to lock before suspending.
pub const SCREEN_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Outward actions of the suspend barrier.
#[cfg_attr(test, automock)]
pub trait SuspendDelegate: Send {
    /// Reads the kernel wakeup count, if available.
    fn read_wakeup_count(&mut self) -> Option<u64>;
    /// Tells delay clients that a suspend with `sequence_number` is imminent.
    fn announce_suspend(&mut self, sequence_number: u32);
    fn lock_screen(&mut self);
    fn suspend(&mut self, wakeup_count: Option<u64>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendState {
    Idle,
    Requested,
    Suspending,
}

pub struct Suspender {
    delegate: Box<dyn SuspendDelegate>,
    clock: Arc<dyn Clock>,
    state: SuspendState,
    // Registered delay clients and their requested delay in milliseconds.
    delays: HashMap<String, u32>,
    // Clients that have not acknowledged the current attempt.
    outstanding: HashSet<String>,
    waiting_for_lock: bool,
    sequence_number: u32,
    wakeup_count: Option<u64>,
    timeout_timer: OneShotTimer,
}

impl Suspender {
    pub fn new(delegate: Box<dyn SuspendDelegate>, clock: Arc<dyn Clock>) -> Self {
        // Seeded from wall-clock time so numbers differ across restarts.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u32)
            .unwrap_or(0);
        Suspender {
            delegate,
            clock,
            state: SuspendState::Idle,
            delays: HashMap::new(),
            outstanding: HashSet::new(),
            waiting_for_lock: false,
            sequence_number: seed,
            wakeup_count: None,
            timeout_timer: OneShotTimer::new(),
        }
    }

    pub fn state(&self) -> SuspendState {
        self.state
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len() + usize::from(self.waiting_for_lock)
    }

    /// Largest delay requested by a registered client.
    pub fn suspend_delay_timeout(&self) -> Duration {
        Duration::from_millis(self.delays.values().copied().max().unwrap_or(0).into())
    }

    pub fn register_suspend_delay(&mut self, client: &str, delay_ms: u32) {
        info!("Registered {} for a {} ms suspend delay", client, delay_ms);
        self.delays.insert(client.to_string(), delay_ms);
    }

    /// Forgets a client. An attempt already in progress still waits for it.
    pub fn unregister_suspend_delay(&mut self, client: &str) -> bool {
        if self.delays.remove(client).is_some() {
            info!("Unregistered suspend delay for {}", client);
            true
        } else {
            false
        }
    }

    pub fn is_registered(&self, client: &str) -> bool {
        self.delays.contains_key(client)
    }

    /// Starts a suspend attempt. `lock_screen` adds the screen locker as an
    /// implicit delay client.
    pub fn request_suspend(&mut self, lock_screen: bool) {
        if self.state != SuspendState::Idle {
            info!("Suspend already in progress ({:?})", self.state);
            return;
        }

        self.wakeup_count = self.delegate.read_wakeup_count();
        if self.wakeup_count.is_none() {
            warn!("No wakeup count available; suspending without one");
        }
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.outstanding = self.delays.keys().cloned().collect();
        self.waiting_for_lock = lock_screen;
        self.state = SuspendState::Requested;

        let mut timeout = self.suspend_delay_timeout();
        if lock_screen {
            self.delegate.lock_screen();
            timeout = timeout.max(SCREEN_LOCK_TIMEOUT);
        }
        let timeout = timeout.min(MAX_SUSPEND_DELAY_TIMEOUT);
        info!(
            "Requesting suspend {} with {} outstanding clients and {:?} timeout",
            self.sequence_number,
            self.outstanding_count(),
            timeout
        );
        self.delegate.announce_suspend(self.sequence_number);
        self.timeout_timer.arm_after(self.clock.now(), timeout);
        self.check_suspend();
    }

    pub fn suspend_ready(&mut self, client: &str, sequence_number: u32) {
        if self.state != SuspendState::Requested || sequence_number != self.sequence_number {
            debug!(
                "Ignoring stale suspend ack {} from {} (current {})",
                sequence_number, client, self.sequence_number
            );
            return;
        }
        if !self.is_registered(client) && !self.outstanding.contains(client) {
            warn!("Suspend ack from unregistered client {}", client);
            return;
        }
        if self.outstanding.remove(client) {
            debug!("{} is ready to suspend", client);
        }
        self.check_suspend();
    }

    /// The screen finished locking.
    pub fn screen_locked(&mut self) {
        if self.waiting_for_lock {
            self.waiting_for_lock = false;
            self.check_suspend();
        }
    }

    /// Suspends once every client has acknowledged.
    pub fn check_suspend(&mut self) {
        if self.state == SuspendState::Requested && self.outstanding_count() == 0 {
            self.suspend();
        }
    }

    fn suspend(&mut self) {
        self.timeout_timer.cancel();
        self.outstanding.clear();
        self.waiting_for_lock = false;
        self.state = SuspendState::Suspending;
        info!("Suspending (attempt {})", self.sequence_number);
        self.delegate.suspend(self.wakeup_count);
    }

    /// Abandons a requested suspend. Safe to call in any state.
    pub fn cancel_suspend(&mut self) {
        if self.state == SuspendState::Requested {
            info!("Canceling suspend {}", self.sequence_number);
            self.state = SuspendState::Idle;
        }
        self.outstanding.clear();
        self.waiting_for_lock = false;
        self.timeout_timer.cancel();
    }

    /// The system resumed, or the suspend command failed.
    pub fn handle_resume(&mut self) {
        if self.state == SuspendState::Suspending {
            info!("Resumed from suspend {}", self.sequence_number);
        }
        self.state = SuspendState::Idle;
        self.outstanding.clear();
        self.waiting_for_lock = false;
        self.timeout_timer.cancel();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeout_timer.deadline()
    }

    pub fn handle_timeout(&mut self) {
        if !self.timeout_timer.fire_if_due(self.clock.now()) {
            return;
        }
        if self.state != SuspendState::Requested {
            return;
        }
        let mut late: Vec<&String> = self.outstanding.iter().collect();
        late.sort();
        warn!(
            "Suspend delay timed out waiting for {:?}{}",
            late,
            if self.waiting_for_lock { " and screen lock" } else { "" }
        );
        self.suspend();
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use mockall::Sequence;

    use super::*;
    use crate::test_utils::FakeClock;

    const WAKEUP_COUNT: u64 = 452;

    fn delegate_expecting_suspends(times: usize) -> MockSuspendDelegate {
        let mut delegate = MockSuspendDelegate::new();
        delegate
            .expect_read_wakeup_count()
            .returning(|| Some(WAKEUP_COUNT));
        delegate.expect_announce_suspend().return_const(());
        delegate
            .expect_suspend()
            .with(eq(Some(WAKEUP_COUNT)))
            .times(times)
            .return_const(());
        delegate
    }

    #[test]
    fn test_no_clients_suspends_immediately() {
        let clock = FakeClock::new();
        let mut suspender = Suspender::new(Box::new(delegate_expecting_suspends(1)), clock);
        suspender.request_suspend(false);
        assert_eq!(suspender.state(), SuspendState::Suspending);
        assert_eq!(suspender.next_deadline(), None);

        // Further requests wait for resume.
        suspender.request_suspend(false);
        suspender.handle_resume();
        assert_eq!(suspender.state(), SuspendState::Idle);
    }

    #[test]
    fn test_all_clients_ack() {
        let clock = FakeClock::new();
        let mut suspender =
            Suspender::new(Box::new(delegate_expecting_suspends(1)), clock.clone());
        suspender.register_suspend_delay(":1.10", 100);
        suspender.register_suspend_delay(":1.11", 200);
        assert_eq!(suspender.suspend_delay_timeout(), Duration::from_millis(200));

        suspender.request_suspend(false);
        let sequence = suspender.sequence_number();
        assert_eq!(suspender.outstanding_count(), 2);
        assert_eq!(
            suspender.next_deadline(),
            Some(clock.now() + Duration::from_millis(200))
        );

        suspender.suspend_ready(":1.10", sequence);
        assert_eq!(suspender.state(), SuspendState::Requested);
        // Duplicate acks don't count twice.
        suspender.suspend_ready(":1.10", sequence);
        assert_eq!(suspender.outstanding_count(), 1);

        suspender.suspend_ready(":1.11", sequence);
        assert_eq!(suspender.state(), SuspendState::Suspending);

        // The timer was cancelled, so nothing else happens.
        clock.advance(Duration::from_secs(1));
        suspender.handle_timeout();
    }

    #[test]
    fn test_timeout_forces_suspend() {
        let clock = FakeClock::new();
        let mut suspender =
            Suspender::new(Box::new(delegate_expecting_suspends(1)), clock.clone());
        suspender.register_suspend_delay(":1.10", 100);
        suspender.register_suspend_delay(":1.11", 200);
        suspender.request_suspend(false);
        let sequence = suspender.sequence_number();

        suspender.suspend_ready(":1.10", sequence);
        clock.advance(Duration::from_millis(199));
        suspender.handle_timeout();
        assert_eq!(suspender.state(), SuspendState::Requested);

        clock.advance(Duration::from_millis(1));
        suspender.handle_timeout();
        assert_eq!(suspender.state(), SuspendState::Suspending);
        assert_eq!(suspender.outstanding_count(), 0);

        suspender.handle_timeout();
        // A late ack is stale.
        suspender.suspend_ready(":1.11", sequence);
    }

    #[test]
    fn test_stale_and_unknown_acks() {
        let clock = FakeClock::new();
        let mut suspender = Suspender::new(Box::new(delegate_expecting_suspends(0)), clock);
        suspender.register_suspend_delay(":1.10", 500);
        suspender.request_suspend(false);
        let sequence = suspender.sequence_number();

        suspender.suspend_ready(":1.10", sequence.wrapping_sub(1));
        suspender.suspend_ready(":1.99", sequence);
        assert_eq!(suspender.outstanding_count(), 1);
        assert_eq!(suspender.state(), SuspendState::Requested);
    }

    #[test]
    fn test_cancel() {
        let clock = FakeClock::new();
        let mut suspender =
            Suspender::new(Box::new(delegate_expecting_suspends(0)), clock.clone());
        suspender.register_suspend_delay(":1.10", 500);
        suspender.request_suspend(false);
        let sequence = suspender.sequence_number();

        suspender.cancel_suspend();
        assert_eq!(suspender.state(), SuspendState::Idle);
        assert_eq!(suspender.next_deadline(), None);
        suspender.cancel_suspend();

        suspender.suspend_ready(":1.10", sequence);
        clock.advance(Duration::from_secs(1));
        suspender.handle_timeout();
        assert_eq!(suspender.state(), SuspendState::Idle);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let clock = FakeClock::new();
        let mut suspender = Suspender::new(Box::new(delegate_expecting_suspends(0)), clock);
        suspender.register_suspend_delay(":1.10", 500);
        suspender.request_suspend(false);
        let first = suspender.sequence_number();
        suspender.cancel_suspend();
        suspender.request_suspend(false);
        assert_eq!(suspender.sequence_number(), first.wrapping_add(1));
    }

    #[test]
    fn test_unregister_mid_attempt_relies_on_timeout() {
        let clock = FakeClock::new();
        let mut suspender =
            Suspender::new(Box::new(delegate_expecting_suspends(1)), clock.clone());
        suspender.register_suspend_delay(":1.10", 500);
        suspender.request_suspend(false);

        assert!(suspender.unregister_suspend_delay(":1.10"));
        assert!(!suspender.unregister_suspend_delay(":1.10"));
        assert_eq!(suspender.outstanding_count(), 1);

        clock.advance(Duration::from_millis(500));
        suspender.handle_timeout();
        assert_eq!(suspender.state(), SuspendState::Suspending);
    }

    #[test]
    fn test_screen_lock_is_a_delay() {
        let clock = FakeClock::new();
        let mut delegate = MockSuspendDelegate::new();
        let mut seq = Sequence::new();
        delegate
            .expect_read_wakeup_count()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| None);
        delegate
            .expect_lock_screen()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        delegate
            .expect_announce_suspend()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        delegate
            .expect_suspend()
            .with(eq(None))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut suspender = Suspender::new(Box::new(delegate), clock.clone());
        suspender.register_suspend_delay(":1.10", 100);
        suspender.request_suspend(true);
        assert_eq!(
            suspender.next_deadline(),
            Some(clock.now() + SCREEN_LOCK_TIMEOUT)
        );

        suspender.suspend_ready(":1.10", suspender.sequence_number());
        assert_eq!(suspender.state(), SuspendState::Requested);
        suspender.screen_locked();
        assert_eq!(suspender.state(), SuspendState::Suspending);
    }

    #[test]
    fn test_timeout_is_capped() {
        let clock = FakeClock::new();
        let mut suspender =
            Suspender::new(Box::new(delegate_expecting_suspends(0)), clock.clone());
        suspender.register_suspend_delay(":1.10", 60_000);
        suspender.request_suspend(false);
        assert_eq!(
            suspender.next_deadline(),
            Some(clock.now() + MAX_SUSPEND_DELAY_TIMEOUT)
        );
    }
}
