// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::debug;

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleEvent {
    pub is_idle: bool,
    pub idle_time_ms: i64,
}

/// Source of idle time and threshold crossing events.
pub trait IdleDetector: Send {
    fn idle_time_ms(&self) -> i64;
    fn handle_user_activity(&mut self, when: Instant);
    /// Requests an idle event once idleness reaches `threshold_ms`.
    fn add_idle_timeout(&mut self, threshold_ms: i64);
    fn clear_timeouts(&mut self);
    fn next_deadline(&self) -> Option<Instant>;
    /// Returns the events raised since the last call, oldest first.
    fn take_events(&mut self) -> Vec<IdleEvent>;
}

#[derive(Debug)]
struct Alarm {
    threshold_ms: i64,
    fired: bool,
}

/// Idle detection based on the timestamp of the last reported user activity.
pub struct ActivityIdleDetector {
    clock: Arc<dyn Clock>,
    last_activity: Instant,
    alarms: Vec<Alarm>,
    events: Vec<IdleEvent>,
}

impl ActivityIdleDetector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let last_activity = clock.now();
        ActivityIdleDetector {
            clock,
            last_activity,
            alarms: Vec::new(),
            events: Vec::new(),
        }
    }

    fn idle_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn deadline(&self, threshold_ms: i64) -> Instant {
        self.last_activity + Duration::from_millis(threshold_ms.max(0) as u64)
    }

    fn check_alarms(&mut self, now: Instant) {
        let idle_time_ms = self.idle_duration(now).as_millis() as i64;
        for alarm in self.alarms.iter_mut().filter(|alarm| !alarm.fired) {
            if idle_time_ms >= alarm.threshold_ms {
                alarm.fired = true;
                self.events.push(IdleEvent {
                    is_idle: true,
                    idle_time_ms,
                });
            }
        }
    }
}

impl IdleDetector for ActivityIdleDetector {
    fn idle_time_ms(&self) -> i64 {
        self.idle_duration(self.clock.now()).as_millis() as i64
    }

    fn handle_user_activity(&mut self, when: Instant) {
        let now = self.clock.now();
        // Raise any crossing that happened before the activity first.
        self.check_alarms(now.min(when.max(self.last_activity)));
        let when = when.min(now);
        if when <= self.last_activity {
            debug!("Ignoring activity older than the last one");
            return;
        }
        self.last_activity = when;

        let was_idle = self.alarms.iter().any(|alarm| alarm.fired);
        for alarm in &mut self.alarms {
            alarm.fired = false;
        }
        if was_idle {
            self.events.push(IdleEvent {
                is_idle: false,
                idle_time_ms: self.idle_duration(now).as_millis() as i64,
            });
        }
    }

    fn add_idle_timeout(&mut self, threshold_ms: i64) {
        // A threshold already behind us only fires after the next activity.
        let fired = self.idle_time_ms() >= threshold_ms;
        self.alarms.push(Alarm {
            threshold_ms,
            fired,
        });
    }

    fn clear_timeouts(&mut self) {
        self.alarms.clear();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.alarms
            .iter()
            .filter(|alarm| !alarm.fired)
            .map(|alarm| self.deadline(alarm.threshold_ms))
            .min()
    }

    fn take_events(&mut self) -> Vec<IdleEvent> {
        self.check_alarms(self.clock.now());
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeClock;

    #[test]
    fn test_alarms_fire_once() {
        let clock = FakeClock::new();
        let mut detector = ActivityIdleDetector::new(clock.clone());
        detector.add_idle_timeout(1000);
        detector.add_idle_timeout(3000);
        assert_eq!(
            detector.next_deadline(),
            Some(clock.now() + Duration::from_millis(1000))
        );

        clock.advance(Duration::from_millis(500));
        assert!(detector.take_events().is_empty());

        clock.advance(Duration::from_millis(700));
        assert_eq!(
            detector.take_events(),
            vec![IdleEvent {
                is_idle: true,
                idle_time_ms: 1200
            }]
        );
        assert!(detector.take_events().is_empty());

        clock.advance(Duration::from_millis(2000));
        assert_eq!(detector.take_events().len(), 1);
        assert_eq!(detector.next_deadline(), None);
        assert_eq!(detector.idle_time_ms(), 3200);
    }

    #[test]
    fn test_activity_ends_idleness() {
        let clock = FakeClock::new();
        let mut detector = ActivityIdleDetector::new(clock.clone());
        detector.add_idle_timeout(1000);

        // Activity before any alarm fired raises nothing.
        clock.advance(Duration::from_millis(500));
        detector.handle_user_activity(clock.now());
        assert!(detector.take_events().is_empty());
        assert_eq!(detector.idle_time_ms(), 0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(detector.take_events().len(), 1);
        detector.handle_user_activity(clock.now());
        assert_eq!(
            detector.take_events(),
            vec![IdleEvent {
                is_idle: false,
                idle_time_ms: 0
            }]
        );

        // The alarm is re-armed for the next idle period.
        clock.advance(Duration::from_millis(1000));
        assert_eq!(detector.take_events().len(), 1);
    }

    #[test]
    fn test_stale_activity_is_ignored() {
        let clock = FakeClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(100));
        let mut detector = ActivityIdleDetector::new(clock.clone());
        detector.handle_user_activity(start);
        assert_eq!(detector.idle_time_ms(), 0);

        // Future timestamps are treated as now.
        clock.advance(Duration::from_millis(100));
        detector.handle_user_activity(clock.now() + Duration::from_secs(10));
        assert_eq!(detector.idle_time_ms(), 0);
    }

    #[test]
    fn test_passed_threshold_waits_for_next_idle() {
        let clock = FakeClock::new();
        let mut detector = ActivityIdleDetector::new(clock.clone());
        clock.advance(Duration::from_millis(5000));
        detector.add_idle_timeout(1000);
        detector.add_idle_timeout(8000);
        assert!(detector.take_events().is_empty());
        assert_eq!(
            detector.next_deadline(),
            Some(clock.now() + Duration::from_millis(3000))
        );

        detector.clear_timeouts();
        assert_eq!(detector.next_deadline(), None);
    }
}
