// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;
use std::time::Instant;

/// A single-shot deadline. Arming it again replaces the pending deadline, so a
/// superseded schedule can never fire.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    deadline: Option<Instant>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        OneShotTimer { deadline: None }
    }

    pub fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn arm_after(&mut self, now: Instant, delay: Duration) {
        self.arm(now + delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarms the timer and returns true if its deadline is at or before `now`.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Returns the earlier of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rearm_replaces_deadline() {
        let now = Instant::now();
        let mut timer = OneShotTimer::new();
        timer.arm_after(now, Duration::from_millis(10));
        timer.arm_after(now, Duration::from_millis(50));

        assert!(!timer.fire_if_due(now + Duration::from_millis(20)));
        assert!(timer.fire_if_due(now + Duration::from_millis(50)));
        // Single shot.
        assert!(!timer.fire_if_due(now + Duration::from_millis(100)));
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timer = OneShotTimer::new();
        timer.arm(now);
        timer.cancel();
        assert!(!timer.fire_if_due(now));
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(Some(now), None), Some(now));
        assert_eq!(earliest(None, None), None);
    }
}
