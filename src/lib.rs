// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod activity;
pub mod als;
pub mod backlight;
pub mod backlight_controller;
pub mod brightness_curve;
pub mod clock;
pub mod common;
pub mod daemon;
pub mod dbus;
pub mod idle;
pub mod idle_timeouts;
pub mod logging;
mod name_owner_listener;
pub mod power_supply;
pub mod prefs;
pub mod state_control;
pub mod suspender;
pub mod timer;

#[cfg(test)]
mod test_utils;
