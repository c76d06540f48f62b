// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Preferences stored as one file per pref, searched across an ordered list of
//! directories. Writes always go to the first directory.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use futures::StreamExt;
use inotify::Inotify;
use inotify::WatchMask;
use log::error;
use log::warn;
use tokio::sync::mpsc::UnboundedSender;

use crate::common::read_file_to_string;

pub const PLUGGED_DIM_MS_PREF: &str = "plugged_dim_ms";
pub const PLUGGED_OFF_MS_PREF: &str = "plugged_off_ms";
pub const PLUGGED_SUSPEND_MS_PREF: &str = "plugged_suspend_ms";
pub const UNPLUGGED_DIM_MS_PREF: &str = "unplugged_dim_ms";
pub const UNPLUGGED_OFF_MS_PREF: &str = "unplugged_off_ms";
pub const UNPLUGGED_SUSPEND_MS_PREF: &str = "unplugged_suspend_ms";
pub const REACT_MS_PREF: &str = "react_ms";
pub const FUZZ_MS_PREF: &str = "fuzz_ms";
pub const ENFORCE_LOCK_PREF: &str = "enforce_lock";
pub const LOCK_ON_IDLE_SUSPEND_PREF: &str = "lock_on_idle_suspend";
pub const LOCK_MS_PREF: &str = "lock_ms";
pub const DISABLE_IDLE_SUSPEND_PREF: &str = "disable_idle_suspend";
pub const PLUGGED_BRIGHTNESS_OFFSET_PREF: &str = "plugged_brightness_offset";
pub const UNPLUGGED_BRIGHTNESS_OFFSET_PREF: &str = "unplugged_brightness_offset";
pub const MIN_VISIBLE_BACKLIGHT_LEVEL_PREF: &str = "min_visible_backlight_level";
pub const INSTANT_TRANSITIONS_BELOW_MIN_LEVEL_PREF: &str = "instant_transitions_below_min_level";
pub const INTERNAL_BACKLIGHT_CONTROLLER_LEVELS_PREF: &str = "internal_backlight_controller_levels";
pub const HAS_AMBIENT_LIGHT_SENSOR_PREF: &str = "has_ambient_light_sensor";
pub const STATE_MAX_DISABLED_DURATION_SEC_PREF: &str = "state_max_disabled_duration_sec";

pub const DEFAULT_READ_WRITE_PREFS_DIR: &str = "/var/lib/power_manager";
pub const DEFAULT_READ_ONLY_PREFS_DIR: &str = "/usr/share/power_manager";

pub trait Prefs: Send + Sync {
    fn get_int64(&self, name: &str) -> Option<i64>;
    fn get_double(&self, name: &str) -> Option<f64>;
    fn set_int64(&self, name: &str, value: i64) -> Result<()>;
    fn set_double(&self, name: &str, value: f64) -> Result<()>;

    fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_int64(name).map(|value| value != 0)
    }
}

#[derive(Debug)]
pub struct DirectoryPrefs {
    dirs: Vec<PathBuf>,
}

impl DirectoryPrefs {
    /// `dirs` are searched in order. The first one is writable.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        DirectoryPrefs { dirs }
    }

    pub fn writable_dir(&self) -> Option<&Path> {
        self.dirs.first().map(PathBuf::as_path)
    }

    fn get_string(&self, name: &str) -> Option<String> {
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .filter(|path| path.exists())
            .find_map(|path| match read_file_to_string(&path) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Failed to read pref {}: {:#}", path.display(), e);
                    None
                }
            })
    }

    fn set_string(&self, name: &str, value: &str) -> Result<()> {
        let dir = self.writable_dir().context("No writable pref directory")?;
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, value).with_context(|| format!("Failed to write {}", path.display()))
    }
}

impl Prefs for DirectoryPrefs {
    fn get_int64(&self, name: &str) -> Option<i64> {
        let value = self.get_string(name)?;
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!("Pref {} has non-integer value \"{}\"", name, value);
                None
            }
        }
    }

    fn get_double(&self, name: &str) -> Option<f64> {
        let value = self.get_string(name)?;
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!("Pref {} has non-numeric value \"{}\"", name, value);
                None
            }
        }
    }

    fn set_int64(&self, name: &str, value: i64) -> Result<()> {
        self.set_string(name, &value.to_string())
    }

    fn set_double(&self, name: &str, value: f64) -> Result<()> {
        self.set_string(name, &value.to_string())
    }
}

/// Sends the name of every pref file written, moved into or removed from `dir`.
pub fn watch_prefs_dir(dir: &Path, sender: UnboundedSender<String>) -> Result<()> {
    let mut inotify = Inotify::init().context("Failed to start inotify")?;
    inotify
        .add_watch(
            dir,
            WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO | WatchMask::DELETE,
        )
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    let mut events = inotify
        .event_stream([0; 1024])
        .context("Failed to create inotify event stream")?;

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    error!("Failed to read pref change event: {}", e);
                    continue;
                }
            };
            let Some(name) = event.name.and_then(|name| name.into_string().ok()) else {
                continue;
            };
            if sender.send(name).is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_order_and_write_target() {
        let rw = tempfile::tempdir().unwrap();
        let ro = tempfile::tempdir().unwrap();
        fs::write(ro.path().join(REACT_MS_PREF), "30000\n").unwrap();
        fs::write(ro.path().join(PLUGGED_DIM_MS_PREF), "480000").unwrap();
        fs::write(rw.path().join(PLUGGED_DIM_MS_PREF), "120000").unwrap();

        let prefs = DirectoryPrefs::new(vec![rw.path().to_path_buf(), ro.path().to_path_buf()]);
        assert_eq!(prefs.get_int64(REACT_MS_PREF), Some(30000));
        assert_eq!(prefs.get_int64(PLUGGED_DIM_MS_PREF), Some(120000));
        assert_eq!(prefs.get_int64(FUZZ_MS_PREF), None);

        prefs.set_double(PLUGGED_BRIGHTNESS_OFFSET_PREF, 42.5).unwrap();
        assert_eq!(prefs.get_double(PLUGGED_BRIGHTNESS_OFFSET_PREF), Some(42.5));
        assert!(rw.path().join(PLUGGED_BRIGHTNESS_OFFSET_PREF).exists());
        assert!(!ro.path().join(PLUGGED_BRIGHTNESS_OFFSET_PREF).exists());
    }

    #[test]
    fn test_malformed_values() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_MS_PREF), "soon").unwrap();
        fs::write(dir.path().join(ENFORCE_LOCK_PREF), "1").unwrap();

        let prefs = DirectoryPrefs::new(vec![dir.path().to_path_buf()]);
        assert_eq!(prefs.get_int64(LOCK_MS_PREF), None);
        assert_eq!(prefs.get_double(LOCK_MS_PREF), None);
        assert_eq!(prefs.get_bool(ENFORCE_LOCK_PREF), Some(true));
    }

    #[tokio::test]
    async fn test_watch_prefs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        watch_prefs_dir(dir.path(), sender).unwrap();

        fs::write(dir.path().join(DISABLE_IDLE_SUSPEND_PREF), "1").unwrap();
        let name = tokio::time::timeout(std::time::Duration::from_secs(5), receiver.recv())
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some(DISABLE_IDLE_SUSPEND_PREF));
    }
}
