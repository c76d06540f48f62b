// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use thiserror::Error as ThisError;

use crate::common::read_file_to_u64;

const BACKLIGHT_PATH: &str = "sys/class/backlight";
const MAX_BRIGHTNESS: &str = "max_brightness";
const BRIGHTNESS: &str = "brightness";
const ACTUAL_BRIGHTNESS: &str = "actual_brightness";

#[derive(Debug, ThisError)]
pub enum BacklightError {
    #[error("backlight controller is not initialized")]
    NotInitialized,
    #[error("backlight device error: {0:#}")]
    Device(#[source] anyhow::Error),
    #[error("invalid maximum backlight level {0}")]
    InvalidMaxLevel(i64),
}

/// Hardware backlight device. Failures are reported to the caller, which
/// decides whether they are fatal.
pub trait Backlight: Send {
    fn max_level(&self) -> Result<i64>;
    fn current_level(&self) -> Result<i64>;
    fn set_level(&mut self, level: i64) -> Result<()>;
}

#[derive(Debug)]
pub struct SysfsBacklight {
    dir: PathBuf,
}

impl SysfsBacklight {
    pub fn new(dir: PathBuf) -> Self {
        SysfsBacklight { dir }
    }

    /// Picks the first backlight device exposing `max_brightness` under `root`.
    pub fn find(root: &Path) -> Result<Self> {
        let path = root.join(BACKLIGHT_PATH);
        let mut dirs: Vec<PathBuf> = path
            .read_dir()
            .with_context(|| format!("Failed to enumerate backlights in {}", path.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|dir| dir.join(MAX_BRIGHTNESS).exists())
            .collect();
        dirs.sort();
        match dirs.into_iter().next() {
            Some(dir) => Ok(SysfsBacklight::new(dir)),
            None => bail!("No backlight device found in {}", path.display()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_level(&self, file: &str) -> Result<i64> {
        let path = self.dir.join(file);
        let level = read_file_to_u64(&path)
            .with_context(|| format!("Error reading {}", path.display()))?;
        Ok(level as i64)
    }
}

impl Backlight for SysfsBacklight {
    fn max_level(&self) -> Result<i64> {
        self.read_level(MAX_BRIGHTNESS)
    }

    fn current_level(&self) -> Result<i64> {
        if self.dir.join(ACTUAL_BRIGHTNESS).exists() {
            self.read_level(ACTUAL_BRIGHTNESS)
        } else {
            self.read_level(BRIGHTNESS)
        }
    }

    fn set_level(&mut self, level: i64) -> Result<()> {
        if level < 0 {
            bail!("Invalid backlight level {}", level);
        }
        let path = self.dir.join(BRIGHTNESS);
        fs::write(&path, level.to_string())
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
