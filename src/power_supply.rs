// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::common::read_file_to_u64;
use crate::common::PluggedState;

const POWER_SUPPLY_PATH: &str = "sys/class/power_supply";
const POWER_SUPPLY_ONLINE: &str = "online";

pub trait PowerSourceProvider: Send {
    /// Returns whether line power is connected.
    fn get_plugged_state(&self) -> Result<PluggedState>;
}

#[derive(Debug)]
pub struct DirectoryPowerSourceProvider {
    pub root: PathBuf,
}

impl PowerSourceProvider for DirectoryPowerSourceProvider {
    /// Any power supply reporting `online` == 1 means the system runs on line
    /// power. Without power supplies the system is treated as on battery.
    fn get_plugged_state(&self) -> Result<PluggedState> {
        let path = self.root.join(POWER_SUPPLY_PATH);

        if !path.exists() {
            return Ok(PluggedState::Disconnected);
        }

        let dirs = path
            .read_dir()
            .with_context(|| format!("Failed to enumerate power supplies in {}", path.display()))?;

        for result in dirs {
            let supply_path = result?.path();
            let online_path = supply_path.join(POWER_SUPPLY_ONLINE);
            if !online_path.exists() {
                continue;
            }

            let online = read_file_to_u64(&online_path)
                .with_context(|| format!("Error reading online from {}", online_path.display()))?;
            if online == 1 {
                return Ok(PluggedState::Connected);
            }
        }

        Ok(PluggedState::Disconnected)
    }
}
