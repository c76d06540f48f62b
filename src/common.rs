// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

pub const MAX_PERCENT: f64 = 100.0;

/// Backlight power state. Owned by the backlight controller and only changed
/// through `BacklightController::set_power_state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PowerState {
    Uninitialized,
    Active,
    Dim,
    // Dimming was requested while the backlight was already below the dim level.
    AlreadyDimmed,
    IdleOff,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PowerState::Uninitialized => "UNINITIALIZED",
            PowerState::Active => "ACTIVE",
            PowerState::Dim => "DIM",
            PowerState::AlreadyDimmed => "ALREADY_DIMMED",
            PowerState::IdleOff => "IDLE_OFF",
            PowerState::Suspended => "SUSPENDED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PluggedState {
    Connected,
    Disconnected,
    Unknown,
}

impl PluggedState {
    pub fn from_plugged(is_plugged: bool) -> PluggedState {
        if is_plugged {
            PluggedState::Connected
        } else {
            PluggedState::Disconnected
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrightnessChangeCause {
    Automated,
    UserInitiated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionStyle {
    Instant,
    Fast,
    Slow,
}

impl TryFrom<u32> for TransitionStyle {
    type Error = anyhow::Error;

    fn try_from(style_raw: u32) -> Result<TransitionStyle> {
        Ok(match style_raw {
            0 => TransitionStyle::Instant,
            1 => TransitionStyle::Fast,
            2 => TransitionStyle::Slow,
            _ => bail!("Unsupported transition style {}", style_raw),
        })
    }
}

// Extract the parsing function for unittest.
pub fn parse_file_to_u64<R: BufRead>(reader: R) -> Result<u64> {
    let first_line = reader.lines().next().context("No content in buffer")??;
    first_line
        .trim()
        .parse()
        .with_context(|| format!("Couldn't parse \"{}\" as u64", first_line))
}

/// Get the first line in a file and parse as u64.
pub fn read_file_to_u64<P: AsRef<Path>>(filename: P) -> Result<u64> {
    let reader = File::open(filename).map(BufReader::new)?;
    parse_file_to_u64(reader)
}

/// Get the first line in a file with surrounding whitespace removed.
pub fn read_file_to_string<P: AsRef<Path>>(filename: P) -> Result<String> {
    let path = filename.as_ref();
    let reader = File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let first_line = reader
        .lines()
        .next()
        .with_context(|| format!("No content in {}", path.display()))??;
    Ok(first_line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_to_u64() {
        assert_eq!(parse_file_to_u64("123".as_bytes()).unwrap(), 123);
        assert_eq!(parse_file_to_u64("456\n789".as_bytes()).unwrap(), 456);
        assert_eq!(parse_file_to_u64(" 42 \n".as_bytes()).unwrap(), 42);
        assert!(parse_file_to_u64("".as_bytes()).is_err());
        assert!(parse_file_to_u64("-1".as_bytes()).is_err());
        assert!(parse_file_to_u64("abc".as_bytes()).is_err());
    }

    #[test]
    fn test_read_file_to_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, "  on \nignored\n").unwrap();
        assert_eq!(read_file_to_string(&path).unwrap(), "on");
        assert!(read_file_to_string(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_transition_style_from_u32() {
        assert_eq!(
            TransitionStyle::try_from(0).unwrap(),
            TransitionStyle::Instant
        );
        assert_eq!(TransitionStyle::try_from(2).unwrap(), TransitionStyle::Slow);
        assert!(TransitionStyle::try_from(3).is_err());
    }

    #[test]
    fn test_power_state_display() {
        assert_eq!(PowerState::AlreadyDimmed.to_string(), "ALREADY_DIMMED");
        assert_eq!(PowerState::IdleOff.to_string(), "IDLE_OFF");
    }
}
