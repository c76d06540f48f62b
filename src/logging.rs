// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;
use anyhow::Result;
use log::LevelFilter;
use syslog::BasicLogger;
use syslog::Facility;
use syslog::Formatter3164;

const IDENT: &str = "powerd";

/// Sends log records to syslog, or to stderr when `log_to_stderr` is set.
/// The default level is info; `verbose` enables debug.
pub fn init(log_to_stderr: bool, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    if log_to_stderr {
        stderrlog::new()
            .module(IDENT)
            .verbosity(if verbose { 3 } else { 2 })
            .init()
            .map_err(|e| anyhow!("Failed to initialize stderr logging: {}", e))?;
    } else {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: IDENT.into(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow!("Could not connect to syslog: {}", e))?;
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map_err(|e| anyhow!("Failed to install syslog logger: {}", e))?;
    }
    log::set_max_level(level);
    Ok(())
}

fn level_filter(level_raw: u8) -> Option<LevelFilter> {
    Some(match level_raw {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        _ => return None,
    })
}

/// Changes the log level at runtime. 0 turns logging off, 5 is trace.
pub fn set_log_level(level_raw: u8) -> Result<LevelFilter> {
    let level =
        level_filter(level_raw).ok_or_else(|| anyhow!("Unsupported log level {}", level_raw))?;
    log::set_max_level(level);
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(0), Some(LevelFilter::Off));
        assert_eq!(level_filter(3), Some(LevelFilter::Info));
        assert_eq!(level_filter(5), Some(LevelFilter::Trace));
        assert_eq!(level_filter(6), None);
    }

    #[test]
    fn test_set_log_level_rejects_unknown() {
        assert!(set_log_level(9).is_err());
    }
}
