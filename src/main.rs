// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Manages backlight brightness, idle dimming and suspend.

use std::path::PathBuf;

use anyhow::bail;
use anyhow::Result;
use getopts::Options;
use log::error;
use log::info;
use powerd::dbus;
use powerd::dbus::ServiceOptions;
use powerd::logging;
use tokio::runtime::Builder;

fn print_usage(options: &Options, error: bool) {
    let brief = r#"Usage: powerd [options]
Power management daemon: controls the backlight, dims and turns off the
screen when idle and coordinates suspend with other processes.
"#;
    if error {
        eprintln!("{}", options.usage(brief))
    } else {
        println!("{}", options.usage(brief));
    }
}

fn main() -> Result<()> {
    let mut opts = Options::new();
    opts.optopt(
        "",
        "prefs_dir",
        "Directory holding writable preferences",
        "DIR",
    );
    opts.optopt(
        "",
        "default_prefs_dir",
        "Directory holding read-only default preferences",
        "DIR",
    );
    opts.optflag("", "log_to_stderr", "Log to stderr instead of syslog");
    opts.optflag("v", "verbose", "Enable debug logging");
    opts.optflag("h", "help", "Print this help text");

    let matches = match opts.parse(std::env::args().skip(1)) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to parse arguments: {}", e);
            print_usage(&opts, true);
            bail!("Invalid arguments");
        }
    };

    if matches.opt_present("h") {
        print_usage(&opts, false);
        return Ok(());
    }

    logging::init(
        matches.opt_present("log_to_stderr"),
        matches.opt_present("v"),
    )?;

    let mut options = ServiceOptions::default();
    if let Some(dir) = matches.opt_str("prefs_dir") {
        options.prefs_dir = PathBuf::from(dir);
    }
    if let Some(dir) = matches.opt_str("default_prefs_dir") {
        options.default_prefs_dir = PathBuf::from(dir);
    }

    info!("Starting powerd");

    let rt = Builder::new_current_thread().enable_all().build()?;
    if let Err(err) = rt.block_on(dbus::service_main(options)) {
        error!("The D-Bus service main returns error: {:?}", err);
        return Err(err);
    }

    Ok(())
}
