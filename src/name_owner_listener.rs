// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::SyncConnection;
use log::debug;
use log::error;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;

pub trait NameLostCallback: Send {
    fn on_name_lost(&self, name: &str) -> Result<()>;
}

#[derive(Debug, PartialEq, Eq)]
struct NameOwnerChangeInfo {
    name: String,
    old: String,
    new: String,
}

impl NameOwnerChangeInfo {
    // A name that had an owner and now has none.
    fn lost_name(self) -> Option<String> {
        if !self.old.is_empty() && self.new.is_empty() {
            Some(self.name)
        } else {
            None
        }
    }
}

async fn handle_name_owner_changes<T: NameLostCallback>(
    mut receiver: UnboundedReceiver<NameOwnerChangeInfo>,
    cb: T,
) {
    while let Some(msg) = receiver.recv().await {
        let Some(name) = msg.lost_name() else {
            continue;
        };
        debug!("{} left the bus", name);
        if let Err(e) = cb.on_name_lost(&name) {
            error!("Error handling loss of {}: {:?}", name, e);
        }
    }
}

/// Invokes the callback whenever a bus name loses its owner, e.g. when a
/// client process exits.
pub async fn monitor_lost_names<T: NameLostCallback + 'static>(
    conn: &Arc<SyncConnection>,
    cb: T,
) -> Result<()> {
    let name_owner_change_signal =
        MatchRule::new_signal("org.freedesktop.DBus", "NameOwnerChanged");

    conn.add_match_no_cb(&name_owner_change_signal.match_str())
        .await
        .context("failed to add match")?;

    let (sender, receiver) = unbounded_channel();

    tokio::spawn(handle_name_owner_changes(receiver, cb));

    conn.start_receive(
        name_owner_change_signal,
        Box::new(move |msg, _| {
            let (name, old, new): (String, String, String) = match msg.read3() {
                Ok(res) => res,
                Err(e) => {
                    error!("Malformed signal: {:?}", e);
                    return true;
                }
            };

            if let Err(e) = sender.send(NameOwnerChangeInfo { name, old, new }) {
                error!("error dispatching name owner change: {:?}", e)
            }
            true
        }),
    );

    Ok(())
}
