// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Soundman - watches the default output device and logs its volume and mute
//! state whenever it changes.

use soundman::{ConfigManager, EventKind, Soundman};
use std::rc::Rc;
use tracing::{info, warn};

fn log_device(soundman: &Soundman) {
    match (soundman.get_volume(), soundman.is_muted()) {
        (Ok(Some(volume)), Ok(Some(muted))) => {
            info!("Default output: volume {}%, muted: {}", volume, muted)
        }
        (Ok(None), _) | (_, Ok(None)) => info!("No default output device"),
        (Err(e), _) | (_, Err(e)) => warn!("Failed to query default output: {}", e),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("soundman=info".parse()?),
        )
        .init();

    info!("Soundman starting...");

    let config_manager = ConfigManager::new()?;
    let config = config_manager.load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        Default::default()
    });

    let soundman = Rc::new(Soundman::pulse(config));
    soundman.init().await?;
    log_device(&soundman);

    let weak = Rc::downgrade(&soundman);
    soundman.on(EventKind::DeviceChanged, move || {
        if let Some(soundman) = weak.upgrade() {
            log_device(&soundman);
        }
    })?;

    // Handle shutdown signals
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = soundman.dispatch_events() => {
            warn!("Event delivery ended unexpectedly");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    soundman.uninit();
    info!("Soundman stopped");
    Ok(())
}
