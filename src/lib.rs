// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Soundman - volume, mute and device-change control for the default audio
//! output device.
//!
//! The audio server client runs on its own worker thread. [`Soundman`] gives
//! the host thread a synchronous view of it: each call submits a request,
//! blocks until the server answers, and returns the result. Device-change
//! notifications raised on the worker are coalesced and delivered to a
//! handler on the host thread.
//!
//! ```no_run
//! use soundman::{EventKind, Soundman, SoundmanConfig};
//!
//! # #[cfg(feature = "pulse")]
//! # async fn demo() -> soundman::Result<()> {
//! let soundman = Soundman::pulse(SoundmanConfig::default());
//! soundman.init().await?;
//!
//! soundman.set_volume(50)?.unmute()?;
//! println!("volume: {:?}", soundman.get_volume()?);
//!
//! soundman.on(EventKind::DeviceChanged, || println!("device changed"))?;
//! soundman.dispatch_events().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod server;
mod soundman;

pub use bridge::{EventKind, LifecycleState};
pub use config::{ConfigError, ConfigManager, SoundmanConfig};
pub use device::DeviceSnapshot;
pub use error::{Result, SoundmanError};
pub use server::{AudioServer, Connector, ServerError};
pub use soundman::Soundman;
