// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Default device lookup and volume conversion.

use crate::bridge::worker::Worker;
use crate::error::Result;
use tracing::debug;

/// Native volume that corresponds to 100%.
pub const NORMAL_VOLUME: u32 = 0x10000;

/// Largest valid native volume.
pub const MAX_VOLUME: u32 = u32::MAX / 2;

/// Point-in-time copy of one output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Server-assigned index. Only stable while the device exists.
    pub index: u32,
    pub name: String,
    pub description: String,
    /// Per-channel volume in native units.
    pub volumes: Vec<u32>,
    pub muted: bool,
}

impl DeviceSnapshot {
    pub fn channels(&self) -> usize {
        self.volumes.len()
    }

    /// Average channel volume as a rounded percentage of [`NORMAL_VOLUME`].
    pub fn volume_percent(&self) -> u32 {
        percent_from_volume(average_volume(&self.volumes))
    }
}

/// Integer mean of the channel volumes. Zero channels read as silence.
pub fn average_volume(volumes: &[u32]) -> u32 {
    if volumes.is_empty() {
        return 0;
    }
    let sum: u64 = volumes.iter().map(|&v| u64::from(v)).sum();
    (sum / volumes.len() as u64) as u32
}

pub fn percent_from_volume(volume: u32) -> u32 {
    (f64::from(volume) * 100.0 / f64::from(NORMAL_VOLUME)).round() as u32
}

/// Convert a percentage to native units. Negative input is treated as 0;
/// there is no upper policy limit, only the native maximum.
pub fn volume_from_percent(percent: i32) -> u32 {
    let percent = u64::from(percent.max(0).unsigned_abs());
    (percent * u64::from(NORMAL_VOLUME) / 100).min(u64::from(MAX_VOLUME)) as u32
}

/// Resolve the current default sink to a fresh snapshot.
///
/// Two sequential blocking calls: server info for the default sink name,
/// then sink info for that name. `Ok(None)` when either step finds nothing.
pub(crate) fn query_default_device(worker: &Worker) -> Result<Option<DeviceSnapshot>> {
    let info = worker.blocking_call("server info query", |server, reply| {
        server.server_info(reply)
    })?;

    let Some(name) = info.default_sink_name else {
        debug!("Server reports no default sink");
        return Ok(None);
    };

    let device = worker.blocking_call("device info query", move |server, reply| {
        server.sink_by_name(&name, reply)
    })?;

    if device.is_none() {
        debug!("Default sink is not known to the server");
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(volumes: Vec<u32>) -> DeviceSnapshot {
        DeviceSnapshot {
            index: 0,
            name: "sink".to_string(),
            description: String::new(),
            volumes,
            muted: false,
        }
    }

    #[test]
    fn test_percent_of_normal() {
        assert_eq!(snapshot(vec![NORMAL_VOLUME, NORMAL_VOLUME]).volume_percent(), 100);
        assert_eq!(snapshot(vec![NORMAL_VOLUME / 2; 2]).volume_percent(), 50);
        assert_eq!(snapshot(vec![0]).volume_percent(), 0);
    }

    #[test]
    fn test_percent_averages_channels() {
        // 100% and 50% average to 75%
        assert_eq!(snapshot(vec![NORMAL_VOLUME, NORMAL_VOLUME / 2]).volume_percent(), 75);
    }

    #[test]
    fn test_no_channels_is_silent() {
        let device = snapshot(Vec::new());
        assert_eq!(device.channels(), 0);
        assert_eq!(device.volume_percent(), 0);
    }

    #[test]
    fn test_volume_from_percent() {
        assert_eq!(volume_from_percent(100), NORMAL_VOLUME);
        assert_eq!(volume_from_percent(50), NORMAL_VOLUME / 2);
        assert_eq!(volume_from_percent(0), 0);
        assert_eq!(volume_from_percent(-20), 0);
        assert_eq!(volume_from_percent(150), NORMAL_VOLUME * 3 / 2);
        assert_eq!(volume_from_percent(i32::MAX), MAX_VOLUME);
    }

    #[test]
    fn test_percent_survives_conversion() {
        for percent in 0..=200 {
            let back = percent_from_volume(volume_from_percent(percent)) as i32;
            assert!((back - percent).abs() <= 1, "{} came back as {}", percent, back);
        }
    }
}
