// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Host-facing context object.

use crate::bridge::event::{CallbackHandle, EventBridge, EventKind};
use crate::bridge::gate::LifecycleState;
use crate::bridge::worker::Worker;
use crate::config::SoundmanConfig;
use crate::device::{query_default_device, volume_from_percent, DeviceSnapshot};
use crate::error::{Result, SoundmanError};
use crate::server::Connector;
use std::cell::{Cell, Ref, RefCell};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Volume, mute and device-change control for the default output device.
///
/// Every call runs on the thread that owns the `Soundman`; requests are
/// forwarded to a worker thread that owns the server connection, and the
/// calling thread blocks until the server answers. Registered handlers run
/// on the owning thread as well, from [`Soundman::try_dispatch`],
/// [`Soundman::next_event`] or [`Soundman::dispatch_events`]. The type is
/// `!Send`.
///
/// [`Soundman::init`] needs a tokio runtime. A current-thread runtime is
/// enough.
pub struct Soundman {
    config: SoundmanConfig,
    connector: Arc<dyn Connector>,
    worker: RefCell<Option<Worker>>,
    bridge: RefCell<Option<EventBridge>>,
    /// Whether the current worker has been asked to subscribe.
    subscribed: Cell<bool>,
    /// Reported while no worker exists.
    last_state: Cell<LifecycleState>,
}

impl Soundman {
    pub fn new(config: SoundmanConfig, connector: impl Connector) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
            worker: RefCell::new(None),
            bridge: RefCell::new(None),
            subscribed: Cell::new(false),
            last_state: Cell::new(LifecycleState::Unstarted),
        }
    }

    /// Context backed by the PulseAudio server.
    #[cfg(feature = "pulse")]
    pub fn pulse(config: SoundmanConfig) -> Self {
        Self::new(config, crate::server::pulse::PulseConnector)
    }

    pub fn config(&self) -> &SoundmanConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.worker
            .borrow()
            .as_ref()
            .map_or(self.last_state.get(), Worker::state)
    }

    /// Connect to the audio server.
    ///
    /// Returns immediately while already ready or connecting. After a failed
    /// attempt or [`Soundman::uninit`] it starts a fresh connection.
    pub async fn init(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Ready => {
                // An earlier init may have been dropped before it could subscribe
                self.arm_subscription();
                return Ok(());
            }
            LifecycleState::Connecting => return Ok(()),
            LifecycleState::Unstarted | LifecycleState::Failed | LifecycleState::Terminated => {}
        }

        let stale = self.worker.borrow_mut().take();
        if let Some(stale) = stale {
            stale.shutdown();
        }
        self.subscribed.set(false);

        let worker = Worker::spawn(Arc::clone(&self.connector), &self.config)?;
        let gate = Arc::clone(worker.gate());
        *self.worker.borrow_mut() = Some(worker);

        let (state, failure) = tokio::task::spawn_blocking(move || Worker::wait_connected(&gate))
            .await
            .map_err(|e| SoundmanError::Thread(e.to_string()))?;

        match state {
            LifecycleState::Ready => {
                info!("Audio server connection ready");
                self.arm_subscription();
                Ok(())
            }
            LifecycleState::Terminated => Err(SoundmanError::Connection(
                "connection closed before it became ready".to_string(),
            )),
            _ => {
                let reason = failure.unwrap_or_else(|| "connection failed".to_string());
                warn!("Audio server connection failed: {}", reason);
                Err(SoundmanError::Connection(reason))
            }
        }
    }

    /// Disconnect, stop the worker thread and release the registered handler.
    /// Safe to call at any time, any number of times.
    pub fn uninit(&self) {
        let worker = self.worker.borrow_mut().take();
        if let Some(worker) = worker {
            worker.shutdown();
            self.last_state.set(LifecycleState::Terminated);
            info!("Audio server connection closed");
        }

        let bridge = self.bridge.borrow_mut().take();
        if let Some(bridge) = bridge {
            bridge.close();
        }
        self.subscribed.set(false);
    }

    fn worker(&self) -> Result<Ref<'_, Worker>> {
        Ref::filter_map(self.worker.borrow(), Option::as_ref).map_err(|_| SoundmanError::NotReady)
    }

    /// Fresh snapshot of the default output device, `None` if there is none.
    pub fn default_device(&self) -> Result<Option<DeviceSnapshot>> {
        let worker = self.worker()?;
        query_default_device(&worker)
    }

    /// Volume of the default device in percent, `None` if there is none.
    pub fn get_volume(&self) -> Result<Option<u32>> {
        Ok(self.default_device()?.map(|device| device.volume_percent()))
    }

    /// Set every channel of the default device to `percent`.
    ///
    /// Negative values are treated as 0. Values above 100 boost the device.
    /// Does nothing if there is no default device.
    pub fn set_volume(&self, percent: i32) -> Result<&Self> {
        let worker = self.worker()?;
        let Some(device) = query_default_device(&worker)? else {
            return Ok(self);
        };

        let volumes = vec![volume_from_percent(percent); device.channels()];
        debug!("Setting volume of '{}' to {}%", device.name, percent.max(0));
        worker.blocking_call("volume change", move |server, reply| {
            server.set_sink_volume_by_index(device.index, &volumes, reply)
        })?;
        Ok(self)
    }

    /// Mute flag of the default device, `None` if there is none.
    pub fn is_muted(&self) -> Result<Option<bool>> {
        Ok(self.default_device()?.map(|device| device.muted))
    }

    pub fn mute(&self) -> Result<&Self> {
        self.set_mute(true)
    }

    pub fn unmute(&self) -> Result<&Self> {
        self.set_mute(false)
    }

    fn set_mute(&self, mute: bool) -> Result<&Self> {
        let worker = self.worker()?;
        let Some(device) = query_default_device(&worker)? else {
            return Ok(self);
        };

        debug!("Setting mute of '{}' to {}", device.name, mute);
        worker.blocking_call("mute change", move |server, reply| {
            server.set_sink_mute_by_index(device.index, mute, reply)
        })?;
        Ok(self)
    }

    /// Register `handler` for `kind`, replacing any previous handler.
    ///
    /// `kind` is an [`EventKind`], its numeric code (`0u32`) or its name
    /// (`"device-changed"`). Unknown kinds fail without touching any state.
    /// Registration before [`Soundman::init`] is fine; the server
    /// subscription is set up once the connection is ready.
    pub fn on<K, F>(&self, kind: K, handler: F) -> Result<&Self>
    where
        K: TryInto<EventKind>,
        SoundmanError: From<K::Error>,
        F: Fn() + 'static,
    {
        let kind = kind.try_into()?;

        let replaced = self
            .bridge
            .borrow_mut()
            .get_or_insert_with(EventBridge::new)
            .replace(CallbackHandle::new(kind, handler));
        if let Some(old) = replaced {
            debug!("Replaced {} handler", old.kind());
        }

        self.arm_subscription();
        Ok(self)
    }

    /// Release the handler for `kind`. Later changes are dropped until a new
    /// handler is registered.
    pub fn off(&self, kind: EventKind) -> &Self {
        if let Some(bridge) = self.bridge.borrow_mut().as_mut() {
            if bridge.release().is_some() {
                debug!("Released {} handler", kind);
            }
        }
        self
    }

    /// Ask a ready worker to subscribe, once per connection.
    fn arm_subscription(&self) {
        if self.subscribed.get() {
            return;
        }
        let bridge = self.bridge.borrow();
        let Some(bridge) = bridge.as_ref() else {
            return;
        };
        let worker = self.worker.borrow();
        let Some(worker) = worker
            .as_ref()
            .filter(|w| w.state() == LifecycleState::Ready)
        else {
            return;
        };

        match worker.subscribe(bridge.signal()) {
            Ok(()) => {
                debug!("Requested device change subscription");
                self.subscribed.set(true);
            }
            Err(e) => warn!("Failed to request device change subscription: {}", e),
        }
    }

    /// Run the handler if a change is pending. Never blocks.
    ///
    /// Returns whether a handler ran.
    pub fn try_dispatch(&self) -> bool {
        let delivery = self
            .bridge
            .borrow()
            .as_ref()
            .and_then(EventBridge::take_delivery);

        match delivery {
            Some(handle) => {
                trace!("Delivering {}", handle.kind());
                handle.invoke();
                true
            }
            None => false,
        }
    }

    /// Wait for the next change and run the handler for it.
    ///
    /// Returns `false` once there is nothing left to wait for: no handler was
    /// ever registered, or [`Soundman::uninit`] closed the event channel.
    pub async fn next_event(&self) -> bool {
        loop {
            if self.try_dispatch() {
                return true;
            }
            let receiver = match self.bridge.borrow().as_ref() {
                Some(bridge) => bridge.receiver(),
                None => return false,
            };
            if receiver.is_closed() {
                return false;
            }
            receiver.woken().await;
        }
    }

    /// Deliver changes until the event channel closes.
    pub async fn dispatch_events(&self) {
        while self.next_event().await {}
        debug!("Event delivery stopped");
    }
}

impl Drop for Soundman {
    fn drop(&mut self) {
        self.uninit();
    }
}
