// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cross-thread change notifications.
//!
//! The worker thread only ever sets a single "something changed" flag and
//! wakes the host. The host reads the flag and runs whichever handler is
//! registered at that moment, on its own thread. Signals sent before the host
//! gets around to it collapse into one delivery.

use crate::error::SoundmanError;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Events a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The default output device (or a stream playing into it) changed.
    DeviceChanged,
}

impl EventKind {
    pub const fn code(self) -> u32 {
        match self {
            Self::DeviceChanged => 0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::DeviceChanged => "device-changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u32> for EventKind {
    type Error = SoundmanError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::DeviceChanged),
            other => Err(SoundmanError::InvalidArgument(format!(
                "no such event: {}",
                other
            ))),
        }
    }
}

impl FromStr for EventKind {
    type Err = SoundmanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device-changed" | "SinkNotify" => Ok(Self::DeviceChanged),
            other => Err(SoundmanError::InvalidArgument(format!(
                "no such event: {:?}",
                other
            ))),
        }
    }
}

impl TryFrom<&str> for EventKind {
    type Error = SoundmanError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

struct ChannelShared {
    pending: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

/// Sending half, handed to the worker's event observer.
#[derive(Clone)]
pub(crate) struct EventSignal {
    shared: Arc<ChannelShared>,
}

impl EventSignal {
    /// Mark a change and wake the host. Repeated sends before the host
    /// observes the first one have no further effect.
    pub fn send(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.shared.pending.swap(true, Ordering::AcqRel) {
            self.shared.notify.notify_one();
        }
    }
}

/// Receiving half, kept by the host for waiting.
#[derive(Clone)]
pub(crate) struct EventReceiver {
    shared: Arc<ChannelShared>,
}

impl EventReceiver {
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Resolve after the next send or close. May also resolve early for a
    /// signal the host already consumed; callers re-check.
    pub async fn woken(&self) {
        self.shared.notify.notified().await;
    }
}

/// Owned user handler for one event kind.
#[derive(Clone)]
pub(crate) struct CallbackHandle {
    kind: EventKind,
    handler: Rc<dyn Fn()>,
}

impl CallbackHandle {
    pub fn new(kind: EventKind, handler: impl Fn() + 'static) -> Self {
        Self {
            kind,
            handler: Rc::new(handler),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn invoke(&self) {
        (self.handler)();
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Host-side bridge: the wake channel plus the currently registered handler.
pub(crate) struct EventBridge {
    shared: Arc<ChannelShared>,
    handle: Option<CallbackHandle>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            handle: None,
        }
    }

    pub fn signal(&self) -> EventSignal {
        EventSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn receiver(&self) -> EventReceiver {
        EventReceiver {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Install `handle`, dropping the previous one.
    pub fn replace(&mut self, handle: CallbackHandle) -> Option<CallbackHandle> {
        self.handle.replace(handle)
    }

    pub fn release(&mut self) -> Option<CallbackHandle> {
        self.handle.take()
    }

    #[cfg(test)]
    pub fn has_handler(&self) -> bool {
        self.handle.is_some()
    }

    /// Consume a pending signal and return the handler to run for it.
    pub fn take_delivery(&self) -> Option<CallbackHandle> {
        if !self.shared.pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.handle.clone()
    }

    /// Stop accepting signals and wake any waiting host task.
    pub fn close(mut self) {
        self.handle = None;
        self.shared.closed.store(true, Ordering::Release);
        self.shared.pending.store(false, Ordering::Release);
        self.shared.notify.notify_waiters();
        self.shared.notify.notify_one();
    }
}
