// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Boundary to the audio-server client library.
//!
//! An [`AudioServer`] is created by a [`Connector`] on the worker thread and
//! never leaves it. Requests are asynchronous: each one takes a [`Reply`]
//! that the server invokes from [`AudioServer::dispatch`] once the answer
//! arrives. Dropping a reply without calling it counts as a cancelled request.

pub mod mock;
#[cfg(feature = "pulse")]
pub mod pulse;

use crate::config::SoundmanConfig;
use crate::device::DeviceSnapshot;
use thiserror::Error;

/// Facilities the device-change subscription listens to: the sink inventory
/// and the streams playing into sinks.
pub const DEVICE_FACILITIES: &[Facility] = &[Facility::Sink, Facility::SinkInput];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("request cancelled before completion")]
    Cancelled,
    #[error("client library error: {0}")]
    Client(String),
}

/// Connection state as reported by the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unconnected,
    Connecting,
    Ready,
    Failed,
    Terminated,
}

impl ServerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

/// Subset of the server info the bridge needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_name: String,
    pub default_sink_name: Option<String>,
}

/// Object categories the server reports events for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    Sink,
    SinkInput,
    Source,
    SourceOutput,
    Client,
    Server,
    Card,
    Other,
}

/// What happened to the object an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    New,
    Changed,
    Removed,
}

pub type Reply<T> = Box<dyn FnOnce(Result<T, ServerError>)>;
pub type StateObserver = Box<dyn FnMut()>;
pub type EventObserver = Box<dyn FnMut(Facility, EventOp, u32)>;

/// A connection to an audio server, driven from a single thread.
pub trait AudioServer {
    /// Start connecting. `observer` runs on every state change.
    fn connect(&mut self, observer: StateObserver) -> Result<(), ServerError>;

    fn state(&self) -> ServerState;

    /// Run every callback that is ready without blocking.
    fn dispatch(&mut self) -> Result<(), ServerError>;

    fn disconnect(&mut self);

    fn server_info(&mut self, reply: Reply<ServerInfo>);

    /// Look up a sink by name. `None` when no sink matches.
    fn sink_by_name(&mut self, name: &str, reply: Reply<Option<DeviceSnapshot>>);

    /// Set per-channel volumes (native units) of the sink at `index`.
    fn set_sink_volume_by_index(&mut self, index: u32, volumes: &[u32], reply: Reply<()>);

    fn set_sink_mute_by_index(&mut self, index: u32, mute: bool, reply: Reply<()>);

    /// Install `observer` as the event callback and arm the server-side mask.
    fn subscribe(&mut self, facilities: &[Facility], observer: EventObserver, reply: Reply<()>);
}

/// Opens server connections. Called on the worker thread.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, config: &SoundmanConfig) -> Result<Box<dyn AudioServer>, ServerError>;
}
