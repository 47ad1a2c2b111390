// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory audio server for testing without a sound server.
//!
//! A [`MockServer`] is both the [`Connector`] handed to
//! [`Soundman`](crate::Soundman) and the test's remote control: it can add
//! and change sinks behind the client's back, refuse connections, hold
//! requests unanswered and drop an established connection.
//!
//! Requests are answered on the next dispatch pass of the worker, never
//! inline, so the asynchronous path is always exercised.
//!
//! # Usage
//!
//! ```no_run
//! use soundman::server::mock::MockServer;
//! use soundman::{Soundman, SoundmanConfig};
//!
//! # async fn demo() -> soundman::Result<()> {
//! let mock = MockServer::with_default_sink("speakers", 2);
//! let soundman = Soundman::new(SoundmanConfig::default(), mock.clone());
//! soundman.init().await?;
//! soundman.set_volume(40)?;
//! assert_eq!(mock.sink("speakers").unwrap().volume_percent(), 40);
//! # Ok(())
//! # }
//! ```

use crate::config::SoundmanConfig;
use crate::device::{volume_from_percent, DeviceSnapshot, NORMAL_VOLUME};
use crate::server::{
    AudioServer, Connector, EventObserver, EventOp, Facility, Reply, ServerError, ServerInfo,
    ServerState, StateObserver,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct MockSink {
    index: u32,
    name: String,
    description: String,
    volumes: Vec<u32>,
    muted: bool,
}

impl MockSink {
    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            index: self.index,
            name: self.name.clone(),
            description: self.description.clone(),
            volumes: self.volumes.clone(),
            muted: self.muted,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    sinks: Vec<MockSink>,
    default_sink: Option<String>,
    next_index: u32,
    refuse_connections: bool,
    hold_connecting: bool,
    stall_requests: bool,
    reject_writes: bool,
    connection_dropped: bool,
    connections: u32,
    /// Facilities armed by the live connection's subscription.
    subscribed: Vec<Facility>,
    events: VecDeque<(Facility, EventOp, u32)>,
}

impl MockState {
    fn emit(&mut self, facility: Facility, op: EventOp, index: u32) {
        if self.subscribed.contains(&facility) {
            self.events.push_back((facility, op, index));
        }
    }

    fn sink_mut(&mut self, name: &str) -> Option<&mut MockSink> {
        self.sinks.iter_mut().find(|s| s.name == name)
    }
}

/// Shared handle to an in-memory audio server.
#[derive(Clone, Default)]
pub struct MockServer {
    shared: Arc<Mutex<MockState>>,
}

impl MockServer {
    /// A server with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// A server with one sink at 100%, set as the default.
    pub fn with_default_sink(name: &str, channels: usize) -> Self {
        let server = Self::new();
        server.add_sink(name, channels);
        server.set_default_sink(Some(name));
        server
    }

    /// Add a sink at 100% and return its index.
    pub fn add_sink(&self, name: &str, channels: usize) -> u32 {
        let mut state = self.shared.lock();
        let index = state.next_index;
        state.next_index += 1;
        state.sinks.push(MockSink {
            index,
            name: name.to_string(),
            description: format!("Mock sink {}", name),
            volumes: vec![NORMAL_VOLUME; channels],
            muted: false,
        });
        state.emit(Facility::Sink, EventOp::New, index);
        index
    }

    pub fn remove_sink(&self, name: &str) {
        let mut state = self.shared.lock();
        if let Some(pos) = state.sinks.iter().position(|s| s.name == name) {
            let sink = state.sinks.remove(pos);
            state.emit(Facility::Sink, EventOp::Removed, sink.index);
        }
    }

    /// Point the default at `name`, which does not have to exist.
    pub fn set_default_sink(&self, name: Option<&str>) {
        let mut state = self.shared.lock();
        state.default_sink = name.map(str::to_string);
        state.emit(Facility::Server, EventOp::Changed, 0);
    }

    /// Change a sink's volume as another client would.
    pub fn set_volume_externally(&self, name: &str, percent: i32) {
        let mut state = self.shared.lock();
        let volume = volume_from_percent(percent);
        let Some(sink) = state.sink_mut(name) else {
            return;
        };
        sink.volumes.iter_mut().for_each(|v| *v = volume);
        let index = sink.index;
        state.emit(Facility::Sink, EventOp::Changed, index);
    }

    /// Change a sink's mute flag as another client would.
    pub fn set_mute_externally(&self, name: &str, muted: bool) {
        let mut state = self.shared.lock();
        let Some(sink) = state.sink_mut(name) else {
            return;
        };
        sink.muted = muted;
        let index = sink.index;
        state.emit(Facility::Sink, EventOp::Changed, index);
    }

    pub fn sink(&self, name: &str) -> Option<DeviceSnapshot> {
        let state = self.shared.lock();
        state.sinks.iter().find(|s| s.name == name).map(MockSink::snapshot)
    }

    /// Make new connections fail instead of becoming ready.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse_connections = refuse;
    }

    /// Keep new connections in the connecting state.
    pub fn hold_connecting(&self, hold: bool) {
        self.shared.lock().hold_connecting = hold;
    }

    /// Keep requests queued without answering them.
    pub fn stall_requests(&self, stall: bool) {
        self.shared.lock().stall_requests = stall;
    }

    /// Answer volume and mute writes with an error.
    pub fn reject_writes(&self, reject: bool) {
        self.shared.lock().reject_writes = reject;
    }

    /// Fail the live connection on its next dispatch pass.
    pub fn drop_connection(&self) {
        self.shared.lock().connection_dropped = true;
    }

    /// Number of connections opened so far.
    pub fn connections(&self) -> u32 {
        self.shared.lock().connections
    }

    pub fn is_subscribed(&self) -> bool {
        !self.shared.lock().subscribed.is_empty()
    }

    /// Poll until a subscription is armed or `timeout` passes.
    pub fn wait_for_subscription(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_subscribed() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.is_subscribed()
    }
}

impl Connector for MockServer {
    fn open(&self, config: &SoundmanConfig) -> Result<Box<dyn AudioServer>, ServerError> {
        debug!("Mock connection opened for '{}'", config.application_name);
        Ok(Box::new(MockConnection {
            shared: Arc::clone(&self.shared),
            state: ServerState::Unconnected,
            state_observer: None,
            event_observer: None,
            queue: VecDeque::new(),
        }))
    }
}

enum Request {
    ServerInfo(Reply<ServerInfo>),
    SinkByName(String, Reply<Option<DeviceSnapshot>>),
    SetVolume(u32, Vec<u32>, Reply<()>),
    SetMute(u32, bool, Reply<()>),
    Subscribe(Vec<Facility>, Reply<()>),
}

struct MockConnection {
    shared: Arc<Mutex<MockState>>,
    state: ServerState,
    state_observer: Option<StateObserver>,
    event_observer: Option<EventObserver>,
    queue: VecDeque<Request>,
}

impl MockConnection {
    fn set_state(&mut self, next: ServerState) {
        if next == self.state {
            return;
        }
        trace!("Mock connection {:?} -> {:?}", self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.shared.lock().subscribed.clear();
            // Unanswered requests are cancelled with the connection
            self.queue.clear();
        }
        if let Some(observer) = self.state_observer.as_mut() {
            observer();
        }
    }

    fn advance_state(&mut self) {
        let (refused, held, dropped) = {
            let state = self.shared.lock();
            (
                state.refuse_connections,
                state.hold_connecting,
                state.connection_dropped,
            )
        };
        let next = match self.state {
            ServerState::Connecting if held => ServerState::Connecting,
            ServerState::Connecting if refused => ServerState::Failed,
            ServerState::Connecting => ServerState::Ready,
            ServerState::Ready if dropped => ServerState::Failed,
            other => other,
        };
        self.set_state(next);
    }

    fn answer(&mut self, request: Request) {
        match request {
            Request::ServerInfo(reply) => {
                let default_sink_name = self.shared.lock().default_sink.clone();
                reply(Ok(ServerInfo {
                    server_name: "mock".to_string(),
                    default_sink_name,
                }));
            }
            Request::SinkByName(name, reply) => {
                let sink = self
                    .shared
                    .lock()
                    .sinks
                    .iter()
                    .find(|s| s.name == name)
                    .map(MockSink::snapshot);
                reply(Ok(sink));
            }
            Request::SetVolume(index, volumes, reply) => {
                let result = self.write_sink(index, |sink| {
                    if sink.volumes.len() != volumes.len() {
                        return Err(ServerError::Rejected("channel count mismatch".to_string()));
                    }
                    sink.volumes.clone_from(&volumes);
                    Ok(())
                });
                reply(result);
            }
            Request::SetMute(index, muted, reply) => {
                let result = self.write_sink(index, |sink| {
                    sink.muted = muted;
                    Ok(())
                });
                reply(result);
            }
            Request::Subscribe(facilities, reply) => {
                let mut state = self.shared.lock();
                state.subscribed = facilities;
                state.events.clear();
                drop(state);
                reply(Ok(()));
            }
        }
    }

    fn write_sink(
        &self,
        index: u32,
        write: impl FnOnce(&mut MockSink) -> Result<(), ServerError>,
    ) -> Result<(), ServerError> {
        let mut state = self.shared.lock();
        if state.reject_writes {
            return Err(ServerError::Rejected("access denied".to_string()));
        }
        let sink = state
            .sinks
            .iter_mut()
            .find(|s| s.index == index)
            .ok_or_else(|| ServerError::Rejected(format!("no sink with index {}", index)))?;
        write(sink)?;
        state.emit(Facility::Sink, EventOp::Changed, index);
        Ok(())
    }

    fn deliver_events(&mut self) {
        let events: Vec<_> = self.shared.lock().events.drain(..).collect();
        if let Some(observer) = self.event_observer.as_mut() {
            for (facility, op, index) in events {
                observer(facility, op, index);
            }
        }
    }

    fn enqueue(&mut self, request: Request) {
        if self.state == ServerState::Ready {
            self.queue.push_back(request);
        } else {
            reject_not_ready(request);
        }
    }
}

fn reject_not_ready(request: Request) {
    let error = ServerError::Client("context is not ready".to_string());
    match request {
        Request::ServerInfo(reply) => reply(Err(error)),
        Request::SinkByName(_, reply) => reply(Err(error)),
        Request::SetVolume(_, _, reply) => reply(Err(error)),
        Request::SetMute(_, _, reply) => reply(Err(error)),
        Request::Subscribe(_, reply) => reply(Err(error)),
    }
}

impl AudioServer for MockConnection {
    fn connect(&mut self, observer: StateObserver) -> Result<(), ServerError> {
        if self.state != ServerState::Unconnected {
            return Err(ServerError::Client("already connected".to_string()));
        }
        {
            let mut state = self.shared.lock();
            state.connections += 1;
            state.connection_dropped = false;
        }
        self.state_observer = Some(observer);
        self.set_state(ServerState::Connecting);
        Ok(())
    }

    fn state(&self) -> ServerState {
        self.state
    }

    fn dispatch(&mut self) -> Result<(), ServerError> {
        self.advance_state();
        if self.state != ServerState::Ready {
            return Ok(());
        }

        if !self.shared.lock().stall_requests {
            while let Some(request) = self.queue.pop_front() {
                self.answer(request);
            }
        }
        self.deliver_events();
        Ok(())
    }

    fn disconnect(&mut self) {
        self.set_state(ServerState::Terminated);
    }

    fn server_info(&mut self, reply: Reply<ServerInfo>) {
        self.enqueue(Request::ServerInfo(reply));
    }

    fn sink_by_name(&mut self, name: &str, reply: Reply<Option<DeviceSnapshot>>) {
        self.enqueue(Request::SinkByName(name.to_string(), reply));
    }

    fn set_sink_volume_by_index(&mut self, index: u32, volumes: &[u32], reply: Reply<()>) {
        self.enqueue(Request::SetVolume(index, volumes.to_vec(), reply));
    }

    fn set_sink_mute_by_index(&mut self, index: u32, mute: bool, reply: Reply<()>) {
        self.enqueue(Request::SetMute(index, mute, reply));
    }

    fn subscribe(&mut self, facilities: &[Facility], observer: EventObserver, reply: Reply<()>) {
        self.event_observer = Some(observer);
        self.enqueue(Request::Subscribe(facilities.to_vec(), reply));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn open(mock: &MockServer) -> Box<dyn AudioServer> {
        let mut conn = mock.open(&SoundmanConfig::default()).unwrap();
        conn.connect(Box::new(|| {})).unwrap();
        conn
    }

    fn capture<T: 'static>() -> (Rc<RefCell<Option<Result<T, ServerError>>>>, Reply<T>) {
        let slot = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        (slot, Box::new(move |r| *sink.borrow_mut() = Some(r)))
    }

    #[test]
    fn test_connects_on_first_dispatch() {
        let mock = MockServer::new();
        let mut conn = open(&mock);
        assert_eq!(conn.state(), ServerState::Connecting);
        conn.dispatch().unwrap();
        assert_eq!(conn.state(), ServerState::Ready);
        assert_eq!(mock.connections(), 1);
    }

    #[test]
    fn test_held_connection_stays_connecting() {
        let mock = MockServer::new();
        mock.hold_connecting(true);
        let mut conn = open(&mock);
        conn.dispatch().unwrap();
        assert_eq!(conn.state(), ServerState::Connecting);

        mock.hold_connecting(false);
        conn.dispatch().unwrap();
        assert_eq!(conn.state(), ServerState::Ready);
    }

    #[test]
    fn test_refused_connection_fails() {
        let mock = MockServer::new();
        mock.refuse_connections(true);
        let mut conn = open(&mock);
        conn.dispatch().unwrap();
        assert_eq!(conn.state(), ServerState::Failed);
    }

    #[test]
    fn test_requests_are_answered_on_dispatch() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let mut conn = open(&mock);
        conn.dispatch().unwrap();

        let (slot, reply) = capture();
        conn.server_info(reply);
        assert!(slot.borrow().is_none());

        conn.dispatch().unwrap();
        let info = slot.borrow_mut().take().unwrap().unwrap();
        assert_eq!(info.default_sink_name.as_deref(), Some("speakers"));
    }

    #[test]
    fn test_request_before_ready_is_rejected() {
        let mock = MockServer::new();
        let mut conn = open(&mock);
        let (slot, reply) = capture();
        conn.server_info(reply);
        assert!(matches!(
            slot.borrow_mut().take(),
            Some(Err(ServerError::Client(_)))
        ));
    }

    #[test]
    fn test_stalled_requests_wait() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let mut conn = open(&mock);
        conn.dispatch().unwrap();
        mock.stall_requests(true);

        let (slot, reply) = capture();
        conn.sink_by_name("speakers", reply);
        conn.dispatch().unwrap();
        assert!(slot.borrow().is_none());

        mock.stall_requests(false);
        conn.dispatch().unwrap();
        let sink = slot.borrow_mut().take().unwrap().unwrap().unwrap();
        assert_eq!(sink.name, "speakers");
        assert_eq!(sink.channels(), 2);
    }

    #[test]
    fn test_write_to_unknown_index_is_rejected() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let mut conn = open(&mock);
        conn.dispatch().unwrap();

        let (slot, reply) = capture();
        conn.set_sink_mute_by_index(42, true, reply);
        conn.dispatch().unwrap();
        assert!(matches!(
            slot.borrow_mut().take(),
            Some(Err(ServerError::Rejected(_)))
        ));
    }

    #[test]
    fn test_events_need_subscription() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let mut conn = open(&mock);
        conn.dispatch().unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);

        mock.set_volume_externally("speakers", 10);
        let (_slot, reply) = capture();
        conn.subscribe(
            &[Facility::Sink],
            Box::new(move |facility, op, index| log.borrow_mut().push((facility, op, index))),
            reply,
        );
        conn.dispatch().unwrap();
        assert!(seen.borrow().is_empty());
        assert!(mock.is_subscribed());

        mock.set_volume_externally("speakers", 20);
        conn.dispatch().unwrap();
        assert_eq!(*seen.borrow(), vec![(Facility::Sink, EventOp::Changed, 0)]);
    }

    #[test]
    fn test_dropped_connection_cancels_queue() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let mut conn = open(&mock);
        conn.dispatch().unwrap();
        mock.stall_requests(true);

        let (slot, reply) = capture::<ServerInfo>();
        conn.server_info(reply);
        mock.drop_connection();
        conn.dispatch().unwrap();

        assert_eq!(conn.state(), ServerState::Failed);
        // The reply was dropped without being called
        assert!(slot.borrow().is_none());
        assert_eq!(Rc::strong_count(&slot), 1);
    }
}
