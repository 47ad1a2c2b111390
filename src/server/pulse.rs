// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PulseAudio backend.
//!
//! Uses the standard (non-threaded) mainloop: the worker thread already is
//! the loop thread, and [`AudioServer::dispatch`] iterates it without
//! blocking. Works against PipeWire through its PulseAudio compatibility
//! layer as well.

use crate::config::SoundmanConfig;
use crate::device::DeviceSnapshot;
use crate::server::{
    AudioServer, Connector, EventObserver, EventOp, Facility, Reply, ServerError, ServerInfo,
    ServerState, StateObserver,
};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::introspect::SinkInfo;
use libpulse_binding::context::subscribe::{
    Facility as PaFacility, InterestMaskSet, Operation as PaOperation,
};
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::volume::{ChannelVolumes, Volume};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// Upper bound on mainloop iterations per dispatch pass, so a chatty server
/// cannot starve the command queue.
const MAX_ITERATIONS_PER_DISPATCH: usize = 64;

/// Opens connections to the PulseAudio server named in the config, or the
/// default server.
#[derive(Debug, Default, Clone, Copy)]
pub struct PulseConnector;

impl Connector for PulseConnector {
    fn open(&self, config: &SoundmanConfig) -> Result<Box<dyn AudioServer>, ServerError> {
        let mainloop = Mainloop::new()
            .ok_or_else(|| ServerError::Client("failed to create PA mainloop".to_string()))?;
        let context = Context::new(&mainloop, &config.application_name)
            .ok_or_else(|| ServerError::Client("failed to create PA context".to_string()))?;

        Ok(Box::new(PulseConnection {
            context: Rc::new(RefCell::new(context)),
            mainloop,
            server: config.server.clone(),
        }))
    }
}

struct PulseConnection {
    // Dropped before the mainloop it was created on
    context: Rc<RefCell<Context>>,
    mainloop: Mainloop,
    server: Option<String>,
}

/// Adapt a one-shot reply to the `FnMut` callbacks libpulse expects.
fn once<T: 'static>(reply: Reply<T>) -> impl FnMut(Result<T, ServerError>) + 'static {
    let mut reply = Some(reply);
    move |result| {
        if let Some(reply) = reply.take() {
            reply(result);
        }
    }
}

fn success_reply(reply: Reply<()>, what: &'static str) -> Box<dyn FnMut(bool) + 'static> {
    let mut reply = once(reply);
    Box::new(move |success| {
        if success {
            reply(Ok(()));
        } else {
            reply(Err(ServerError::Rejected(format!("{} refused by server", what))));
        }
    })
}

fn snapshot(info: &SinkInfo<'_>) -> DeviceSnapshot {
    DeviceSnapshot {
        index: info.index,
        name: info.name.as_deref().unwrap_or_default().to_string(),
        description: info.description.as_deref().unwrap_or_default().to_string(),
        volumes: info.volume.get().iter().map(|v| v.0).collect(),
        muted: info.mute,
    }
}

/// Per-channel volumes in the layout libpulse expects.
fn channel_volumes(volumes: &[u32]) -> Result<ChannelVolumes, ServerError> {
    if volumes.is_empty() || volumes.len() > usize::from(ChannelVolumes::CHANNELS_MAX) {
        return Err(ServerError::Rejected(format!(
            "unsupported channel count {}",
            volumes.len()
        )));
    }

    let mut channel_volumes = ChannelVolumes::default();
    channel_volumes.set_len(volumes.len() as u8);
    for (slot, &volume) in channel_volumes.get_mut().iter_mut().zip(volumes) {
        *slot = Volume(volume);
    }
    Ok(channel_volumes)
}

fn context_errno(context: &Weak<RefCell<Context>>) -> Option<PAErr> {
    let context = context.upgrade()?;
    let errno = context.try_borrow().ok()?.errno();
    Some(errno)
}

/// Result of a sink lookup the server answered with an error. Only an
/// unknown name counts as "no such sink".
fn failed_lookup(errno: Option<PAErr>) -> Result<Option<DeviceSnapshot>, ServerError> {
    match errno {
        Some(err) if err.0.abs() == Code::NoEntity as i32 => Ok(None),
        Some(err) => Err(ServerError::Rejected(format!("sink lookup failed: {:?}", err))),
        None => Err(ServerError::Rejected("sink lookup failed".to_string())),
    }
}

fn map_facility(facility: PaFacility) -> Facility {
    match facility {
        PaFacility::Sink => Facility::Sink,
        PaFacility::SinkInput => Facility::SinkInput,
        PaFacility::Source => Facility::Source,
        PaFacility::SourceOutput => Facility::SourceOutput,
        PaFacility::Client => Facility::Client,
        PaFacility::Server => Facility::Server,
        PaFacility::Card => Facility::Card,
        _ => Facility::Other,
    }
}

fn map_operation(op: PaOperation) -> EventOp {
    match op {
        PaOperation::New => EventOp::New,
        PaOperation::Changed => EventOp::Changed,
        PaOperation::Removed => EventOp::Removed,
    }
}

fn interest_mask(facilities: &[Facility]) -> InterestMaskSet {
    facilities
        .iter()
        .fold(InterestMaskSet::NULL, |mask, facility| {
            mask | match facility {
                Facility::Sink => InterestMaskSet::SINK,
                Facility::SinkInput => InterestMaskSet::SINK_INPUT,
                Facility::Source => InterestMaskSet::SOURCE,
                Facility::SourceOutput => InterestMaskSet::SOURCE_OUTPUT,
                Facility::Client => InterestMaskSet::CLIENT,
                Facility::Server => InterestMaskSet::SERVER,
                Facility::Card => InterestMaskSet::CARD,
                Facility::Other => InterestMaskSet::NULL,
            }
        })
}

impl AudioServer for PulseConnection {
    fn connect(&mut self, observer: StateObserver) -> Result<(), ServerError> {
        self.context.borrow_mut().set_state_callback(Some(observer));
        debug!(
            "Connecting PA context to {}",
            self.server.as_deref().unwrap_or("default server")
        );
        self.context
            .borrow_mut()
            .connect(self.server.as_deref(), ContextFlagSet::NOFLAGS, None)
            .map_err(|e| ServerError::ConnectionRefused(format!("{:?}", e)))
    }

    fn state(&self) -> ServerState {
        match self.context.borrow().get_state() {
            ContextState::Unconnected => ServerState::Unconnected,
            ContextState::Connecting | ContextState::Authorizing | ContextState::SettingName => {
                ServerState::Connecting
            }
            ContextState::Ready => ServerState::Ready,
            ContextState::Failed => ServerState::Failed,
            ContextState::Terminated => ServerState::Terminated,
        }
    }

    fn dispatch(&mut self) -> Result<(), ServerError> {
        for _ in 0..MAX_ITERATIONS_PER_DISPATCH {
            match self.mainloop.iterate(false) {
                IterateResult::Success(0) => return Ok(()),
                IterateResult::Success(n) => trace!("PA mainloop dispatched {} sources", n),
                IterateResult::Quit(_) => return Err(ServerError::ConnectionLost),
                IterateResult::Err(e) => return Err(ServerError::Client(format!("{:?}", e))),
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut context = self.context.borrow_mut();
        context.set_subscribe_callback(None);
        context.disconnect();
    }

    fn server_info(&mut self, reply: Reply<ServerInfo>) {
        let mut reply = once(reply);
        self.context.borrow().introspect().get_server_info(move |info| {
            reply(Ok(ServerInfo {
                server_name: info.server_name.as_deref().unwrap_or_default().to_string(),
                default_sink_name: info.default_sink_name.as_deref().map(str::to_string),
            }));
        });
    }

    fn sink_by_name(&mut self, name: &str, reply: Reply<Option<DeviceSnapshot>>) {
        let mut reply = once(reply);
        let mut found = None;
        let context = Rc::downgrade(&self.context);
        self.context
            .borrow()
            .introspect()
            .get_sink_info_by_name(name, move |result| match result {
                ListResult::Item(info) => found = Some(snapshot(info)),
                ListResult::End => reply(Ok(found.take())),
                ListResult::Error => {
                    let result = failed_lookup(context_errno(&context));
                    if let Err(e) = &result {
                        warn!("{}", e);
                    }
                    reply(result);
                }
            });
    }

    fn set_sink_volume_by_index(&mut self, index: u32, volumes: &[u32], reply: Reply<()>) {
        let channel_volumes = match channel_volumes(volumes) {
            Ok(channel_volumes) => channel_volumes,
            Err(e) => {
                reply(Err(e));
                return;
            }
        };

        self.context.borrow().introspect().set_sink_volume_by_index(
            index,
            &channel_volumes,
            Some(success_reply(reply, "volume change")),
        );
    }

    fn set_sink_mute_by_index(&mut self, index: u32, mute: bool, reply: Reply<()>) {
        self.context.borrow().introspect().set_sink_mute_by_index(
            index,
            mute,
            Some(success_reply(reply, "mute change")),
        );
    }

    fn subscribe(&mut self, facilities: &[Facility], mut observer: EventObserver, reply: Reply<()>) {
        let mut context = self.context.borrow_mut();
        context.set_subscribe_callback(Some(Box::new(move |facility, op, index| {
            if let (Some(facility), Some(op)) = (facility, op) {
                observer(map_facility(facility), map_operation(op), index);
            }
        })));

        let mut done = success_reply(reply, "subscription");
        context.subscribe(interest_mask(facilities), move |success| done(success));
    }
}
