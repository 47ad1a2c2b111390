// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Worker thread that owns the audio-server connection.

use crate::bridge::event::EventSignal;
use crate::bridge::gate::{LifecycleState, OperationGate, PendingOperation};
use crate::config::SoundmanConfig;
use crate::error::{Result, SoundmanError};
use crate::server::{
    AudioServer, Connector, EventObserver, EventOp, Reply, ServerError, ServerState,
    DEVICE_FACILITIES,
};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Work item executed on the worker thread with the gate lock held.
pub(crate) type Job = Box<dyn FnOnce(&mut dyn AudioServer) + Send>;

/// Commands sent from the host to the worker thread.
enum WorkerCommand {
    Run(Job),
    Shutdown,
}

/// Handle to the worker thread.
pub(crate) struct Worker {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    gate: Arc<OperationGate>,
    call_timeout: Option<Duration>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread. The connection attempt starts immediately;
    /// use [`Worker::wait_connected`] to learn how it ends.
    pub fn spawn(connector: Arc<dyn Connector>, config: &SoundmanConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let gate = OperationGate::new();

        let thread_gate = Arc::clone(&gate);
        let thread_config = config.clone();
        let handle = thread::Builder::new()
            .name("soundman-worker".to_string())
            .spawn(move || run_worker(connector, thread_config, thread_gate, cmd_rx))
            .map_err(|e| SoundmanError::Thread(e.to_string()))?;

        Ok(Self {
            cmd_tx,
            gate,
            call_timeout: config.call_timeout(),
            handle: Some(handle),
        })
    }

    pub fn gate(&self) -> &Arc<OperationGate> {
        &self.gate
    }

    pub fn state(&self) -> LifecycleState {
        self.gate.lock().lifecycle
    }

    /// Block until the connection attempt leaves `Connecting`.
    ///
    /// Returns the state it ended in and the failure reason, if any.
    pub fn wait_connected(gate: &OperationGate) -> (LifecycleState, Option<String>) {
        gate.wait_for(None, |s| {
            (s.lifecycle != LifecycleState::Connecting).then(|| (s.lifecycle, s.failure.clone()))
        })
        .unwrap_or((LifecycleState::Failed, None))
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.cmd_tx
            .send(WorkerCommand::Run(job))
            .map_err(|_| SoundmanError::NotReady)
    }

    /// Issue one asynchronous request on the worker and wait for its reply.
    ///
    /// Fails fast with `NotReady` unless the connection is ready. The wait
    /// ends when the request completes, when the connection reaches a
    /// terminal state, or when the configured call timeout passes.
    pub fn blocking_call<T, F>(&self, what: &'static str, issue: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn AudioServer, Reply<T>) + Send + 'static,
    {
        if self.state() != LifecycleState::Ready {
            return Err(SoundmanError::NotReady);
        }

        let (pending, completion) = PendingOperation::new(&self.gate);
        trace!("Submitting {}", what);
        self.submit(Box::new(move |server| issue(server, completion.into_reply())))?;

        let deadline = self.call_timeout.map(|timeout| Instant::now() + timeout);
        let outcome = self.gate.wait_for(deadline, |s| {
            if let Some(result) = pending.take() {
                return Some(result);
            }
            s.lifecycle
                .is_terminal()
                .then_some(Err(ServerError::ConnectionLost))
        });

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => {
                debug!("{} failed: {}", what, e);
                Err(SoundmanError::failed(what, e))
            }
            None => {
                warn!("{} timed out", what);
                Err(SoundmanError::Timeout(what))
            }
        }
    }

    /// Install the device-change observer on the server, without waiting for
    /// the server to acknowledge it.
    pub fn subscribe(&self, signal: EventSignal) -> Result<()> {
        self.submit(Box::new(move |server| {
            let observer: EventObserver = Box::new(move |facility, op, index| {
                if op == EventOp::Changed && DEVICE_FACILITIES.contains(&facility) {
                    trace!("{:?} {} changed", facility, index);
                    signal.send();
                }
            });
            server.subscribe(
                DEVICE_FACILITIES,
                observer,
                Box::new(|result| match result {
                    Ok(()) => debug!("Device change subscription active"),
                    Err(e) => warn!("Device change subscription failed: {}", e),
                }),
            );
        }))
    }

    /// Stop the worker thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-side owner of the connection.
///
/// Dropping it (normal exit, failure or panic) releases the connection and
/// publishes the final lifecycle state under the gate lock.
struct WorkerLoop {
    gate: Arc<OperationGate>,
    server: Option<Box<dyn AudioServer>>,
    exit_state: LifecycleState,
}

impl WorkerLoop {
    fn fail(&mut self, reason: String) {
        error!("{}", reason);
        self.gate.lock().failure = Some(reason);
    }

    /// Dispatch pending server callbacks and publish the resulting state.
    /// Returns false once the connection has ended.
    fn pump(&mut self) -> bool {
        let Some(server) = self.server.as_mut() else {
            return false;
        };

        let mut gate = self.gate.lock();
        let next = match server.dispatch() {
            Ok(()) => match server.state() {
                ServerState::Ready => LifecycleState::Ready,
                ServerState::Unconnected | ServerState::Connecting => LifecycleState::Connecting,
                terminal => {
                    if gate.failure.is_none() {
                        gate.failure = Some(format!("server reported {:?}", terminal));
                    }
                    LifecycleState::Failed
                }
            },
            Err(e) => {
                gate.failure = Some(format!("dispatch failed: {}", e));
                LifecycleState::Failed
            }
        };

        let changed = next != gate.lifecycle;
        if changed {
            info!("Audio server connection: {:?} -> {:?}", gate.lifecycle, next);
            gate.lifecycle = next;
        }
        drop(gate);

        if changed {
            self.gate.signal();
        }
        !next.is_terminal()
    }

    fn run(&mut self, job: Job) {
        match self.server.as_mut() {
            Some(server) => {
                let _gate = self.gate.lock();
                job(server.as_mut());
            }
            // Dropping the job cancels the request inside it
            None => drop(job),
        }
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        let mut gate = self.gate.lock();
        if let Some(mut server) = self.server.take() {
            if server.state() == ServerState::Ready {
                server.disconnect();
            }
            drop(server);
        }
        if !gate.lifecycle.is_terminal() {
            info!("Audio server connection: {:?} -> {:?}", gate.lifecycle, self.exit_state);
            gate.lifecycle = self.exit_state;
        }
        drop(gate);
        self.gate.signal();
    }
}

fn run_worker(
    connector: Arc<dyn Connector>,
    config: SoundmanConfig,
    gate: Arc<OperationGate>,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
) {
    debug!("Worker thread starting");

    let mut worker = WorkerLoop {
        gate: Arc::clone(&gate),
        server: None,
        exit_state: LifecycleState::Failed,
    };

    match connector.open(&config) {
        Ok(mut server) => {
            let observer_gate = Arc::clone(&gate);
            let connected = {
                let _guard = gate.lock();
                server.connect(Box::new(move || observer_gate.signal()))
            };
            match connected {
                Ok(()) => worker.server = Some(server),
                Err(e) => {
                    worker.fail(format!("Failed to connect to audio server: {}", e));
                    return;
                }
            }
        }
        Err(e) => {
            worker.fail(format!("Failed to create audio server connection: {}", e));
            return;
        }
    }

    info!("Connecting to audio server as '{}'", config.application_name);

    let interval = config.dispatch_interval();
    while worker.pump() {
        match cmd_rx.recv_timeout(interval) {
            Ok(WorkerCommand::Run(job)) => worker.run(job),
            Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker received shutdown");
                worker.exit_state = LifecycleState::Terminated;
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    debug!("Worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::mock::MockServer;

    fn config() -> SoundmanConfig {
        SoundmanConfig {
            dispatch_interval_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_worker_connects() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let worker = Worker::spawn(Arc::new(mock), &config()).unwrap();

        let (state, failure) = Worker::wait_connected(worker.gate());
        assert_eq!(state, LifecycleState::Ready);
        assert!(failure.is_none());
        assert_eq!(worker.state(), LifecycleState::Ready);
        worker.shutdown();
    }

    #[test]
    fn test_worker_reports_refused_connection() {
        let mock = MockServer::new();
        mock.refuse_connections(true);
        let worker = Worker::spawn(Arc::new(mock), &config()).unwrap();

        let (state, failure) = Worker::wait_connected(worker.gate());
        assert_eq!(state, LifecycleState::Failed);
        assert!(failure.is_some());
    }

    #[test]
    fn test_blocking_call_returns_reply() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let worker = Worker::spawn(Arc::new(mock), &config()).unwrap();
        Worker::wait_connected(worker.gate());

        let info = worker
            .blocking_call("server info query", |server, reply| server.server_info(reply))
            .unwrap();
        assert_eq!(info.default_sink_name.as_deref(), Some("speakers"));
    }

    #[test]
    fn test_blocking_call_propagates_rejection() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let worker = Worker::spawn(Arc::new(mock), &config()).unwrap();
        Worker::wait_connected(worker.gate());

        let result = worker.blocking_call("set mute", |server, reply| {
            server.set_sink_mute_by_index(9999, true, reply)
        });
        assert!(matches!(
            result,
            Err(SoundmanError::OperationFailed {
                source: ServerError::Rejected(_),
                ..
            })
        ));
        assert_eq!(worker.state(), LifecycleState::Ready);
    }

    #[test]
    fn test_shutdown_terminates() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let worker = Worker::spawn(Arc::new(mock), &config()).unwrap();
        Worker::wait_connected(worker.gate());
        let gate = Arc::clone(worker.gate());
        worker.shutdown();

        assert_eq!(gate.lock().lifecycle, LifecycleState::Terminated);
    }

    #[test]
    fn test_discarded_request_unblocks_waiter() {
        let mock = MockServer::with_default_sink("speakers", 2);
        let worker = Worker::spawn(Arc::new(mock), &config()).unwrap();
        Worker::wait_connected(worker.gate());

        // The job drops the reply instead of issuing the request
        let result: Result<()> = worker.blocking_call("noop", |_server, reply| drop(reply));
        assert!(matches!(
            result,
            Err(SoundmanError::OperationFailed {
                source: ServerError::Cancelled,
                ..
            })
        ));
    }
}
