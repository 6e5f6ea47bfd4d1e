//! Daemon: the bridge between the controller socket and the operator side.
//!
//! Two threads run for the lifetime of the bridge:
//!
//! 1. Receive loop (the caller's thread): accepts the controller, decodes
//!    each frame, updates the parameter store and waveform buffers, and
//!    acknowledges configuration commands.
//! 2. Dispatcher: drains operator changes from the queue and writes them to
//!    the controller.
//!
//! Collaborators observe the bridge through `BridgeEvent`s on an mpsc
//! channel and act on it through a cloneable `BridgeHandle`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::dispatch::{ChangeQueue, Dispatcher, ParamChange};
use crate::error::{BridgeError, Result};
use crate::protocol::{parse_line, DataFrame, Inbound};
use crate::service::{Disconnect, LinkState, PeerHandler, PeerLink, PeerSocket, StateCell};
use crate::store::{ParameterStore, StoreSnapshot};
use crate::types::config::BridgeConfig;
use crate::types::parameter::Bound;
use crate::types::sample::Channel;
use crate::waveform::Waveforms;


/// Notifications published to the operator-facing side.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Every parameter has min, max and default. Sent once per
    /// configuration cycle.
    StoreReady(StoreSnapshot),
    /// A `set_conf` frame was applied.
    ValuesChanged(StoreSnapshot),
    /// `reset_conf` cleared the store.
    StoreReset,
    PeerConnected,
    PeerDisconnected,
}


/// Cloneable sender side of the event channel. A dropped receiver is not an
/// error; events are discarded.
#[derive(Clone)]
pub struct Notifier {
    sender: mpsc::Sender<BridgeEvent>,
}


impl Notifier {
    pub fn new(sender: mpsc::Sender<BridgeEvent>) -> Notifier {
        Notifier { sender }
    }

    pub fn emit(&self, event: BridgeEvent) {
        if self.sender.send(event).is_err() {
            debug!("event receiver gone, notification discarded");
        }
    }
}


/// Applies decoded frames to the store and waveform buffers.
pub struct InboundHandler {
    store: Arc<ParameterStore>,
    waveforms: Arc<Waveforms>,
    events: Notifier,
    sample_period: f64,
    reset_clears_store: bool,
}


impl InboundHandler {
    pub fn new(
        store: Arc<ParameterStore>,
        waveforms: Arc<Waveforms>,
        events: Notifier,
        config: &BridgeConfig,
    ) -> InboundHandler {
        InboundHandler {
            store,
            waveforms,
            events,
            sample_period: config.sample_period_s,
            reset_clears_store: config.reset_clears_store,
        }
    }

    /// Decode and apply one line. Malformed frames are logged and dropped.
    pub fn handle_line(&mut self, line: &str, link: &PeerLink) {
        match parse_line(line) {
            Ok(inbound) => self.apply(inbound, link),
            Err(e) => warn!("dropping frame {:?}: {}", line, e),
        }
    }

    fn apply(&mut self, inbound: Inbound, link: &PeerLink) {
        match inbound {
            Inbound::ResetConf => {
                if self.reset_clears_store {
                    info!("reset_conf: clearing parameter store");
                    self.store.reset();
                    self.events.emit(BridgeEvent::StoreReset);
                } else {
                    info!("reset_conf received");
                }
            }
            Inbound::SetConf(pairs) => {
                for (key, raw) in &pairs {
                    self.log_rejected(key, raw, self.store.set_value(key, raw));
                }
                self.events.emit(BridgeEvent::ValuesChanged(self.store.snapshot()));
                link.acknowledge();
            }
            Inbound::Bounds { bound, pairs } => {
                for (key, raw) in &pairs {
                    self.log_rejected(key, raw, self.store.set_bound(key, bound, raw));
                }
                self.check_ready(bound);
                link.acknowledge();
            }
            Inbound::Data(data) => self.ingest(&data),
            Inbound::Unknown(command) => debug!("ignoring unknown command {:?}", command),
        }
    }

    fn log_rejected(&self, key: &str, raw: &str, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(BridgeError::UnknownParameter(_)) => {
                debug!("ignoring unknown parameter {:?}={:?}", key, raw)
            }
            Err(e) => warn!("rejected {}={:?}: {}", key, raw, e),
        }
    }

    fn check_ready(&self, after: Bound) {
        if let Some(snapshot) = self.store.take_ready_announcement() {
            info!("all parameters configured (after {})", after.command());
            self.events.emit(BridgeEvent::StoreReady(snapshot));
        }
    }

    /// Decode each channel independently; a bad run drops only that batch.
    fn ingest(&self, data: &DataFrame) {
        for channel in Channel::ALL {
            let Some(run) = data.run(channel) else {
                warn!("d frame at ts={} has no {} run", data.ts, channel.key());
                continue;
            };
            if let Err(e) = self
                .waveforms
                .ingest(channel, data.n, run, data.ts, self.sample_period)
            {
                warn!("dropping {} batch at ts={}: {} (raw {:?})", channel.key(), data.ts, e, run);
            }
        }
    }
}


impl PeerHandler for InboundHandler {
    fn on_connect(&mut self) {
        self.events.emit(BridgeEvent::PeerConnected);
    }

    fn on_line(&mut self, line: Result<String>, link: &PeerLink) {
        match line {
            Ok(line) => {
                debug!("received {:?}", line);
                self.handle_line(&line, link);
            }
            Err(e) => warn!("dropping frame: {}", e),
        }
    }

    fn on_disconnect(&mut self, _reason: Disconnect) {
        self.events.emit(BridgeEvent::PeerDisconnected);
    }
}


/// Handle for the operator side: submit changes, read state, stop the bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    store: Arc<ParameterStore>,
    waveforms: Arc<Waveforms>,
    queue: ChangeQueue,
    link: PeerLink,
    state: StateCell,
    shutdown: Arc<AtomicBool>,
}


impl BridgeHandle {
    /// Record an operator edit locally and queue it for the controller.
    pub fn submit(&self, change: impl Into<ParamChange>) {
        let change = change.into();
        for param in change.params() {
            if let Some(value) = &param.value {
                self.store.update_value(param.name, value.clone());
            }
        }
        self.queue.push(change);
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn waveforms(&self) -> &Waveforms {
        &self.waveforms
    }

    pub fn queue(&self) -> &ChangeQueue {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    /// Ask both loops to stop. `Bridge::run` returns once they have.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}


/// The bridge: owns the socket, the shared state and both loops.
pub struct Bridge {
    config: BridgeConfig,
    socket: PeerSocket,
    store: Arc<ParameterStore>,
    waveforms: Arc<Waveforms>,
    queue: ChangeQueue,
    events: Notifier,
    shutdown: Arc<AtomicBool>,
}


impl Bridge {
    /// Validate the config and bind the socket. Binding failures are fatal
    /// to the caller.
    pub fn bind(config: BridgeConfig, events: mpsc::Sender<BridgeEvent>) -> Result<Bridge> {
        config.validate()?;
        let socket = PeerSocket::start(&config).map_err(|e| {
            error!("cannot listen on {}: {}", config.socket_path.display(), e);
            e
        })?;
        Ok(Bridge {
            store: Arc::new(ParameterStore::new()),
            waveforms: Arc::new(Waveforms::new(config.max_points)),
            queue: ChangeQueue::new(),
            events: Notifier::new(events),
            shutdown: Arc::new(AtomicBool::new(false)),
            socket,
            config,
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            store: Arc::clone(&self.store),
            waveforms: Arc::clone(&self.waveforms),
            queue: self.queue.clone(),
            link: self.socket.link(),
            state: self.socket.state(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run until `BridgeHandle::shutdown`. Starts the dispatcher thread,
    /// serves controllers on this thread, then joins the dispatcher and
    /// removes the socket file.
    pub fn run(self) -> Result<()> {
        let dispatcher = Dispatcher::new(
            self.queue.clone(),
            self.socket.link(),
            self.config.dispatch_idle(),
        );
        let dispatch_shutdown = Arc::clone(&self.shutdown);
        let dispatch_thread = std::thread::Builder::new()
            .name("ventlink-dispatch".into())
            .spawn(move || dispatcher.run(&dispatch_shutdown))?;

        let mut handler = InboundHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.waveforms),
            self.events.clone(),
            &self.config,
        );
        self.socket.serve(&self.shutdown, &mut handler);

        self.shutdown.store(true, Ordering::Release);
        if dispatch_thread.join().is_err() {
            error!("dispatcher thread panicked");
        }
        self.socket.release();
        info!("bridge stopped");
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
