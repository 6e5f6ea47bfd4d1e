//! Connection manager: the Unix socket the controller connects to.
//!
//! One peer at a time. The accept loop polls a non-blocking listener so a
//! shutdown request is noticed within one poll interval; reads on a
//! connected peer use the same interval as their timeout. Writes from the
//! receive loop (acknowledgments) and from the dispatcher (outbound
//! commands) both go through `PeerLink`, whose lock covers a whole frame.

use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{BridgeError, Result};
use crate::protocol::{LineBuffer, ACK_FRAME};
use crate::types::config::BridgeConfig;


/// Upper bound on a single frame write before the peer is considered stuck.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Listening,
    Connected,
    /// The peer closed its end, or the bridge is shutting down; the handle is
    /// being discarded.
    Closing,
    /// A read failed (reset, aborted or any other error); the handle is
    /// being discarded.
    Reset,
}


/// Why a peer session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Empty read: the peer closed its end.
    Closed,
    /// Reset, aborted, or any other read failure.
    Reset,
    Shutdown,
}


/// Receives everything the socket layer observes on a peer session.
pub trait PeerHandler {
    fn on_connect(&mut self) {}

    /// One complete line, or the reason a line could not be extracted.
    fn on_line(&mut self, line: Result<String>, link: &PeerLink);

    fn on_disconnect(&mut self, _reason: Disconnect) {}
}


/// Shared write handle to the current peer, if any.
#[derive(Clone, Default)]
pub struct PeerLink {
    inner: Arc<Mutex<Option<UnixStream>>>,
}


impl PeerLink {
    pub fn new() -> PeerLink {
        PeerLink::default()
    }

    /// Install the write half of a new peer, discarding any previous one.
    pub fn attach(&self, stream: UnixStream) {
        *self.inner.lock() = Some(stream);
    }

    /// Drop the current peer. Returns true if there was one.
    pub fn detach(&self) -> bool {
        self.inner.lock().take().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Write one whole frame. `Ok(false)` when no peer is attached.
    ///
    /// The lock is held for the full write so frames from different threads
    /// never interleave. A failed write may leave part of the frame on the
    /// wire, so the peer is detached and the socket shut down; the receive
    /// loop then sees the session end and the peer has to reconnect.
    pub fn send(&self, frame: &[u8]) -> std::io::Result<bool> {
        let mut guard = self.inner.lock();
        let Some(stream) = guard.as_mut() else {
            return Ok(false);
        };
        if let Err(e) = stream.write_all(frame).and_then(|()| stream.flush()) {
            if let Some(stream) = guard.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Send `+ack`. Failures are logged, never returned.
    pub fn acknowledge(&self) -> bool {
        match self.send(ACK_FRAME) {
            Ok(true) => true,
            Ok(false) => {
                warn!("no peer connected, acknowledgment not sent");
                false
            }
            Err(e) => {
                warn!("acknowledgment failed: {}", e);
                false
            }
        }
    }
}


/// Shared view of the connection state.
#[derive(Clone)]
pub struct StateCell(Arc<Mutex<LinkState>>);


impl StateCell {
    fn new() -> StateCell {
        StateCell(Arc::new(Mutex::new(LinkState::Idle)))
    }

    pub fn get(&self) -> LinkState {
        *self.0.lock()
    }

    fn set(&self, state: LinkState) {
        let mut current = self.0.lock();
        if *current != state {
            debug!("link state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }
}


pub struct PeerSocket {
    listener: UnixListener,
    path: PathBuf,
    link: PeerLink,
    state: StateCell,
    poll: Duration,
    read_chunk: usize,
    max_frame: usize,
}


impl PeerSocket {
    /// Bind the listening socket.
    ///
    /// A leftover socket file from a crashed run is removed first. If another
    /// process still accepts on the path, fails with `BindConflict`.
    pub fn bind(path: &Path) -> Result<PeerSocket> {
        clear_stale_socket(path)?;
        let listener = UnixListener::bind(path).map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => BridgeError::BindConflict(path.to_path_buf()),
            _ => BridgeError::Io(e),
        })?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", path.display());

        let defaults = BridgeConfig::default();
        Ok(PeerSocket {
            listener,
            path: path.to_path_buf(),
            link: PeerLink::new(),
            state: StateCell::new(),
            poll: defaults.poll_interval(),
            read_chunk: defaults.read_chunk_bytes,
            max_frame: defaults.max_frame_bytes,
        })
    }

    /// Bind using the socket path and timing from `config`.
    pub fn start(config: &BridgeConfig) -> Result<PeerSocket> {
        let mut socket = PeerSocket::bind(&config.socket_path)?;
        socket.poll = config.poll_interval();
        socket.read_chunk = config.read_chunk_bytes;
        socket.max_frame = config.max_frame_bytes;
        Ok(socket)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn link(&self) -> PeerLink {
        self.link.clone()
    }

    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    /// Accept and serve peers one after another until `shutdown` is set.
    pub fn serve(&self, shutdown: &AtomicBool, handler: &mut dyn PeerHandler) {
        while !shutdown.load(Ordering::Acquire) {
            self.state.set(LinkState::Listening);
            info!("waiting for controller on {}", self.path.display());
            let Some(stream) = self.accept_until(shutdown) else {
                break;
            };
            info!("controller connected");
            match self.serve_peer(stream, shutdown, handler) {
                Ok(Disconnect::Closed) => warn!("controller closed the connection"),
                Ok(Disconnect::Reset) => warn!("connection reset by controller"),
                Ok(Disconnect::Shutdown) => info!("closing controller connection for shutdown"),
                Err(e) => {
                    warn!("cannot serve controller connection: {}", e);
                    self.link.detach();
                }
            }
        }
        self.state.set(LinkState::Idle);
    }

    /// Poll the listener until a peer arrives or shutdown is requested.
    fn accept_until(&self, shutdown: &AtomicBool) -> Option<UnixStream> {
        while !shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _addr)) => return Some(stream),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(self.poll);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed: {}", e);
                    std::thread::sleep(self.poll);
                }
            }
        }
        None
    }

    /// Run the read loop for one peer until it goes away or shutdown.
    fn serve_peer(
        &self,
        mut stream: UnixStream,
        shutdown: &AtomicBool,
        handler: &mut dyn PeerHandler,
    ) -> Result<Disconnect> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.poll))?;
        let writer = stream.try_clone()?;
        writer.set_write_timeout(Some(WRITE_TIMEOUT))?;
        self.link.attach(writer);
        self.state.set(LinkState::Connected);
        handler.on_connect();

        let mut lines = LineBuffer::new(self.max_frame);
        let mut chunk = vec![0u8; self.read_chunk];
        let reason = loop {
            if shutdown.load(Ordering::Acquire) {
                break Disconnect::Shutdown;
            }
            match stream.read(&mut chunk) {
                Ok(0) => break Disconnect::Closed,
                Ok(n) => {
                    for line in lines.push(&chunk[..n]) {
                        handler.on_line(line, &self.link);
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {}
                    ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe => break Disconnect::Reset,
                    _ => {
                        warn!("read from controller failed: {}", e);
                        break Disconnect::Reset;
                    }
                },
            }
        };

        self.state.set(match reason {
            Disconnect::Reset => LinkState::Reset,
            Disconnect::Closed | Disconnect::Shutdown => LinkState::Closing,
        });
        if lines.pending() > 0 {
            debug!("discarding {} bytes of unterminated frame", lines.pending());
        }
        self.link.detach();
        handler.on_disconnect(reason);
        if reason != Disconnect::Shutdown {
            self.state.set(LinkState::Listening);
        }
        Ok(reason)
    }

    /// Remove the socket file so a restart can bind immediately.
    pub fn release(&self) {
        self.link.detach();
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!("removed socket {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove socket {}: {}", self.path.display(), e),
        }
    }
}


impl Drop for PeerSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}


/// Remove a socket file left behind by a previous run.
///
/// Refuses to touch anything that is not a socket, and reports a conflict if
/// something still accepts connections on it. Liveness is checked by
/// connecting, so a live bridge on `path` briefly sees a peer that connects
/// and closes without sending anything.
fn clear_stale_socket(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !meta.file_type().is_socket() {
        return Err(BridgeError::Config(format!(
            "{} exists and is not a socket",
            path.display()
        )));
    }
    if let Ok(probe) = UnixStream::connect(path) {
        let _ = probe.shutdown(Shutdown::Both);
        return Err(BridgeError::BindConflict(path.to_path_buf()));
    }
    info!("removing stale socket {}", path.display());
    std::fs::remove_file(path)?;
    Ok(())
}
