//! Client: the controller's side of the socket.
//!
//! Used by the bench simulator in the CLI and by end-to-end tests. It speaks
//! the same line protocol as a real controller: it sends configuration and
//! waveform frames and reads `+ack` and `set_conf` lines back.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{BridgeError, Result};
use crate::protocol::{encode_bound, ACK_FRAME};
use crate::types::parameter::{Bound, ParamName};


pub struct PeerClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    pending: String,
}


impl PeerClient {
    pub fn connect(path: &Path) -> Result<PeerClient> {
        let writer = UnixStream::connect(path)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(PeerClient {
            writer,
            reader,
            pending: String::new(),
        })
    }

    /// Connect, retrying with backoff until the bridge socket accepts or
    /// `timeout` elapses.
    pub fn connect_with_retry(path: &Path, timeout: Duration) -> Result<PeerClient> {
        let deadline = Instant::now() + timeout;
        let mut interval = Duration::from_millis(25);
        loop {
            match PeerClient::connect(path) {
                Ok(client) => return Ok(client),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(e) => debug!("bridge not reachable yet: {}", e),
            }
            std::thread::sleep(interval);
            interval = std::cmp::min(interval * 2, Duration::from_millis(200));
        }
    }

    /// Write one frame; a missing terminator is added.
    pub fn send_line(&mut self, frame: &str) -> Result<()> {
        self.writer.write_all(frame.as_bytes())?;
        if !frame.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Next line from the bridge, without its terminator. `Ok(None)` when
    /// nothing complete arrives within `timeout`.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        self.reader.get_ref().set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.reader.read_line(&mut self.pending) {
            Ok(0) => Err(BridgeError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "bridge closed the connection",
            ))),
            Ok(_) if self.pending.ends_with('\n') => {
                let line = std::mem::take(&mut self.pending);
                Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for `+ack`. Any other line is a protocol error.
    pub fn expect_ack(&mut self, timeout: Duration) -> Result<()> {
        let ack = std::str::from_utf8(ACK_FRAME).unwrap_or("+ack").trim_end();
        match self.read_line(timeout)? {
            Some(line) if line == ack => Ok(()),
            Some(line) => Err(BridgeError::MalformedFrame(format!(
                "expected acknowledgment, got {:?}",
                line
            ))),
            None => Err(BridgeError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                "no acknowledgment from bridge",
            ))),
        }
    }

    /// Send `min_conf`, `max_conf` and `def_conf` for every entry, waiting
    /// for each acknowledgment.
    pub fn configure(&mut self, limits: &[(ParamName, f64, f64, f64)], timeout: Duration) -> Result<()> {
        let mins: Vec<(ParamName, f64)> = limits.iter().map(|l| (l.0, l.1)).collect();
        let maxes: Vec<(ParamName, f64)> = limits.iter().map(|l| (l.0, l.2)).collect();
        let defaults: Vec<(ParamName, f64)> = limits.iter().map(|l| (l.0, l.3)).collect();
        for (bound, values) in [(Bound::Min, mins), (Bound::Max, maxes), (Bound::Default, defaults)] {
            self.send_line(&encode_bound(bound, &values))?;
            self.expect_ack(timeout)?;
        }
        Ok(())
    }
}
