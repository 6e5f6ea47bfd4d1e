//! Outbound dispatcher: operator changes → `set_conf` frames to the peer.
//!
//! Runs on its own thread. Each queued change is taken exactly once; if no
//! peer is connected at that moment the change is dropped, since there is
//! nobody to inform.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::protocol::encode_set_conf;
use crate::service::PeerLink;
use crate::types::parameter::{ParamName, Parameter};


/// One operator-issued change: a single parameter or a named batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamChange {
    Single(Parameter),
    Batch(BTreeMap<ParamName, Parameter>),
}


impl ParamChange {
    /// Normalize to a named mapping; a single parameter becomes a
    /// one-entry map.
    pub fn into_batch(self) -> BTreeMap<ParamName, Parameter> {
        match self {
            ParamChange::Single(p) => BTreeMap::from([(p.name, p)]),
            ParamChange::Batch(map) => map,
        }
    }

    /// Every parameter carried by the change.
    pub fn params(&self) -> Vec<&Parameter> {
        match self {
            ParamChange::Single(p) => vec![p],
            ParamChange::Batch(map) => map.values().collect(),
        }
    }
}


impl From<Parameter> for ParamChange {
    fn from(p: Parameter) -> Self {
        ParamChange::Single(p)
    }
}


impl FromIterator<Parameter> for ParamChange {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        ParamChange::Batch(iter.into_iter().map(|p| (p.name, p)).collect())
    }
}


/// FIFO of pending changes shared between the operator side and the
/// dispatcher.
#[derive(Clone, Default)]
pub struct ChangeQueue {
    inner: Arc<Mutex<VecDeque<ParamChange>>>,
}


impl ChangeQueue {
    pub fn new() -> ChangeQueue {
        ChangeQueue::default()
    }

    pub fn push(&self, change: impl Into<ParamChange>) {
        self.inner.lock().push_back(change.into());
    }

    pub fn pop(&self) -> Option<ParamChange> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}


/// What happened to one dequeued change.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Sent(Vec<u8>),
    NoPeer,
    EncodeFailed,
    SendFailed,
}


pub struct Dispatcher {
    queue: ChangeQueue,
    link: PeerLink,
    idle: Duration,
}


impl Dispatcher {
    pub fn new(queue: ChangeQueue, link: PeerLink, idle: Duration) -> Dispatcher {
        Dispatcher { queue, link, idle }
    }

    /// Take one change off the queue and send it. `None` when the queue is
    /// empty.
    pub fn dispatch_one(&self) -> Option<Dispatched> {
        let change = self.queue.pop()?;
        let params = change.into_batch();
        let frame = match encode_set_conf(&params) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping parameter change: {}", e);
                return Some(Dispatched::EncodeFailed);
            }
        };
        let text = String::from_utf8_lossy(&frame);
        let outcome = match self.link.send(&frame) {
            Ok(true) => {
                info!("sent {:?} to controller", text.trim_end());
                Dispatched::Sent(frame)
            }
            Ok(false) => {
                debug!("no controller connected, dropped {:?}", text.trim_end());
                Dispatched::NoPeer
            }
            Err(e) => {
                warn!("sending {:?} failed: {}", text.trim_end(), e);
                Dispatched::SendFailed
            }
        };
        Some(outcome)
    }

    /// Drain the queue until `shutdown` is set, idling when it is empty.
    pub fn run(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Acquire) {
            if self.dispatch_one().is_none() {
                std::thread::sleep(self.idle);
            }
        }
        if !self.queue.is_empty() {
            debug!("{} parameter changes left unsent at shutdown", self.queue.len());
        }
    }
}
