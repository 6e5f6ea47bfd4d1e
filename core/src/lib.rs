//! Core of the ventilator bridge.
//!
//! The controller connects over a Unix socket and speaks a line protocol of
//! query-string frames. The bridge keeps a parameter store and three
//! waveform buffers in sync with it, and forwards operator changes back.

pub mod client;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod service;
pub mod settings;
pub mod store;
pub mod types;
pub mod waveform;
