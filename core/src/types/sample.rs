use serde::{Deserialize, Serialize};


/// One of the three waveform channels carried by a `d` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    CurrentPressure,
    CurrentFlow,
    TotalFlow,
}


impl Channel {
    pub const ALL: [Channel; 3] = [Channel::CurrentPressure, Channel::CurrentFlow, Channel::TotalFlow];

    /// Query key of the channel inside a `d` frame.
    pub fn key(self) -> &'static str {
        match self {
            Channel::CurrentPressure => "cp",
            Channel::CurrentFlow => "cf",
            Channel::TotalFlow => "tf",
        }
    }
}


/// A single timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub t: f64,
    pub value: f64,
}


/// A decoded run of samples appended to a buffer as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Monotonic per-buffer sequence number, starting at 1.
    pub seq: u64,
    pub points: Vec<Point>,
}
