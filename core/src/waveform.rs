//! Waveform decoding and the per-channel sliding sample buffers.
//!
//! A `d` frame carries, per channel, `n` big-endian IEEE-754 doubles as a hex
//! run. Decoding is all-or-nothing per channel: a short or non-hex run yields
//! an error and nothing is appended.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::error::{BridgeError, Result};
use crate::types::sample::{Batch, Channel, Point};


/// Bytes per encoded sample.
pub const SAMPLE_LEN_BYTES: usize = 8;


/// Decode `n` samples from the start of `hex_run` into points spaced by
/// `period` starting at `t0`. Characters past the first `n * 16` are ignored.
pub fn decode_samples(n: usize, hex_run: &str, t0: f64, period: f64) -> Result<Vec<Point>> {
    let needed = n
        .checked_mul(SAMPLE_LEN_BYTES * 2)
        .ok_or_else(|| BridgeError::MalformedSampleData(format!("sample count {} too large", n)))?;
    let bytes = hex_run.as_bytes();
    if bytes.len() < needed {
        return Err(BridgeError::MalformedSampleData(format!(
            "need {} hex characters for {} samples, got {}",
            needed,
            n,
            bytes.len()
        )));
    }
    let raw = hex::decode(&bytes[..needed])
        .map_err(|e| BridgeError::MalformedSampleData(e.to_string()))?;

    let points = raw
        .chunks_exact(SAMPLE_LEN_BYTES)
        .enumerate()
        .map(|(i, chunk)| {
            let mut word = [0u8; SAMPLE_LEN_BYTES];
            word.copy_from_slice(chunk);
            Point {
                t: t0 + i as f64 * period,
                value: f64::from_be_bytes(word),
            }
        })
        .collect();
    Ok(points)
}


/// Hex-encode samples in the wire layout. Used by the peer side.
pub fn encode_samples(values: &[f64]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    hex::encode(bytes)
}


struct BufferInner {
    batches: VecDeque<Batch>,
    len: usize,
    next_seq: u64,
}


/// Bounded, time-ordered store of decoded batches for one channel.
///
/// Single writer, many readers. Once more than `capacity` points are held
/// the oldest batches are evicted whole; a lone batch larger than capacity
/// is trimmed from its head.
pub struct SampleBuffer {
    capacity: usize,
    inner: RwLock<BufferInner>,
}


impl SampleBuffer {
    pub fn new(capacity: usize) -> SampleBuffer {
        SampleBuffer {
            capacity: capacity.max(1),
            inner: RwLock::new(BufferInner {
                batches: VecDeque::new(),
                len: 0,
                next_seq: 1,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one decoded batch. Returns its sequence number, or `None` for
    /// an empty batch, which is not stored.
    pub fn append(&self, points: Vec<Point>) -> Option<u64> {
        if points.is_empty() {
            return None;
        }
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.len += points.len();
        inner.batches.push_back(Batch { seq, points });

        while inner.len > self.capacity && inner.batches.len() > 1 {
            if let Some(old) = inner.batches.pop_front() {
                inner.len -= old.points.len();
            }
        }
        if inner.len > self.capacity {
            let excess = inner.len - self.capacity;
            if let Some(only) = inner.batches.front_mut() {
                only.points.drain(..excess);
            }
            inner.len = self.capacity;
        }
        Some(seq)
    }

    /// Number of points currently retained.
    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every retained point, oldest first.
    pub fn points(&self) -> Vec<Point> {
        let inner = self.inner.read();
        inner
            .batches
            .iter()
            .flat_map(|b| b.points.iter().copied())
            .collect()
    }

    pub fn latest(&self) -> Option<Point> {
        let inner = self.inner.read();
        inner.batches.back().and_then(|b| b.points.last().copied())
    }

    /// Batches appended after `seq`, for readers polling incrementally.
    pub fn batches_since(&self, seq: u64) -> Vec<Batch> {
        let inner = self.inner.read();
        inner
            .batches
            .iter()
            .filter(|b| b.seq > seq)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.batches.clear();
        inner.len = 0;
    }
}


/// The three channel buffers fed by `d` frames.
pub struct Waveforms {
    current_pressure: SampleBuffer,
    current_flow: SampleBuffer,
    total_flow: SampleBuffer,
}


impl Waveforms {
    pub fn new(capacity: usize) -> Waveforms {
        Waveforms {
            current_pressure: SampleBuffer::new(capacity),
            current_flow: SampleBuffer::new(capacity),
            total_flow: SampleBuffer::new(capacity),
        }
    }

    pub fn channel(&self, channel: Channel) -> &SampleBuffer {
        match channel {
            Channel::CurrentPressure => &self.current_pressure,
            Channel::CurrentFlow => &self.current_flow,
            Channel::TotalFlow => &self.total_flow,
        }
    }

    /// Decode one channel's run and append it as a single batch.
    pub fn ingest(
        &self,
        channel: Channel,
        n: usize,
        hex_run: &str,
        t0: f64,
        period: f64,
    ) -> Result<Option<u64>> {
        let points = decode_samples(n, hex_run, t0, period)?;
        Ok(self.channel(channel).append(points))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn pts(ts: &[f64]) -> Vec<Point> {
        ts.iter().map(|&t| Point { t, value: t * 2.0 }).collect()
    }

    #[test]
    fn decodes_n_points_spaced_by_period() {
        let hex_run = encode_samples(&[1.5, -2.25, 100.0]);
        let points = decode_samples(3, &hex_run, 10.0, 0.01).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], Point { t: 10.0, value: 1.5 });
        assert_eq!(points[1].value, -2.25);
        assert_eq!(points[2].value, 100.0);
        assert!((points[1].t - 10.01).abs() < 1e-12);
        assert!((points[2].t - 10.02).abs() < 1e-12);
    }

    #[test]
    fn known_big_endian_encoding() {
        // 1.0 == 0x3FF0000000000000
        let points = decode_samples(1, "3FF0000000000000", 0.0, 0.01).unwrap();
        assert_eq!(points[0].value, 1.0);
    }

    #[test]
    fn excess_hex_is_ignored() {
        let mut hex_run = encode_samples(&[4.0, 8.0]);
        hex_run.push_str("zz-trailing");
        let points = decode_samples(2, &hex_run, 0.0, 0.5).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1], Point { t: 0.5, value: 8.0 });
    }

    #[test]
    fn short_run_rejected() {
        let hex_run = encode_samples(&[1.0, 2.0]);
        let err = decode_samples(3, &hex_run, 0.0, 0.01).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedSampleData(_)));
    }

    #[test]
    fn non_hex_rejected() {
        let err = decode_samples(1, "3FF000000000000G", 0.0, 0.01).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedSampleData(_)));
    }

    #[test]
    fn zero_samples_is_empty() {
        assert!(decode_samples(0, "", 0.0, 0.01).unwrap().is_empty());
    }

    #[test]
    fn empty_batch_not_stored() {
        let buf = SampleBuffer::new(10);
        assert_eq!(buf.append(Vec::new()), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn evicts_whole_oldest_batches() {
        let buf = SampleBuffer::new(5);
        buf.append(pts(&[0.0, 1.0, 2.0]));
        buf.append(pts(&[3.0, 4.0]));
        assert_eq!(buf.len(), 5);
        buf.append(pts(&[5.0, 6.0]));
        let ts: Vec<f64> = buf.points().iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn oversized_single_batch_keeps_newest_points() {
        let buf = SampleBuffer::new(3);
        buf.append(pts(&[0.0, 1.0, 2.0, 3.0, 4.0]));
        let ts: Vec<f64> = buf.points().iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![2.0, 3.0, 4.0]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn batches_since_returns_newer_only() {
        let buf = SampleBuffer::new(100);
        let first = buf.append(pts(&[0.0])).unwrap();
        let second = buf.append(pts(&[1.0, 2.0])).unwrap();
        let newer = buf.batches_since(first);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].seq, second);
        assert_eq!(newer[0].points.len(), 2);
        assert_eq!(buf.latest().unwrap().t, 2.0);
    }

    #[test]
    fn failed_ingest_leaves_buffer_unchanged() {
        let waves = Waveforms::new(100);
        let good = encode_samples(&[1.0, 2.0]);
        waves.ingest(Channel::CurrentFlow, 2, &good, 0.0, 0.01).unwrap();
        let before = waves.channel(Channel::CurrentFlow).points();

        let err = waves.ingest(Channel::CurrentFlow, 4, &good, 1.0, 0.01);
        assert!(err.is_err());
        assert_eq!(waves.channel(Channel::CurrentFlow).points(), before);
    }
}
