//! Bench controller: drives a running bridge the way the ventilator does.
//!
//! Sends the full min/max/default configuration, then streams synthetic
//! pressure and flow waveforms as `d` frames. Any `set_conf` the bridge
//! forwards from the operator is logged.

use std::f64::consts::TAU;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Args;
use log::{info, warn};

use ventlink_core::client::PeerClient;
use ventlink_core::error::Result;
use ventlink_core::protocol::encode_data;
use ventlink_core::types::config::DEFAULT_SOCKET_PATH;
use ventlink_core::types::parameter::ParamName;
use ventlink_core::waveform::encode_samples;

use crate::SHUTDOWN;


const ACK_TIMEOUT: Duration = Duration::from_secs(2);


#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    /// Bridge socket to connect to
    #[arg(long, env = "VENTLINK_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,

    /// Number of `d` frames to send; 0 streams until interrupted
    #[arg(long, default_value_t = 0)]
    pub frames: u64,

    /// Samples per channel in each frame
    #[arg(long, default_value_t = 10)]
    pub samples: usize,

    /// Seconds between samples; should match the bridge's sample_period_s
    #[arg(long, default_value_t = 0.01)]
    pub sample_period: f64,

    /// Breaths per minute of the synthetic waveform
    #[arg(long, default_value_t = 15.0)]
    pub breath_rate: f64,

    /// How long to wait for a bridge socket before giving up, in seconds
    #[arg(long, default_value_t = 5)]
    pub connect_timeout: u64,
}


/// (name, min, max, default) as a controller reports them at power-up.
/// `ier` bounds are indices into its ratio table.
pub const CONTROLLER_LIMITS: [(ParamName, f64, f64, f64); ParamName::COUNT] = [
    (ParamName::Fio2, 21.0, 100.0, 40.0),
    (ParamName::Brpm, 5.0, 40.0, 15.0),
    (ParamName::Ier, 0.0, 4.0, 2.0),
    (ParamName::IerI, 1.0, 4.0, 1.0),
    (ParamName::IerE, 1.0, 4.0, 2.0),
    (ParamName::Ast, 0.0, 10.0, 2.0),
    (ParamName::Mode, 0.0, 2.0, 0.0),
    (ParamName::Tvm, 200.0, 800.0, 450.0),
    (ParamName::Peep, 0.0, 20.0, 5.0),
    (ParamName::Tf, 0.0, 60.0, 30.0),
];


pub fn execute(args: &PeerArgs) -> i32 {
    match simulate(args) {
        Ok(sent) => {
            info!("sent {} data frames", sent);
            0
        }
        Err(e) => {
            eprintln!("ventlink peer: {}", e);
            1
        }
    }
}


/// Run the bench controller. Returns the number of `d` frames sent.
pub fn simulate(args: &PeerArgs) -> Result<u64> {
    let mut client =
        PeerClient::connect_with_retry(&args.socket, Duration::from_secs(args.connect_timeout))?;
    info!("connected to {}", args.socket.display());
    client.configure(&CONTROLLER_LIMITS, ACK_TIMEOUT)?;
    info!("configuration acknowledged");

    let samples = args.samples.max(1);
    let frame_span = Duration::from_secs_f64(args.sample_period * samples as f64);
    let mut sent = 0u64;
    let mut t0 = 0.0;
    while !SHUTDOWN.load(Ordering::Relaxed) && (args.frames == 0 || sent < args.frames) {
        let [cp, cf, tf] = breath_samples(t0, samples, args.sample_period, args.breath_rate);
        client.send_line(&encode_data(
            samples,
            t0,
            &encode_samples(&cp),
            &encode_samples(&cf),
            &encode_samples(&tf),
        ))?;
        sent += 1;
        t0 += args.sample_period * samples as f64;

        // Pace the stream by waiting for operator changes in between.
        if let Some(line) = client.read_line(frame_span)? {
            if line.starts_with("set_conf") {
                info!("bridge forwarded {:?}", line);
            } else {
                warn!("unexpected line from bridge: {:?}", line);
            }
        }
    }
    Ok(sent)
}


/// Synthetic pressure, flow and cumulative flow for `n` samples from `t0`.
pub fn breath_samples(t0: f64, n: usize, period: f64, breaths_per_min: f64) -> [Vec<f64>; 3] {
    let freq = breaths_per_min / 60.0;
    let mut pressure = Vec::with_capacity(n);
    let mut flow = Vec::with_capacity(n);
    let mut volume = Vec::with_capacity(n);
    for i in 0..n {
        let phase = TAU * freq * (t0 + i as f64 * period);
        pressure.push(5.0 + 15.0 * phase.sin().max(0.0));
        flow.push(40.0 * phase.cos());
        volume.push(450.0 * (1.0 - phase.cos()) / 2.0);
    }
    [pressure, flow, volume]
}
