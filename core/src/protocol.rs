//! Line protocol spoken with the controller.
//!
//! Every frame is one ASCII line shaped like a URL path plus query:
//!
//! ```text
//! set_conf?fio2=45.0&peep=5
//! d?n=2&ts=12.5&cp=3ff0...&cf=...&tf=...
//! ```
//!
//! Keys and values are percent-escaped (`+` decodes to a space). When a key
//! repeats, the last occurrence wins: pairs are applied in order, and
//! `Frame::get` returns the final value.

use std::collections::BTreeMap;

use crate::error::{BridgeError, Result};
use crate::types::parameter::{Bound, ParamKind, ParamName, ParamValue, Parameter};
use crate::types::sample::Channel;


/// Reply the bridge sends after every configuration command.
pub const ACK_FRAME: &[u8] = b"+ack\n";


/// A frame split into its command and ordered key/value pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: String,
    pub pairs: Vec<(String, String)>,
}


impl Frame {
    /// Parse one line (terminator optional).
    pub fn parse(line: &str) -> Result<Frame> {
        let line = line.trim_end_matches(['\n', '\r']);
        if !line.is_ascii() {
            return Err(BridgeError::MalformedFrame(format!("non-ASCII frame {:?}", line)));
        }
        let (command, query) = line.split_once('?').unwrap_or((line, ""));
        let command = command.trim();
        if command.is_empty() {
            return Err(BridgeError::MalformedFrame(format!("missing command in {:?}", line)));
        }

        let mut pairs = Vec::new();
        for segment in query.split('&').filter(|s| !s.is_empty()) {
            let Some((key, value)) = segment.split_once('=') else {
                return Err(BridgeError::MalformedFrame(format!(
                    "segment {:?} has no '='",
                    segment
                )));
            };
            let key = unescape(key)?;
            if key.is_empty() {
                return Err(BridgeError::MalformedFrame(format!("empty key in {:?}", line)));
            }
            pairs.push((key, unescape(value)?));
        }

        Ok(Frame {
            command: command.to_string(),
            pairs,
        })
    }

    /// Value of `key`; the last occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}


fn unescape(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| BridgeError::MalformedFrame(format!("bad escape in {:?}: {}", raw, e)))
}


/// Payload of a `d` frame before sample decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub n: usize,
    pub ts: f64,
    pub cp: Option<String>,
    pub cf: Option<String>,
    pub tf: Option<String>,
}


impl DataFrame {
    /// Hex run for a channel, if the frame carried one.
    pub fn run(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::CurrentPressure => self.cp.as_deref(),
            Channel::CurrentFlow => self.cf.as_deref(),
            Channel::TotalFlow => self.tf.as_deref(),
        }
    }
}


/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ResetConf,
    /// New current values, in frame order.
    SetConf(Vec<(String, String)>),
    /// `min_conf`, `max_conf` or `def_conf`.
    Bounds {
        bound: Bound,
        pairs: Vec<(String, String)>,
    },
    Data(DataFrame),
    /// A command this bridge does not handle.
    Unknown(String),
}


impl Inbound {
    pub fn decode(frame: Frame) -> Result<Inbound> {
        let inbound = match frame.command.as_str() {
            "reset_conf" => Inbound::ResetConf,
            "set_conf" => Inbound::SetConf(frame.pairs),
            "min_conf" => Inbound::Bounds {
                bound: Bound::Min,
                pairs: frame.pairs,
            },
            "max_conf" => Inbound::Bounds {
                bound: Bound::Max,
                pairs: frame.pairs,
            },
            "def_conf" => Inbound::Bounds {
                bound: Bound::Default,
                pairs: frame.pairs,
            },
            "d" => Inbound::Data(decode_data(&frame)?),
            _ => Inbound::Unknown(frame.command.clone()),
        };
        Ok(inbound)
    }
}


/// Parse and decode a single line.
pub fn parse_line(line: &str) -> Result<Inbound> {
    Inbound::decode(Frame::parse(line)?)
}


fn decode_data(frame: &Frame) -> Result<DataFrame> {
    let n = frame
        .get("n")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .ok_or_else(|| BridgeError::MalformedFrame(format!("d frame without valid n: {:?}", frame.get("n"))))?;
    let ts = frame
        .get("ts")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or_else(|| BridgeError::MalformedFrame(format!("d frame without valid ts: {:?}", frame.get("ts"))))?;
    let run = |c: Channel| frame.get(c.key()).map(str::to_string);
    Ok(DataFrame {
        n,
        ts,
        cp: run(Channel::CurrentPressure),
        cf: run(Channel::CurrentFlow),
        tf: run(Channel::TotalFlow),
    })
}


// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Splits a byte stream into lines.
///
/// Bytes are held until a `\n` arrives. A line that grows past `max_len`
/// without a terminator is reported once as `MalformedFrame` and the rest of
/// it is skipped up to the next terminator.
pub struct LineBuffer {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}


impl LineBuffer {
    pub fn new(max_len: usize) -> LineBuffer {
        LineBuffer {
            buf: Vec::new(),
            max_len: max_len.max(1),
            discarding: false,
        }
    }

    /// Feed bytes; returns every line completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String>> {
        let mut out = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else if !self.buf.is_empty() {
                    let line = std::mem::take(&mut self.buf);
                    out.push(String::from_utf8(line).map_err(|e| {
                        BridgeError::MalformedFrame(format!("invalid UTF-8 frame: {}", e))
                    }));
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            self.buf.push(byte);
            if self.buf.len() > self.max_len {
                out.push(Err(BridgeError::MalformedFrame(format!(
                    "frame exceeds {} bytes without terminator",
                    self.max_len
                ))));
                self.buf.clear();
                self.discarding = true;
            }
        }
        out
    }

    /// Bytes waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial line, e.g. after the peer went away.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}


// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Build a frame from a command and already-rendered pairs.
pub fn encode_frame(command: &str, pairs: &[(&str, String)]) -> String {
    let mut line = String::from(command);
    if !pairs.is_empty() {
        line.push('?');
        let query: Vec<String> = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        line.push_str(&query.join("&"));
    }
    line.push('\n');
    line
}


/// Render a value as the declared kind of `name`. Floats always carry a
/// decimal point (`45.0`).
fn coerce(name: ParamName, kind: ParamKind, value: &ParamValue) -> Result<String> {
    kind.parse(&value.to_string())
        .map(|v| match v {
            ParamValue::Float(f) => format!("{:?}", f),
            other => other.to_string(),
        })
        .ok_or_else(|| BridgeError::InvalidValue {
            name: name.to_string(),
            raw: value.to_string(),
        })
}


/// Encode an outbound parameter change as a `set_conf` frame.
///
/// `ier` is sent as its two sub-values `ier_i` and `ier_e`. The whole change
/// fails if any parameter lacks a value or does not render as its kind.
pub fn encode_set_conf(params: &BTreeMap<ParamName, Parameter>) -> Result<Vec<u8>> {
    if params.is_empty() {
        return Err(BridgeError::InvalidValue {
            name: "set_conf".into(),
            raw: String::new(),
        });
    }
    let mut pairs: Vec<(&str, String)> = Vec::new();
    for (name, param) in params {
        if *name == ParamName::Ier {
            let (i, e) = param.ratio_parts()?;
            pairs.push((ParamName::IerI.as_str(), ParamValue::Float(i).to_string()));
            pairs.push((ParamName::IerE.as_str(), ParamValue::Float(e).to_string()));
            continue;
        }
        let value = param.value.as_ref().ok_or_else(|| BridgeError::InvalidValue {
            name: name.to_string(),
            raw: String::new(),
        })?;
        pairs.push((name.as_str(), coerce(*name, name.kind(), value)?));
    }
    Ok(encode_frame("set_conf", &pairs).into_bytes())
}


/// Peer-side `min_conf` / `max_conf` / `def_conf` frame.
pub fn encode_bound(bound: Bound, values: &[(ParamName, f64)]) -> String {
    let pairs: Vec<(&str, String)> = values
        .iter()
        .map(|(n, v)| (n.as_str(), format!("{:?}", v)))
        .collect();
    encode_frame(bound.command(), &pairs)
}


/// Peer-side `set_conf` frame.
pub fn encode_values(values: &[(ParamName, f64)]) -> String {
    let pairs: Vec<(&str, String)> = values
        .iter()
        .map(|(n, v)| (n.as_str(), format!("{:?}", v)))
        .collect();
    encode_frame("set_conf", &pairs)
}


/// Peer-side `d` frame; each run is a hex string from `waveform::encode_samples`.
pub fn encode_data(n: usize, ts: f64, cp: &str, cf: &str, tf: &str) -> String {
    encode_frame(
        "d",
        &[
            ("n", n.to_string()),
            ("ts", format!("{:?}", ts)),
            ("cp", cp.to_string()),
            ("cf", cf.to_string()),
            ("tf", tf.to_string()),
        ],
    )
}


#[cfg(test)]
mod tests {
    use super::*;

    fn change(params: Vec<Parameter>) -> BTreeMap<ParamName, Parameter> {
        params.into_iter().map(|p| (p.name, p)).collect()
    }

    #[test]
    fn parses_command_and_pairs() {
        let frame = Frame::parse("set_conf?fio2=45.0&peep=5\n").unwrap();
        assert_eq!(frame.command, "set_conf");
        assert_eq!(
            frame.pairs,
            vec![("fio2".into(), "45.0".into()), ("peep".into(), "5".into())]
        );
    }

    #[test]
    fn command_without_query() {
        let frame = Frame::parse("reset_conf\r\n").unwrap();
        assert_eq!(frame.command, "reset_conf");
        assert!(frame.pairs.is_empty());
        assert_eq!(parse_line("reset_conf").unwrap(), Inbound::ResetConf);
    }

    #[test]
    fn duplicate_key_last_wins() {
        let frame = Frame::parse("min_conf?brpm=5&brpm=6").unwrap();
        assert_eq!(frame.get("brpm"), Some("6"));
        assert_eq!(frame.pairs.len(), 2);
    }

    #[test]
    fn percent_escapes_decoded() {
        let frame = Frame::parse("set_conf?ier=1%3A2&note=a+b").unwrap();
        assert_eq!(frame.get("ier"), Some("1:2"));
        assert_eq!(frame.get("note"), Some("a b"));
    }

    #[test]
    fn segment_without_equals_is_malformed() {
        let err = Frame::parse("set_conf?fio2").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedFrame(_)));
    }

    #[test]
    fn empty_command_is_malformed() {
        assert!(Frame::parse("?fio2=1").is_err());
        assert!(Frame::parse("").is_err());
    }

    #[test]
    fn bad_escape_is_malformed() {
        assert!(Frame::parse("set_conf?fio2=%FF").is_err());
    }

    #[test]
    fn decodes_bound_commands() {
        match parse_line("def_conf?peep=5").unwrap() {
            Inbound::Bounds { bound, pairs } => {
                assert_eq!(bound, Bound::Default);
                assert_eq!(pairs, vec![("peep".into(), "5".into())]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_command_is_not_an_error() {
        assert_eq!(
            parse_line("calibrate?x=1").unwrap(),
            Inbound::Unknown("calibrate".into())
        );
    }

    #[test]
    fn decodes_data_frame() {
        let line = "d?n=2&ts=1.5&cp=aa&cf=bb";
        match parse_line(line).unwrap() {
            Inbound::Data(data) => {
                assert_eq!(data.n, 2);
                assert_eq!(data.ts, 1.5);
                assert_eq!(data.run(Channel::CurrentPressure), Some("aa"));
                assert_eq!(data.run(Channel::CurrentFlow), Some("bb"));
                assert_eq!(data.run(Channel::TotalFlow), None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn data_frame_requires_n_and_ts() {
        assert!(parse_line("d?ts=1.0&cp=aa").is_err());
        assert!(parse_line("d?n=x&ts=1.0").is_err());
        assert!(parse_line("d?n=1").is_err());
    }

    #[test]
    fn line_buffer_reassembles_split_frames() {
        let mut lines = LineBuffer::new(1024);
        assert!(lines.push(b"set_conf?fi").is_empty());
        assert_eq!(lines.pending(), 11);
        let out = lines.push(b"o2=1\nreset_conf\nd?n");
        let out: Vec<String> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["set_conf?fio2=1", "reset_conf"]);
        assert_eq!(lines.pending(), 3);
    }

    #[test]
    fn line_buffer_skips_blank_lines() {
        let mut lines = LineBuffer::new(1024);
        let out = lines.push(b"\n\nreset_conf\n");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn line_buffer_drops_overlong_frame_once() {
        let mut lines = LineBuffer::new(12);
        let out = lines.push(b"0123456789abcdef");
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
        let out = lines.push(b"more\nreset_conf\n");
        let out: Vec<String> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec!["reset_conf"]);
    }

    #[test]
    fn encodes_ier_as_two_sub_values() {
        let params = change(vec![Parameter::with_value(
            ParamName::Ier,
            ParamValue::Text("2".into()),
        )]);
        let bytes = encode_set_conf(&params).unwrap();
        assert_eq!(bytes, b"set_conf?ier_i=1&ier_e=2\n");
    }

    #[test]
    fn encodes_values_by_declared_type() {
        let params = change(vec![
            Parameter::with_value(ParamName::Brpm, ParamValue::Float(14.0)),
            Parameter::with_value(ParamName::Fio2, ParamValue::Float(45.5)),
        ]);
        let bytes = encode_set_conf(&params).unwrap();
        assert_eq!(bytes, b"set_conf?fio2=45.5&brpm=14\n");
    }

    #[test]
    fn whole_floats_keep_decimal_point() {
        let params = change(vec![
            Parameter::with_value(ParamName::Fio2, ParamValue::Float(45.0)),
            Parameter::with_value(ParamName::Tf, ParamValue::Int(30)),
            Parameter::with_value(ParamName::Peep, ParamValue::Int(5)),
        ]);
        let bytes = encode_set_conf(&params).unwrap();
        assert_eq!(bytes, b"set_conf?fio2=45.0&peep=5&tf=30.0\n");
    }

    #[test]
    fn float_index_for_ier_encodes() {
        let params = change(vec![Parameter::with_value(
            ParamName::Ier,
            ParamValue::Text("2.0".into()),
        )]);
        assert_eq!(encode_set_conf(&params).unwrap(), b"set_conf?ier_i=1&ier_e=2\n");
    }

    #[test]
    fn encode_rejects_missing_or_wrong_typed_values() {
        let params = change(vec![Parameter::new(ParamName::Peep)]);
        assert!(encode_set_conf(&params).is_err());

        let params = change(vec![Parameter::with_value(
            ParamName::Peep,
            ParamValue::Float(5.5),
        )]);
        assert!(matches!(
            encode_set_conf(&params),
            Err(BridgeError::InvalidValue { .. })
        ));
        assert!(encode_set_conf(&BTreeMap::new()).is_err());
    }

    #[test]
    fn peer_frames_parse_back() {
        let line = encode_bound(Bound::Max, &[(ParamName::Fio2, 100.0), (ParamName::Peep, 20.0)]);
        assert_eq!(line, "max_conf?fio2=100.0&peep=20.0\n");
        match parse_line(&line).unwrap() {
            Inbound::Bounds { bound, pairs } => {
                assert_eq!(bound, Bound::Max);
                assert_eq!(pairs.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(encode_values(&[(ParamName::Fio2, 45.0)]), "set_conf?fio2=45.0\n");
    }
}
