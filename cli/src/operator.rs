//! Operator input: parameter edits typed on stdin.
//!
//! One change per line, as whitespace-separated `name=value` tokens. A line
//! with several tokens is submitted as one batch so the controller receives
//! a single `set_conf` frame.

use std::io::BufRead;

use log::{info, warn};

use ventlink_core::daemon::BridgeHandle;
use ventlink_core::dispatch::ParamChange;
use ventlink_core::error::{BridgeError, Result};
use ventlink_core::types::parameter::{ParamName, Parameter};


/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_change(line: &str) -> Result<Option<ParamChange>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut params = Vec::new();
    for token in line.split_whitespace() {
        let (key, raw) = token.split_once('=').ok_or_else(|| {
            BridgeError::MalformedFrame(format!("expected name=value, got {:?}", token))
        })?;
        let name = ParamName::parse(key)?;
        let value = name.kind().parse(raw).ok_or_else(|| BridgeError::InvalidValue {
            name: key.to_string(),
            raw: raw.to_string(),
        })?;
        params.push(Parameter::with_value(name, value));
    }
    let change = match params.len() {
        1 => ParamChange::from(params.remove(0)),
        _ => params.into_iter().collect(),
    };
    Ok(Some(change))
}


pub fn spawn_stdin_reader(handle: BridgeHandle) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("stdin: {}", e);
                    break;
                }
            };
            if handle.is_shutting_down() {
                break;
            }
            match parse_change(&line) {
                Ok(Some(change)) => {
                    if !handle.is_connected() {
                        warn!("no controller connected, {:?} will be dropped", line.trim());
                    }
                    handle.submit(change);
                }
                Ok(None) => {}
                Err(e) => eprintln!("ventlink: {}", e),
            }
        }
        info!("stdin closed, operator input stopped");
    });
}


#[cfg(test)]
mod tests {
    use super::*;
    use ventlink_core::types::parameter::ParamValue;

    #[test]
    fn single_token_is_single_change() {
        let change = parse_change("fio2=40.5").unwrap().unwrap();
        assert_eq!(
            change,
            ParamChange::Single(Parameter::with_value(ParamName::Fio2, ParamValue::Float(40.5)))
        );
    }

    #[test]
    fn several_tokens_form_a_batch() {
        let change = parse_change("  peep=6   ier=2 ").unwrap().unwrap();
        let batch = change.into_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[&ParamName::Peep].value, Some(ParamValue::Int(6)));
        assert_eq!(batch[&ParamName::Ier].value, Some(ParamValue::Text("2".into())));
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_change("").unwrap().is_none());
        assert!(parse_change("   # tidal volume next").unwrap().is_none());
    }

    #[test]
    fn bad_tokens_reject_the_whole_line() {
        assert!(matches!(parse_change("peep"), Err(BridgeError::MalformedFrame(_))));
        assert!(matches!(
            parse_change("fio2=40 volume=3"),
            Err(BridgeError::UnknownParameter(_))
        ));
        assert!(matches!(
            parse_change("brpm=fast"),
            Err(BridgeError::InvalidValue { .. })
        ));
    }
}
