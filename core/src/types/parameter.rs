use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};


/// The closed set of parameters the controller exposes.
///
/// Declaration order is the iteration order of the store and of encoded
/// batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamName {
    Fio2,
    Brpm,
    Ier,
    IerI,
    IerE,
    Ast,
    Mode,
    Tvm,
    Peep,
    Tf,
}


impl ParamName {
    pub const COUNT: usize = 10;

    pub const ALL: [ParamName; ParamName::COUNT] = [
        ParamName::Fio2,
        ParamName::Brpm,
        ParamName::Ier,
        ParamName::IerI,
        ParamName::IerE,
        ParamName::Ast,
        ParamName::Mode,
        ParamName::Tvm,
        ParamName::Peep,
        ParamName::Tf,
    ];

    /// Wire name of the parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::Fio2 => "fio2",
            ParamName::Brpm => "brpm",
            ParamName::Ier => "ier",
            ParamName::IerI => "ier_i",
            ParamName::IerE => "ier_e",
            ParamName::Ast => "ast",
            ParamName::Mode => "mode",
            ParamName::Tvm => "tvm",
            ParamName::Peep => "peep",
            ParamName::Tf => "tf",
        }
    }

    /// Look up a wire name. Fails with `UnknownParameter` outside the declared set.
    pub fn parse(name: &str) -> Result<ParamName> {
        ParamName::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| BridgeError::UnknownParameter(name.to_string()))
    }

    pub fn kind(self) -> ParamKind {
        match self {
            ParamName::Fio2 | ParamName::IerI | ParamName::IerE | ParamName::Tf => {
                ParamKind::Float
            }
            ParamName::Brpm
            | ParamName::Ast
            | ParamName::Mode
            | ParamName::Tvm
            | ParamName::Peep => ParamKind::Int,
            ParamName::Ier => ParamKind::Composite,
        }
    }
}


impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


/// Declared primitive type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    Int,
    /// A string holding colon-separated sub-values, or an index into the
    /// parameter's options table that resolves to one.
    Composite,
}


impl ParamKind {
    /// Parse a raw wire value as this kind.
    ///
    /// Integers accept an integral float rendering (`"5.0"`) because the
    /// controller sends every bound as a float.
    pub fn parse(self, raw: &str) -> Option<ParamValue> {
        let raw = raw.trim();
        match self {
            ParamKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(ParamValue::Float),
            ParamKind::Int => {
                if let Ok(i) = raw.parse::<i64>() {
                    return Some(ParamValue::Int(i));
                }
                let f = raw.parse::<f64>().ok()?;
                if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Some(ParamValue::Int(f as i64))
                } else {
                    None
                }
            }
            ParamKind::Composite => {
                if raw.is_empty() {
                    None
                } else {
                    Some(ParamValue::Text(raw.to_string()))
                }
            }
        }
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}


impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}


/// Which configured bound a `*_conf` command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Min,
    Max,
    Default,
}


impl Bound {
    pub fn command(self) -> &'static str {
        match self {
            Bound::Min => "min_conf",
            Bound::Max => "max_conf",
            Bound::Default => "def_conf",
        }
    }
}


/// Default inspiration:expiration ratio table for `ier`.
const IER_OPTIONS: [(u32, &str); 5] = [(0, "1:1"), (1, "1:1.5"), (2, "1:2"), (3, "1:3"), (4, "1:4")];


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: ParamName,
    pub value: Option<ParamValue>,
    pub value_min: Option<ParamValue>,
    pub value_max: Option<ParamValue>,
    pub value_default: Option<ParamValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<u32, String>,
}


impl Parameter {
    /// An empty parameter; `ier` starts with its ratio table.
    pub fn new(name: ParamName) -> Parameter {
        let options = if name == ParamName::Ier {
            IER_OPTIONS
                .iter()
                .map(|(i, s)| (*i, s.to_string()))
                .collect()
        } else {
            BTreeMap::new()
        };
        Parameter {
            name,
            value: None,
            value_min: None,
            value_max: None,
            value_default: None,
            options,
        }
    }

    /// Builder used by operator-side code to describe a change.
    pub fn with_value(name: ParamName, value: ParamValue) -> Parameter {
        let mut p = Parameter::new(name);
        p.value = Some(value);
        p
    }

    /// True once min, max and default have all been set.
    pub fn is_configured(&self) -> bool {
        self.value_min.is_some() && self.value_max.is_some() && self.value_default.is_some()
    }

    pub fn kind(&self) -> ParamKind {
        self.name.kind()
    }

    pub fn bound(&self, bound: Bound) -> Option<&ParamValue> {
        match bound {
            Bound::Min => self.value_min.as_ref(),
            Bound::Max => self.value_max.as_ref(),
            Bound::Default => self.value_default.as_ref(),
        }
    }

    pub(crate) fn bound_mut(&mut self, bound: Bound) -> &mut Option<ParamValue> {
        match bound {
            Bound::Min => &mut self.value_min,
            Bound::Max => &mut self.value_max,
            Bound::Default => &mut self.value_default,
        }
    }

    /// Resolve a composite value into its two numeric sub-values.
    ///
    /// The value is either an index into `options` or a literal `"a:b"`.
    pub fn ratio_parts(&self) -> Result<(f64, f64)> {
        let invalid = |raw: &str| BridgeError::InvalidValue {
            name: self.name.to_string(),
            raw: raw.to_string(),
        };
        let key = match &self.value {
            Some(v) => v.to_string(),
            None => return Err(invalid("")),
        };
        let raw = option_index(&key)
            .and_then(|i| self.options.get(&i))
            .map(String::as_str)
            .unwrap_or(key.as_str());

        let mut parts = raw.split(':');
        let (Some(i), Some(e), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid(raw));
        };
        let sub = ParamKind::Float;
        match (sub.parse(i), sub.parse(e)) {
            (Some(ParamValue::Float(i)), Some(ParamValue::Float(e))) => Ok((i, e)),
            _ => Err(invalid(raw)),
        }
    }
}


/// An options index, written as an integer or an integral float (`"2.0"`).
fn option_index(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(i) = raw.parse::<u32>() {
        return Some(i);
    }
    let f = raw.parse::<f64>().ok()?;
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}
