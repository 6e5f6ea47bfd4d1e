use std::path::PathBuf;

use thiserror::Error;


#[derive(Error, Debug)]
pub enum BridgeError {
    /// A frame whose command or query string could not be parsed at all.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A key that is not one of the declared parameter names.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// A raw value that does not parse as the parameter's declared type.
    #[error("invalid value for {name}: {raw:?}")]
    InvalidValue { name: String, raw: String },

    /// A hex sample run that is too short or contains non-hex characters.
    #[error("malformed sample data: {0}")]
    MalformedSampleData(String),

    /// The socket path is held by a live listener.
    #[error("socket {} is already in use by a running process", .0.display())]
    BindConflict(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_parameter() {
        let err = BridgeError::InvalidValue {
            name: "brpm".into(),
            raw: "fast".into(),
        };
        assert_eq!(err.to_string(), "invalid value for brpm: \"fast\"");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
