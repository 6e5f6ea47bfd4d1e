use std::path::Path;

use crate::error::{BridgeError, Result};
use crate::types::config::BridgeConfig;


/// Load a `BridgeConfig` from a YAML file. Missing keys take their defaults;
/// unknown keys are an error so typos do not pass silently.
pub fn load(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let config = parse(&content)
        .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
    Ok(config)
}


/// Parse and validate configuration from a YAML string.
pub fn parse(content: &str) -> Result<BridgeConfig> {
    let config: BridgeConfig = if content.trim().is_empty() {
        BridgeConfig::default()
    } else {
        serde_yaml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))?
    };
    config.validate()?;
    Ok(config)
}


/// Write a config back out as YAML.
pub fn save(path: &Path, config: &BridgeConfig) -> Result<()> {
    let content = serde_yaml::to_string(config).map_err(|e| BridgeError::Config(e.to_string()))?;
    std::fs::write(path, content)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(parse("").unwrap(), BridgeConfig::default());
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config = parse("socket_path: /run/vent.sock\nmax_points: 1000\n").unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/vent.sock"));
        assert_eq!(config.max_points, 1000);
        assert_eq!(config.sample_period_s, 0.01);
    }

    #[test]
    fn unknown_key_rejected() {
        let err = parse("sample_rate: 100\n").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn invalid_values_rejected_after_parse() {
        assert!(parse("max_points: 0\n").is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ventlink.yaml");
        let config = BridgeConfig {
            dispatch_idle_ms: 20,
            reset_clears_store: true,
            ..BridgeConfig::default()
        };
        save(&path, &config).unwrap();
        assert_eq!(load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = load(Path::new("/nonexistent/ventlink.yaml")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
