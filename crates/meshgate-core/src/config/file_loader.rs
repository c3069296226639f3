//! File-based configuration loading

use std::fs;
use std::path::Path;

use super::MeshConfig;
use super::error::ConfigError;

/// Load configuration from a file
///
/// Supports JSON, TOML, and YAML formats based on file extension.
/// Returns default config if file doesn't exist.
pub fn load_from_file(path: &Path) -> Result<MeshConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file; using defaults");
        return Ok(MeshConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let parse_error = |format: &'static str, message: String| ConfigError::Parse {
        format,
        path: path.display().to_string(),
        message,
    };

    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|e| parse_error("TOML", e.to_string()))?,
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| parse_error("YAML", e.to_string()))?
        }
        _ => serde_json::from_str(&content).map_err(|e| parse_error("JSON", e.to_string()))?,
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Strategy;
    use crate::bus::TransportKind;
    use crate::config::LogFormat;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_toml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("meshgate.toml");
        let config_toml = r#"
[bus]
transport = "redis"
redis_url = "redis://cache:6379"

[registry]
ttl = "10s"
health_check_interval = "5s"
max_failed_health_checks = 4

[circuit_breaker]
failure_threshold = 2
reset_timeout = "1s"

[load_balancer]
strategy = "least-connections"

[load_balancer.services]
search = "ip-hash"

[gateway]
max_retries = 5
retry_delay = "250ms"

[logging]
level = "debug"
format = "json"
"#;
        fs::write(&config_path, config_toml).unwrap();

        let config = load_from_file(&config_path).unwrap();
        assert_eq!(config.bus.transport, TransportKind::Redis);
        assert_eq!(config.bus.redis_url, "redis://cache:6379");
        assert_eq!(config.registry.ttl, Duration::from_secs(10));
        assert_eq!(config.registry.max_failed_health_checks, 4);
        // Unspecified fields keep their defaults
        assert_eq!(config.registry.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(1));
        assert_eq!(config.load_balancer.strategy, Strategy::LeastConnections);
        assert_eq!(
            config.load_balancer.services.get("search"),
            Some(&Strategy::IpHash)
        );
        assert_eq!(config.gateway.retry_delay, Duration::from_millis(250));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("meshgate.yaml");
        let yaml_content = r#"
registry:
  ttl: 45s
gateway:
  request_timeout: 2s
  count_client_errors: true
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let config = load_from_file(&config_path).unwrap();
        assert_eq!(config.registry.ttl, Duration::from_secs(45));
        assert_eq!(config.gateway.request_timeout, Duration::from_secs(2));
        assert!(config.gateway.count_client_errors);
    }

    #[test]
    fn test_load_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("meshgate.json");
        fs::write(
            &config_path,
            r#"{"bus": {"capacity": 64}, "load_balancer": {"strategy": "random"}}"#,
        )
        .unwrap();

        let config = load_from_file(&config_path).unwrap();
        assert_eq!(config.bus.capacity, 64);
        assert_eq!(config.load_balancer.strategy, Strategy::Random);
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let config = load_from_file(Path::new("/nonexistent/meshgate.toml")).unwrap();
        assert_eq!(config, MeshConfig::default());
    }

    #[test]
    fn test_load_from_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("broken.toml");
        fs::write(&config_path, "[registry\nttl = ").unwrap();

        let err = load_from_file(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "TOML", .. }));
    }
}
