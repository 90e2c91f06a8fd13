//! Configuration loading and validation.

use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::error::ConfigError;
use super::schema::{Config, TransportKind};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "MCPHUB_CONFIG";

/// Config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "mcphub.yaml";

/// Locate the config file.
///
/// Priority: explicit path, then `$MCPHUB_CONFIG`, then `./mcphub.yaml`.
/// An explicit or environment-supplied path that does not exist is an error;
/// a missing `./mcphub.yaml` just means "run with defaults" (`Ok(None)`).
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let requested = explicit_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

    if let Some(path) = requested {
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path],
        });
    }

    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(local.exists().then_some(local))
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(&contents)?;
    let config: Config = serde_saphyr::from_str(&contents)?;

    Ok(config)
}

/// Load, then validate.
pub fn load_and_validate(path: &Path) -> Result<Config, ConfigError> {
    let config = load_config(path)?;
    validate(&config)?;
    Ok(config)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on a compile-time literal pattern, covered by
// test_env_var_pattern_compiles().
#[allow(clippy::expect_used)]
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${VAR}` - Required, fail if not set
/// - `${VAR:-default}` - Optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match (std::env::var(var_name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Check cross-field requirements the schema cannot express.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.transport.kind == TransportKind::Tcp {
        let address = config
            .transport
            .address
            .as_deref()
            .ok_or(ConfigError::MissingField {
                field: "transport.address",
            })?;
        check_address("transport.address", address)?;
    }

    if config.proxy.enabled {
        let address =
            config
                .proxy
                .listen_address
                .as_deref()
                .ok_or(ConfigError::MissingField {
                    field: "proxy.listen_address",
                })?;
        check_address("proxy.listen_address", address)?;
    }

    Ok(())
}

fn check_address(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
        message,
    };
    let mut addrs = value.to_socket_addrs().map_err(|e| invalid(e.to_string()))?;
    addrs
        .next()
        .map(|_| ())
        .ok_or_else(|| invalid("resolves to no addresses".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_var_pattern_compiles() {
        assert!(ENV_VAR_PATTERN.is_match("${HOME}"));
        assert!(ENV_VAR_PATTERN.is_match("${X:-y}"));
        assert!(!ENV_VAR_PATTERN.is_match("$HOME"));
    }

    #[test]
    fn test_substitute_default_used_when_unset() {
        let out = substitute_env_vars("port: ${MCPHUB_TEST_SURELY_UNSET_1:-7400}").unwrap();
        assert_eq!(out, "port: 7400");
    }

    #[test]
    fn test_substitute_set_var() {
        let path = std::env::var("PATH").unwrap();
        let out = substitute_env_vars("p: ${PATH:-nope}").unwrap();
        assert_eq!(out, format!("p: {path}"));
    }

    #[test]
    fn test_substitute_missing_required_var() {
        let err = substitute_env_vars("a: ${MCPHUB_TEST_SURELY_UNSET_2}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { var, .. } if var == "MCPHUB_TEST_SURELY_UNSET_2"));
    }

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let file = write_config("server:\n  name: test-hub\n");
        let config = load_and_validate(file.path()).unwrap();
        assert_eq!(config.server.name, "test-hub");
        assert_eq!(config.transport.kind, TransportKind::Stdio);
        assert!(!config.proxy.enabled);
        assert_eq!(config.proxy.registration_timeout_secs, 30);
        assert_eq!(config.proxy.call_timeout_secs, 120);
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
server:
  name: hub
  version: "9.9.9"
transport:
  type: tcp
  address: "127.0.0.1:0"
proxy:
  enabled: true
  listen_address: "127.0.0.1:${MCPHUB_TEST_SURELY_UNSET_3:-0}"
  registration_timeout_secs: 0
  call_timeout_secs: 5
inspector:
  enabled: true
"#,
        );
        let config = load_and_validate(file.path()).unwrap();
        assert_eq!(config.transport.kind, TransportKind::Tcp);
        assert_eq!(config.proxy.listen_address.as_deref(), Some("127.0.0.1:0"));
        assert_eq!(config.proxy.registration_timeout(), None);
        assert_eq!(
            config.proxy.call_timeout(),
            Some(std::time::Duration::from_secs(5))
        );
        assert!(config.inspector.enabled);
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = write_config("  \n");
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::EmptyConfigFile)
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let file = write_config("proxy:\n  enabled: true\n  listen: x\n");
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_proxy_enabled_requires_address() {
        let mut config = Config::default();
        config.proxy.enabled = true;
        assert!(matches!(
            validate(&config),
            Err(ConfigError::MissingField {
                field: "proxy.listen_address"
            })
        ));
    }

    #[test]
    fn test_invalid_address_rejected() {
        let mut config = Config::default();
        config.proxy.enabled = true;
        config.proxy.listen_address = Some("not an address".into());
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let err = find_config_file(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileNotFound { .. }));
    }

    #[test]
    fn test_explicit_existing_path_found() {
        let file = write_config("inspector:\n  enabled: false\n");
        let found = find_config_file(Some(file.path())).unwrap();
        assert_eq!(found.as_deref(), Some(file.path()));
    }
}
