use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};

use flagdev_core::Context;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    /// Debug capture is disabled when unset.
    pub events_db_path: Option<PathBuf>,
    pub api_base_uri: String,
    pub sdk_base_uri: String,
    pub access_token: Option<String>,
    pub cors: CorsConfig,
    pub heartbeat_secs: u64,
    /// Periodic upstream sync; 0 disables it.
    pub sync_interval_secs: u64,
    pub startup: Option<StartupSync>,
    pub sync_once: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origin: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origin: "*".to_string(),
        }
    }
}

/// Project to create, import or re-sync before serving.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupSync {
    pub project: String,
    pub source_environment_key: Option<String>,
    pub context: Option<Context>,
    pub overrides: Map<String, Value>,
    pub import_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let listen_addr = var("FLAGDEV_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8765".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FLAGDEV_LISTEN_ADDR", "must be a valid socket address")
            })?;

        let db_path = var("FLAGDEV_DB_PATH")
            .unwrap_or_else(|| "./flagdev.db".to_string())
            .into();
        let events_db_path = var("FLAGDEV_EVENTS_DB_PATH").map(PathBuf::from);

        let api_base_uri = var("FLAGDEV_API_BASE_URI")
            .unwrap_or_else(|| "https://app.launchdarkly.com".to_string());
        let sdk_base_uri = var("FLAGDEV_SDK_BASE_URI")
            .unwrap_or_else(|| "https://clientsdk.launchdarkly.com".to_string());
        let access_token = var("FLAGDEV_ACCESS_TOKEN");

        let cors = CorsConfig {
            enabled: parse_bool(var("FLAGDEV_CORS_ENABLED"), true)
                .ok_or(ConfigError::Invalid("FLAGDEV_CORS_ENABLED", "must be true or false"))?,
            allowed_origin: var("FLAGDEV_CORS_ORIGIN").unwrap_or_else(|| "*".to_string()),
        };

        let heartbeat_secs = match var("FLAGDEV_HEARTBEAT_SECS") {
            Some(s) => s
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::Invalid(
                    "FLAGDEV_HEARTBEAT_SECS",
                    "must be a positive number of seconds",
                ))?,
            None => 30,
        };

        let sync_interval_secs = match var("FLAGDEV_SYNC_INTERVAL_SECS") {
            Some(s) => s.parse::<u64>().map_err(|_| {
                ConfigError::Invalid(
                    "FLAGDEV_SYNC_INTERVAL_SECS",
                    "must be a number of seconds, 0 to disable",
                )
            })?,
            None => 0,
        };

        let sync_once = parse_bool(var("FLAGDEV_SYNC_ONCE"), false)
            .ok_or(ConfigError::Invalid("FLAGDEV_SYNC_ONCE", "must be true or false"))?;

        let startup = Self::parse_startup(&var)?;
        if sync_once && startup.is_none() {
            return Err(ConfigError::Missing("FLAGDEV_PROJECT"));
        }

        Ok(Config {
            listen_addr,
            db_path,
            events_db_path,
            api_base_uri,
            sdk_base_uri,
            access_token,
            cors,
            heartbeat_secs,
            sync_interval_secs,
            startup,
            sync_once,
        })
    }

    fn parse_startup<F>(var: &F) -> Result<Option<StartupSync>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(project) = var("FLAGDEV_PROJECT") else {
            return Ok(None);
        };

        let context = match var("FLAGDEV_CONTEXT") {
            Some(raw) => Some(
                serde_json::from_str::<Value>(&raw)
                    .ok()
                    .and_then(|v| Context::from_value(v).ok())
                    .ok_or(ConfigError::Invalid(
                        "FLAGDEV_CONTEXT",
                        "must be a JSON context object with a key",
                    ))?,
            ),
            None => None,
        };

        let overrides = match var("FLAGDEV_OVERRIDES") {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    return Err(ConfigError::Invalid(
                        "FLAGDEV_OVERRIDES",
                        "must be a JSON object of flag key to value",
                    ))
                }
            },
            None => Map::new(),
        };

        let import_file = var("FLAGDEV_IMPORT_FILE").map(PathBuf::from);
        let source_environment_key = var("FLAGDEV_SOURCE_ENV");
        if source_environment_key.is_none() && import_file.is_none() {
            return Err(ConfigError::Missing("FLAGDEV_SOURCE_ENV"));
        }

        Ok(Some(StartupSync {
            project,
            source_environment_key,
            context,
            overrides,
            import_file,
        }))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }
}

fn parse_bool(value: Option<String>, default: bool) -> Option<bool> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Some(default),
        Some("true" | "1" | "yes") => Some(true),
        Some("false" | "0" | "no") => Some(false),
        Some(_) => None,
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(var) => {
                write!(f, "Missing required environment variable: {}", var)
            }
            ConfigError::Invalid(var, msg) => write!(f, "Invalid value for {}: {}", var, msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 8765);
        assert_eq!(config.db_path, PathBuf::from("./flagdev.db"));
        assert!(config.events_db_path.is_none());
        assert_eq!(config.cors, CorsConfig::default());
        assert_eq!(config.heartbeat(), Duration::from_secs(30));
        assert!(config.startup.is_none());
        assert!(!config.sync_once);
        assert_eq!(config.sync_interval(), None);
    }

    #[test]
    fn test_sync_interval() {
        let config = load(&[("FLAGDEV_SYNC_INTERVAL_SECS", "300")]).unwrap();
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(300)));

        let config = load(&[("FLAGDEV_SYNC_INTERVAL_SECS", "0")]).unwrap();
        assert_eq!(config.sync_interval(), None);

        assert!(matches!(
            load(&[("FLAGDEV_SYNC_INTERVAL_SECS", "-5")]),
            Err(ConfigError::Invalid("FLAGDEV_SYNC_INTERVAL_SECS", _))
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("FLAGDEV_LISTEN_ADDR", "nope")]),
            Err(ConfigError::Invalid("FLAGDEV_LISTEN_ADDR", _))
        ));
        assert!(matches!(
            load(&[("FLAGDEV_CORS_ENABLED", "maybe")]),
            Err(ConfigError::Invalid("FLAGDEV_CORS_ENABLED", _))
        ));
        assert!(matches!(
            load(&[("FLAGDEV_HEARTBEAT_SECS", "0")]),
            Err(ConfigError::Invalid("FLAGDEV_HEARTBEAT_SECS", _))
        ));
    }

    #[test]
    fn test_startup_sync() {
        let config = load(&[
            ("FLAGDEV_PROJECT", "p1"),
            ("FLAGDEV_SOURCE_ENV", "production"),
            ("FLAGDEV_CONTEXT", r#"{"kind":"user","key":"alice"}"#),
            ("FLAGDEV_OVERRIDES", r#"{"f1": false}"#),
            ("FLAGDEV_CORS_ENABLED", "FALSE"),
        ])
        .unwrap();

        assert!(!config.cors.enabled);
        let startup = config.startup.unwrap();
        assert_eq!(startup.project, "p1");
        assert_eq!(startup.context.unwrap().key(), Some("alice"));
        assert_eq!(startup.overrides.get("f1"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_startup_requires_source() {
        assert!(matches!(
            load(&[("FLAGDEV_PROJECT", "p1")]),
            Err(ConfigError::Missing("FLAGDEV_SOURCE_ENV"))
        ));
        assert!(load(&[("FLAGDEV_PROJECT", "p1"), ("FLAGDEV_IMPORT_FILE", "p1.json")]).is_ok());
        assert!(matches!(
            load(&[("FLAGDEV_SYNC_ONCE", "true")]),
            Err(ConfigError::Missing("FLAGDEV_PROJECT"))
        ));
        assert!(matches!(
            load(&[
                ("FLAGDEV_PROJECT", "p1"),
                ("FLAGDEV_SOURCE_ENV", "production"),
                ("FLAGDEV_OVERRIDES", "[1]"),
            ]),
            Err(ConfigError::Invalid("FLAGDEV_OVERRIDES", _))
        ));
    }
}
