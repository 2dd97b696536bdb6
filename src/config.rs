use crate::error::GateError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway configuration
///
/// The top-level keys mirror the launcher file format: the user allow-list,
/// the shared secret, the environment root, the three lifecycle scripts and
/// the first backend port.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Users that get a session, in port-assignment order
    #[serde(default)]
    pub users: Vec<String>,

    /// Shared secret required on every /entry and /proxy route
    #[serde(default)]
    pub token: String,

    /// Root directory handed to every script
    #[serde(default)]
    pub env_dir: PathBuf,

    /// Provisioning script: `setup <user> <env_dir>`
    #[serde(default)]
    pub setup_script: PathBuf,

    /// Backend launcher: `start <user> <env_dir> <base_url> <token> <port>`
    #[serde(default)]
    pub start_script: PathBuf,

    /// Cleanup script: `stop <user> <env_dir> <port>`
    pub stop_script: Option<PathBuf>,

    /// Port of the first user's backend
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Session startup behaviour
    #[serde(default)]
    pub startup: StartupConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("users", &self.users)
            .field("token", &"<redacted>")
            .field("env_dir", &self.env_dir)
            .field("setup_script", &self.setup_script)
            .field("start_script", &self.start_script)
            .field("stop_script", &self.stop_script)
            .field("base_port", &self.base_port)
            .field("server", &self.server)
            .field("startup", &self.startup)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Wait after running the stop scripts before exiting (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// Session startup behaviour
///
/// By default a session is registered as soon as its start script has been
/// spawned. With `wait_for_ready` the supervisor first waits for the backend
/// port to accept connections (bounded by `ready_timeout_secs`).
#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    #[serde(default)]
    pub wait_for_ready: bool,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_ready_check_interval")]
    pub ready_check_interval_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            wait_for_ready: false,
            ready_timeout_secs: default_ready_timeout(),
            ready_check_interval_ms: default_ready_check_interval(),
        }
    }
}

impl StartupConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_check_interval(&self) -> Duration {
        Duration::from_millis(self.ready_check_interval_ms)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_base_port() -> u16 {
    9000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_ready_check_interval() -> u64 {
    100
}

impl Config {
    /// Load and validate a config file. Files ending in `.json` are parsed as
    /// JSON, everything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, GateError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GateError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config: Config = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| GateError::Configuration(format!("invalid JSON: {}", e)))?
        } else {
            toml::from_str(&content)
                .map_err(|e| GateError::Configuration(format!("invalid TOML: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), GateError> {
        let mut errors = Vec::new();

        if self.token.is_empty() {
            errors.push("'token' must be set for security".to_string());
        } else if self
            .token
            .chars()
            .any(|c| c.is_control() || matches!(c, '/' | '?' | '#'))
        {
            // The token is a path segment of every backend's base URL
            errors.push("'token' must not contain '/', '?', '#' or control characters".to_string());
        }

        if let Err(e) = check_script(&self.setup_script) {
            errors.push(format!("setup_script: {}", e));
        }

        if let Err(e) = check_script(&self.start_script) {
            errors.push(format!("start_script: {}", e));
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if user.is_empty() || user.contains('/') {
                errors.push(format!("invalid user name '{}'", user));
            }
            if !seen.insert(user.as_str()) {
                errors.push(format!("user '{}' is listed more than once", user));
            }
        }

        if self.base_port == 0 {
            errors.push("'base_port' must be greater than 0".to_string());
        } else if !self.users.is_empty()
            && self.base_port as usize + self.users.len() - 1 > u16::MAX as usize
        {
            errors.push(format!(
                "'base_port' {} leaves no room for {} users",
                self.base_port,
                self.users.len()
            ));
        }

        if !errors.is_empty() {
            return Err(GateError::Configuration(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}

/// A script path must be non-empty and point at an existing regular file
fn check_script(path: &Path) -> Result<(), String> {
    if path.as_os_str().is_empty() {
        return Err("empty path to script".to_string());
    }

    let metadata = std::fs::metadata(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    if !metadata.is_file() {
        return Err(format!("{}: not a file", path.display()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("setup.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("start.sh"), "#!/bin/sh\n").unwrap();
        dir
    }

    fn valid_config(dir: &Path) -> Config {
        let toml = format!(
            r#"
users = ["alice", "bob"]
token = "T"
env_dir = "/srv/envs"
setup_script = "{}"
start_script = "{}"
base_port = 9000
"#,
            dir.join("setup.sh").display(),
            dir.join("start.sh").display()
        );
        toml::from_str(&toml).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
users = ["alice", "bob"]
token = "secret"
env_dir = "/srv/envs"
setup_script = "/srv/bin/setup.sh"
start_script = "/srv/bin/start.sh"
stop_script = "/srv/bin/stop.sh"
base_port = 9100

[server]
bind = "127.0.0.1"
port = 8081

[startup]
wait_for_ready = true
ready_timeout_secs = 10
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.users, vec!["alice", "bob"]);
        assert_eq!(config.token, "secret");
        assert_eq!(config.env_dir, PathBuf::from("/srv/envs"));
        assert_eq!(config.stop_script, Some(PathBuf::from("/srv/bin/stop.sh")));
        assert_eq!(config.base_port, 9100);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8081);
        assert!(config.startup.wait_for_ready);
        assert_eq!(config.startup.ready_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.startup.ready_check_interval(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
        assert_eq!(config.shutdown_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.users.is_empty());
        assert!(config.token.is_empty());
        assert!(config.stop_script.is_none());
        assert_eq!(config.base_port, 9000);
        assert!(!config.startup.wait_for_ready);
    }

    #[test]
    fn test_validate_valid_config() {
        let dir = script_dir();
        let config = valid_config(dir.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_token() {
        let dir = script_dir();
        let mut config = valid_config(dir.path());
        config.token = String::new();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'token' must be set"));
    }

    #[test]
    fn test_validate_token_fits_in_path_segment() {
        let dir = script_dir();
        let mut config = valid_config(dir.path());

        config.token = "ab+c=".to_string();
        assert!(config.validate().is_ok());

        for bad in ["a/b", "a?b", "a#b", "a\nb"] {
            config.token = bad.to_string();
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains("must not contain"), "token {:?}: {}", bad, err);
        }
    }

    #[test]
    fn test_validate_scripts_must_exist() {
        let dir = script_dir();
        let mut config = valid_config(dir.path());
        config.setup_script = dir.path().join("missing.sh");
        config.start_script = PathBuf::new();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("setup_script"));
        assert!(err.contains("start_script: empty path to script"));
    }

    #[test]
    fn test_validate_script_must_be_file() {
        let dir = script_dir();
        let mut config = valid_config(dir.path());
        config.start_script = dir.path().to_path_buf();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("not a file"));
    }

    #[test]
    fn test_validate_duplicate_users() {
        let dir = script_dir();
        let mut config = valid_config(dir.path());
        config.users = vec!["alice".to_string(), "alice".to_string()];

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("listed more than once"));
    }

    #[test]
    fn test_validate_port_range() {
        let dir = script_dir();
        let mut config = valid_config(dir.path());
        config.base_port = u16::MAX;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("leaves no room"));

        config.base_port = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'base_port' must be greater than 0"));
    }

    #[test]
    fn test_load_json_config() {
        let dir = script_dir();
        let json = serde_json::json!({
            "users": ["alice"],
            "token": "T",
            "env_dir": "/srv/envs",
            "setup_script": dir.path().join("setup.sh"),
            "start_script": dir.path().join("start.sh"),
            "stop_script": dir.path().join("stop.sh"),
            "base_port": 9300
        });
        let path = dir.path().join("launch.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(json.to_string().as_bytes()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.users, vec!["alice"]);
        assert_eq!(config.base_port, 9300);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/sessiongate.toml").unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config: Config = toml::from_str(r#"token = "super-secret""#).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
