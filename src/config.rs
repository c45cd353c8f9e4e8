use crate::vars;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Gateway configuration document
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and timing settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Target for requests whose host matches no virtual host
    #[serde(default)]
    pub default_server: Option<TargetConfig>,

    /// Virtual host routes
    #[serde(default)]
    pub servers: BTreeMap<String, TargetConfig>,

    /// Supervised services, in start order
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bound on backend connect + response head, also used for WebSocket handshakes
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Time between the interrupt signal and the forced kill
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| format!("Invalid bind address '{}:{}': {}", self.bind, self.port, e))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// Where a virtual host's requests go
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum TargetConfig {
    /// Reverse proxy over a unix domain socket path template
    UnixSocket { uds: String },
    /// Reverse proxy to a network base address template, e.g. `http://127.0.0.1:5173`
    Network { target: String },
    /// Files served from a directory
    Static { root_path: String },
}

impl TargetConfig {
    fn validate(&self, name: &str, services: &[&str]) -> Result<(), String> {
        let template = match self {
            TargetConfig::UnixSocket { uds } => uds,
            TargetConfig::Network { target } => {
                if !target.contains('{') {
                    validate_network_address(target)
                        .map_err(|e| format!("Server '{}': {}", name, e))?;
                }
                target
            }
            TargetConfig::Static { root_path } => {
                if root_path.is_empty() {
                    return Err(format!("Server '{}': 'root_path' must not be empty", name));
                }
                return Ok(());
            }
        };

        vars::validate(template, services.iter().copied(), false)
            .map_err(|e| format!("Server '{}': {}", name, e))
    }
}

fn validate_network_address(address: &str) -> Result<(), String> {
    let uri: hyper::Uri = address
        .parse()
        .map_err(|e| format!("invalid target '{}': {}", address, e))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(format!(
                "unsupported scheme '{}' in target '{}'",
                other, address
            ))
        }
        None => return Err(format!("target '{}' must start with http://", address)),
    }
    if uri.host().is_none() {
        return Err(format!("target '{}' has no host", address));
    }
    Ok(())
}

/// How a service's program is invoked
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServiceCommand {
    /// `python -m module args...`
    Python { python: String, module: String },
    /// `exec args...`
    Script { exec: String },
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(flatten)]
    pub command: ServiceCommand,

    /// Arguments, may contain template variables
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory (default: the gateway's own)
    #[serde(default = "default_cwd")]
    pub cwd: String,

    /// Environment overrides, applied after `env_file`
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Dotenv file, relative to `cwd`
    pub env_file: Option<String>,
}

impl ServiceConfig {
    /// Create a service that runs `exec` directly
    pub fn script(name: &str, exec: &str) -> Self {
        Self {
            name: name.to_string(),
            command: ServiceCommand::Script {
                exec: exec.to_string(),
            },
            args: Vec::new(),
            cwd: default_cwd(),
            env: BTreeMap::new(),
            env_file: None,
        }
    }

    /// Create a service that runs a Python module
    pub fn python(name: &str, python: &str, module: &str) -> Self {
        Self {
            command: ServiceCommand::Python {
                python: python.to_string(),
                module: module.to_string(),
            },
            ..Self::script(name, "")
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: &str) -> Self {
        self.cwd = cwd.to_string();
        self
    }

    pub fn with_env_file(mut self, env_file: &str) -> Self {
        self.env_file = Some(env_file.to_string());
        self
    }

    /// Program and arguments before template substitution
    pub fn argv(&self) -> Vec<String> {
        let mut argv = match &self.command {
            ServiceCommand::Python { python, module } => {
                vec![python.clone(), "-m".to_string(), module.clone()]
            }
            ServiceCommand::Script { exec } => vec![exec.clone()],
        };
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn cwd_path(&self) -> PathBuf {
        PathBuf::from(&self.cwd)
    }

    /// Environment overlay: the env file (if any), then the `env` table
    pub fn environment(&self) -> Result<BTreeMap<String, String>, dotenvy::Error> {
        let mut env = BTreeMap::new();
        if let Some(env_file) = &self.env_file {
            for item in dotenvy::from_path_iter(self.cwd_path().join(env_file))? {
                let (key, value) = item?;
                env.insert(key, value);
            }
        }
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(env)
    }

    fn validate(&self, services: &[&str]) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Service name must not be empty".to_string());
        }
        if self.name.contains(['/', '\\', '.']) {
            return Err(format!(
                "Service '{}': name must not contain '/', '\\' or '.'",
                self.name
            ));
        }

        let program = match &self.command {
            ServiceCommand::Python { python, module } => {
                if module.is_empty() {
                    return Err(format!("Service '{}': 'module' must not be empty", self.name));
                }
                python
            }
            ServiceCommand::Script { exec } => exec,
        };
        if program.is_empty() {
            return Err(format!("Service '{}': program must not be empty", self.name));
        }

        for arg in self.argv() {
            vars::validate(&arg, services.iter().copied(), true)
                .map_err(|e| format!("Service '{}': {}", self.name, e))?;
        }

        Ok(())
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds for the backend to start responding
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds between SIGINT and SIGKILL
}

fn default_cwd() -> String {
    ".".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let names = self.service_names();

        if let Err(e) = self.server.bind_addr() {
            errors.push(e);
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                errors.push(format!("Duplicate service name '{}'", service.name));
            }
            if let Err(e) = service.validate(&names) {
                errors.push(e);
            }
        }

        let mut hosts = HashSet::new();
        for (host, target) in &self.servers {
            if host.is_empty() {
                errors.push("Server host must not be empty".to_string());
            }
            if !hosts.insert(host.to_ascii_lowercase()) {
                errors.push(format!("Duplicate server host '{}'", host));
            }
            if let Err(e) = target.validate(host, &names) {
                errors.push(e);
            }
        }

        if let Some(target) = &self.default_server {
            if let Err(e) = target.validate("default_server", &names) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }
}
