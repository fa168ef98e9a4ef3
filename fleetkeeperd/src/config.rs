//! Daemon configuration loader (spec §6, "A1").
//!
//! The YAML file named by `FLEETKEEPERD_CONFIG` is parsed into `Config`;
//! missing required fields or an unparsable file is a fatal startup
//! error (spec §6 "Exit codes": `1` on initialization failure).

use std::env;
use std::fmt::{self, Display};
use std::fs;

use failure::{Backtrace, Context, Fail};

#[derive(Debug)]
pub struct ConfigError {
    inner: Context<ConfigErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ConfigErrKind {
    #[fail(display = "environment variable FLEETKEEPERD_CONFIG is not set")]
    MissingEnvVar,
    #[fail(display = "could not read config file {}: {}", _0, _1)]
    Unreadable(String, String),
    #[fail(display = "could not parse config file {}: {}", _0, _1)]
    Unparsable(String, String),
}

impl Fail for ConfigError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}
impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<ConfigErrKind> for ConfigError {
    fn from(kind: ConfigErrKind) -> ConfigError {
        ConfigError { inner: Context::new(kind) }
    }
}
impl From<Context<ConfigErrKind>> for ConfigError {
    fn from(inner: Context<ConfigErrKind>) -> ConfigError {
        ConfigError { inner }
    }
}
impl ConfigError {
    pub fn kind(&self) -> &ConfigErrKind {
        self.inner.get_context()
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn default_keepalive_interval() -> u64 { 5 }
fn default_fence_intervals() -> u32 { 6 }
fn default_node_log_lines() -> usize { 2000 }
fn default_console_log_lines() -> usize { 1000 }
fn default_console_log_directory() -> String { "/var/log/fleetkeeper/consoles".to_string() }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceAction {
    Migrate,
    None,
}

/// All recognized YAML keys from spec §6 "Configuration".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_name: String,
    pub coordination_endpoints: String,
    #[serde(default)]
    pub coordinators: Vec<String>,

    #[serde(default)]
    pub cluster_dev: Option<String>,
    #[serde(default)]
    pub cluster_dev_ip: Option<String>,
    #[serde(default)]
    pub cluster_mtu: Option<u32>,
    #[serde(default)]
    pub storage_dev: Option<String>,
    #[serde(default)]
    pub storage_dev_ip: Option<String>,
    #[serde(default)]
    pub storage_mtu: Option<u32>,
    #[serde(default)]
    pub upstream_dev: Option<String>,
    #[serde(default)]
    pub upstream_dev_ip: Option<String>,
    #[serde(default)]
    pub upstream_mtu: Option<u32>,
    #[serde(default)]
    pub upstream_gateway: Option<String>,
    #[serde(default)]
    pub vni_dev: Option<String>,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_fence_intervals")]
    pub fence_intervals: u32,
    #[serde(default)]
    pub suicide_intervals: Option<u32>,
    #[serde(default = "default_successful_fence")]
    pub successful_fence: FenceAction,
    #[serde(default = "default_failed_fence")]
    pub failed_fence: FenceAction,

    pub ipmi_hostname: String,
    pub ipmi_username: String,
    pub ipmi_password: String,

    #[serde(default = "default_true")]
    pub enable_hypervisor: bool,
    #[serde(default)]
    pub enable_storage: bool,
    #[serde(default)]
    pub enable_networking: bool,

    #[serde(default)]
    pub log_dates: bool,
    #[serde(default = "default_true")]
    pub log_colours: bool,
    #[serde(default)]
    pub file_logging: Option<String>,
    #[serde(default)]
    pub zookeeper_logging: bool,
    #[serde(default = "default_node_log_lines")]
    pub node_log_lines: usize,
    #[serde(default = "default_console_log_lines")]
    pub console_log_lines: usize,
    #[serde(default = "default_console_log_directory")]
    pub console_log_directory: String,
}

fn default_true() -> bool { true }
fn default_successful_fence() -> FenceAction { FenceAction::Migrate }
fn default_failed_fence() -> FenceAction { FenceAction::Migrate }

impl Config {
    /// Load from the file named by `FLEETKEEPERD_CONFIG`.
    pub fn from_env() -> Result<Config> {
        let path = env::var("FLEETKEEPERD_CONFIG").map_err(|_| ConfigErrKind::MissingEnvVar)?;
        Config::from_path(&path)
    }

    pub fn from_path(path: &str) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigErrKind::Unreadable(path.to_string(), e.to_string()))?;
        serde_yaml::from_str(&raw).map_err(|e| ConfigErrKind::Unparsable(path.to_string(), e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
node_name: hv1
coordination_endpoints: "zk1:2181,zk2:2181"
ipmi_hostname: hv1-ipmi
ipmi_username: admin
ipmi_password: hunter2
"#
    }

    #[test]
    fn defaults_fill_in_missing_optional_keys() {
        let cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(cfg.keepalive_interval, 5);
        assert_eq!(cfg.fence_intervals, 6);
        assert_eq!(cfg.successful_fence, FenceAction::Migrate);
        assert!(cfg.enable_hypervisor);
        assert_eq!(cfg.node_log_lines, 2000);
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        let broken = "node_name: hv1\n";
        let result: std::result::Result<Config, _> = serde_yaml::from_str(broken);
        assert!(result.is_err());
    }

    #[test]
    fn from_path_reports_unreadable_file() {
        let err = Config::from_path("/nonexistent/fleetkeeperd.yaml").unwrap_err();
        match err.kind() {
            ConfigErrKind::Unreadable(..) => {}
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
