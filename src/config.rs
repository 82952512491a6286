//! Runner configuration - device identity, endpoints, sandbox and timeouts
//!
//! The configuration is built once at startup (from a YAML file or from the
//! environment) and shared read-only as `Arc<RunnerConfig>`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Placeholder replaced by the ADALM-Pluto address in prebuilt programs
pub const PLUTO_PLACEHOLDER: &str = "**RELIA_REPLACE_WITH_ADALM_PLUTO_IP_ADDRESS**";
/// Placeholder replaced by the Red Pitaya address in prebuilt programs
pub const RED_PITAYA_PLACEHOLDER: &str = "**RELIA_REPLACE_WITH_RED_PITAYA_IP_ADDRESS**";

/// Which side of the radio link this device plays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    #[default]
    Receiver,
    Transmitter,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receiver => "receiver",
            Self::Transmitter => "transmitter",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "receiver" => Ok(Self::Receiver),
            "transmitter" => Ok(Self::Transmitter),
            other => Err(format!("unsupported device type: {other}")),
        }
    }
}

/// Named environment profile used when no config file is given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Development,
    Staging,
    Production,
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown profile: {other}")),
        }
    }
}

/// Device identity and shared secret sent with every scheduler request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub id: String,
    pub role: DeviceRole,
    pub secret: String,
}

/// Access granted to a whitelisted path inside the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Access {
    /// Visible and writable
    ReadWrite,
    /// Not whitelisted, but marked read-only wherever it is visible
    ReadOnly,
    /// Visible and read-only
    WhitelistReadOnly,
}

/// A filesystem path exposed to the sandboxed process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub path: PathBuf,
    pub access: Access,
}

impl PathRule {
    pub fn new(path: impl Into<PathBuf>, access: Access) -> Self {
        Self {
            path: path.into(),
            access,
        }
    }
}

/// Sandbox wrapper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Wrapper binary prepended to every command
    pub wrapper: String,
    /// Profile file name, written into the task working directory
    pub profile_file: String,
    /// Outbound network interface the sandbox is bound to
    pub interface: String,
    pub ip_address: String,
    /// Paths besides the working directory the process may see
    pub paths: Vec<PathRule>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wrapper: "firejail".to_string(),
            profile_file: "firejail.profile".to_string(),
            interface: "br0".to_string(),
            ip_address: "10.10.20.2".to_string(),
            paths: default_sandbox_paths(),
        }
    }
}

/// Caches, block libraries and preferences the DSP toolkit needs at runtime
fn default_sandbox_paths() -> Vec<PathRule> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/home/relia"));
    vec![
        PathRule::new(home.join(".gr_fftw_wisdom"), Access::ReadWrite),
        PathRule::new(home.join("relia-blocks"), Access::WhitelistReadOnly),
        PathRule::new(home.join(".gnuradio/prefs"), Access::WhitelistReadOnly),
        PathRule::new(home.join(".bashrc"), Access::ReadOnly),
        PathRule::new(home.join(".profile"), Access::ReadOnly),
        PathRule::new(home.join(".grc_gnuradio"), Access::WhitelistReadOnly),
        PathRule::new(home.join(".cache/grc_gnuradio"), Access::ReadWrite),
    ]
}

/// External compiler and interpreter invocations
///
/// Command templates understand `{input}`, `{workdir}` and `{program}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub compile_command: Vec<String>,
    pub run_command: Vec<String>,
    /// Name of the compiler input inside the working directory
    pub input_file: String,
    /// Base name of the program the compiler produces
    pub target_name: String,
    pub program_extension: String,
    pub manifest_file: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            compile_command: vec![
                "grcc".to_string(),
                "{input}".to_string(),
                "-o".to_string(),
                "{workdir}".to_string(),
            ],
            run_command: vec!["python3".to_string(), "{program}".to_string()],
            input_file: "user_file.grc".to_string(),
            target_name: "target_file".to_string(),
            program_extension: "py".to_string(),
            manifest_file: "relia.json".to_string(),
        }
    }
}

impl ToolchainConfig {
    /// File name of the executable program inside the working directory
    pub fn program_file(&self) -> String {
        if self.program_extension.is_empty() {
            self.target_name.clone()
        } else {
            format!("{}.{}", self.target_name, self.program_extension)
        }
    }
}

/// Timeouts and polling intervals, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Cap on the execute phase, independent of the task's own budget
    pub max_run_secs: f64,
    pub poll_interval_secs: f64,
    pub watchdog_interval_secs: f64,
    /// Wait after terminate (and again after kill)
    pub kill_grace_secs: f64,
    /// Sleep when the scheduler has nothing for us
    pub idle_backoff_secs: f64,
    /// Sleep after an unexpected failure in the loop
    pub error_backoff_secs: f64,
    pub server_error_backoff_secs: f64,
    pub request_timeout_secs: f64,
    pub heartbeat_secs: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            max_run_secs: 20.0,
            poll_interval_secs: 0.1,
            watchdog_interval_secs: 5.0,
            kill_grace_secs: 10.0,
            idle_backoff_secs: 5.0,
            error_backoff_secs: 2.0,
            server_error_backoff_secs: 2.0,
            request_timeout_secs: 30.0,
            heartbeat_secs: 5.0,
        }
    }
}

/// Saturates instead of panicking; `validate` rejects what does not fit
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl Timeouts {
    pub fn max_run(&self) -> Duration {
        secs(self.max_run_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        secs(self.watchdog_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        secs(self.kill_grace_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        secs(self.idle_backoff_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        secs(self.error_backoff_secs)
    }

    pub fn server_error_backoff(&self) -> Duration {
        secs(self.server_error_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        secs(self.heartbeat_secs)
    }

    fn all(&self) -> [(&'static str, f64); 9] {
        [
            ("max_run_secs", self.max_run_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("kill_grace_secs", self.kill_grace_secs),
            ("idle_backoff_secs", self.idle_backoff_secs),
            ("error_backoff_secs", self.error_backoff_secs),
            ("server_error_backoff_secs", self.server_error_backoff_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("heartbeat_secs", self.heartbeat_secs),
        ]
    }
}

/// Text replacement applied to prebuilt programs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub placeholder: String,
    pub value: String,
}

/// Complete runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub device: DeviceIdentity,
    pub scheduler_url: String,
    pub uploader_url: String,
    /// Clear the device's previous artifacts on the upload service before a run
    pub reset_uploads: bool,
    pub sandbox: SandboxConfig,
    pub toolchain: ToolchainConfig,
    pub timeouts: Timeouts,
    pub substitutions: Vec<Substitution>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            device: DeviceIdentity::default(),
            scheduler_url: String::new(),
            uploader_url: String::new(),
            reset_uploads: true,
            sandbox: SandboxConfig::default(),
            toolchain: ToolchainConfig::default(),
            timeouts: Timeouts::default(),
            substitutions: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: RunnerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Build configuration from the process environment
    pub fn from_env(profile: Profile) -> Result<Self> {
        Self::from_lookup(profile, |key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(profile: Profile, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if profile == Profile::Development {
            config.device.id = "uw-s1i1:r".to_string();
            config.device.secret = "password".to_string();
            config.uploader_url = "http://localhost:6001/".to_string();
            config.scheduler_url = "http://localhost:6002/".to_string();
        }

        if let Some(id) = var("DEVICE_ID") {
            config.device.id = id;
        }
        if let Some(secret) = var("PASSWORD") {
            config.device.secret = secret;
        }
        match var("DEVICE_TYPE") {
            Some(role) => {
                config.device.role = role.parse().map_err(anyhow::Error::msg)?;
            }
            None if profile != Profile::Development => {
                anyhow::bail!("DEVICE_TYPE must be set to 'receiver' or 'transmitter'");
            }
            None => {}
        }
        if let Some(url) = var("SCHEDULER_BASE_URL") {
            config.scheduler_url = url;
        }
        if let Some(url) = var("DATA_UPLOADER_BASE_URL") {
            config.uploader_url = url;
        }

        // Staging and production sandbox unless told otherwise
        config.sandbox.enabled = match lookup("USE_FIREJAIL") {
            Some(flag) => matches!(flag.trim(), "1" | "true"),
            None => profile != Profile::Development,
        };
        if let Some(ip) = var("FIREJAIL_IP_ADDRESS") {
            config.sandbox.ip_address = ip;
        }
        if let Some(interface) = var("FIREJAIL_INTERFACE") {
            config.sandbox.interface = interface;
        }

        if let Some(max) = var("MAX_GR_PYTHON_EXECUTION_TIME") {
            config.timeouts.max_run_secs = max
                .trim()
                .parse()
                .with_context(|| format!("MAX_GR_PYTHON_EXECUTION_TIME is not a number: {max}"))?;
        }

        if let Some(ip) = var("ADALM_PLUTO_IP_ADDRESS") {
            config.substitutions.push(Substitution {
                placeholder: PLUTO_PLACEHOLDER.to_string(),
                value: ip,
            });
        }
        if let Some(ip) = var("RED_PITAYA_IP_ADDRESS") {
            config.substitutions.push(Substitution {
                placeholder: RED_PITAYA_PLACEHOLDER.to_string(),
                value: ip,
            });
        }

        Ok(config)
    }

    /// Check the configuration is usable
    ///
    /// `networked` additionally requires identity and service URLs.
    pub fn validate(&self, networked: bool) -> Result<()> {
        if networked {
            if self.device.id.trim().is_empty() {
                anyhow::bail!("device id is required");
            }
            if self.device.secret.is_empty() {
                anyhow::bail!("device secret is required");
            }
            if self.scheduler_url.trim().is_empty() {
                anyhow::bail!("scheduler url is required");
            }
            if self.reset_uploads && self.uploader_url.trim().is_empty() {
                anyhow::bail!("uploader url is required when reset_uploads is enabled");
            }
        }
        if self.toolchain.compile_command.is_empty() {
            anyhow::bail!("toolchain.compile_command is empty");
        }
        if self.toolchain.run_command.is_empty() {
            anyhow::bail!("toolchain.run_command is empty");
        }
        if self.sandbox.enabled && self.sandbox.wrapper.trim().is_empty() {
            anyhow::bail!("sandbox is enabled but no wrapper is configured");
        }
        for (name, value) in self.timeouts.all() {
            match Duration::try_from_secs_f64(value) {
                Ok(duration) if !duration.is_zero() => {}
                _ => anyhow::bail!("timeouts.{name} must be a positive number of seconds, got {value}"),
            }
        }
        Ok(())
    }
}

/// Join a base URL and a relative path with exactly one slash
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert!(!config.sandbox.enabled);
        assert_eq!(config.sandbox.wrapper, "firejail");
        assert_eq!(config.toolchain.program_file(), "target_file.py");
        assert_eq!(config.timeouts.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.timeouts.kill_grace(), Duration::from_secs(10));
        assert!(config.reset_uploads);
    }

    #[test]
    fn test_development_profile_fills_identity() {
        let config = RunnerConfig::from_lookup(Profile::Development, lookup_from(&[])).unwrap();
        assert_eq!(config.device.id, "uw-s1i1:r");
        assert_eq!(config.device.role, DeviceRole::Receiver);
        assert_eq!(config.scheduler_url, "http://localhost:6002/");
        assert!(!config.sandbox.enabled);
        config.validate(true).unwrap();
    }

    #[test]
    fn test_production_profile_enables_sandbox() {
        let config = RunnerConfig::from_lookup(
            Profile::Production,
            lookup_from(&[
                ("DEVICE_ID", "lab-1:t"),
                ("PASSWORD", "s3cret"),
                ("DEVICE_TYPE", "transmitter"),
                ("SCHEDULER_BASE_URL", "https://lab.example/"),
                ("DATA_UPLOADER_BASE_URL", "https://up.example/"),
                ("FIREJAIL_INTERFACE", "eth1"),
            ]),
        )
        .unwrap();
        assert!(config.sandbox.enabled);
        assert_eq!(config.sandbox.interface, "eth1");
        assert_eq!(config.device.role, DeviceRole::Transmitter);
    }

    #[test]
    fn test_use_firejail_flag_overrides_profile() {
        let config = RunnerConfig::from_lookup(
            Profile::Staging,
            lookup_from(&[("DEVICE_TYPE", "receiver"), ("USE_FIREJAIL", "0")]),
        )
        .unwrap();
        assert!(!config.sandbox.enabled);

        let config = RunnerConfig::from_lookup(
            Profile::Development,
            lookup_from(&[("USE_FIREJAIL", "true")]),
        )
        .unwrap();
        assert!(config.sandbox.enabled);
    }

    #[test]
    fn test_device_type_required_outside_development() {
        assert!(RunnerConfig::from_lookup(Profile::Production, lookup_from(&[])).is_err());
        assert!(RunnerConfig::from_lookup(
            Profile::Development,
            lookup_from(&[("DEVICE_TYPE", "antenna")])
        )
        .is_err());
    }

    #[test]
    fn test_hardware_addresses_become_substitutions() {
        let config = RunnerConfig::from_lookup(
            Profile::Development,
            lookup_from(&[
                ("ADALM_PLUTO_IP_ADDRESS", "192.168.2.1"),
                ("MAX_GR_PYTHON_EXECUTION_TIME", "45"),
            ]),
        )
        .unwrap();
        assert_eq!(config.substitutions.len(), 1);
        assert_eq!(config.substitutions[0].placeholder, PLUTO_PLACEHOLDER);
        assert_eq!(config.substitutions[0].value, "192.168.2.1");
        assert_eq!(config.timeouts.max_run(), Duration::from_secs(45));
    }

    #[test]
    fn test_bad_max_run_time() {
        let result = RunnerConfig::from_lookup(
            Profile::Development,
            lookup_from(&[("MAX_GR_PYTHON_EXECUTION_TIME", "soon")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
device:
  id: lab-2:r
  secret: pw
  role: receiver
scheduler_url: http://sched/
reset_uploads: false
sandbox:
  enabled: true
  paths:
    - path: /opt/blocks
      access: whitelist-read-only
timeouts:
  max_run_secs: 3
"#;
        let config: RunnerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.device.id, "lab-2:r");
        assert!(config.sandbox.enabled);
        assert_eq!(config.sandbox.wrapper, "firejail");
        assert_eq!(config.sandbox.paths.len(), 1);
        assert_eq!(config.sandbox.paths[0].access, Access::WhitelistReadOnly);
        assert_eq!(config.timeouts.max_run(), Duration::from_secs(3));
        assert_eq!(config.timeouts.watchdog_interval(), Duration::from_secs(5));
        config.validate(true).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RunnerConfig::default();
        assert!(config.validate(true).is_err());
        config.validate(false).unwrap();

        config.timeouts.poll_interval_secs = 0.0;
        assert!(config.validate(false).is_err());

        let mut config = RunnerConfig::default();
        config.toolchain.run_command.clear();
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_validate_rejects_unrepresentable_timeouts() {
        let mut config = RunnerConfig::default();
        config.timeouts.max_run_secs = 1e20;
        assert!(config.validate(false).is_err());
        assert_eq!(config.timeouts.max_run(), Duration::MAX);

        config.timeouts.max_run_secs = f64::NAN;
        assert!(config.validate(false).is_err());
        assert_eq!(config.timeouts.max_run(), Duration::ZERO);

        config.timeouts.max_run_secs = 1e-12;
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a/", "/b/c"), "http://a/b/c");
        assert_eq!(join_url("http://a", "b"), "http://a/b");
    }
}
