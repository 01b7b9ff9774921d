use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Variables pointed at `edit-command`, so tools inside the server open files
/// back in this application.
pub const EDITOR_VARIABLES: [&str; 3] = ["EDITOR", "VISUAL", "GIT_EDITOR"];
pub const PLUGIN_PORT_VARIABLE: &str = "VIGIL_PLUGIN_PORT";

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VigilConfig {
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default)]
    pub servers: BTreeMap<String, ManagedProcessConfig>,
}

/// One supervised server. Immutable once handed to a supervisor.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ManagedProcessConfig {
    pub executable: PathBuf,
    /// Templates, `{port}` and `{folder}` are substituted.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Fixed port. When unset a free port is picked on every start.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub strip_env_prefixes: Vec<String>,
    #[serde(default)]
    pub path_prepend: Vec<PathBuf>,
    #[serde(default)]
    pub edit_command: Option<String>,
    #[serde(default)]
    pub plugin_port: Option<u16>,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub folder: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub capture_output: bool,
    #[serde(default)]
    pub readiness: ReadinessProperties,
    #[serde(default)]
    pub stop: StopProperties,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ReadinessProperties {
    #[serde(default = "default_readiness_path")]
    pub path: String,
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_readiness_timeout")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct StopProperties {
    #[serde(with = "humantime_serde", default = "default_kill_timeout")]
    pub graceful_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_kill_timeout")]
    pub forceful_timeout: Duration,
}

impl VigilConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .wrap_err_with(|| format!("Failed to open config {}", path.display()))?;
        serde_yaml::from_reader(file).wrap_err("Failed to read config!")
    }
}

impl ManagedProcessConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_directory: None,
            port: None,
            env: HashMap::new(),
            strip_env_prefixes: Vec::new(),
            path_prepend: Vec::new(),
            edit_command: None,
            plugin_port: None,
            url: default_url(),
            folder: None,
            capture_output: true,
            readiness: ReadinessProperties::default(),
            stop: StopProperties::default(),
        }
    }

    /// `env` plus the variables derived from `edit-command` and
    /// `plugin-port`. Explicit `env` entries win.
    pub fn environment_overrides(&self) -> HashMap<String, String> {
        let mut overrides = HashMap::new();
        if let Some(command) = &self.edit_command {
            for var in EDITOR_VARIABLES {
                overrides.insert(var.to_string(), command.clone());
            }
        }
        if let Some(port) = self.plugin_port {
            overrides.insert(PLUGIN_PORT_VARIABLE.to_string(), port.to_string());
        }
        overrides.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        overrides
    }
}

fn default_log() -> String {
    "info".into()
}

fn default_url() -> String {
    "http://127.0.0.1:{port}/".into()
}

fn default_true() -> bool {
    true
}

fn default_readiness_path() -> String {
    "/healthz".into()
}

fn default_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            log: default_log(),
            servers: Default::default(),
        }
    }
}

impl Default for ReadinessProperties {
    fn default() -> Self {
        Self {
            path: default_readiness_path(),
            interval: default_interval(),
            timeout: default_readiness_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for StopProperties {
    fn default() -> Self {
        Self {
            graceful_timeout: default_kill_timeout(),
            forceful_timeout: default_kill_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
log: debug
servers:
  code-server:
    executable: /opt/code-server/bin/code-server
    args: ["--bind-addr", "127.0.0.1:{port}", "--auth", "none"]
    port: 25448
    strip-env-prefixes: [VSCODE_]
    path-prepend: [/opt/vigil/bin]
    edit-command: vigil-edit --wait
    plugin-port: 5000
    readiness:
      path: /healthz
      interval: 250ms
      timeout: 1m
    stop:
      graceful-timeout: 2s
  agent:
    executable: agent-runtime
"#;

    #[test]
    fn parses_full_example() {
        let config: VigilConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.log, "debug");

        let code = &config.servers["code-server"];
        assert_eq!(code.port, Some(25448));
        assert_eq!(code.args[1], "127.0.0.1:{port}");
        assert_eq!(code.readiness.interval, Duration::from_millis(250));
        assert_eq!(code.readiness.timeout, Duration::from_secs(60));
        assert_eq!(code.readiness.request_timeout, Duration::from_secs(1));
        assert_eq!(code.stop.graceful_timeout, Duration::from_secs(2));
        assert_eq!(code.stop.forceful_timeout, Duration::from_secs(5));
    }

    #[test]
    fn applies_defaults() {
        let config: VigilConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        let agent = &config.servers["agent"];
        assert_eq!(agent.port, None);
        assert!(agent.capture_output);
        assert_eq!(agent.url, "http://127.0.0.1:{port}/");
        assert_eq!(agent.readiness.path, "/healthz");
        assert_eq!(agent.readiness.timeout, Duration::from_secs(30));
    }

    #[test]
    fn derives_editor_and_plugin_overrides() {
        let mut config = ManagedProcessConfig::new("code-server");
        config.edit_command = Some("vigil-edit --wait".into());
        config.plugin_port = Some(5000);
        config.env.insert("VISUAL".into(), "nano".into());

        let overrides = config.environment_overrides();
        assert_eq!(overrides["EDITOR"], "vigil-edit --wait");
        assert_eq!(overrides["GIT_EDITOR"], "vigil-edit --wait");
        assert_eq!(overrides["VISUAL"], "nano");
        assert_eq!(overrides[PLUGIN_PORT_VARIABLE], "5000");
    }
}
