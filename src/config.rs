//! Configuration file handling.
//!
//! The config file is TOML. Before parsing it is rendered as a template with
//! `${ VAR }` delimiters against the process environment, so secrets and
//! per-host paths can be injected without editing the file:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:${ PORT }"
//!
//! [store]
//! path = "${ DATA_DIR }/containers.json"
//! ```

use std::{collections::HashMap, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use minijinja::Environment;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0:?}")]
    Template((PathBuf, minijinja::Error)),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub build: BuildConfig,
    pub health: HealthConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Largest accepted request body, archive uploads included.
    pub upload_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            upload_limit_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    /// Path to the daemon socket. Platform defaults are used when unset.
    pub socket: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Parent of the per-build extraction directories.
    pub workspace_dir: PathBuf,
    /// Where uploaded archives wait before extraction.
    pub staging_dir: PathBuf,
    pub dockerfile: String,
    pub network_mode: String,
    pub start_after_build: bool,
    pub log_capacity: usize,
    /// Seconds a settled build's log channel stays open for late observers.
    pub log_grace_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("./files/docker/container/temp"),
            staging_dir: PathBuf::from("./files/docker/container/uploads"),
            dockerfile: "Dockerfile".to_string(),
            network_mode: "bridge".to_string(),
            start_after_build: false,
            log_capacity: 1024,
            log_grace_secs: 60,
        }
    }
}

impl BuildConfig {
    pub fn log_grace(&self) -> Duration {
        Duration::from_secs(self.log_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Consecutive failed ticks before a container's failures are escalated.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            failure_threshold: 3,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding container records. Records live in memory only when unset.
    pub path: Option<PathBuf>,
}

pub fn render_template(
    template_str: &str,
    vars: &HashMap<String, String>,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()
        .expect("This really should not fail. If this fail something has gone horribly wrong.");

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    Ok(template.render(vars)?)
}

impl Config {
    fn try_init_from_string(
        config: &str,
        path: &Path,
        vars: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let rendered = render_template(config, vars)
            .map_err(|e| ConfigError::Template((path.to_path_buf(), e)))?;
        Ok(toml::from_str(&rendered)?)
    }

    /// Load the config file at `path`. A missing file yields the defaults.
    pub async fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(config) => {
                let vars: HashMap<String, String> = std::env::vars().collect();
                Self::try_init_from_string(&config, path, &vars)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config file at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
