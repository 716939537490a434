use std::{env, fs, path::PathBuf};

use crate::prelude::*;
use nestify::nest;
use serde::{Deserialize, Serialize};

nest! {
    #[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]*
    #[serde(rename_all = "kebab-case")]*
    /// Persistent configuration of the tracer.
    ///
    /// Stored at `~/.config/trace-inputs/config.yaml` following the XDG Base Directory
    /// Specification. Every field is optional, a missing file yields the defaults.
    pub struct TraceInputsConfig {
        #[serde(default)]
        pub tracer: pub struct TracerConfig {
            #[serde(default = "default_strace_path")]
            pub strace_path: String,
            #[serde(default = "default_dtrace_path")]
            pub dtrace_path: String,
            #[serde(default = "default_logman_path")]
            pub logman_path: String,
            #[serde(default = "default_tracerpt_path")]
            pub tracerpt_path: String,
            /// Interpreter prepended to commands starting with a `.py` script
            #[serde(default = "default_python_path")]
            pub python_path: String,
        }
    }
}

fn default_strace_path() -> String {
    "strace".into()
}

fn default_dtrace_path() -> String {
    "dtrace".into()
}

fn default_logman_path() -> String {
    "logman.exe".into()
}

fn default_tracerpt_path() -> String {
    "tracerpt.exe".into()
}

fn default_python_path() -> String {
    "python3".into()
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            strace_path: default_strace_path(),
            dtrace_path: default_dtrace_path(),
            logman_path: default_logman_path(),
            tracerpt_path: default_tracerpt_path(),
            python_path: default_python_path(),
        }
    }
}

impl Default for TraceInputsConfig {
    fn default() -> Self {
        Self {
            tracer: TracerConfig::default(),
        }
    }
}

/// Get the path to the configuration file, following the XDG Base Directory Specification
/// at https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
///
/// If config_name is None, returns ~/.config/trace-inputs/config.yaml (default)
/// If config_name is Some, returns ~/.config/trace-inputs/{config_name}.yaml
fn get_configuration_file_path(config_name: Option<&str>) -> Option<PathBuf> {
    let config_dir = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .or_else(|_| env::var("APPDATA").map(PathBuf::from))
        .ok()?;
    let config_dir = config_dir.join("trace-inputs");

    Some(match config_name {
        Some(name) => config_dir.join(format!("{name}.yaml")),
        None => config_dir.join("config.yaml"),
    })
}

impl TraceInputsConfig {
    /// Load the configuration. If it does not exist, return a default configuration.
    pub fn load(config_name: Option<&str>) -> Result<Self> {
        let Some(config_path) = get_configuration_file_path(config_name) else {
            debug!("No configuration directory, using the default configuration");
            return Ok(Self::default());
        };

        match fs::read(&config_path) {
            Ok(config_str) => {
                let config: TraceInputsConfig = serde_yaml::from_slice(&config_str)
                    .with_context(|| {
                        format!("Failed to parse config at {}", config_path.display())
                    })?;
                debug!("Config loaded from {}", config_path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file not found at {}", config_path.display());
                Ok(Self::default())
            }
            Err(e) => bail!("Failed to load config: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        temp_env::with_var("XDG_CONFIG_HOME", Some(dir.path()), || {
            let config = TraceInputsConfig::load(None).unwrap();
            assert_eq!(config, TraceInputsConfig::default());
        });
    }

    #[test]
    fn test_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("trace-inputs");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("ci.yaml"),
            "tracer:\n  strace-path: /opt/strace/bin/strace\n",
        )
        .unwrap();

        temp_env::with_var("XDG_CONFIG_HOME", Some(dir.path()), || {
            let config = TraceInputsConfig::load(Some("ci")).unwrap();
            assert_eq!(config.tracer.strace_path, "/opt/strace/bin/strace");
            assert_eq!(config.tracer.python_path, "python3");
        });
    }

    #[test]
    fn test_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("trace-inputs");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("config.yaml"), "tracer: [not, a, map]\n").unwrap();

        temp_env::with_var("XDG_CONFIG_HOME", Some(dir.path()), || {
            assert!(TraceInputsConfig::load(None).is_err());
        });
    }
}
