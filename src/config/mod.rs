use crate::error::{PipelogError, Result};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Run configuration: where each stream goes, which signal rotates, what to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log file for the child's standard output
    #[serde(default)]
    pub stdout_log: Option<PathBuf>,

    /// Log file for the child's standard error
    #[serde(default)]
    pub stderr_log: Option<PathBuf>,

    /// Signal number that triggers rotation (default: SIGHUP)
    #[serde(default = "default_signal")]
    pub signal: i32,

    /// Relay the rotation signal to the child
    #[serde(default)]
    pub forward_signal: bool,

    /// Program to execute
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for the program
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_signal() -> i32 {
    Signal::SIGHUP as i32
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stdout_log: None,
            stderr_log: None,
            signal: default_signal(),
            forward_signal: false,
            command: None,
            args: Vec::new(),
        }
    }
}

impl Config {
    /// Load a configuration from a file (supports TOML and JSON)
    ///
    /// Fields may be partial; command-line flags fill in the rest before
    /// [`Config::validate`] runs.
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PipelogError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config: Config = match extension {
            "toml" => toml::from_str(&contents)
                .map_err(|e| PipelogError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| PipelogError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?,
            _ => {
                return Err(PipelogError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stdout_log.is_none() || self.stderr_log.is_none() {
            return Err(PipelogError::MissingConfigField(
                "expected at least -o and -e".to_string(),
            ));
        }

        for path in [&self.stdout_log, &self.stderr_log].into_iter().flatten() {
            if path.as_os_str().is_empty() {
                return Err(PipelogError::ConfigValidationError(
                    "log path cannot be empty".to_string(),
                ));
            }
        }

        match self.command.as_deref() {
            None | Some("") => {
                return Err(PipelogError::MissingConfigField(
                    "expected a command".to_string(),
                ))
            }
            Some(_) => {}
        }

        let signal = self.rotation_signal()?;
        if signal_hook::consts::FORBIDDEN.contains(&self.signal) {
            return Err(PipelogError::ConfigValidationError(format!(
                "{} cannot be used as the rotation signal",
                signal
            )));
        }

        Ok(())
    }

    /// Rotation signal as a typed value
    pub fn rotation_signal(&self) -> Result<Signal> {
        Signal::try_from(self.signal).map_err(|_| {
            PipelogError::ConfigValidationError(format!("Invalid signal number: {}", self.signal))
        })
    }

    pub fn stdout_path(&self) -> Result<&Path> {
        self.stdout_log
            .as_deref()
            .ok_or_else(|| PipelogError::MissingConfigField("stdout_log".to_string()))
    }

    pub fn stderr_path(&self) -> Result<&Path> {
        self.stderr_log
            .as_deref()
            .ok_or_else(|| PipelogError::MissingConfigField("stderr_log".to_string()))
    }

    pub fn command(&self) -> Result<&str> {
        self.command
            .as_deref()
            .ok_or_else(|| PipelogError::MissingConfigField("command".to_string()))
    }

    /// Expand environment variables in the log paths
    fn expand_env_vars(&mut self) {
        self.stdout_log = self.stdout_log.as_deref().map(expand_env_in_path);
        self.stderr_log = self.stderr_log.as_deref().map(expand_env_in_path);
    }
}

/// Expand `$VAR` and `${VAR}` in a path; unknown variables are left as is
///
/// Names are matched whole and the path is handled as raw bytes, so paths
/// that are not valid UTF-8 come through unchanged.
fn expand_env_in_path(path: &Path) -> PathBuf {
    let input = path.as_os_str().as_bytes();
    let mut expanded = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        if input[i] != b'$' {
            expanded.push(input[i]);
            i += 1;
            continue;
        }

        let (name, end) = if input.get(i + 1) == Some(&b'{') {
            match input[i + 2..].iter().position(|&b| b == b'}') {
                Some(len) => (&input[i + 2..i + 2 + len], i + 3 + len),
                None => (&input[i..i], i + 1),
            }
        } else {
            let len = input[i + 1..]
                .iter()
                .take_while(|&&b| is_name_byte(b))
                .count();
            (&input[i + 1..i + 1 + len], i + 1 + len)
        };

        match lookup_var(name) {
            Some(value) => expanded.extend_from_slice(value.as_bytes()),
            None => expanded.extend_from_slice(&input[i..end]),
        }
        i = end;
    }

    PathBuf::from(OsString::from_vec(expanded))
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn lookup_var(name: &[u8]) -> Option<OsString> {
    if name.is_empty() || !name.iter().all(|&b| is_name_byte(b)) {
        return None;
    }
    std::str::from_utf8(name).ok().and_then(std::env::var_os)
}
