//! Configuration for the vzbridge dry-run driver.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one dry run.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Path to the machine description (JSON).
    pub machine_path: PathBuf,

    /// Directory saved state files are written to.
    pub snapshot_dir: PathBuf,

    /// Restore the saved state right after saving it (default: false).
    pub restore: bool,

    /// How long to wait for each snapshot operation (default: 30s).
    pub wait: Duration,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("VZBRIDGE_MACHINE must point to a machine description")]
    MissingMachine,

    #[error("machine description not found: {0}")]
    MachineNotFound(PathBuf),

    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

const DEFAULT_SNAPSHOT_DIR: &str = "/tmp/vzbridge";
const DEFAULT_WAIT_SECS: u64 = 30;

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `VZBRIDGE_MACHINE` | required |
    /// | `VZBRIDGE_SNAPSHOT_DIR` | `/tmp/vzbridge` |
    /// | `VZBRIDGE_RESTORE` | `false` |
    /// | `VZBRIDGE_WAIT_SECS` | `30` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let machine_path = lookup("VZBRIDGE_MACHINE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingMachine)?;

        let restore = match lookup("VZBRIDGE_RESTORE") {
            None => false,
            Some(v) => match v.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "VZBRIDGE_RESTORE",
                        value: v,
                    })
                }
            },
        };

        let wait_secs = match lookup("VZBRIDGE_WAIT_SECS") {
            None => DEFAULT_WAIT_SECS,
            Some(v) => match v.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "VZBRIDGE_WAIT_SECS",
                        value: v,
                    })
                }
            },
        };

        Ok(Self {
            machine_path,
            snapshot_dir: lookup("VZBRIDGE_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            restore,
            wait: Duration::from_secs(wait_secs),
        })
    }

    /// Validate that the machine description exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.machine_path.exists() {
            return Err(ConfigError::MachineNotFound(self.machine_path.clone()));
        }
        Ok(())
    }
}
