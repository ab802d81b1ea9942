//! Rosetta translation cache options.

use crate::engine::{Engine, Platform};
use crate::error::{BridgeError, Result, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which kind of socket the translation cache service listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosettaCachingKind {
    AbstractSocketName,
    UnixSocketPath,
}

/// Where the guest finds the translation cache service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosettaCachingOptions {
    /// Linux abstract namespace socket.
    AbstractSocket { name: String },
    /// Filesystem socket path.
    UnixSocket { path: PathBuf },
}

impl RosettaCachingOptions {
    /// Build options of `kind` from a raw value.
    pub fn new(engine: &dyn Engine, kind: RosettaCachingKind, value: &str) -> Result<Self> {
        match kind {
            RosettaCachingKind::AbstractSocketName => Self::abstract_socket(engine, value),
            RosettaCachingKind::UnixSocketPath => Self::unix_socket(engine, value),
        }
    }

    /// # Errors
    /// `NameTooLong` past the engine's current limit, `UnsupportedOnPlatform`
    /// off arm64.
    pub fn abstract_socket(engine: &dyn Engine, name: impl Into<String>) -> Result<Self> {
        require_arm64(engine)?;
        let name = name.into();
        let max = engine.max_abstract_socket_name_length();
        if name.len() > max {
            return Err(ValidationError::NameTooLong {
                len: name.len(),
                max,
            }
            .into());
        }
        Ok(Self::AbstractSocket { name })
    }

    /// # Errors
    /// `PathTooLong` past the engine's current limit, `UnsupportedOnPlatform`
    /// off arm64.
    pub fn unix_socket(engine: &dyn Engine, path: impl Into<PathBuf>) -> Result<Self> {
        require_arm64(engine)?;
        let path = path.into();
        let len = path.as_os_str().len();
        let max = engine.max_unix_socket_path_length();
        if len > max {
            return Err(ValidationError::PathTooLong { len, max }.into());
        }
        Ok(Self::UnixSocket { path })
    }

    pub fn kind(&self) -> RosettaCachingKind {
        match self {
            Self::AbstractSocket { .. } => RosettaCachingKind::AbstractSocketName,
            Self::UnixSocket { .. } => RosettaCachingKind::UnixSocketPath,
        }
    }
}

fn require_arm64(engine: &dyn Engine) -> Result<()> {
    match engine.platform() {
        Platform::Arm64 => Ok(()),
        platform => Err(BridgeError::UnsupportedOnPlatform {
            feature: "Rosetta caching",
            platform,
        }),
    }
}

/// The Rosetta directory share exposed to a Linux guest under `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosettaDirectoryShare {
    tag: String,
    caching: Option<RosettaCachingOptions>,
}

impl RosettaDirectoryShare {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            caching: None,
        }
    }

    pub fn with_caching_options(mut self, options: RosettaCachingOptions) -> Self {
        self.caching = Some(options);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn caching_options(&self) -> Option<&RosettaCachingOptions> {
        self.caching.as_ref()
    }

    /// Socket path, if the cache uses a filesystem socket.
    pub fn socket_path(&self) -> Option<&Path> {
        match &self.caching {
            Some(RosettaCachingOptions::UnixSocket { path }) => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulatedEngine;

    #[test]
    fn test_name_length_boundary() {
        let engine = SimulatedEngine::new(Platform::Arm64).with_limits(8, 16);

        let at_limit = RosettaCachingOptions::abstract_socket(&engine, "a".repeat(8)).unwrap();
        assert_eq!(at_limit.kind(), RosettaCachingKind::AbstractSocketName);

        match RosettaCachingOptions::abstract_socket(&engine, "a".repeat(9)) {
            Err(BridgeError::Validation(ValidationError::NameTooLong { len, max })) => {
                assert_eq!((len, max), (9, 8));
            }
            other => panic!("expected NameTooLong, got {other:?}"),
        }
    }

    #[test]
    fn test_path_length_boundary() {
        let engine = SimulatedEngine::new(Platform::Arm64).with_limits(8, 16);

        let path = format!("/{}", "p".repeat(15));
        assert!(RosettaCachingOptions::unix_socket(&engine, &path).is_ok());

        let path = format!("/{}", "p".repeat(16));
        assert!(matches!(
            RosettaCachingOptions::unix_socket(&engine, &path),
            Err(BridgeError::Validation(ValidationError::PathTooLong { len: 17, max: 16 }))
        ));
    }

    #[test]
    fn test_limits_are_independent() {
        // A 13-byte value fits the path limit but not the name limit.
        let engine = SimulatedEngine::new(Platform::Arm64).with_limits(8, 16);
        let value = "/tmp/ros.sock";

        assert!(RosettaCachingOptions::new(&engine, RosettaCachingKind::UnixSocketPath, value).is_ok());
        assert!(RosettaCachingOptions::new(&engine, RosettaCachingKind::AbstractSocketName, value).is_err());
    }

    #[test]
    fn test_unsupported_off_arm64() {
        let engine = SimulatedEngine::new(Platform::X86_64);
        assert!(matches!(
            RosettaCachingOptions::abstract_socket(&engine, "cache"),
            Err(BridgeError::UnsupportedOnPlatform {
                platform: Platform::X86_64,
                ..
            })
        ));
    }

    #[test]
    fn test_directory_share() {
        let engine = SimulatedEngine::new(Platform::Arm64);
        let options = RosettaCachingOptions::unix_socket(&engine, "/run/rosettad.sock").unwrap();
        let share = RosettaDirectoryShare::new("rosetta").with_caching_options(options);

        assert_eq!(share.tag(), "rosetta");
        assert_eq!(share.socket_path(), Some(Path::new("/run/rosettad.sock")));
    }
}
