//! Keyboard devices.

use crate::engine::{Engine, Platform};
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// A keyboard attached to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyboardConfig {
    /// Generic USB keyboard, available everywhere.
    Usb,
    /// Keyboard for macOS guests, which only run on arm64.
    Mac,
}

impl KeyboardConfig {
    pub fn usb() -> Self {
        Self::Usb
    }

    /// # Errors
    /// `UnsupportedOnPlatform` unless the engine runs arm64 guests.
    pub fn mac(engine: &dyn Engine) -> Result<Self> {
        match engine.platform() {
            Platform::Arm64 => Ok(Self::Mac),
            platform => Err(BridgeError::UnsupportedOnPlatform {
                feature: "Mac keyboard",
                platform,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulatedEngine;

    #[test]
    fn test_mac_keyboard_on_arm64() {
        let engine = SimulatedEngine::new(Platform::Arm64);
        assert_eq!(KeyboardConfig::mac(&engine).unwrap(), KeyboardConfig::Mac);
    }

    #[test]
    fn test_mac_keyboard_elsewhere() {
        let engine = SimulatedEngine::new(Platform::X86_64);
        let err = KeyboardConfig::mac(&engine).unwrap_err();
        assert_eq!(err.to_string(), "Mac keyboard is not supported on x86_64");
        assert_eq!(KeyboardConfig::usb(), KeyboardConfig::Usb);
    }
}
