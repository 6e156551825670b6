//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoherenceError, CoherenceResult};

/// Configuration for the coherency engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherenceConfig {
    /// Copy directly between devices when the backend supports it,
    /// instead of bouncing through the host.
    pub direct_device_copy: bool,
    /// Alias contiguous children into their parent's device buffer.
    pub sub_buffers: bool,
    /// Run ghost synchronization on a parent before registering a child.
    pub sync_ghost_on_register: bool,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            direct_device_copy: true,
            sub_buffers: true,
            sync_ghost_on_register: true,
        }
    }
}

impl CoherenceConfig {
    /// Enable or disable direct device-to-device copies.
    #[must_use]
    pub fn with_direct_device_copy(mut self, enabled: bool) -> Self {
        self.direct_device_copy = enabled;
        self
    }

    /// Enable or disable sub-buffer aliasing.
    #[must_use]
    pub fn with_sub_buffers(mut self, enabled: bool) -> Self {
        self.sub_buffers = enabled;
        self
    }

    /// Enable or disable ghost synchronization on child registration.
    #[must_use]
    pub fn with_sync_ghost_on_register(mut self, enabled: bool) -> Self {
        self.sync_ghost_on_register = enabled;
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> CoherenceResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CoherenceError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> CoherenceResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CoherenceError::Configuration(format!("Failed to serialize config: {}", e)))
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> CoherenceResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CoherenceError::Configuration(format!("Failed to read config: {}", e)))?;
        Self::from_json(&json)
    }

    /// Save the configuration to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> CoherenceResult<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
            .map_err(|e| CoherenceError::Configuration(format!("Failed to write config: {}", e)))
    }
}
