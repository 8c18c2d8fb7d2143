//! Configuration persistence for the sequencer.
//!
//! Saves and loads sequencer configuration to/from YAML files.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::endpoint::{EndpointNames, EndpointPolicy};
use crate::error::{Error, Result};

/// Endpoint creation policy for each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicies {
    #[serde(default = "default_reuse")]
    pub playback: EndpointPolicy,
    #[serde(default = "default_recreate")]
    pub recorder: EndpointPolicy,
}

fn default_reuse() -> EndpointPolicy {
    EndpointPolicy::Reuse
}

fn default_recreate() -> EndpointPolicy {
    EndpointPolicy::Recreate
}

impl Default for EndpointPolicies {
    fn default() -> Self {
        Self {
            playback: default_reuse(),
            recorder: default_recreate(),
        }
    }
}

/// Complete sequencer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Identity of the hosting application; endpoint names derive from it
    #[serde(default = "default_identity")]
    pub application_identity: String,
    /// Sampler output channel (1-16, stored as 1-indexed for human readability)
    #[serde(default = "default_channel")]
    pub output_channel: u8,
    /// Tempo stamped on recorded sequences
    #[serde(default = "default_recorder_bpm")]
    pub recorder_bpm: f64,
    /// Repeat playback forever instead of finishing
    #[serde(default)]
    pub enable_looping: bool,
    /// Delay after creating a virtual endpoint before it is used
    #[serde(default = "default_warmup_ms")]
    pub endpoint_warmup_ms: u64,
    #[serde(default)]
    pub endpoint_policy: EndpointPolicies,
}

fn default_identity() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_channel() -> u8 {
    1 // 1-indexed for YAML readability
}

fn default_recorder_bpm() -> f64 {
    60.0
}

fn default_warmup_ms() -> u64 {
    200
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            application_identity: default_identity(),
            output_channel: default_channel(),
            recorder_bpm: default_recorder_bpm(),
            enable_looping: false,
            endpoint_warmup_ms: default_warmup_ms(),
            endpoint_policy: EndpointPolicies::default(),
        }
    }
}

impl SequencerConfig {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        let project_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        project_dir.join("sequencer_config.yaml")
    }

    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;

        fs::write(path, content)
            .map_err(|e| Error::Config(format!("failed to write {}: {}", path.display(), e)))
    }

    fn validate(&self) -> Result<()> {
        if !(1..=16).contains(&self.output_channel) {
            return Err(Error::Config(format!(
                "output_channel must be 1-16, got {}",
                self.output_channel
            )));
        }
        if !(self.recorder_bpm > 0.0) {
            return Err(Error::Config(format!(
                "recorder_bpm must be positive, got {}",
                self.recorder_bpm
            )));
        }
        Ok(())
    }

    /// Output channel on the wire (0-15).
    pub fn wire_channel(&self) -> u8 {
        self.output_channel.saturating_sub(1).min(15)
    }

    pub fn endpoint_names(&self) -> EndpointNames {
        EndpointNames::from_identity(&self.application_identity)
    }

    pub fn endpoint_warmup(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.endpoint_warmup_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SequencerConfig::load(dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config.output_channel, 1);
        assert_eq!(config.recorder_bpm, 60.0);
        assert!(!config.enable_looping);
        assert_eq!(config.endpoint_policy.playback, EndpointPolicy::Reuse);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let config = SequencerConfig {
            application_identity: "com.example.app".to_string(),
            output_channel: 10,
            enable_looping: true,
            ..SequencerConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = SequencerConfig::load(&path).unwrap();
        assert_eq!(loaded.application_identity, "com.example.app");
        assert_eq!(loaded.output_channel, 10);
        assert_eq!(loaded.wire_channel(), 9);
        assert!(loaded.enable_looping);
        assert_eq!(
            loaded.endpoint_names().playback,
            "com.example.app.destination"
        );
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "application_identity: demo\nendpoint_policy:\n  playback: recreate\n").unwrap();

        let loaded = SequencerConfig::load(&path).unwrap();
        assert_eq!(loaded.application_identity, "demo");
        assert_eq!(loaded.endpoint_warmup_ms, 200);
        assert_eq!(loaded.endpoint_policy.playback, EndpointPolicy::Recreate);
        assert_eq!(loaded.endpoint_policy.recorder, EndpointPolicy::Recreate);
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "output_channel: 17\n").unwrap();

        assert!(matches!(
            SequencerConfig::load(&path),
            Err(Error::Config(_))
        ));
    }
}
