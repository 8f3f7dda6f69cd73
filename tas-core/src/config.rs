//! Static, file-backed settings for the harness, layered the way
//! `code-core`'s `Config`/`ConfigOverrides` split works: a `HarnessConfig`
//! loaded from an optional TOML file, then overridden field-by-field by
//! whatever an embedding binary's CLI or environment wants to set. Both
//! the file-parsed and override-merged paths funnel through the same
//! `validate`, so there is no shortcut that skips it.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::CoreError;

/// Settings that do not change per-frame. Contrast with
/// `tas_protocol::SharedConfig`, which rides the wire protocol and can
/// change every frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub default_fps: u32,
    pub suspend_signal_offset: i32,
    pub write_checkpoint_signal_offset: i32,
    pub snapshot_dir: PathBuf,
    pub ignore_non_writable_regions: bool,
    pub ignore_non_writable_non_anonymous_regions: bool,
    pub ignore_exec_regions: bool,
    pub ignore_shared_regions: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            default_fps: 60,
            suspend_signal_offset: 0,
            write_checkpoint_signal_offset: 1,
            snapshot_dir: PathBuf::from("."),
            ignore_non_writable_regions: true,
            ignore_non_writable_non_anonymous_regions: true,
            ignore_exec_regions: true,
            ignore_shared_regions: true,
        }
    }
}

impl HarnessConfig {
    /// Loads a config from `path` if it exists, falling back to defaults
    /// if it does not. A present-but-malformed file is still an error.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| CoreError::InvalidConfig(format!("reading {}: {e}", path.display())))?;
            toml::from_str(&text)
                .map_err(|e| CoreError::InvalidConfig(format!("parsing {}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.default_fps == 0 {
            return Err(CoreError::InvalidConfig("default_fps must be > 0".to_owned()));
        }
        // Realtime signal range is [0, SIGRTMAX - SIGRTMIN]; values well
        // outside that are almost certainly a typo rather than intent.
        if !(0..64).contains(&self.suspend_signal_offset) {
            return Err(CoreError::InvalidConfig(
                "suspend_signal_offset must be within the realtime signal range".to_owned(),
            ));
        }
        if !(0..64).contains(&self.write_checkpoint_signal_offset) {
            return Err(CoreError::InvalidConfig(
                "write_checkpoint_signal_offset must be within the realtime signal range".to_owned(),
            ));
        }
        if self.suspend_signal_offset == self.write_checkpoint_signal_offset {
            return Err(CoreError::InvalidConfig(
                "suspend and write-checkpoint signals must be distinct".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn region_policy(&self) -> tas_checkpoint::RegionPolicy {
        tas_checkpoint::RegionPolicy {
            ignore_non_writable: self.ignore_non_writable_regions,
            ignore_non_writable_non_anonymous: self.ignore_non_writable_non_anonymous_regions,
            ignore_exec: self.ignore_exec_regions,
            ignore_shared: self.ignore_shared_regions,
        }
    }
}

/// A builder-style set of optional overrides for fields an embedding
/// binary's CLI or environment may want to set without re-parsing a TOML
/// file. Each `Some` wins over the loaded `HarnessConfig`'s value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub default_fps: Option<u32>,
    pub snapshot_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(self, mut base: HarnessConfig) -> Result<HarnessConfig, CoreError> {
        if let Some(fps) = self.default_fps {
            base.default_fps = fps;
        }
        if let Some(dir) = self.snapshot_dir {
            base.snapshot_dir = dir;
        }
        base.validate()?;
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        HarnessConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_fps_is_rejected() {
        let mut config = HarnessConfig::default();
        config.default_fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn colliding_signal_offsets_are_rejected() {
        let mut config = HarnessConfig::default();
        config.write_checkpoint_signal_offset = config.suspend_signal_offset;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_win_over_loaded_values() {
        let base = HarnessConfig::default();
        let overrides = ConfigOverrides {
            default_fps: Some(30),
            snapshot_dir: None,
        };
        let merged = overrides.apply(base).unwrap();
        assert_eq!(merged.default_fps, 30);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = HarnessConfig::load(Path::new("/nonexistent/tas-harness.toml")).unwrap();
        assert_eq!(config.default_fps, HarnessConfig::default().default_fps);
    }
}
