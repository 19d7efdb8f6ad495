//! Engine configuration.
//!
//! Settings come from an optional JSON file and are then overridden by
//! command-line flags. Every field has a default so a partial file is valid.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default output sample rate (44.1 kHz standard).
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default block size for the realtime callback.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Largest block any driver will request.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Runtime configuration shared by the realtime and offline drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Frames rendered per block.
    pub block_size: usize,
    /// Upper bound for `block_size`; sources preallocate this much.
    pub max_block_size: usize,
    /// Number of source slots on the audio thread.
    pub max_tracks: usize,
    /// Capacity of the UI to audio command ring.
    pub command_capacity: usize,
    /// Capacity of the audio to UI event ring.
    pub event_capacity: usize,
    /// Threads in the resource loader pool.
    pub loader_threads: usize,
    /// Seconds appended after the last region in offline renders.
    pub render_tail_seconds: f64,
    /// Extra directories searched for plugin libraries.
    pub plugin_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            max_tracks: 128,
            command_capacity: 1024,
            event_capacity: 1024,
            loader_threads: 2,
            render_tail_seconds: 2.0,
            plugin_dirs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file is missing, `Decode` if it is not valid
    /// JSON and `InvalidArgument` if a value is out of range.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::not_found(path),
            _ => EngineError::decode(path, e),
        })?;
        let config: EngineConfig =
            serde_json::from_str(&json).map_err(|e| EngineError::decode(path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> EngineResult<()> {
        if !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(EngineError::InvalidArgument(format!(
                "sample rate {} outside 8000-192000",
                self.sample_rate
            )));
        }
        if self.max_block_size == 0 || self.max_block_size > MAX_BLOCK_SIZE {
            return Err(EngineError::InvalidArgument(format!(
                "max block size {} outside 1-{}",
                self.max_block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.block_size < 16 || self.block_size > self.max_block_size {
            return Err(EngineError::InvalidArgument(format!(
                "block size {} outside 16-{}",
                self.block_size, self.max_block_size
            )));
        }
        if self.max_tracks == 0 {
            return Err(EngineError::InvalidArgument("max tracks must be >= 1".into()));
        }
        if self.command_capacity == 0 || self.event_capacity == 0 {
            return Err(EngineError::InvalidArgument("queue capacity must be >= 1".into()));
        }
        if !self.render_tail_seconds.is_finite() || self.render_tail_seconds < 0.0 {
            return Err(EngineError::InvalidArgument("render tail must be >= 0".into()));
        }
        Ok(())
    }

    /// Platform plugin directories followed by the user-configured ones.
    pub fn plugin_search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if cfg!(target_os = "macos") {
            dirs.push(PathBuf::from("/Library/Audio/Plug-Ins/Beatline"));
        } else if cfg!(target_os = "windows") {
            dirs.push(PathBuf::from("C:\\Program Files\\Common Files\\Beatline"));
        } else {
            dirs.push(PathBuf::from("/usr/lib/beatline/plugins"));
            dirs.push(PathBuf::from("/usr/local/lib/beatline/plugins"));
        }
        if let Some(home) = std::env::var_os("HOME") {
            dirs.push(PathBuf::from(home).join(".beatline").join("plugins"));
        }
        dirs.extend(self.plugin_dirs.iter().cloned());
        dirs
    }

    /// Duration of one block in seconds.
    #[allow(dead_code)]
    pub fn block_seconds(&self) -> f64 {
        self.block_size as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.render_tail_seconds, 2.0);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, r#"{{ "sampleRate": 48000, "blockSize": 256 }}"#).unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.sample_rate, 48_000);
        assert_eq!(config.block_size, 256);
        assert_eq!(config.max_tracks, 128);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig {
            block_size: 8,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidArgument(_))
        ));

        let config = EngineConfig {
            sample_rate: 1_000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = EngineConfig::load_from_file("/nonexistent/beatline.json").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
