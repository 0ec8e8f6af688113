use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::constants::*;
use super::error::ConfigError;

/// Structure representing the receiver configuration. Contains the network, pool and
/// detector settings. Configs are seralizable and deserializable to YAML using serde and
/// serde_yaml.
///
/// A Config is handed to the Receiver/Sorter at construction and is never changed while
/// they run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// First UDP port to try. Incremented on bind conflicts. 0 lets the OS pick one.
    pub udp_port: u16,
    pub socket_timeout_ms: u64,
    pub socket_recv_buffer: usize,
    /// Number of buffers in the pool filled by the Receiver
    pub unsorted_pool_size: usize,
    /// Number of buffers in the pool handed to consumers
    pub sorted_pool_size: usize,
    /// Bitmap of the ASICs expected to send data, bit n = ASIC n
    pub asic_mask: u16,
    /// Maximum number of samples per pixel in a train
    pub sram_depth: usize,
    /// Reclaim the oldest unconsumed sorted train instead of blocking when the sorted
    /// pool runs dry
    pub drop_oldest: bool,
    /// Number of threads used to reshuffle a train, 0 selects from the available cores
    pub sort_threads: usize,
    pub check_dummy_data: bool,
    pub expected_test_pattern: u16,
    /// Stop reading a directory after this many files, 0 means no limit
    pub max_files: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            socket_timeout_ms: DEFAULT_SOCKET_TIMEOUT_MS,
            socket_recv_buffer: DEFAULT_SOCKET_RECV_BUFFER,
            unsorted_pool_size: 10,
            sorted_pool_size: 3,
            asic_mask: ALL_ASICS_MASK,
            sram_depth: MAX_SRAM_DEPTH,
            drop_oldest: true,
            sort_threads: 0,
            check_dummy_data: false,
            expected_test_pattern: DEFAULT_EXPECTED_TESTPATTERN,
            max_files: 0,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check the values which would make the Receiver or Sorter unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.asic_mask == 0 {
            return Err(ConfigError::Invalid(String::from(
                "asic_mask must enable at least one ASIC",
            )));
        }
        if self.sram_depth == 0 || self.sram_depth > MAX_SRAM_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "sram_depth must be between 1 and {MAX_SRAM_DEPTH}, got {}",
                self.sram_depth
            )));
        }
        if self.unsorted_pool_size == 0 || self.sorted_pool_size == 0 {
            return Err(ConfigError::Invalid(String::from(
                "pool sizes must be at least 1",
            )));
        }
        if self.socket_timeout_ms == 0 {
            return Err(ConfigError::Invalid(String::from(
                "socket_timeout_ms must be non-zero",
            )));
        }
        Ok(())
    }

    /// The ASIC numbers enabled in the bitmap, in ascending order
    pub fn sending_asics(&self) -> Vec<usize> {
        self.asic_mask.view_bits::<Lsb0>().iter_ones().collect()
    }

    /// Ladder mode means more than one ASIC is tiled into the image
    pub fn is_ladder_mode(&self) -> bool {
        self.asic_mask.count_ones() > 1
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Number of reshuffle workers: the configured value, or half the cores minus one
    /// clamped to 1..=8
    pub fn sort_thread_count(&self) -> usize {
        if self.sort_threads > 0 {
            return self.sort_threads;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cores / 2).saturating_sub(1).clamp(1, MAX_SORT_THREADS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sending_asics() {
        let config = Config {
            asic_mask: 0b0000_0001_0000_0110,
            ..Default::default()
        };
        assert_eq!(config.sending_asics(), vec![1, 2, 8]);
        assert!(config.is_ladder_mode());

        let single = Config {
            asic_mask: 1 << 12,
            ..Default::default()
        };
        assert_eq!(single.sending_asics(), vec![12]);
        assert!(!single.is_ladder_mode());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let config = Config {
            udp_port: 8100,
            sram_depth: 100,
            ..Default::default()
        };
        config.write_config_file(&path).unwrap();
        let loaded = Config::read_config_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("udp_port: 9000\n").unwrap();
        assert_eq!(config.udp_port, 9000);
        assert_eq!(config.sram_depth, MAX_SRAM_DEPTH);
    }

    #[test]
    fn test_invalid_configs() {
        let no_asics = Config {
            asic_mask: 0,
            ..Default::default()
        };
        assert!(no_asics.validate().is_err());
        let too_deep = Config {
            sram_depth: MAX_SRAM_DEPTH + 1,
            ..Default::default()
        };
        assert!(too_deep.validate().is_err());
        assert!(Config::read_config_file(Path::new("/does/not/exist.yml")).is_err());
    }
}
