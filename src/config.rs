//! Engine configuration and validation.
//!
//! The engine itself takes its tuning parameters (thread count, buffer
//! size, handle cap) as plain function arguments; this module provides
//! the serializable [`Settings`] surface that embedding applications use
//! to carry those parameters in their own configuration files.
use log::debug;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::core::files;
use crate::error::TaskTreeError;

/// Default size of a single file-cache data buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default cap on simultaneously open OS-level file handles.
pub const DEFAULT_MAX_SHARED_HANDLES: usize = 16;

/// Tuning parameters for the task scheduler and the file cache.
///
/// All fields have sensible defaults, so a `[tasktree]` section in an
/// application configuration file may set any subset of them.
///
/// # Examples
///
/// ```rust
/// use tasktree::config::Settings;
///
/// let settings = Settings::from_toml_str("worker_threads = 2").unwrap();
/// assert_eq!(settings.worker_threads, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Number of worker threads the scheduler may spawn.
    /// `1` selects the serial execution model.
    pub worker_threads: usize,

    /// Size of each file-cache data buffer in bytes. Must be a power
    /// of two.
    pub file_buffer_size: usize,

    /// Maximum number of OS-level file handles kept open at the same
    /// time. `0` is legal; the cache then cycles a single transient
    /// handle.
    pub max_shared_handles: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            file_buffer_size: DEFAULT_BUFFER_SIZE,
            max_shared_handles: DEFAULT_MAX_SHARED_HANDLES,
        }
    }
}

impl Settings {
    /// Parse settings from a TOML document, falling back to defaults
    /// for absent fields, and validate the result.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for internally consistent values.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(TaskTreeError::config(
                "worker_threads must be at least 1 (1 selects serial execution)",
            ));
        }
        if !self.file_buffer_size.is_power_of_two() {
            return Err(TaskTreeError::config(format!(
                "file_buffer_size must be a power of two, got {}",
                self.file_buffer_size
            )));
        }
        Ok(())
    }

    /// Apply the file-cache part of the settings to the process-wide
    /// handle pool.
    pub fn apply_to_global_pool(&self) -> Result<()> {
        self.validate()?;
        debug!(
            "Settings: applying max_shared_handles = {}",
            self.max_shared_handles
        );
        files::set_max_shared_handles(self.max_shared_handles);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.worker_threads >= 1);
        assert_eq!(settings.file_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(settings.max_shared_handles, DEFAULT_MAX_SHARED_HANDLES);
    }

    #[test]
    fn test_from_toml_str_partial_overrides() {
        let settings = Settings::from_toml_str("file_buffer_size = 1024").unwrap();
        assert_eq!(settings.file_buffer_size, 1024);
        assert_eq!(settings.max_shared_handles, DEFAULT_MAX_SHARED_HANDLES);
    }

    #[test]
    fn test_from_toml_str_rejects_unknown_fields() {
        let result = Settings::from_toml_str("buffer_bytes = 1024");
        assert!(matches!(result, Err(TaskTreeError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let settings = Settings {
            worker_threads: 0,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("worker_threads"));
    }

    #[test]
    fn test_validate_rejects_unaligned_buffer_size() {
        let settings = Settings {
            file_buffer_size: 3000,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_zero_handle_cap_is_legal() {
        let settings = Settings {
            max_shared_handles: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());
    }
}
