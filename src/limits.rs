//! Staging-time hive limits.
//!
//! A transaction opened with limits rejects edits that would exceed
//! them, before anything reaches the rebuild. Each violation names the
//! rule and the numeric bound it broke.

use crate::error::{RegistryError, Result};

/// Bounds enforced while staging edits.
#[derive(Debug, Clone)]
pub struct HiveLimits {
    /// Maximum key name length in characters.
    pub max_key_name_len: usize,

    /// Maximum value name length in characters.
    pub max_value_name_len: usize,

    /// Maximum value data size in bytes.
    pub max_value_data_len: usize,

    /// Maximum key depth below the root.
    pub max_depth: usize,
}

impl Default for HiveLimits {
    fn default() -> Self {
        // The bounds Windows itself documents for registry elements
        HiveLimits {
            max_key_name_len: 255,
            max_value_name_len: 16_383,
            max_value_data_len: 64 * 1024 * 1024,
            max_depth: 512,
        }
    }
}

impl HiveLimits {
    /// Checks a single key name component.
    pub fn check_key_name(&self, name: &str) -> Result<()> {
        let len = name.chars().count();
        if len > self.max_key_name_len {
            return Err(RegistryError::limit_violation(
                "key_name_len",
                self.max_key_name_len as u64,
                len as u64,
            ));
        }
        Ok(())
    }

    /// Checks a normalized path's depth and each component's length.
    pub fn check_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Ok(());
        }

        let mut depth = 0;
        for component in path.split('\\') {
            depth += 1;
            self.check_key_name(component)?;
        }

        if depth > self.max_depth {
            return Err(RegistryError::limit_violation(
                "key_depth",
                self.max_depth as u64,
                depth as u64,
            ));
        }
        Ok(())
    }

    /// Checks a value name.
    pub fn check_value_name(&self, name: &str) -> Result<()> {
        let len = name.chars().count();
        if len > self.max_value_name_len {
            return Err(RegistryError::limit_violation(
                "value_name_len",
                self.max_value_name_len as u64,
                len as u64,
            ));
        }
        Ok(())
    }

    /// Checks a value payload size.
    pub fn check_value_data(&self, len: usize) -> Result<()> {
        if len > self.max_value_data_len {
            return Err(RegistryError::limit_violation(
                "value_data_len",
                self.max_value_data_len as u64,
                len as u64,
            ));
        }
        Ok(())
    }
}
