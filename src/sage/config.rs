// STARK, a system for computer augmented design.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// STARK is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/sage/config.rs

// Environment settings, read from JSON, and logger setup.

// <>

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown log level {0}")]
    LogLevel(String),
    #[error("cannot install logger: {0}")]
    Logger(#[from] log::SetLoggerError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SageConfig {
    pub log_level: String,
    /// Log every message send and return
    pub watch_messages: bool,
    /// Log entry and exit of every handler
    pub watch_handlers: bool,
    /// Check slot constraints on direct slot writes
    pub dynamic_constraint_checking: bool,
    /// Byte ceiling for a single scratch buffer
    pub scratch_limit: Option<usize>,
    /// Sweep idle atoms after a binary clear
    pub reclaim_on_clear: bool,
}

impl Default for SageConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            watch_messages: false,
            watch_handlers: false,
            dynamic_constraint_checking: false,
            scratch_limit: None,
            reclaim_on_clear: true,
        }
    }
}

impl SageConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn level_filter(&self) -> Result<log::LevelFilter, ConfigError> {
        log::LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }
}

/// Installs `simple_logger` at the configured level
pub fn init_logging(config: &SageConfig) -> Result<(), ConfigError> {
    simple_logger::SimpleLogger::new()
        .with_level(config.level_filter()?)
        .init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn missing_fields_default() {
        let config = SageConfig::from_json(r#"{ "watch_messages": true }"#).unwrap();
        assert_eq!(
            config,
            SageConfig {
                watch_messages: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn reads_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "scratch_limit": 4096, "log_level": "debug" }}"#).unwrap();

        let config = SageConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scratch_limit, Some(4096));
        assert_eq!(config.level_filter().unwrap(), log::LevelFilter::Debug);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            SageConfig::from_json("{ \"watch_handlers\": 3 }"),
            Err(ConfigError::Parse(_))
        ));
        let config = SageConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.level_filter(), Err(ConfigError::LogLevel(_))));
    }

    #[test]
    fn environment_uses_config() {
        let config = SageConfig {
            scratch_limit: Some(16),
            ..Default::default()
        };
        let mut env = crate::sage::Env::with_config(config);
        assert_eq!(env.config().scratch_limit, Some(16));
        assert!(env.allocate_scratch(17).is_none());
    }
}
