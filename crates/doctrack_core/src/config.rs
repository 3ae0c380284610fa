//! Documents configuration.
//!
//! # Responsibility
//! - Load service settings and schema declarations from JSON.
//! - Turn declared schemas into a validated [`SchemaRegistry`].
//!
//! # Invariants
//! - Missing keys fall back to [`DocumentsConfig::default`].
//! - Duplicate kinds and invalid schemas are rejected at load time.

use crate::model::schema::{DocumentedSchema, SchemaRegistry, SchemaValidationError};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Top-level settings for documented entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentsConfig {
    /// Published changes without an entity create one instead of failing.
    pub create_entity_after_change_created: bool,
    pub schemas: Vec<DocumentedSchema>,
    pub logging: Option<LoggingConfig>,
}

/// File logging settings, see [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    pub log_dir: PathBuf,
}

fn default_level() -> String {
    crate::logging::default_log_level().to_string()
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Schema(SchemaValidationError),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config json: {err}"),
            Self::Schema(err) => write!(f, "invalid documented schema: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Schema(err) => Some(err),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

impl From<SchemaValidationError> for ConfigError {
    fn from(value: SchemaValidationError) -> Self {
        Self::Schema(value)
    }
}

impl DocumentsConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.schema_registry()?;
        Ok(config)
    }

    /// Reads and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Builds a registry holding every declared schema.
    pub fn schema_registry(&self) -> Result<SchemaRegistry, ConfigError> {
        Ok(SchemaRegistry::from_schemas(self.schemas.iter().cloned())?)
    }
}
