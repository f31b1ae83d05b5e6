//! Resource definitions loaded from YAML.
//!
//! ```yaml
//! doc_type: order
//! db_name: orders          # optional, defaults to the plural of doc_type
//! schema:
//!   qty: numeric
//!   code: { prefix: "ORD-", validate: numeric }
//!   note: { optional: true }
//! views:
//!   by_code:
//!     map: "function (doc) { emit(doc.code, null); }"
//! ```

use serde::Deserialize;
use sofa_core::{ConnectionConfig, DesignParts, ResourceConfig, Schema, SecurityDocument};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceFile {
    pub doc_type: String,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub schema: Schema,
    #[serde(flatten)]
    pub design: DesignParts,
    #[serde(default)]
    pub security: Option<SecurityDocument>,
}

impl ResourceFile {
    pub fn load(path: &Path) -> Result<Self, ResourceFileError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ResourceFileError::ReadError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ResourceFileError::ParseError(path.to_path_buf(), e))
    }

    pub fn to_config(&self, connection: ConnectionConfig) -> ResourceConfig {
        let mut config = ResourceConfig::new(&self.doc_type)
            .with_connection(connection)
            .with_schema(self.schema.clone())
            .with_design(self.design.clone());
        if let Some(db_name) = &self.db_name {
            config = config.with_db_name(db_name);
        }
        if let Some(namespace) = &self.namespace {
            config = config.with_namespace(namespace);
        }
        if let Some(security) = &self.security {
            config = config.with_security(security.clone());
        }
        config
    }
}

#[derive(Debug)]
pub enum ResourceFileError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ResourceFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceFileError::ReadError(path, e) => {
                write!(f, "Failed to read resource file '{}': {}", path.display(), e)
            }
            ResourceFileError::ParseError(path, e) => {
                write!(f, "Failed to parse resource file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ResourceFileError {}
