use clap::Args;
use sofa_core::ResourceClass;
use std::path::PathBuf;

use crate::config::Config;
use crate::resource_file::ResourceFile;

/// Fetch one document by id
#[derive(Debug, Args)]
pub struct GetCommand {
    /// Resource definition (YAML)
    resource: PathBuf,

    /// Document id
    id: String,
}

impl GetCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let resource = ResourceFile::load(&self.resource)?;
        let class = ResourceClass::initialize(resource.to_config(config.connection())).await?;

        let found = class.get(&self.id).await?;
        println!("{}", serde_json::to_string_pretty(&found.to_document())?);
        Ok(())
    }
}
