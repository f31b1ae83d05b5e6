//! Run the schema validator on a local JSON document.

use clap::Args;
use sofa_core::{validate, Document, ValidationError};
use std::path::PathBuf;

use crate::config::Config;
use crate::resource_file::ResourceFile;

/// Validate a JSON document against a resource schema
#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Resource definition (YAML)
    resource: PathBuf,

    /// Document to check (JSON)
    document: PathBuf,
}

impl ValidateCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let resource = ResourceFile::load(&self.resource)?;
        let resource_config = resource.to_config(config.connection());
        resource_config.check()?;

        let contents = std::fs::read_to_string(&self.document)?;
        let mut document: Document = serde_json::from_str(&contents)?;
        // Writes are always tagged with the class doc type
        document
            .entry("doc_type")
            .or_insert_with(|| resource.doc_type.clone().into());

        match validate(
            &document,
            resource_config.schema(),
            resource_config.validators(),
        ) {
            Ok(()) => {
                println!("✓ {} is a valid {}", self.document.display(), resource.doc_type);
                Ok(())
            }
            Err(e) => {
                print_errors(&e);
                Err(e.into())
            }
        }
    }
}

fn print_errors(error: &ValidationError) {
    println!("✗ {}", error.kind());
    match error.field_errors() {
        Some(errors) => {
            for (field, message) in errors {
                println!("  {}: {}", field, message);
            }
        }
        None => println!("  {}", error),
    }
}
