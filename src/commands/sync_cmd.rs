//! Push design and security documents for a resource definition.

use clap::Args;
use sofa_core::{ResourceClass, SyncOutcome};
use std::path::PathBuf;

use crate::config::Config;
use crate::resource_file::ResourceFile;

/// Create the database and synchronize design documents
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Resource definition (YAML)
    resource: PathBuf,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let resource = ResourceFile::load(&self.resource)?;
        let class = ResourceClass::initialize(resource.to_config(config.connection())).await?;

        println!(
            "Synchronizing {} in database {}...",
            class.doc_type(),
            class.db_name()
        );
        println!();

        let report = class.report();
        for (id, outcome) in report.iter() {
            let status = match outcome {
                SyncOutcome::Unchanged => "✓ up to date",
                SyncOutcome::Created => "✓ created",
                SyncOutcome::Updated => "✓ updated",
            };
            println!("  {} {}", status, id);
        }

        println!();
        if report.writes() == 0 {
            println!("Already up to date.");
        } else {
            println!(
                "Sync complete ({} document{} written).",
                report.writes(),
                if report.writes() == 1 { "" } else { "s" }
            );
        }

        Ok(())
    }
}
