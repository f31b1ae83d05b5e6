//! Follow the change feed of a resource's database.

use clap::Args;
use futures::StreamExt;
use sofa_core::{ChangeParams, ResourceClass};
use std::path::PathBuf;

use crate::config::Config;
use crate::resource_file::ResourceFile;

/// Print changes as JSON lines until interrupted
#[derive(Debug, Args)]
pub struct ChangesCommand {
    /// Resource definition (YAML)
    resource: PathBuf,

    /// Start after this sequence ("now" skips history)
    #[arg(long)]
    since: Option<String>,

    /// Include full documents in each event
    #[arg(long)]
    include_docs: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 30_000)]
    heartbeat: u64,
}

impl ChangesCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let resource = ResourceFile::load(&self.resource)?;
        let class = ResourceClass::initialize(resource.to_config(config.connection())).await?;

        let mut params = ChangeParams::new()
            .include_docs(self.include_docs)
            .heartbeat(self.heartbeat);
        if let Some(since) = &self.since {
            params = params.since(since.clone());
        }

        let mut feed = class.changes(&params).await?;
        tracing::info!("following changes of {}", class.db_name());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = feed.next() => match event {
                    Some(Ok(event)) => println!("{}", serde_json::to_string(&event)?),
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }

        Ok(())
    }
}
