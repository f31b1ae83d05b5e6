use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("host: {}", config.host.value);
                        println!("  source: {}", config.host.source);
                        println!();

                        println!("port: {}", config.port.value);
                        println!("  source: {}", config.port.source);
                        println!();

                        match &config.username {
                            Some(username) => {
                                println!("username: {}", username.value);
                                println!("  source: {}", username.source);
                                println!(
                                    "password: {}",
                                    if config.password.is_some() { "(set)" } else { "(not set)" }
                                );
                            }
                            None => println!("username: (not set)"),
                        }
                        println!();

                        println!("cache: {}", config.cache.value);
                        println!("  source: {}", config.cache.source);
                        println!();

                        println!("url: {}", config.connection().base_url());
                    }
                }
                Ok(())
            }
        }
    }
}
