use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jobcrawler", about = "Tiered, rate-aware job-listing ingestion pipeline")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one ingestion pass across all configured tiers
    Run,
    /// Print the latest persisted counts and health report
    Status,
}
