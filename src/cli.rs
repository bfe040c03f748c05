use clap::{Parser, Subcommand};

/// Gatehouse — permission-gated resource API
#[derive(Parser)]
#[command(name = "gatehouse", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server
    Serve {
        /// Port to bind
        #[arg(short, long, default_value = "4000")]
        port: u16,

        /// Run as a SaaS instance (enables seat-control enforcement)
        #[arg(long)]
        saas: bool,

        /// Licensed features to enable, comma separated (or "all")
        #[arg(long, value_delimiter = ',')]
        licensed_features: Option<Vec<String>>,

        /// Feature flags to enable, comma separated
        #[arg(long, value_delimiter = ',')]
        feature_flags: Option<Vec<String>>,

        /// Run background jobs inline instead of on the worker task
        #[arg(long)]
        inline_jobs: bool,
    },
}
