use clap::{Parser, Subcommand};

/// Relay — authenticated encrypted job relay
#[derive(Parser)]
#[command(name = "relay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API with an embedded worker pool
    Serve {
        /// Port to bind (defaults to RELAY_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Embedded relay workers; 0 runs the API alone (defaults to RELAY_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Run relay workers only
    Worker {
        /// Number of workers (defaults to RELAY_WORKERS)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Key material helpers
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Manage subjects allowed to log in
    Subject {
        #[command(subcommand)]
        command: SubjectCommands,
    },

    /// Encrypt a payload with the configured active data key
    Encrypt {
        #[arg(long)]
        data: String,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Print a fresh signing key and data key
    Generate {
        /// Key id for the new data key
        #[arg(long, default_value = "k1")]
        kid: String,
    },
}

#[derive(Subcommand)]
pub enum SubjectCommands {
    /// Create or replace a subject's secret
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        secret: String,
    },
}
