//! PointSync CLI
//!
//! Command-line tools for PointSync.
//!
//! # Commands
//!
//! - `demo` - Run a synchronizer against an in-process points server
//! - `token issue` - Issue an access token for an account
//! - `token verify` - Check a token and print the account it grants
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// PointSync command-line tools.
#[derive(Parser)]
#[command(name = "pointsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synchronizer against an in-process points server
    Demo {
        /// Accounts to subscribe to
        #[arg(short, long, value_delimiter = ',', default_value = "alice,bob,carol")]
        keys: Vec<String>,

        /// Number of ledger writes to perform
        #[arg(short, long, default_value = "100")]
        updates: usize,

        /// Sever every open feed after this many writes (0 disables)
        #[arg(long, default_value = "25")]
        sever_every: usize,

        /// Seed for the random write sequence
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Seconds to wait for subscribers to converge
        #[arg(long, default_value = "10")]
        timeout: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Issue or check access tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue a token for an account
    Issue {
        /// Shared signing secret
        #[arg(short, long)]
        secret: String,

        /// Account the token grants access to
        #[arg(short, long)]
        key: String,
    },

    /// Verify a hex-encoded token
    Verify {
        /// Shared signing secret
        #[arg(short, long)]
        secret: String,

        /// Token to verify
        #[arg(short, long)]
        token: String,

        /// Token lifetime in seconds
        #[arg(long, default_value = "86400")]
        expiry: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Demo {
            keys,
            updates,
            sever_every,
            seed,
            timeout,
            format,
        } => {
            let options = commands::demo::DemoOptions {
                keys,
                updates,
                sever_every,
                seed,
                timeout: Duration::from_secs(timeout),
            };
            commands::demo::run(options, &format).await?;
        }
        Commands::Token { action } => match action {
            TokenAction::Issue { secret, key } => {
                println!("{}", commands::token::issue(&secret, &key)?);
            }
            TokenAction::Verify {
                secret,
                token,
                expiry,
            } => {
                let key = commands::token::verify(&secret, &token, Duration::from_secs(expiry))?;
                println!("valid token for {key}");
            }
        },
        Commands::Version => {
            println!("PointSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "PointSync protocol v{}",
                pointsync_protocol::PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
