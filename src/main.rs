use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use feedmail::commands::{self, Paths};
use feedmail::feed::RunOptions;

/// Turn web feeds into email.
#[derive(Parser)]
#[command(name = "feedmail", version, about)]
struct Cli {
    /// Config file (default: ~/.config/feedmail/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Datafile holding per-feed state (default: ~/.local/share/feedmail/feeds.json)
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to a feed
    Add {
        name: String,
        url: String,
        /// Destination address for this feed (overrides the default)
        email: Option<String>,
    },
    /// Show all subscriptions
    List,
    /// Stop running the named feeds (all feeds if none given)
    Pause { names: Vec<String> },
    /// Resume running the named feeds (all feeds if none given)
    Unpause { names: Vec<String> },
    /// Unsubscribe and forget stored state
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Clear stored state so feeds are re-delivered from scratch
    Reset { names: Vec<String> },
    /// Fetch feeds and send new entries
    Run {
        /// Process entries but do not actually send anything
        #[arg(short = 'n', long = "no-send")]
        no_send: bool,
        /// Prune state for entries that left their feed
        #[arg(long)]
        clean: bool,
        /// Only run these feeds (all active feeds if none given)
        names: Vec<String>,
    },
}

fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("feedmail")
        .join("config.toml"))
}

fn default_data_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("feedmail")
        .join("feeds.json"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedmail=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths {
        config: match cli.config {
            Some(p) => p,
            None => default_config_path()?,
        },
        data: match cli.data {
            Some(p) => p,
            None => default_data_path()?,
        },
    };

    match cli.command {
        Command::Add { name, url, email } => {
            commands::add(&paths, &name, &url, email.as_deref())
        }
        Command::List => commands::list(&paths),
        Command::Pause { names } => commands::set_active(&paths, &names, false),
        Command::Unpause { names } => commands::set_active(&paths, &names, true),
        Command::Delete { names } => commands::delete(&paths, &names),
        Command::Reset { names } => commands::reset(&paths, &names),
        Command::Run {
            no_send,
            clean,
            names,
        } => {
            commands::run(
                &paths,
                RunOptions {
                    send: !no_send,
                    clean,
                },
                &names,
            )
            .await
        }
    }
}
