use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use rtu_sync::protocol::OutboundRequest;
use rtu_sync::reconcile::Bookmark;
use rtu_sync::server::{self, ServerOptions};
use rtu_sync::sync::events::CONNECTION_CHANGED;
use rtu_sync::{Delivery, RtuClient, RtuConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "rtu.log";

#[derive(Parser)]
#[command(name = "rtu")]
#[command(
    about = "Real-time update channel client with HTTP fallback and bookmark reconciliation",
    version
)]
struct Cli {
    /// TOML configuration file; RTU_* environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// HTTP base of the remote service
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    #[arg(long, global = true)]
    token: Option<String>,

    /// SQLite file for the local collections
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    /// Also write daily rolling logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the channel and print connection changes until interrupted
    Connect {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Send one request over the channel, or over HTTP when it is down
    Send {
        service: String,
        object: String,

        #[arg(default_value = "GET")]
        verb: String,

        #[arg(short, long)]
        identity: Option<String>,

        /// JSON body
        #[arg(short, long)]
        body: Option<String>,

        /// Query parameter, e.g. `--query since=0`
        #[arg(short, long, value_name = "KEY=VALUE")]
        query: Vec<String>,

        /// How long to wait for the channel before falling back
        #[arg(long, default_value = "3")]
        wait: u64,
    },

    /// Start the mock RTU server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Token clients must present
        #[arg(long)]
        require_token: Option<String>,

        /// Delay before answering a PING
        #[arg(long, default_value = "1000")]
        heartbeat_ms: u64,
    },

    /// Inspect and edit the local bookmark collection
    Bookmarks {
        #[command(subcommand)]
        action: BookmarkAction,
    },
}

#[derive(Subcommand)]
enum BookmarkAction {
    /// List bookmarks, newest first
    List,

    /// Add or replace a bookmark
    Add {
        id: String,
        book_id: String,
        location: String,

        #[arg(long, default_value = "0")]
        progress: f64,

        #[arg(long)]
        title: Option<String>,
    },

    /// Remove a bookmark locally and on the server
    Remove { id: String },

    /// Send pending local changes
    Flush,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.log_dir.as_deref());

    if let Commands::Serve {
        port,
        require_token,
        heartbeat_ms,
    } = &cli.command
    {
        println!(
            "{}",
            format!("🌐 Starting mock server on port {}...", port)
                .cyan()
                .bold()
        );
        let options = ServerOptions {
            token: require_token.clone(),
            heartbeat_delay: Duration::from_millis(*heartbeat_ms),
        };
        return server::start(*port, options).await;
    }

    let config = load_config(&cli)?;
    let client = RtuClient::new(config)?;
    let restored = client.open().await?;

    match cli.command {
        Commands::Connect { duration } => {
            let mut events = client.bus().subscribe();
            println!(
                "{} Connecting to {}",
                "→".bright_black(),
                client.config().base_url.as_str().bright_blue()
            );
            client.start();

            let watch = async {
                while let Ok(event) = events.recv().await {
                    if event.topic == CONNECTION_CHANGED {
                        println!("{} {}", "●".bright_green(), event.args);
                    }
                }
            };
            let limit = async {
                match duration {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = watch => {}
                _ = limit => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }

        Commands::Send {
            service,
            object,
            verb,
            identity,
            body,
            query,
            wait,
        } => {
            client.start();
            if !client.wait_ready(Duration::from_secs(wait)).await {
                println!("{} channel not ready, using HTTP", "!".yellow());
            }

            let mut request = OutboundRequest::new(service, object, verb);
            if let Some(identity) = identity {
                request = request.with_identity(identity);
            }
            if let Some(body) = body {
                let body: serde_json::Value =
                    serde_json::from_str(&body).context("--body is not valid JSON")?;
                request = request.with_body(body);
            }
            for pair in query {
                let (key, value) = pair
                    .split_once('=')
                    .with_context(|| format!("--query {pair} is not KEY=VALUE"))?;
                request = request.with_query(key, value);
            }

            match client.send(&request).await {
                Delivery::Channel => println!("{} sent over the channel", "✓".green()),
                Delivery::Fallback(response) => {
                    println!("{} sent over HTTP", "✓".green());
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                Delivery::Failed => println!("{} request failed, see log", "✗".red()),
            }
        }

        Commands::Bookmarks { action } => {
            let engine = client.bookmarks();
            match action {
                BookmarkAction::List => {
                    let records = engine.records().await;
                    println!(
                        "{} {}",
                        "📑 Bookmarks".cyan().bold(),
                        format!("({} restored)", restored).bright_black()
                    );
                    println!("{}", "═".repeat(60).bright_black());
                    let dirty = engine.dirty_ids().await;
                    for bookmark in &records {
                        let marker = if dirty.contains(&bookmark.id) {
                            "●".yellow()
                        } else {
                            "●".bright_green()
                        };
                        println!(
                            "{} {} {} {}",
                            marker,
                            bookmark.id.bright_cyan().bold(),
                            bookmark.book_id.bright_white(),
                            format!("{:.0}%", bookmark.progress * 100.0).bright_black()
                        );
                        if let Some(title) = &bookmark.title {
                            println!("   {}", title);
                        }
                    }
                    println!(
                        "\n{} {} pending",
                        format!("{} bookmarks", records.len()).bright_white().bold(),
                        dirty.len()
                    );
                }
                BookmarkAction::Add {
                    id,
                    book_id,
                    location,
                    progress,
                    title,
                } => {
                    let mut bookmark = Bookmark::new(id, book_id, location, progress);
                    if let Some(title) = title {
                        bookmark = bookmark.with_title(title);
                    }
                    let saved = engine.upsert(bookmark).await?;
                    println!("{} Saved {}", "✓".green(), saved.id.bright_yellow());
                }
                BookmarkAction::Remove { id } => {
                    if engine.remove(&id).await? {
                        println!("{} Removed {}", "✓".green(), id.bright_yellow());
                    } else {
                        println!("{} No bookmark {}", "!".yellow(), id);
                    }
                }
                BookmarkAction::Flush => {
                    let sent = engine.flush().await;
                    println!("{} Flushed {} bookmarks", "✓".green(), sent);
                }
            }
        }

        Commands::Serve { .. } => {}
    }

    client.stop();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<RtuConfig> {
    let mut config = match (&cli.config, &cli.base_url) {
        (Some(path), _) => RtuConfig::from_file(path)?,
        (None, Some(base)) => RtuConfig::new(base)?,
        (None, None) => RtuConfig::from_env()?,
    };
    if let Some(base) = &cli.base_url {
        config.base_url = base
            .parse()
            .with_context(|| format!("--base-url {base} is not a url"))?;
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    if let Some(storage) = &cli.storage {
        config.storage_path = Some(storage.clone());
    }
    config.verbose |= cli.verbose;
    Ok(config)
}

/// stderr output filtered by `RUST_LOG` (default `info`, `debug` with
/// `--verbose`), plus a daily rolling file when `log_dir` is given.
fn init_tracing(
    verbose: bool,
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
