//! Command-line client for a raft-kv cluster.
//!
//! ```bash
//! cargo run --bin raft-kv-client -- --seed 127.0.0.1:7601 set color blue
//! cargo run --bin raft-kv-client -- --seed 127.0.0.1:7601 get color
//! cargo run --bin raft-kv-client -- --dns raft shell
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::lookup_host;
use tracing::{info, warn};

use raft_kv::client::Client;
use raft_kv::protocol::{ConsoleCommand, USAGE};
use raft_kv::telemetry;

const DEMO_KEY: &str = "current_second";

#[derive(Parser, Debug)]
#[command(author, version, about = "Talk to a raft-kv cluster")]
struct Cli {
    /// Comma-separated node addresses to start from.
    #[arg(long, value_delimiter = ',', conflicts_with = "dns")]
    seed: Vec<String>,

    /// DNS name resolving to every cluster member.
    #[arg(long)]
    dns: Option<String>,

    /// Port used with --dns.
    #[arg(long, default_value_t = 7600)]
    port: u16,

    /// OTLP gRPC collector to export spans to.
    #[arg(long)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a value.
    Set { key: String, value: String },
    /// Read a value from the leader.
    Get { key: String },
    /// Replace a value only if it currently equals `expected`.
    Cas {
        key: String,
        expected: String,
        new: String,
    },
    /// Interactive prompt.
    Shell,
    /// Write, read and swap the current second in a loop.
    Demo {
        /// Pause between rounds, in seconds.
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = telemetry::init("raft-kv-client", cli.otlp_endpoint.as_deref())?;
    let result = run(cli).await;
    telemetry.shutdown().await;
    result
}

async fn run(cli: Cli) -> Result<()> {
    let seeds = match &cli.dns {
        Some(name) => lookup_host((name.as_str(), cli.port))
            .await
            .with_context(|| format!("failed to resolve {name}"))?
            .map(|addr| addr.to_string())
            .collect(),
        None => cli.seed.clone(),
    };
    if seeds.is_empty() {
        bail!("no seed addresses; pass --seed or --dns");
    }
    let mut client = Client::new(seeds)?;

    match cli.command {
        Command::Set { key, value } => {
            client.set(key, value).await?;
            println!("OK");
        }
        Command::Get { key } => print_value(client.get(key).await?),
        Command::Cas { key, expected, new } => {
            client.cas(key, expected, new).await?;
            println!("OK");
        }
        Command::Shell => run_shell(&mut client).await?,
        Command::Demo { interval } => run_demo(&mut client, Duration::from_secs(interval)).await,
    }
    Ok(())
}

fn print_value(value: Option<String>) {
    match value {
        Some(value) => println!("{value}"),
        None => println!("(not found)"),
    }
}

async fn run_shell(client: &mut Client) -> Result<()> {
    println!("Connected via {}. Commands: {USAGE}", client.target());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("error: {err}");
                continue;
            }
        };
        let result = match command {
            ConsoleCommand::Set { key, value } => client.set(key, value).await.map(|_| println!("OK")),
            ConsoleCommand::Get { key } => client.get(key).await.map(print_value),
            ConsoleCommand::Cas { key, expected, new } => {
                client.cas(key, expected, new).await.map(|_| println!("OK"))
            }
            ConsoleCommand::Help => {
                println!("Commands: {USAGE}");
                Ok(())
            }
            ConsoleCommand::Exit => return Ok(()),
        };
        if let Err(err) = result {
            println!("error: {err}");
        }
    }
}

fn current_second() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    (secs % 60).to_string()
}

/// Exercises every operation against whichever node leads.
async fn run_demo(client: &mut Client, interval: Duration) {
    loop {
        match client.set(DEMO_KEY, current_second()).await {
            Ok(()) => {
                info!(key = DEMO_KEY, leader = client.target(), "set succeeded");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(err) => warn!(key = DEMO_KEY, error = %err, "set failed"),
        }

        match client.get(DEMO_KEY).await {
            Ok(Some(value)) => {
                info!(key = DEMO_KEY, value = %value, "get succeeded");
                match client.cas(DEMO_KEY, value, current_second()).await {
                    Ok(()) => info!(key = DEMO_KEY, "cas succeeded"),
                    Err(err) => warn!(key = DEMO_KEY, error = %err, "cas failed"),
                }
            }
            Ok(None) => info!(key = DEMO_KEY, "get found no value"),
            Err(err) => warn!(key = DEMO_KEY, error = %err, "get failed"),
        }

        tokio::time::sleep(interval).await;
    }
}
