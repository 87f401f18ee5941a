use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use courier_core::{dlq, Config, Engine};
use futures::TryStreamExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    version,
    about = "Operational CLI for Courier streams, consumers, and dead letters"
)]
struct Cli {
    #[command(flatten)]
    target: Target,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Target {
    /// Environment token, first segment of every subject
    #[arg(long, env = "COURIER_ENV", default_value = "dev")]
    env: String,

    /// Application name, second segment of every subject
    #[arg(long, env = "COURIER_APP", default_value = "app")]
    app: String,

    /// Broker endpoints, comma-separated
    #[arg(long, env = "COURIER_NATS_URLS", default_value = "nats://127.0.0.1:4222")]
    url: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision topology and run until interrupted
    Start,
    /// Show stream and consumer state
    Info,
    /// Probe the runtime components; exits non-zero when unhealthy
    Health,
    /// Drop stored messages from the stream
    Purge {
        /// Only purge the dead-letter subject
        #[arg(long)]
        dlq: bool,
    },
    /// Delete the stream entirely
    Delete {
        /// Delete the dead-letter stream instead of the primary one
        #[arg(long)]
        dlq: bool,
    },
    /// List dead-letter records, or replay one onto its original subject
    Dlq {
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Stream sequence of the entry to replay
        #[arg(long)]
        replay: Option<u64>,
    },
}

impl Target {
    fn config(&self) -> Result<Config> {
        let mut config = Config::new(self.env.clone(), self.app.clone());
        config.nats_urls = self
            .url
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.target.config()?;
    match cli.command {
        Command::Start => handle_start(config).await,
        Command::Info => handle_info(config).await,
        Command::Health => handle_health(config).await,
        Command::Purge { dlq } => handle_purge(config, dlq).await,
        Command::Delete { dlq } => handle_delete(config, dlq).await,
        Command::Dlq { limit, replay } => handle_dlq(config, limit, replay).await,
    }
}

async fn handle_start(config: Config) -> Result<()> {
    let engine = Engine::builder(config).build()?;
    engine.start().await?;
    info!("running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("wait for interrupt")?;
    engine.stop().await?;
    Ok(())
}

async fn handle_info(config: Config) -> Result<()> {
    let engine = Engine::builder(config.clone()).build()?;
    let handle = connect(&engine).await?;
    let mut stream = handle
        .jetstream
        .get_stream(config.stream_name())
        .await
        .with_context(|| format!("stream {} not found", config.stream_name()))?;
    let stream_info = stream.info().await.context("read stream info")?;

    println!("stream:    {}", stream_info.config.name);
    println!("subjects:  {}", stream_info.config.subjects.join(", "));
    println!("messages:  {}", stream_info.state.messages);
    println!("bytes:     {}", stream_info.state.bytes);
    println!("consumers: {}", stream_info.state.consumer_count);

    let mut names = stream.consumer_names();
    while let Some(name) = names.try_next().await.context("list consumers")? {
        println!("  - {name}");
    }
    Ok(())
}

async fn handle_health(config: Config) -> Result<()> {
    let engine = Engine::builder(config).build()?;
    let report = engine.health_report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.healthy {
        bail!("unhealthy");
    }
    Ok(())
}

async fn handle_purge(config: Config, dlq_only: bool) -> Result<()> {
    let engine = Engine::builder(config.clone()).build()?;
    let handle = connect(&engine).await?;
    let stream = handle
        .jetstream
        .get_stream(config.stream_name())
        .await
        .with_context(|| format!("stream {} not found", config.stream_name()))?;

    let purged = if dlq_only {
        stream
            .purge()
            .filter(config.dlq_subject())
            .await
            .context("purge dead letters")?
    } else {
        stream.purge().await.context("purge stream")?
    };
    println!("purged {} messages", purged.purged);
    Ok(())
}

async fn handle_delete(config: Config, dlq_only: bool) -> Result<()> {
    let engine = Engine::builder(config.clone()).build()?;
    let handle = connect(&engine).await?;
    let name = if dlq_only {
        config.dlq_stream_name()
    } else {
        config.stream_name()
    };
    match handle.jetstream.delete_stream(&name).await {
        Ok(_) => {
            println!("deleted stream {name}");
            Ok(())
        }
        Err(err) if dlq_only => {
            // The default topology keeps dead letters in the primary stream.
            warn!(stream = %name, error = %err, "no dedicated DLQ stream; use purge --dlq");
            bail!("stream {name} not found")
        }
        Err(err) => Err(err).with_context(|| format!("delete stream {name}")),
    }
}

async fn handle_dlq(config: Config, limit: usize, replay: Option<u64>) -> Result<()> {
    let engine = Engine::builder(config.clone()).build()?;
    let handle = connect(&engine).await?;
    let entries = dlq::list_entries(
        &handle.jetstream,
        &config.stream_name(),
        &config.dlq_subject(),
        if replay.is_some() { 1000 } else { limit },
    )
    .await?;

    if let Some(sequence) = replay {
        let entry = entries
            .iter()
            .find(|e| e.sequence == sequence)
            .with_context(|| format!("no DLQ entry with sequence {sequence}"))?;
        dlq::replay_entry(&handle.jetstream, entry).await?;
        println!("replayed #{sequence} onto {}", entry.record.original_subject);
        return Ok(());
    }

    if entries.is_empty() {
        println!("no dead letters");
        return Ok(());
    }
    for entry in entries {
        println!(
            "#{seq} {subject} reason={reason} deliveries={deliveries} error={error:?}",
            seq = entry.sequence,
            subject = entry.record.original_subject,
            reason = entry.record.reason.as_str(),
            deliveries = entry.record.deliveries,
            error = entry.record.error,
        );
    }
    Ok(())
}

async fn connect(engine: &Engine) -> Result<courier_core::Handle> {
    // The engine owns the shared connection; reuse it instead of dialing raw.
    let publisher_handle = engine.connection_handle().await?;
    Ok(publisher_handle)
}
