use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use shmbus_config::BusConfig;
use shmbus_core::{BrokerServer, BusClient, Topic};
use shmbus_repl::{TcpSource, TcpTarget};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shmbus", about = "Zero-copy shared-memory pub/sub bus with network replication")]
struct Cli {
    /// Optional TOML file with bus-wide defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bridge channel topics between hosts over TCP.
    #[command(subcommand)]
    Replication(ReplicationCommand),

    /// Synthetic producers and consumers for soak testing.
    #[command(subcommand)]
    Test(TestCommand),

    /// Reset a topic region, or remove a channel's request queue.
    Clear {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        topic: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReplicationCommand {
    /// Serve local topics to remote replication subscribers.
    Publish {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
    },

    /// Mirror topics from a remote source into a local broker.
    Subscribe {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
        /// Comma-separated list of topics to replicate.
        #[arg(long, value_delimiter = ',')]
        topics: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TestCommand {
    /// Publish integrity-checked random frames.
    Write {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 60)]
        count: u64,
        /// Publish rate in frames per second.
        #[arg(long, default_value_t = 18.0)]
        frequency: f64,
        /// Frame body size in bytes.
        #[arg(long, default_value_t = 3 * 1024 * 1024)]
        message_size: usize,
        /// Wait for Enter between frames.
        #[arg(long, default_value_t = false, action = ArgAction::Set)]
        interactive: bool,
    },

    /// Read and verify frames published by `test write`.
    Read {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        topic: String,
        /// Wait for Enter before starting to read.
        #[arg(long, default_value_t = false, action = ArgAction::Set)]
        interactive: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match BusConfig::load(path.display().to_string()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("shmbus: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => BusConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: &BusConfig) -> Result<()> {
    match command {
        Command::Replication(ReplicationCommand::Publish {
            channel,
            host,
            port,
        }) => replication_publish(&channel, &host, port),
        Command::Replication(ReplicationCommand::Subscribe {
            channel,
            host,
            port,
            topics,
        }) => replication_subscribe(&channel, &host, port, &topics, config),
        Command::Test(TestCommand::Write {
            channel,
            topic,
            count,
            frequency,
            message_size,
            interactive,
        }) => test_write(&channel, &topic, count, frequency, message_size, interactive, config),
        Command::Test(TestCommand::Read {
            channel,
            topic,
            interactive,
        }) => test_read(&channel, &topic, interactive),
        Command::Clear { channel, topic } => clear(&channel, topic.as_deref(), config),
    }
}

fn replication_publish(channel: &str, host: &str, port: u16) -> Result<()> {
    info!("starting replication publisher for channel '{channel}' on {host}:{port}");
    let _source = TcpSource::bind(channel, port)
        .with_context(|| format!("cannot start replication source on port {port}"))?;
    info!("waiting for subscription requests");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

fn replication_subscribe(
    channel: &str,
    host: &str,
    port: u16,
    topics: &[String],
    config: &BusConfig,
) -> Result<()> {
    info!("starting replication subscriber for channel '{channel}' from {host}:{port}");
    let broker = Arc::new(BrokerServer::new(channel).context("cannot start local broker")?);
    let target = TcpTarget::new(
        broker.clone(),
        host,
        port,
        config.message_count,
        config.buffer_bytes,
    );

    for topic in topics {
        info!("replicating topic '{topic}'");
        target
            .replicate_topic(topic)
            .with_context(|| format!("cannot replicate topic '{topic}'"))?;
    }

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

fn test_write(
    channel: &str,
    topic_name: &str,
    count: u64,
    frequency: f64,
    message_size: usize,
    interactive: bool,
    config: &BusConfig,
) -> Result<()> {
    anyhow::ensure!(frequency > 0.0, "frequency must be positive");

    let broker = BrokerServer::new(channel).context("cannot start broker")?;
    let topic = broker
        .create_topic(topic_name, config.message_count, config.buffer_bytes)
        .with_context(|| format!("cannot create topic '{topic_name}'"))?;

    let frame_len = shmbus_testframe::frame_size(message_size) as u64;
    anyhow::ensure!(
        frame_len <= topic.max_message_size(),
        "frame of {frame_len} bytes exceeds the topic buffer"
    );

    let period = Duration::from_secs_f64(1.0 / frequency);
    let mut rng = StdRng::from_entropy();
    info!("publishing {count} frames of {message_size} bytes at {frequency} Hz");

    for published in 0..count {
        if interactive {
            wait_for_enter("press Enter to publish the next frame")?;
        }
        let started = Instant::now();

        let mut scope = topic
            .publish(frame_len, 1)
            .context("publish failed")?;
        shmbus_testframe::fill(&mut rng, &mut scope.bytes_mut()[..frame_len as usize]);
        scope.commit(frame_len).context("commit failed")?;
        drop(scope);

        if (published + 1) % 10 == 0 {
            info!("published {}/{count} frames", published + 1);
        }
        if !interactive {
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }

    info!("done, letting readers drain");
    std::thread::sleep(Duration::from_secs(1));
    Ok(())
}

fn test_read(channel: &str, topic: &str, interactive: bool) -> Result<()> {
    let client = BusClient::new(channel).context("cannot start client")?;
    client.connect().context("cannot reach the broker")?;
    let mut cursor = client
        .subscribe(topic)
        .with_context(|| format!("cannot subscribe to '{topic}'"))?;
    info!("subscribed to '{topic}' on slot {}", cursor.slot_id());

    if interactive {
        wait_for_enter("press Enter to start reading")?;
    }

    let mut read = 0u64;
    let mut corrupt = 0u64;
    let mut idle_polls = 0u32;
    loop {
        let Some(accessor) = cursor
            .try_read_for(Duration::from_secs(1))
            .context("cursor read failed")?
        else {
            idle_polls += 1;
            // A quiet period after traffic means the writer is done.
            if read > 0 && idle_polls >= 10 {
                break;
            }
            continue;
        };
        idle_polls = 0;
        read += 1;

        if shmbus_testframe::verify(accessor.bytes()) {
            let age = shmbus_testframe::age(accessor.bytes()).unwrap_or_default();
            if read % 10 == 0 {
                info!("frame {read}: {} bytes, age {age:?}", accessor.size());
            }
        } else {
            corrupt += 1;
            warn!("frame {read} failed its integrity check");
        }
    }

    info!("read {read} frames, {corrupt} corrupt");
    anyhow::ensure!(corrupt == 0, "{corrupt} frames failed verification");
    Ok(())
}

fn clear(channel: &str, topic: Option<&str>, config: &BusConfig) -> Result<()> {
    match topic {
        Some(topic) => {
            let found =
                Topic::clear_if_exists(channel, topic, config.message_count, config.buffer_bytes)
                    .with_context(|| format!("cannot clear topic '{topic}'"))?;
            if found {
                info!("topic '{topic}' on channel '{channel}' cleared");
            } else {
                info!("no region found for topic '{topic}' on channel '{channel}'");
            }
        }
        None => {
            if BrokerServer::remove_channel(channel) {
                info!("request queue of channel '{channel}' removed");
            } else {
                info!("channel '{channel}' had no request queue");
            }
        }
    }
    Ok(())
}

fn wait_for_enter(prompt: &str) -> Result<()> {
    println!("{prompt}");
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("stdin closed")?;
    Ok(())
}
