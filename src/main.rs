//! PulseWire - heartbeat-supervised binary messaging
//!
//! Runs either side of a PulseWire connection from the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pulsewire::config::{self, Config};
use pulsewire::network::{Client, ClientError, ClientEvent, Server, ServerEvent};
use pulsewire::protocol::{self, Message, MessageType, SerializerAlgorithm};

/// PulseWire - heartbeat-supervised binary messaging
#[derive(Parser)]
#[command(name = "pulsewire")]
#[command(author = "PulseWire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Length-prefixed binary messaging with idle heartbeats", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept clients and drop the ones that go silent
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Runtime worker threads
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Connect to a server and keep the connection alive
    Client {
        /// Server host name or address
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds without writes before a heartbeat is sent
        #[arg(long)]
        heartbeat_secs: Option<u64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    init_logging(cli.verbose, &config.general.log_level);

    match cli.command {
        Commands::Server { port, bind, workers } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if let Some(workers) = workers {
                config.server.worker_threads = Some(workers);
            }

            let runtime = build_runtime(config.server.worker_threads)?;
            runtime.block_on(run_server(config))?;
        }
        Commands::Client {
            host,
            port,
            heartbeat_secs,
        } => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            if let Some(secs) = heartbeat_secs {
                config.client.writer_idle_secs = secs;
            }

            let runtime = build_runtime(None)?;
            runtime.block_on(run_client(config))?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else if output.is_some() {
                anyhow::bail!("--output requires --generate");
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// RUST_LOG wins over the configured level; --verbose wins over both
fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn build_runtime(worker_threads: Option<usize>) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = worker_threads {
        if threads == 0 {
            anyhow::bail!("worker thread count must be at least 1");
        }
        builder.worker_threads(threads);
    }
    Ok(builder.build()?)
}

/// Run the server until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    let net_config = config.server_network();
    let reader_idle = net_config.reader_idle;

    tracing::info!(
        "Starting PulseWire server '{}' on {}:{}",
        config.general.name,
        net_config.bind_address,
        net_config.port
    );

    let mut server = Server::new(net_config);
    let mut event_rx = server
        .take_event_receiver()
        .context("server event receiver already taken")?;

    // Start the server
    let bind_addr = server.start().await?;

    println!("\n========================================");
    println!("  PulseWire Server Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Listening: {}", bind_addr);
    println!("  Reader idle: {:?}", reader_idle);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { addr } => {
                        println!("+ Client connected: {}", addr);
                    }
                    ServerEvent::ClientDisconnected { addr, reason } => {
                        println!("- Client disconnected: {} ({})", addr, reason);
                    }
                    ServerEvent::MessageReceived { addr, message } => {
                        tracing::debug!("Message from {}: {:?}", addr, message);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;

    // Let sessions report their disconnects
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = event_rx.recv().await {
            if matches!(event, ServerEvent::Stopped) {
                break;
            }
        }
    })
    .await;

    tracing::info!("Server stopped");

    Ok(())
}

/// Run the client until Ctrl+C or the server drops the connection
async fn run_client(config: Config) -> anyhow::Result<()> {
    let net_config = config.client_network();
    let host = net_config.host.clone();
    let port = net_config.port;
    let writer_idle = net_config.writer_idle;

    let mut client = Client::new(net_config);
    let mut event_rx = client
        .take_event_receiver()
        .context("client event receiver already taken")?;

    // Connect to server
    println!("Connecting to {}:{}...", host, port);
    client
        .connect_configured()
        .await
        .with_context(|| format!("connecting to {}:{}", host, port))?;

    println!("\n========================================");
    println!("  PulseWire Client Connected");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Server: {}:{}", host, port);
    println!("  Heartbeat after: {:?}", writer_idle);
    println!("========================================");
    println!("\nPress Ctrl+C to disconnect.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Connected { server_addr } => {
                        tracing::info!("Connected to server: {}", server_addr);
                    }
                    ClientEvent::Disconnected { reason } => {
                        println!("Disconnected: {}", reason);
                        return Ok(());
                    }
                    ClientEvent::MessageReceived { message } => match message {
                        Message::Heartbeat(packet) => {
                            tracing::info!(
                                sequence_id = packet.sequence_id,
                                info = %packet.info,
                                "Heartbeat from server"
                            );
                        }
                    },
                    ClientEvent::Error { message } => {
                        tracing::error!("Client error: {}", message);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    match client.disconnect().await {
        Ok(()) | Err(ClientError::NotConnected) => {}
        Err(e) => return Err(e.into()),
    }
    tracing::info!("Client disconnected");

    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("PulseWire Protocol Information");
    println!("==============================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Magic: {:02x?}", protocol::MAGIC_BYTES);
    println!("Header Size: {} bytes", protocol::HEADER_SIZE);
    println!("Max Frame Length: {} bytes", protocol::DEFAULT_MAX_FRAME_LENGTH);

    println!("\nSerialization Algorithms:");
    for algorithm in SerializerAlgorithm::ALL {
        println!("  {:>3}  {}", algorithm.tag(), algorithm);
    }

    println!("\nMessage Types:");
    for message_type in MessageType::ALL {
        println!("  {:>3}  {}", message_type.tag(), message_type);
    }
}
