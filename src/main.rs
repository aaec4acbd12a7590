use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memring::config::{Config, ConfigError};
use memring::utils::{format_bytes, format_duration, printable, split_server_list};
use memring::{Client, Dispatcher, MemringError, StoreOptions};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memring")]
#[command(about = "Pipelining memcached binary-protocol client with consistent hashing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "memring team")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Comma separated servers, overriding the configuration file
    #[arg(short, long, global = true)]
    servers: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a key
    Get { key: String },
    /// Store a key
    Set {
        key: String,
        value: String,
        /// Expiration in seconds (0 = never)
        #[arg(short, long, default_value_t = 0)]
        expiration: u32,
        /// Opaque client flags stored with the item
        #[arg(short, long, default_value_t = 0)]
        flags: u32,
        /// Only store if the item still has this CAS value
        #[arg(long)]
        cas: Option<u64>,
    },
    /// Delete a key
    Delete { key: String },
    /// Increment a counter, creating it with `initial` when missing
    Incr {
        key: String,
        #[arg(default_value_t = 1)]
        delta: u64,
        #[arg(short, long)]
        initial: Option<u64>,
    },
    /// Show per-server state and counters, optionally with server STAT output
    Stats {
        /// Also query every server with STAT
        #[arg(long)]
        server_stats: bool,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { output } => generate_config(output),
        Commands::Validate => validate_config(cli.config),
        Commands::Version => {
            show_version();
            Ok(())
        }
        command => {
            let config = load_config(cli.config, cli.servers)?;
            init_logging(&config)?;
            run_command(&config, command).await
        }
    }
}

fn load_config(path: Option<PathBuf>, servers: Option<String>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from_file(&path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(servers) = servers {
        config.servers = split_server_list(&servers);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_command(config: &Config, command: Commands) -> Result<()> {
    let (client, handle) = Dispatcher::spawn(config)?;
    debug!("Dispatcher started for {} servers", config.servers.len());

    let started = Instant::now();
    let outcome = execute(&client, command).await;
    debug!("Command finished in {}", format_duration(started.elapsed()));

    client.stop();
    handle.await.context("Dispatcher task failed")?;
    outcome
}

async fn execute(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key } => match client.get_item(key.clone()).await? {
            Some(item) => println!("{} (flags {}, cas {})", printable(&item.value), item.flags, item.cas),
            None => bail!("key '{}' not found", key),
        },
        Commands::Set {
            key,
            value,
            expiration,
            flags,
            cas,
        } => {
            let options = StoreOptions::expiring(expiration)
                .with_flags(flags)
                .with_cas(cas.unwrap_or(0));
            match client.set_with(key.clone(), value, options).await {
                Ok(cas) => println!("STORED (cas {})", cas),
                Err(MemringError::KeyExists) => bail!("key '{}' was modified (CAS mismatch)", key),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Delete { key } => {
            if client.delete(key.clone()).await? {
                println!("DELETED");
            } else {
                bail!("key '{}' not found", key);
            }
        }
        Commands::Incr {
            key,
            delta,
            initial,
        } => match client.increment(key.clone(), delta, initial).await {
            Ok(value) => println!("{}", value),
            Err(MemringError::NotFound) => bail!("counter '{}' not found", key),
            Err(e) => return Err(e.into()),
        },
        Commands::Stats { server_stats } => print_stats(client, server_stats).await?,
        Commands::Config { .. } | Commands::Validate | Commands::Version => {}
    }
    Ok(())
}

async fn print_stats(client: &Client, server_stats: bool) -> Result<()> {
    for server in client.stats().await? {
        println!("{} [{}] weight {}", server.address, server.state, server.weight);
        println!("  connection:   {}", server.connection);
        println!("  ring points:  {}", server.ring_points);
        println!(
            "  commands:     {} submitted, {} completed, {} failed, {} timed out",
            server.counters.submitted,
            server.counters.completed,
            server.counters.failed,
            server.counters.timeouts
        );
        println!(
            "  traffic:      {} written, {} read",
            format_bytes(server.io.bytes_written),
            format_bytes(server.io.bytes_read)
        );
        if let Some(at) = server.last_failure {
            println!(
                "  last failure: {} ago ({} consecutive)",
                format_duration(at.elapsed()),
                server.consecutive_failures
            );
        }

        if server_stats {
            match client.stat(server.address.clone(), None).await {
                Ok(entries) => {
                    for (name, value) in entries {
                        println!("    {} = {}", name, value);
                    }
                }
                Err(e) => println!("    STAT failed: {}", e),
            }
        }
    }
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the server list and run:");
    println!("  memring --config {:?} stats", output);

    Ok(())
}

fn validate_config(path: Option<PathBuf>) -> Result<()> {
    let Some(path) = path else {
        bail!("--config is required for validate");
    };
    println!("Validating configuration file: {:?}", path);

    match Config::load_from_file(&path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Servers: {}", config.servers.len());
            for (i, server) in config.servers.iter().enumerate() {
                println!("    {}: {}", i + 1, server);
            }
            println!("  Max retries: {}", config.max_retries);
            println!(
                "  Timeouts: connect {}, command {}",
                format_duration(config.connect_timeout()),
                format_duration(config.command_timeout())
            );
            println!(
                "  Credentials: {}",
                if config.credentials.is_some() { "configured" } else { "none" }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
                other => eprintln!("  {}", other),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("memring v{}", env!("CARGO_PKG_VERSION"));
    println!("Pipelining memcached binary-protocol client");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Weighted consistent hashing (MD5 ring)");
    println!("  • Pipelined requests over one connection per server");
    println!("  • Deadlines, retries and failover with backoff");
    println!("  • SASL PLAIN authentication");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("memring={}", config.logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match config.logging.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
