//! Conduit - vendor-neutral storage gateway

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use conduit_cli::{Gateway, GatewayConfig};
use conduit_storage::{stream, PutOptions, StorageDriver};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "Vendor-neutral object storage gateway")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CONDUIT_CONFIG")]
    config: Option<PathBuf>,

    /// Tenant the command runs as
    #[arg(short, long, env = "CONDUIT_TENANT")]
    tenant: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "CONDUIT_DEBUG")]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, env = "CONDUIT_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the assembled driver graph
    Health,
    /// Upload a file
    Put {
        container: String,
        artifact: String,
        file: PathBuf,
        /// Content-Type stored with the object
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Download an object (to stdout unless --output is given)
    Get {
        container: String,
        artifact: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove an object
    Rm { container: String, artifact: String },
    /// List artifacts in a container
    Ls {
        container: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Print a presigned URL
    Presign {
        method: String,
        bucket: String,
        key: String,
        /// Validity in seconds
        #[arg(long, default_value = "900")]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Setup logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("conduit={0},conduit_cli={0},conduit_core={0},conduit_storage={0}", log_level).into()
            }),
        )
        .with(args.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    let config = GatewayConfig::load(args.config.as_deref()).context("loading configuration")?;
    let gateway = Gateway::build(config).context("assembling driver graph")?;
    tracing::debug!(stack = %gateway.stack, "driver graph ready");

    let result = run(&gateway, args.tenant.as_deref(), args.command).await;
    gateway.shutdown();
    result
}

async fn run(gateway: &Gateway, tenant: Option<&str>, command: Command) -> anyhow::Result<()> {
    let scope = gateway.scope(tenant)?;
    let driver = &gateway.driver;

    match command {
        Command::Health => {
            driver
                .health_check(&scope)
                .await
                .with_context(|| format!("{} is unhealthy", driver.name()))?;
            if let Some(failover) = &gateway.failover {
                let health = failover.health();
                println!(
                    "primary: {}, secondary: {}",
                    if health.primary_healthy { "healthy" } else { "unhealthy" },
                    if health.secondary_healthy { "healthy" } else { "unhealthy" },
                );
            }
            println!("ok ({})", gateway.stack);
        }
        Command::Put {
            container,
            artifact,
            file,
            content_type,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let size = data.len();
            let mut options = PutOptions::default();
            if let Some(content_type) = content_type {
                options = options.with_content_type(content_type);
            }
            driver
                .put(&scope, &container, &artifact, stream::from_bytes(Bytes::from(data)), &options)
                .await?;
            tracing::info!(container = %container, artifact = %artifact, size, "stored");
        }
        Command::Get {
            container,
            artifact,
            output,
        } => {
            let mut body = driver.get(&scope, &container, &artifact).await?;
            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };
            while let Some(chunk) = body.next().await {
                sink.write_all(&chunk?).await?;
            }
            sink.flush().await?;
        }
        Command::Rm { container, artifact } => {
            driver.delete(&scope, &container, &artifact).await?;
        }
        Command::Ls { container, prefix } => {
            let mut keys = driver.list(&scope, &container, &prefix).await?;
            keys.sort();
            for key in keys {
                println!("{}", key);
            }
        }
        Command::Presign {
            method,
            bucket,
            key,
            ttl,
        } => {
            let url = gateway.presign(&method, &bucket, &key, Duration::from_secs(ttl))?;
            println!("{}", url);
        }
    }

    Ok(())
}
