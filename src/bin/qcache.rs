use clap::{Parser, Subcommand};
use querycache::{Backend, CacheClient, CacheOptions, Ttl};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "qcache", about = "Query cache inspection tool", version)]
struct Args {
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long, env = "QUERYCACHE_BACKEND")]
  backend: Option<Backend>,
  #[arg(short = 'H', long, env = "QUERYCACHE_HOST")]
  host: Option<String>,
  #[arg(short, long, env = "QUERYCACHE_PORT")]
  port: Option<u16>,
  #[arg(long, env = "QUERYCACHE_PREFIX")]
  prefix: Option<String>,
  #[arg(long)]
  serverless: bool,
  #[arg(long, default_value = "warn")]
  log_level: String,
  #[command(subcommand)]
  action: CacheAction,
}

#[derive(Subcommand)]
enum CacheAction {
  /// Get a cached value by key
  Get {
    /// The cache key (without prefix)
    key: String,
  },
  /// Set a JSON value with optional TTL
  Set {
    /// The cache key (without prefix)
    key: String,
    /// JSON value to store
    value: String,
    /// TTL in seconds (-1 = no expiry, 0 = mode default)
    #[arg(short, long, default_value = "-1", allow_hyphen_values = true)]
    ttl: i64,
  },
  /// Delete a key
  Del {
    /// The cache key (without prefix)
    key: String,
  },
  /// Delete every key under the prefix
  Clear,
  /// Connect and report connection state
  Status,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  // Load config: explicit path > auto-detect > defaults
  let mut options = if let Some(path) = &args.config {
    CacheOptions::from_file(path)?
  } else {
    CacheOptions::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(backend) = args.backend {
    options.backend = backend;
  }
  if let Some(host) = args.host {
    options.host = host;
  }
  if let Some(port) = args.port {
    options.port = port;
  }
  if let Some(prefix) = args.prefix {
    options.prefix = prefix;
  }
  if args.serverless {
    options.serverless_mode = true;
  }

  let client = CacheClient::from_options(options)?;
  let outcome = run_action(&client, &args.action).await;
  let _ = client.close().await;
  outcome
}

async fn run_action(client: &CacheClient, action: &CacheAction) -> Result<(), anyhow::Error> {
  match action {
    CacheAction::Get { key } => match client.get::<serde_json::Value>(key).await? {
      Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      None => println!("(nil)"),
    },
    CacheAction::Set { key, value, ttl } => {
      let value: serde_json::Value = serde_json::from_str(value)
        .map_err(|e| anyhow::anyhow!("Value must be valid JSON: {}", e))?;
      client.set(key, &value, Ttl::from(*ttl)).await?;
      println!("OK");
    }
    CacheAction::Del { key } => {
      client.del(key).await?;
      println!("OK");
    }
    CacheAction::Clear => {
      client.clear().await?;
      println!("OK");
    }
    CacheAction::Status => {
      let connected = client.connect().await;
      println!("backend:   {}", client.options().backend);
      println!("prefix:    {}", client.prefix());
      println!("status:    {}", client.status());
      if !connected {
        for error in client.recent_errors() {
          println!("error:     [{}] {}", error.at.to_rfc3339(), error.message);
        }
        return Err(anyhow::anyhow!(
          "Cache store at {}:{} is not reachable",
          client.options().host,
          client.options().port
        ));
      }
    }
  }
  Ok(())
}
