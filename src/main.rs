use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use model_relay::{
    AppState, Backend, ForwardingProxy, KeyStore, ModelRegistry, RelayError, SessionVerifier,
    UsageLog, server,
};
use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Model-aware relay for OpenAI-style LLM backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay HTTP server.
    Serve(ServeArgs),
    /// Issue an API key for an owner and print it.
    CreateKey(CreateKeyArgs),
    /// Print every issued API key.
    ListKeys(StoreArgs),
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// SQLite database holding issued API keys.
    #[arg(long, env = "KEYS_DB_PATH", default_value = "data/keys.db")]
    db_path: String,
}

#[derive(Debug, Args)]
struct CreateKeyArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Owner the key is issued to.
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Comma separated backends, each `<url>[|<api_key>]`. The first one
    /// receives requests for models no backend lists.
    #[arg(
        long = "backend",
        value_delimiter = ',',
        env = "BACKEND_URLS",
        hide_env_values = true,
        required = true
    )]
    backends: Vec<Backend>,

    /// Directory holding the per-key usage shards.
    #[arg(long, env = "USAGE_DIR", default_value = "data/analytics")]
    usage_dir: String,

    /// HS256 secret that admin session tokens are signed with.
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    session_secret: String,

    /// Address to bind the relay to.
    #[arg(long, env = "RELAY_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the relay to.
    #[arg(long, env = "RELAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Seconds between model listing refreshes.
    #[arg(long, env = "MODEL_REFRESH_SECS", default_value_t = 60)]
    refresh_secs: u64,

    /// Per-backend timeout for a model listing request, in seconds.
    #[arg(long, env = "MODEL_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// How long to wait for a backend's response headers, in seconds.
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 120)]
    upstream_timeout_secs: u64,

    /// Days of usage history kept on disk.
    #[arg(long, env = "USAGE_RETENTION_DAYS", default_value_t = 7)]
    retention_days: i64,

    /// Seconds between usage retention passes.
    #[arg(long, env = "USAGE_PRUNE_SECS", default_value_t = 3600)]
    prune_secs: u64,

    /// Maximum accepted request body, in bytes.
    #[arg(long, env = "PAYLOAD_LIMIT", default_value_t = server::DEFAULT_BODY_LIMIT)]
    payload_limit: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => return run_server(args).await,
        Command::CreateKey(args) => create_key(args).await,
        Command::ListKeys(args) => list_keys(args).await,
    };

    if let Err(err) = result {
        report_error(&err);
        std::process::exit(1);
    }
    Ok(())
}

async fn create_key(args: CreateKeyArgs) -> Result<(), RelayError> {
    let store = KeyStore::open(&args.store.db_path).await?;
    let record = store.create(&args.owner).await?;
    print_json(&record);
    Ok(())
}

async fn list_keys(args: StoreArgs) -> Result<(), RelayError> {
    let store = KeyStore::open(&args.db_path).await?;
    print_json(&store.list().await);
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => println!("{pretty}"),
        Err(err) => eprintln!("error: failed to render output: {err}"),
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let keys = Arc::new(KeyStore::open(&args.store.db_path).await?);
    let usage = Arc::new(
        UsageLog::with_retention(&args.usage_dir, args.retention_days * model_relay::DAY_MS)
            .await?,
    );

    let client = Client::new();
    let registry = Arc::new(ModelRegistry::with_client(
        client.clone(),
        args.backends,
        Duration::from_secs(args.fetch_timeout_secs),
    ));
    registry.refresh().await;
    registry
        .clone()
        .spawn_refresh(Duration::from_secs(args.refresh_secs.max(1)));
    usage
        .clone()
        .spawn_retention(Duration::from_secs(args.prune_secs.max(1)));

    let proxy = ForwardingProxy::with_client(
        client,
        registry,
        Duration::from_secs(args.upstream_timeout_secs),
    );
    let state = AppState::new(
        keys,
        usage,
        proxy,
        SessionVerifier::new(args.session_secret.as_bytes()),
    )
    .with_body_limit(args.payload_limit);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(%addr, "starting model relay");
    server::serve(addr, state).await
}

fn report_error(err: &RelayError) {
    eprintln!("error: {err}");
    match err {
        RelayError::Database(db_err) => {
            eprintln!("  database: {db_err}");
        }
        RelayError::LockTimeout { attempts } => {
            eprintln!("  key store is held by another process ({attempts} attempts)");
        }
        _ => {}
    }
}
