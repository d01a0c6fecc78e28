use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use haven::cache::{CacheLayer, CacheStorage, Generations, SqliteStorage};
use haven::config::Config;
use haven::db::Database;
use haven::http::{Destination, Request};
use haven::logging;
use haven::network::HttpFetcher;
use haven::router::Router;
use haven::vault::{Record, SqliteRecordStore, Vault, SALT_LEN};
use haven::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "haven")]
#[command(about = "Offline-first request cache and encrypted local vault")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/haven/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log debug output
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell for the configured cache version
  Install {
    /// Activate right away even if an older version is still in control
    #[arg(long)]
    skip_waiting: bool,
  },

  /// Activate the installed version and delete stale cache generations
  Activate,

  /// Route one request through the cache and print the response body
  Fetch {
    /// Absolute URL, or a path relative to the configured origin
    target: String,

    /// Treat the request as a top-level page load
    #[arg(long)]
    navigate: bool,

    /// Kind of resource requested
    #[arg(long, value_enum, default_value_t = Destination::Other)]
    destination: Destination,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },

  /// List cache generations
  Caches,

  /// Encrypted record vault (secret read from HAVEN_VAULT_SECRET)
  Vault {
    #[command(subcommand)]
    command: VaultCommand,
  },
}

#[derive(Subcommand, Debug)]
enum VaultCommand {
  /// Encrypt and store a JSON object
  Save { record: String },

  /// Decrypt and print every stored record
  List,

  /// Derive a key and print its salt
  DeriveKey {
    /// Hex-encoded 16-byte salt; a random one is generated if omitted
    #[arg(long)]
    salt: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Install { skip_waiting } => install(&config, skip_waiting).await,
    Command::Activate => activate(&config),
    Command::Fetch {
      target,
      navigate,
      destination,
      method,
      data,
    } => fetch(&config, &target, navigate, destination, &method, data).await,
    Command::Caches => list_caches(&config),
    Command::Vault { command } => run_vault(&config, command).await,
  }
}

/// Cache storage, generations and network client shared by the cache commands.
struct CacheServices {
  storage: Arc<SqliteStorage>,
  /// Configured version, installed and activated by the worker
  generations: Arc<Generations>,
  /// Last activated version, read by the router
  serving: Arc<Generations>,
  fetcher: Arc<HttpFetcher>,
}

impl CacheServices {
  fn open(config: &Config) -> Result<Self> {
    let db = Database::open(&config.database_path()?)?;
    let storage = Arc::new(SqliteStorage::new(db));
    let serving = Generations::serving(storage.as_ref(), &config.cache.version)?;
    Ok(Self {
      storage,
      generations: Arc::new(Generations::new(&config.cache.version)),
      serving: Arc::new(serving),
      fetcher: Arc::new(HttpFetcher::new()?),
    })
  }

  fn worker(&self, config: &Config) -> Worker<SqliteStorage, HttpFetcher> {
    Worker::new(
      config.origin.clone(),
      config.cache.precache.clone(),
      Arc::clone(&self.generations),
      Arc::clone(&self.storage),
      Arc::clone(&self.fetcher),
    )
  }

  fn router(&self, config: &Config) -> Result<Router<SqliteStorage, HttpFetcher>> {
    let cache = CacheLayer::new(Arc::clone(&self.storage), Arc::clone(&self.serving));
    Router::new(
      config.origin.clone(),
      &config.cache,
      cache,
      Arc::clone(&self.fetcher),
    )
  }
}

async fn install(config: &Config, skip_waiting: bool) -> Result<()> {
  let services = CacheServices::open(config)?;
  let mut worker = services.worker(config);
  if skip_waiting || config.lifecycle.skip_waiting_on_install {
    worker.skip_waiting();
  }

  let had_previous = worker.has_previous_version()?;
  let count = worker.install().await?;

  if worker.is_waiting()? {
    println!(
      "Installed cache version {} ({} entries).",
      config.cache.version, count
    );
    println!("New content available; run `haven activate` to switch to it.");
    return Ok(());
  }

  let deleted = worker.activate()?;
  if had_previous {
    println!(
      "Activated cache version {}; removed {} stale generation(s).",
      config.cache.version,
      deleted.len()
    );
  } else {
    println!("Content cached for offline use ({} entries).", count);
  }
  Ok(())
}

fn activate(config: &Config) -> Result<()> {
  let services = CacheServices::open(config)?;
  let mut worker = services.worker(config);

  if !worker.resume_installed()? {
    return Err(eyre!(
      "Cache version {} is not installed. Run `haven install` first.",
      config.cache.version
    ));
  }
  worker.post_message(r#"{"type":"SKIP_WAITING"}"#);

  let deleted = worker.activate()?;
  for name in &deleted {
    println!("Deleted {}", name);
  }
  println!("Cache version {} is active.", config.cache.version);
  Ok(())
}

async fn fetch(
  config: &Config,
  target: &str,
  navigate: bool,
  destination: Destination,
  method: &str,
  data: Option<String>,
) -> Result<()> {
  let url = match Url::parse(target) {
    Ok(url) => url,
    Err(_) => config
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid target {}: {}", target, e))?,
  };
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

  let mut request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url).with_destination(destination)
  };
  request = request.with_method(method);
  if let Some(body) = data {
    request = request.with_body(body);
  }

  let services = CacheServices::open(config)?;
  let router = services.router(config)?;
  let result = router.handle(&request).await;
  router.settle().await;

  let served = result.map_err(|e| eyre!("{}", e))?;
  eprintln!(
    "{} {} ({})",
    served.data.status,
    request.url,
    served.source.as_str()
  );
  println!("{}", String::from_utf8_lossy(&served.data.body));
  Ok(())
}

fn list_caches(config: &Config) -> Result<()> {
  let services = CacheServices::open(config)?;
  for name in services.storage.generation_names()? {
    let count = services.storage.entry_count(&name)?;
    let state = if services.serving.is_live(&name) {
      "serving"
    } else if services.generations.is_live(&name) {
      "waiting"
    } else {
      "stale"
    };
    println!("{:<24} {:>6} entries  {}", name, count, state);
  }
  Ok(())
}

async fn run_vault(config: &Config, command: VaultCommand) -> Result<()> {
  let db = Database::open(&config.database_path()?)?;
  let vault = Vault::new(Arc::new(SqliteRecordStore::new(db)));
  let secret = Config::get_vault_secret()?;

  match command {
    VaultCommand::Save { record } => {
      let record: Record = serde_json::from_str(&record)
        .map_err(|e| eyre!("Record must be a JSON object: {}", e))?;
      let id = vault.save_entry(&secret, &record).await?;
      println!("Saved entry {}", id);
    }
    VaultCommand::List => {
      let entries: Vec<_> = vault
        .get_all_entries(&secret)
        .await?
        .iter()
        .map(|entry| entry.to_json())
        .collect();
      let output = serde_json::to_string_pretty(&entries)
        .map_err(|e| eyre!("Failed to format entries: {}", e))?;
      println!("{}", output);
    }
    VaultCommand::DeriveKey { salt } => {
      let salt = salt.as_deref().map(parse_salt).transpose()?;
      let key = vault.derive_key(&secret, salt).await?;
      println!("salt: {}", hex::encode(key.salt()));
    }
  }
  Ok(())
}

fn parse_salt(raw: &str) -> Result<[u8; SALT_LEN]> {
  let bytes = hex::decode(raw).map_err(|e| eyre!("Salt must be hex: {}", e))?;
  bytes
    .try_into()
    .map_err(|_| eyre!("Salt must be exactly {} bytes", SALT_LEN))
}
