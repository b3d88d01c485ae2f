use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vmsync::api::{
  HttpTransport, Record, ReconciliationClient, ResourceKey, ResourceKind, UserProfile,
  VehicleRecord,
};
use vmsync::cache::{CacheSource, TtlCache};
use vmsync::config::Config;
use vmsync::error::ApiError;
use vmsync::logging;
use vmsync::pending::{spawn_reconnect_retries, WriteState};
use vmsync::poller::{ChangePoller, ChangeProbe};
use vmsync::store::{DurableStores, SqliteStorage};

#[derive(Parser, Debug)]
#[command(name = "vmsync")]
#[command(about = "Offline-first sync client for the vehicle marketplace")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/vmsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Store the API access token
  Login {
    /// Token to store (default: $VMSYNC_TOKEN)
    #[arg(long)]
    token: Option<String>,
  },
  /// Forget the stored access token
  Logout,
  /// Fetch a resource, serving local copies when possible
  Fetch {
    kind: ResourceKind,
    /// Resource id (not needed for the profile)
    id: Option<String>,
    /// Discard local copies and fetch from the server
    #[arg(long)]
    force: bool,
  },
  /// Print changes to resources as they happen (e.g. vehicle:42)
  Watch {
    #[arg(required = true)]
    resources: Vec<ResourceKey>,
  },
  /// Retry every pending write once
  Sync,
  /// List writes not yet acknowledged by the server
  Pending,
  /// Drop every cached response
  ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.data_dir()?)?;

  let storage = SqliteStorage::open(Some(&config.storage_path()?))?;
  let stores = DurableStores::with_sqlite(&storage);
  let transport = Arc::new(HttpTransport::new(
    &config.api.base_url,
    config.request_timeout(),
  )?);
  let cache = TtlCache::new(stores.clone())
    .with_prefix(config.cache.key_prefix.clone())
    .with_max_age(config.cache_max_age());
  let client = Arc::new(
    ReconciliationClient::new(transport, stores)
      .with_cache(cache)
      .with_config(config.client_config()),
  );

  match args.command {
    Command::Login { token } => {
      let token = match token {
        Some(t) => t,
        None => Config::get_api_token()?,
      };
      if !client.store_token(token.trim()) {
        return Err(eyre!("Failed to store access token"));
      }
      println!("Token stored.");
    }
    Command::Logout => {
      client.clear_token();
      println!("Token removed.");
    }
    Command::Fetch { kind, id, force } => {
      resume_pending(&client).await;
      let key = match (kind, id) {
        (ResourceKind::Profile, _) => ResourceKey::profile(),
        (kind, Some(id)) => ResourceKey::new(kind, id),
        (kind, None) => return Err(eyre!("An id is required for {}", kind.as_str())),
      };
      fetch_and_print(&client, &key, force).await?;
    }
    Command::Watch { resources } => {
      resume_pending(&client).await;
      watch(client, &config, resources).await?;
    }
    Command::Sync => {
      let summary = client.resume_pending().await;
      println!(
        "synced: {}, failed: {}, rejected: {}, skipped: {}",
        summary.synced, summary.failed, summary.rejected, summary.skipped
      );
    }
    Command::Pending => {
      let writes = client.pending().pending();
      if writes.is_empty() {
        println!("No pending writes.");
      }
      for write in writes {
        let state = match &write.state {
          WriteState::PendingWithError { error, at } => format!("error at {}: {}", at, error),
          WriteState::PendingWithServer => "waiting for server".to_string(),
          WriteState::Synced => "synced".to_string(),
        };
        println!(
          "{:<28} {:?} {} (attempts: {}) {}",
          write.resource.to_string(),
          write.method,
          write.path,
          write.attempts,
          state
        );
      }
    }
    Command::ClearCache => {
      client.cache().clear_all();
      println!("Cache cleared.");
    }
  }

  Ok(())
}

async fn resume_pending(client: &ReconciliationClient) {
  if client.pending().pending().is_empty() {
    return;
  }
  let summary = client.resume_pending().await;
  info!(
    synced = summary.synced,
    failed = summary.failed,
    rejected = summary.rejected,
    skipped = summary.skipped,
    "resumed pending writes"
  );
}

async fn fetch_and_print(client: &ReconciliationClient, key: &ResourceKey, force: bool) -> Result<()> {
  let (value, source) = match key.kind {
    ResourceKind::Profile => {
      let fetched = client.fetch_resource::<UserProfile>(key, force).await?;
      (fetched.data.to_value(), fetched.source)
    }
    ResourceKind::Vehicle | ResourceKind::SellRequest => {
      let fetched = client.fetch_resource::<VehicleRecord>(key, force).await?;
      (fetched.data.to_value(), fetched.source)
    }
  };

  if source == CacheSource::Offline {
    eprintln!("(offline, showing the last known copy)");
  }
  println!("{}", serde_json::to_string_pretty(&value)?);
  Ok(())
}

async fn watch(
  client: Arc<ReconciliationClient>,
  config: &Config,
  resources: Vec<ResourceKey>,
) -> Result<()> {
  let poller_config = config.poller_config();
  let interval = poller_config.interval;
  let probe: Arc<dyn ChangeProbe> = client.clone();
  let poller = ChangePoller::create(probe, client.subscriptions(), poller_config);

  for key in resources {
    if let Err(e) = fetch_and_print(&client, &key, false).await {
      warn!(%key, error = %e, "initial fetch failed");
      eprintln!("{}: {}", key, e);
    }
    poller.subscribe(key, |event| {
      println!("{} changed:", event.resource);
      println!("{}", serde_json::to_string_pretty(&event.value)?);
      Ok(())
    });
  }

  let (online, monitor) = spawn_connectivity_monitor(client.clone(), interval);
  let retries = spawn_reconnect_retries(client, online);

  tokio::signal::ctrl_c().await?;
  poller.dispose();
  monitor.abort();
  retries.abort();
  Ok(())
}

/// Track connectivity by revalidating the profile each interval.
fn spawn_connectivity_monitor(
  client: Arc<ReconciliationClient>,
  interval: Duration,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
  let (tx, rx) = watch::channel(true);
  let handle = tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let online = !matches!(
        client.check_for_change(&ResourceKey::profile()).await,
        Err(ApiError::Transient(_))
      );
      tx.send_if_modified(|current| {
        let changed = *current != online;
        *current = online;
        changed
      });
    }
  });
  (rx, handle)
}
