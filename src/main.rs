use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use outpost::config::{Config, SeedManifest};
use outpost::fetch::{Destination, FetchRouter, HttpFetcher, Request, ResponseSource};
use outpost::lifecycle::{Activation, ClientRegistry, LifecycleController};
use outpost::queue::{MutationQueue, CONNECTIVITY_TAG};
use outpost::store::{GenerationStore, SqliteStore};

const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Offline-first response cache and fetch-routing layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outpost/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Seed the configured generation and activate it
  Install {
    /// Seed only; leave the previous generation serving
    #[arg(long)]
    no_activate: bool,
  },
  /// List generations and queued mutations
  Status,
  /// Deliver the connectivity-restored signal to the mutation queue
  Drain,
  /// Route one request through the cache layer
  Fetch {
    url: String,
    /// document, script, style, font, image, media or worker
    #[arg(long, default_value = "document")]
    destination: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("outpost=info")),
    )
    .with_writer(writer)
    .init();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Install { no_activate } => install(&config, no_activate).await,
    Command::Status => status(&config),
    Command::Drain => drain().await,
    Command::Fetch { url, destination } => fetch(&config, &url, &destination).await,
  }
}

async fn install(config: &Config, no_activate: bool) -> Result<()> {
  let manifest = SeedManifest::from_config(config)?;
  let store = Arc::new(SqliteStore::open_default()?);
  let network = Arc::new(HttpFetcher::new(NETWORK_TIMEOUT)?);
  let mut controller = LifecycleController::new(store, network, &config.cache.generation);

  controller.install(&manifest).await?;
  println!(
    "Seeded {} with {} entries",
    config.cache.generation,
    manifest.entries().len()
  );

  if no_activate {
    return Ok(());
  }

  // A fresh install has no old clients to wait on; activate right away.
  controller.skip_waiting();
  let mut clients = ClientRegistry::new();
  match controller.activate(&mut clients).await? {
    Activation::Activated { pruned } => {
      for name in &pruned {
        println!("Pruned stale generation {name}");
      }
      println!("Activated {}", config.cache.generation);
    }
    Activation::Waiting => println!("Waiting on clients controlled by an older version"),
  }

  Ok(())
}

fn status(config: &Config) -> Result<()> {
  let store = SqliteStore::open_default()?;
  let names = store.list_generation_names()?;
  if names.is_empty() {
    println!("No generations installed");
  } else {
    for name in &names {
      let marker = if *name == config.cache.generation {
        " (current)"
      } else {
        ""
      };
      println!("{name}{marker}");
    }
  }

  let queue = MutationQueue::open_default()?;
  println!("{} queued mutation(s)", queue.len()?);

  Ok(())
}

async fn drain() -> Result<()> {
  let queue = MutationQueue::open_default()?;
  let network = HttpFetcher::new(NETWORK_TIMEOUT)?;

  if let Some(report) = queue.on_signal(CONNECTIVITY_TAG, &network).await? {
    println!(
      "Delivered {} mutation(s), {} remaining",
      report.delivered, report.remaining
    );
    if let Some(id) = report.halted_on {
      println!("Halted on mutation {id}; it stays at the front of the queue");
    }
  }

  Ok(())
}

async fn fetch(config: &Config, url: &str, destination: &str) -> Result<()> {
  let manifest = SeedManifest::from_config(config)?;
  let store = Arc::new(SqliteStore::open_default()?);
  let network = Arc::new(HttpFetcher::new(NETWORK_TIMEOUT)?);
  let generation = store.open(&config.cache.generation)?;
  let router = FetchRouter::new(store, network, generation, manifest.fallback().clone());

  let url = url::Url::parse(url)?;
  let request = Request::get(url).with_destination(parse_destination(destination)?);
  let routed = router.handle(request).await?;

  let source = match routed.source {
    ResponseSource::Network => "network",
    ResponseSource::Cache => "cache",
    ResponseSource::Fallback => "fallback",
  };
  println!(
    "{} via {}, {} bytes",
    routed.response.status,
    source,
    routed.response.body_len()
  );

  Ok(())
}

fn parse_destination(s: &str) -> Result<Destination> {
  match s {
    "document" => Ok(Destination::Document),
    "script" => Ok(Destination::Script),
    "style" => Ok(Destination::Style),
    "font" => Ok(Destination::Font),
    "image" => Ok(Destination::Image),
    "media" => Ok(Destination::Media),
    "worker" => Ok(Destination::Worker),
    other => Err(eyre!("Unknown destination: {other}")),
  }
}
