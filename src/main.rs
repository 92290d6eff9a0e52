mod api;
mod cache;
mod clock;
mod config;
mod logging;
mod mutation;
mod notify;
mod retry;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use api::{Client, Collection, Hub, KnowledgeArticle, NewClient, RestClient, Task, TeamMember};
use cache::{CacheLayer, CacheResult, CacheStorage, MemoryStorage, SqliteStorage};
use clock::{Clock, SystemClock};
use config::Config;
use notify::NotificationService;
use sync::Reconciler;

type Notifications = tokio::sync::mpsc::UnboundedReceiver<notify::Notification>;

#[derive(Parser, Debug)]
#[command(name = "hubsync")]
#[command(about = "Offline-tolerant command line client for the Client Hub backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hubsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log to stderr at debug level instead of the log file
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print a collection, cache first
  List {
    #[arg(value_enum)]
    collection: Collection,
  },
  /// Create a client
  CreateClient {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    company: Option<String>,
  },
  /// Change fields of a cached client
  UpdateClient {
    id: i64,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    status: Option<String>,
  },
  /// Delete a client
  DeleteClient { id: i64 },
  /// Mark a cached task completed
  CompleteTask { id: i64 },
  /// Refetch every configured collection once
  Sync,
  /// Keep syncing in the background; each line on stdin forces a sync
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.log, args.verbose)?;

  if config.cache.persist {
    let storage = match &config.cache.path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    run(config, storage, args.command).await
  } else {
    run(config, MemoryStorage::new(), args.command).await
  }
}

async fn run<S: CacheStorage>(config: Config, storage: S, command: Command) -> Result<()> {
  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let notifier = Arc::new(NotificationService::with_clock(Arc::clone(&clock)));
  let cache = CacheLayer::new(storage)
    .with_stale_time(config.cache.stale_time()?)
    .with_clock(Arc::clone(&clock));
  let hub = Hub::new(
    RestClient::new(&config)?,
    cache.clone(),
    config.retry.policy(),
    Arc::clone(&notifier),
  )?;
  let reconciler = Arc::new(Reconciler::new(
    cache,
    Arc::clone(&notifier),
    clock,
    config.sync.options(),
  ));

  // Notifications raised by one-shot commands are printed after the command
  let mut notifications = notifier.subscribe();
  let result = execute(&hub, reconciler, &mut notifications, command).await;

  while let Ok(notification) = notifications.try_recv() {
    eprintln!("{}", notification);
  }
  let attempts = hub.retrier().attempts();
  if result.is_err() && attempts > 1 {
    eprintln!("Gave up after {} attempts", attempts);
  }
  notifier.shutdown();
  result
}

async fn execute<S: CacheStorage>(
  hub: &Hub<S>,
  reconciler: Arc<Reconciler<S>>,
  notifications: &mut Notifications,
  command: Command,
) -> Result<()> {
  match command {
    Command::List { collection } => list(hub, collection).await,
    Command::CreateClient {
      name,
      email,
      phone,
      company,
    } => {
      let created = hub
        .create_client(NewClient {
          name,
          email,
          phone,
          company,
        })
        .await?;
      print_json(&created)
    }
    Command::UpdateClient {
      id,
      name,
      email,
      phone,
      company,
      status,
    } => {
      let clients = hub.list::<Client>(Collection::Clients).await?.data;
      let current = clients
        .into_iter()
        .find(|c| c.id == id)
        .ok_or_else(|| eyre!("Client {} not found", id))?;
      let updated = Client {
        name: name.unwrap_or(current.name),
        email: email.unwrap_or(current.email),
        phone: phone.or(current.phone),
        company: company.or(current.company),
        status: status.unwrap_or(current.status),
        ..current
      };
      print_json(&hub.update_client(updated).await?)
    }
    Command::DeleteClient { id } => {
      hub.delete_client(id).await?;
      println!("Deleted client {}", id);
      Ok(())
    }
    Command::CompleteTask { id } => {
      // Make sure the task list is cached before looking the task up
      hub.list::<Task>(Collection::Tasks).await?;
      print_json(&hub.complete_task(id).await?)
    }
    Command::Sync => {
      let report = reconciler.force_sync().await;
      println!(
        "Refreshed {} collection(s), {} failed, {} overdue task(s) at {}",
        report.refreshed,
        report.failed,
        report.overdue,
        report.finished_at.format("%Y-%m-%d %H:%M:%S")
      );
      Ok(())
    }
    Command::Watch => watch(reconciler, notifications).await,
  }
}

async fn list<S: CacheStorage>(hub: &Hub<S>, collection: Collection) -> Result<()> {
  match collection {
    Collection::Clients => print_result(hub.list::<Client>(collection).await?),
    Collection::Tasks => print_result(hub.list::<Task>(collection).await?),
    Collection::TeamMembers => print_result(hub.list::<TeamMember>(collection).await?),
    Collection::KnowledgeArticles => print_result(hub.list::<KnowledgeArticle>(collection).await?),
    Collection::Statistics => match hub.statistics().await? {
      Some(stats) => print_json(&stats),
      None => Err(eyre!("No statistics available")),
    },
  }
}

fn print_result<T: Serialize>(result: CacheResult<Vec<T>>) -> Result<()> {
  match result.cached_at {
    Some(at) => eprintln!(
      "({}, cached {})",
      result.source.label(),
      at.format("%Y-%m-%d %H:%M:%S")
    ),
    None => eprintln!("({})", result.source.label()),
  }
  print_json(&result.data)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", out);
  Ok(())
}

async fn watch<S: CacheStorage>(
  reconciler: Arc<Reconciler<S>>,
  notifications: &mut Notifications,
) -> Result<()> {
  reconciler.sync().await;
  eprintln!("status: {}", reconciler.status().as_str());

  let handle = Arc::clone(&reconciler).spawn();
  let mut state = reconciler.watch_state();
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut stdin_open = true;
  info!("watching for changes");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = state.changed() => {
        if changed.is_err() {
          break;
        }
        let current = *state.borrow_and_update();
        if !current.is_syncing {
          eprintln!("status: {}", reconciler.status().as_str());
        }
      }
      Some(notification) = notifications.recv() => {
        println!("{} {}", notification.raised_at.format("%H:%M:%S"), notification);
      }
      line = lines.next_line(), if stdin_open => match line {
        Ok(Some(_)) => handle.trigger(),
        Ok(None) => stdin_open = false,
        Err(e) => {
          debug!(error = %e, "stdin closed");
          stdin_open = false;
        }
      },
    }
  }

  handle.shutdown();
  Ok(())
}
