mod cache;
mod config;
mod dashboard;
mod db;
mod logging;
mod replay;
mod sync;
mod widget;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use cache::{CacheBackend, CacheManager, MemoryCache, NoopCache, SqliteCache};
use config::{CacheBackendKind, Config};
use dashboard::{CachedDashboardClient, DashboardSession, SessionOptions, StackLayout};
use db::{DurableStore, MemoryStore, SqliteStore};
use widget::{Widget, WidgetId, WidgetPatch};

#[derive(Parser, Debug)]
#[command(name = "dashsync")]
#[command(about = "Optimistic widget sync and cache-consistency engine for dashboards")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/dashsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Use an in-memory store and cache; nothing is persisted
  #[arg(long, global = true)]
  memory: bool,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List your dashboards
  Dashboards,
  /// List the widgets of a dashboard
  Widgets { dashboard: String },
  /// Create an empty dashboard
  NewDashboard { name: String },
  /// Rename a saved widget
  Rename {
    dashboard: String,
    widget: String,
    title: String,
  },
  /// Delete a saved widget
  Remove { dashboard: String, widget: String },
  /// Play an editing script against a dashboard
  Replay { dashboard: String, script: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let log_dir = if args.log_stderr {
    None
  } else {
    Some(Config::data_dir()?.join("logs"))
  };
  let _log_guard = logging::init(log_dir.as_deref())?;

  let cache = build_cache(&config, args.memory)?;

  if args.memory {
    let store = Arc::new(MemoryStore::new());
    // Nothing exists yet in memory; give the replay target a home
    if let Command::Replay { dashboard, .. } = &args.command {
      store.insert_dashboard(dashboard, &config.user_id, dashboard);
    }
    execute(store, cache, &config, args.command).await
  } else {
    let store = Arc::new(SqliteStore::open(&config.store_path()?)?);
    execute(store, cache, &config, args.command).await
  }
}

fn build_cache(config: &Config, memory: bool) -> Result<CacheManager> {
  let backend: Arc<dyn CacheBackend> = match (memory, config.cache.backend) {
    (_, CacheBackendKind::None) => Arc::new(NoopCache),
    (true, _) | (false, CacheBackendKind::Memory) => Arc::new(MemoryCache::new()),
    (false, CacheBackendKind::Sqlite) => Arc::new(SqliteCache::open(&config.cache_path()?)?),
  };
  Ok(
    CacheManager::new(backend, config.cache.namespace.clone())
      .with_ttl_policy(config.cache.ttl.policy()),
  )
}

async fn execute<D: DurableStore>(
  store: Arc<D>,
  cache: CacheManager,
  config: &Config,
  command: Command,
) -> Result<()> {
  let client = CachedDashboardClient::new(store, cache, config.user_id.clone());

  match command {
    Command::Dashboards => {
      let dashboards = client.list_dashboards().await?;
      if dashboards.is_empty() {
        println!("No dashboards for {}", config.user_id);
      }
      for d in dashboards {
        println!(
          "{:<38} {:<30} {:>3} widgets  updated {}",
          d.id,
          d.name,
          d.widget_count,
          d.updated_at.format("%Y-%m-%d %H:%M")
        );
      }
    }
    Command::Widgets { dashboard } => {
      print_widgets(&client.list_widgets(&dashboard).await?);
    }
    Command::NewDashboard { name } => {
      let summary = client.create_dashboard(&name).await?;
      println!("{}", summary.id);
    }
    Command::Rename {
      dashboard,
      widget,
      title,
    } => {
      client
        .update_widget(&dashboard, &WidgetId::new(widget), WidgetPatch::title(title))
        .await?;
    }
    Command::Remove { dashboard, widget } => {
      client
        .delete_widget(&dashboard, &WidgetId::new(widget))
        .await?;
    }
    Command::Replay { dashboard, script } => {
      let script = replay::Script::load(&script)?;
      let options = SessionOptions {
        debounce: config.sync.debounce(),
        retry: config.sync.retry,
        layout: Arc::new(StackLayout::default()),
      };
      let session = DashboardSession::open(client, &dashboard, options).await?;

      replay::Replayer::new(&session).run(&script).await?;

      let widgets = session.widgets().clone();
      let outcome = session.close().await;
      print_widgets(&widgets.widgets());
      println!("{:?} ({:?})", widgets.status(), outcome);
      let pending = widgets.pending_count();
      if pending > 0 {
        return Err(eyre!("{} operations could not be saved", pending));
      }
    }
  }

  Ok(())
}

fn print_widgets(widgets: &[Widget]) {
  for w in widgets {
    println!(
      "{:<38} {:<6} {:<30} ({},{} {}x{}){}",
      w.id,
      w.kind().as_str(),
      w.title,
      w.position.x,
      w.position.y,
      w.position.w,
      w.position.h,
      if w.is_configured { "" } else { "  [unconfigured]" }
    );
  }
}
