//! websearch - command-line front-end for the web search agent
//!
//! This tool provides commands for:
//! - Submitting searches and watching their live progress
//! - Recovering and resuming runs left processing by an earlier session
//! - Browsing, searching and pruning the local search history
//!
//! Uses XDG Base Directory specification for file locations:
//! - Storage: $XDG_DATA_HOME/websearch/storage.db (~/.local/share/websearch/storage.db)
//! - Config: $XDG_CONFIG_HOME/websearch/config.toml (~/.config/websearch/config.toml)
//! - Logs: $XDG_STATE_HOME/websearch/ (with --verbose)

mod output;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use websearch_core::config::SECRET_ENV_VAR;
use websearch_core::progress::validate_query;
use websearch_core::{
    Config, History, HistoryStatus, KeyValueStore, LiveMonitor, MemoryStore, PlatformClient,
    PollingSubscriber, Reconciler, Reconciliation, SearchInput, SqliteStore, TaskPlatform, Theme,
    ThemeStore,
};

#[derive(Parser)]
#[command(name = "websearch")]
#[command(about = "Submit web searches to the agent, watch them run, and browse past results")]
#[command(version)]
struct Args {
    /// Write debug logs to the state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a search and follow its progress
    Search {
        /// The question to research
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        /// Model used for the agent loop
        #[arg(long)]
        model: Option<String>,

        /// Model used to write the final answer
        #[arg(long)]
        write_model: Option<String>,

        /// Print the run id and exit instead of watching
        #[arg(short, long)]
        detach: bool,
    },

    /// Reattach to a run that is still processing
    #[command(alias = "watch")]
    Resume {
        run_id: String,
    },

    /// Check every processing run against the platform
    Recover,

    /// Show the remote status of a run
    Status {
        run_id: String,
    },

    /// Request cancellation of a run
    Cancel {
        run_id: String,
    },

    /// List past searches, newest first
    History {
        /// Only entries with this status (processing, complete, failed, canceled)
        #[arg(short, long)]
        status: Option<HistoryStatus>,

        /// Only entries whose query contains this text
        #[arg(long)]
        search: Option<String>,

        /// Maximum number of entries to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one history entry with its answer
    Show {
        /// Entry id or run id
        id: String,

        /// Print the stored entry as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete one history entry
    Delete {
        /// Entry id or run id
        id: String,
    },

    /// Delete all history entries
    Clear,

    /// Show or set the theme preference
    Theme {
        /// light, dark or auto
        value: Option<Theme>,
    },

    /// Show configuration, paths and platform readiness
    Config,
}

/// Shared state for commands
struct App {
    config: Config,
    storage: Arc<dyn KeyValueStore>,
    history: Arc<History>,
}

impl App {
    fn open(config: Config) -> Self {
        let db_path = Config::database_path();
        let storage: Arc<dyn KeyValueStore> =
            match SqliteStore::open(&db_path, config.history.quota_bytes) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    eprintln!(
                        "Warning: storage at {} is unavailable ({}); history will not be saved",
                        db_path.display(),
                        e
                    );
                    Arc::new(MemoryStore::disabled())
                }
            };
        let history = Arc::new(History::open(storage.clone(), config.history.max_entries));

        Self {
            config,
            storage,
            history,
        }
    }

    /// Platform client; fails early when the secret is missing
    fn platform(&self) -> Result<Arc<PlatformClient>> {
        PlatformClient::new(self.config.platform.clone())
            .map(Arc::new)
            .map_err(|e| anyhow!(e.user_message()))
    }

    fn monitor(&self, platform: Arc<PlatformClient>) -> LiveMonitor {
        let subscriber = Arc::new(PollingSubscriber::new(
            platform.clone(),
            Duration::from_millis(self.config.monitor.poll_interval_ms),
        ));
        LiveMonitor::new(
            platform,
            self.history.clone(),
            subscriber,
            self.config.search.clone(),
        )
    }

    fn reconciler(&self, platform: Arc<PlatformClient>) -> Reconciler {
        Reconciler::new(platform, self.history.clone(), &self.config.reconcile)
    }

    /// Look up an entry by id, falling back to run id
    fn find_entry(&self, id: &str) -> Option<websearch_core::HistoryEntry> {
        self.history
            .get(id)
            .or_else(|| self.history.find_by_run_id(id))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = if args.verbose {
        let guard = websearch_core::logging::init(&config.logging)
            .context("failed to initialize logging")?;
        eprintln!("Logging to {}", guard.log_dir().display());
        Some(guard)
    } else {
        None
    };

    let app = App::open(config);

    match args.command {
        Command::Search {
            query,
            model,
            write_model,
            detach,
        } => {
            cmd_search(
                &app,
                &query.join(" "),
                model.as_deref(),
                write_model.as_deref(),
                detach,
            )
            .await
        }
        Command::Resume { run_id } => cmd_resume(&app, &run_id).await,
        Command::Recover => cmd_recover(&app).await,
        Command::Status { run_id } => cmd_status(&app, &run_id).await,
        Command::Cancel { run_id } => cmd_cancel(&app, &run_id).await,
        Command::History {
            status,
            search,
            limit,
        } => cmd_history(&app, status, search.as_deref(), limit),
        Command::Show { id, json } => cmd_show(&app, &id, json),
        Command::Delete { id } => cmd_delete(&app, &id),
        Command::Clear => cmd_clear(&app),
        Command::Theme { value } => cmd_theme(&app, value),
        Command::Config => cmd_config(&app),
    }
}

async fn cmd_search(
    app: &App,
    query: &str,
    model: Option<&str>,
    write_model: Option<&str>,
    detach: bool,
) -> Result<()> {
    let query = validate_query(query).map_err(|e| anyhow!(e.user_message()))?;
    let platform = app.platform()?;

    if detach {
        let input = SearchInput::new(&query, &app.config.search, model, write_model);
        let handle = platform
            .trigger(&input)
            .await
            .map_err(|e| anyhow!(e.user_message()))?;
        app.history.add_processing(
            &query,
            &handle.run_id,
            Some(input.model.as_str()),
            Some(input.write_model.as_str()),
        );
        println!("Started run {}", handle.run_id);
        println!("Follow it with: websearch resume {}", handle.run_id);
        return Ok(());
    }

    let mut monitor = app.monitor(platform);
    let run_id = monitor
        .trigger_search(&query, model, write_model)
        .await
        .map_err(|e| anyhow!(e.user_message()))?;
    tracing::info!(run_id = %run_id, "Search started");

    watch::follow(&mut monitor, &app.history).await
}

async fn cmd_resume(app: &App, run_id: &str) -> Result<()> {
    let platform = app.platform()?;
    let reconciler = app.reconciler(platform.clone());

    match reconciler
        .reconcile_one(run_id)
        .await
        .map_err(|e| anyhow!(e.user_message()))?
    {
        Reconciliation::Resumable(task) => {
            let mut monitor = app.monitor(platform);
            monitor
                .resume(&task)
                .map_err(|e| anyhow!(e.user_message()))?;
            if !task.query.is_empty() {
                println!("Resuming: {}", task.query);
            }
            watch::follow(&mut monitor, &app.history).await
        }
        Reconciliation::Finalized(status) => {
            println!("Run {} is no longer running ({}).", run_id, status);
            if let Some(entry) = app.history.find_by_run_id(run_id) {
                println!();
                output::print_entry_detail(&entry);
            }
            Ok(())
        }
        Reconciliation::StillRunning => {
            bail!(
                "Run {} is still running, but a read token could not be issued. Try again later.",
                run_id
            )
        }
    }
}

async fn cmd_recover(app: &App) -> Result<()> {
    if app.history.list_processing().is_empty() {
        println!("No processing runs to check.");
        return Ok(());
    }

    let platform = app.platform()?;
    let report = app.reconciler(platform).reconcile_all().await;

    println!("Checked {} run(s)", report.checked());
    println!();

    if !report.finalized.is_empty() {
        println!("Finished while away:");
        for (run_id, status) in &report.finalized {
            println!("  {} {:<10} {}", output::status_icon(*status), status.as_str(), run_id);
        }
        println!();
    }

    if !report.resumable.is_empty() {
        println!("Still running (resume with `websearch resume <RUN_ID>`):");
        for task in &report.resumable {
            println!("  {}  {}", task.run_id, output::truncate(&task.query, 60));
        }
        println!();
    }

    if !report.pending.is_empty() {
        println!("Still running, not resumable right now:");
        for run_id in &report.pending {
            println!("  {}", run_id);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Could not check:");
        for failure in &report.errors {
            println!("  {}  {}", failure.run_id, failure.error.user_message());
        }
    }

    Ok(())
}

async fn cmd_status(app: &App, run_id: &str) -> Result<()> {
    let platform = app.platform()?;
    let status = platform
        .fetch_status(run_id)
        .await
        .map_err(|e| anyhow!(e.user_message()))?;

    output::print_remote_status(&status);

    if let Some(entry) = app.history.find_by_run_id(run_id) {
        println!("Local status:    {}", entry.status);
    }
    Ok(())
}

async fn cmd_cancel(app: &App, run_id: &str) -> Result<()> {
    let platform = app.platform()?;
    platform
        .cancel(run_id)
        .await
        .map_err(|e| anyhow!(e.user_message()))?;

    println!("Cancellation requested for {}.", run_id);
    println!("The run may take a moment to stop; `websearch recover` will record the outcome.");
    Ok(())
}

fn cmd_history(
    app: &App,
    status: Option<HistoryStatus>,
    search: Option<&str>,
    limit: usize,
) -> Result<()> {
    let mut entries = match search {
        Some(term) => app.history.search(term),
        None => app.history.load().entries,
    };
    if let Some(status) = status {
        entries.retain(|e| e.status == status);
    }
    let total = entries.len();
    entries.truncate(limit);

    if entries.is_empty() {
        println!("No searches in history.");
        return Ok(());
    }

    for entry in &entries {
        output::print_entry_line(entry);
    }
    if total > entries.len() {
        println!();
        println!("Showing {} of {} entries (use --limit to see more)", entries.len(), total);
    }
    if app.history.is_degraded() {
        eprintln!("Warning: storage unavailable, history is not being saved");
    }
    Ok(())
}

fn cmd_show(app: &App, id: &str, json: bool) -> Result<()> {
    let entry = app
        .find_entry(id)
        .ok_or_else(|| anyhow!("No history entry with id {}", id))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
    } else {
        output::print_entry_detail(&entry);
    }
    Ok(())
}

fn cmd_delete(app: &App, id: &str) -> Result<()> {
    let entry = app
        .find_entry(id)
        .ok_or_else(|| anyhow!("No history entry with id {}", id))?;
    app.history.delete(&entry.id);
    println!("Deleted: {}", output::truncate(&entry.query, 60));
    Ok(())
}

fn cmd_clear(app: &App) -> Result<()> {
    let count = app.history.len();
    app.history.clear();
    println!("Cleared {} history entr{}.", count, if count == 1 { "y" } else { "ies" });
    Ok(())
}

fn cmd_theme(app: &App, value: Option<Theme>) -> Result<()> {
    let themes = ThemeStore::new(app.storage.clone());

    match value {
        Some(theme) => {
            if !themes.set(theme) {
                bail!("Failed to save theme preference");
            }
            println!("Theme set to {}", theme);
        }
        None => {
            let effective = themes.resolve(terminal_prefers_dark());
            match themes.get() {
                Some(Theme::Auto) => println!("{} (using {})", Theme::Auto, effective),
                Some(theme) => println!("{}", theme),
                None => println!("{} (default, using {})", Theme::default(), effective),
            }
        }
    }
    Ok(())
}

/// Guess the terminal background from `COLORFGBG` ("fg;bg" or "fg;x;bg").
///
/// Unknown or missing values count as dark.
fn terminal_prefers_dark() -> bool {
    let Ok(colors) = std::env::var("COLORFGBG") else {
        return true;
    };
    match colors.rsplit(';').next().and_then(|bg| bg.trim().parse::<u8>().ok()) {
        Some(bg) => matches!(bg, 0..=6 | 8),
        None => true,
    }
}

fn cmd_config(app: &App) -> Result<()> {
    let config = &app.config;

    println!("websearch Configuration");
    println!("=======================");
    println!();
    println!("Config file:     {}", Config::config_path().display());
    println!("Storage:         {}", Config::database_path().display());
    println!("Logs:            {}", websearch_core::logging::log_file_path().display());
    println!();
    println!("API URL:         {}", config.platform.api_url);
    println!("Task:            {}", config.platform.task_id);
    println!(
        "Secret key:      {}",
        if config.platform.secret().is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Model:           {}", config.search.effective_model());
    println!("Write model:     {}", config.search.effective_write_model());
    println!("History limit:   {}", config.history.max_entries);
    println!();

    if config.platform.is_ready() {
        println!("Platform:        ready");
    } else {
        println!("Platform:        not configured");
        println!();
        println!("Set {} or add to config.toml:", SECRET_ENV_VAR);
        println!();
        println!("  [platform]");
        println!("  secret_key = \"tr_dev_xxxxxxxxxxxx\"");
    }
    Ok(())
}
