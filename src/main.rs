use anyhow::Context;
use api_client::{ConnectorFactory, LiveConnectorFactory, PaperConnectorFactory};
use clap::{Parser, Subcommand};
use configuration::{Config, init_tracing, load_config};
use core_types::{Signal, SignalSummary, UserProfile};
use database::{DbRepository, DbRouter, InMemoryStore, TradingStore, run_migrations};
use engine::{
    DecisionOracle, EngineParts, HttpDecisionOracle, SignalFollowingOracle, SignalOnlyAnalysis,
    TradingEngine,
};
use events::LogNotifier;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// The entry point for the Relay signal execution engine.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may already be set.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.dry_run {
        config.engine.dry_run = true;
    }
    let _log_guard = init_tracing(&config.logging).context("failed to initialise logging")?;

    match cli.command {
        Commands::Migrate => handle_migrate(&config).await,
        Commands::Signal(args) => {
            let runtime = Runtime::build(config, cli.users.as_deref()).await?;
            handle_signal(&runtime, args).await
        }
        Commands::Run => {
            let runtime = Runtime::build(config, cli.users.as_deref()).await?;
            handle_run(&runtime).await
        }
        Commands::Monitor(args) => {
            let runtime = Runtime::build(config, cli.users.as_deref()).await?;
            handle_monitor(&runtime, args).await
        }
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Executes trading signals across subscribed users and settles the results.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file. Defaults to ./config.toml when present.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Route every order to the paper exchange and keep state in memory.
    #[arg(long, global = true)]
    dry_run: bool,

    /// JSON array of user profiles to seed the in-memory store with (dry runs only).
    #[arg(long, global = true)]
    users: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database migrations and exit.
    Migrate,
    /// Process a single signal read from a JSON file and print the summary.
    Signal(SignalArgs),
    /// Read newline-delimited JSON signals from stdin while monitoring positions.
    Run,
    /// Monitor open positions: stops, targets and maximum hold time.
    Monitor(MonitorArgs),
}

#[derive(Parser)]
struct SignalArgs {
    /// The signal file.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Parser)]
struct MonitorArgs {
    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,
}

// ==============================================================================
// Wiring
// ==============================================================================

/// The engine together with the background work it depends on.
struct Runtime {
    engine: TradingEngine,
    router: Option<Arc<DbRouter>>,
    health_interval: Duration,
}

impl Runtime {
    async fn build(config: Config, users: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let health_interval = Duration::from_secs(config.database.health_check_interval_secs);

        let (store, factory, router): (Arc<dyn TradingStore>, Arc<dyn ConnectorFactory>, _) =
            if config.engine.dry_run {
                tracing::warn!("dry run: orders go to the paper exchange and state is kept in memory");
                let store = InMemoryStore::new();
                if let Some(path) = users {
                    for user in read_users(path).await? {
                        store.insert_user(user)?;
                    }
                }
                (
                    Arc::new(store),
                    Arc::new(PaperConnectorFactory::new(config.exchanges.paper.clone())),
                    None,
                )
            } else {
                if users.is_some() {
                    tracing::warn!("--users is ignored outside dry runs");
                }
                let router = Arc::new(
                    DbRouter::connect(&config.database)
                        .await
                        .context("failed to connect to the database")?,
                );
                (
                    Arc::new(DbRepository::new(router.clone())),
                    Arc::new(LiveConnectorFactory::new(config.exchanges.clone())),
                    Some(router),
                )
            };

        let oracle: Arc<dyn DecisionOracle> = match &config.engine.oracle_url {
            Some(url) => {
                tracing::info!(%url, "using the HTTP decision oracle");
                Arc::new(HttpDecisionOracle::new(
                    url.clone(),
                    config.engine.oracle_timeout(),
                    config.admission.default_cooldown_minutes,
                )?)
            }
            None => {
                tracing::info!("no oracle configured, following signals as received");
                Arc::new(SignalFollowingOracle::default())
            }
        };

        let engine = TradingEngine::new(EngineParts {
            config,
            store,
            factory,
            oracle,
            analysis: Arc::new(SignalOnlyAnalysis),
            notifier: Arc::new(LogNotifier),
        });
        Ok(Self {
            engine,
            router,
            health_interval,
        })
    }

    /// Starts replica health checks when running against the database.
    fn spawn_background(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.router
            .as_ref()
            .map(|router| router.spawn_health_checks(self.health_interval))
    }
}

async fn read_users(path: &std::path::Path) -> anyhow::Result<Vec<UserProfile>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let users: Vec<UserProfile> =
        serde_json::from_str(&raw).with_context(|| format!("invalid user list in {}", path.display()))?;
    for user in &users {
        user.trading
            .validate()
            .with_context(|| format!("user {} has an invalid trading config", user.id))?;
    }
    tracing::info!(count = users.len(), "seeded users");
    Ok(users)
}

fn print_summary(summary: &SignalSummary) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(summary)?);
    Ok(())
}

// ==============================================================================
// Command Logic
// ==============================================================================

async fn handle_migrate(config: &Config) -> anyhow::Result<()> {
    let router = DbRouter::connect(&config.database)
        .await
        .context("failed to connect to the database")?;
    run_migrations(router.primary()).await?;
    tracing::info!("migrations applied");
    Ok(())
}

async fn handle_signal(runtime: &Runtime, args: SignalArgs) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let signal: Signal = serde_json::from_str(&raw).context("invalid signal")?;
    let summary = runtime.engine.process_signal(signal).await?;
    print_summary(&summary)
}

/// Processes signals from stdin one line at a time. The monitor keeps running
/// after stdin closes, until the process is interrupted.
async fn handle_run(runtime: &Runtime) -> anyhow::Result<()> {
    let health = runtime.spawn_background();
    let monitor = tokio::spawn(runtime.engine.lifecycle().run());

    let signals = async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let signal: Signal = match serde_json::from_str(line) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed signal");
                    continue;
                }
            };
            match runtime.engine.process_signal(signal).await {
                Ok(summary) => print_summary(&summary)?,
                Err(e) => tracing::error!(code = e.code(), error = %e, "signal failed"),
            }
        }
        tracing::info!("input closed, monitoring until interrupted");
        std::future::pending::<()>().await;
        Ok::<(), anyhow::Error>(())
    };

    let result = tokio::select! {
        result = signals => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    };

    monitor.abort();
    if let Some(health) = health {
        health.abort();
    }
    let pending = runtime.engine.lifecycle().pending_settlements().await;
    if pending > 0 {
        tracing::error!(pending, "exiting with unsettled positions");
    }
    result
}

async fn handle_monitor(runtime: &Runtime, args: MonitorArgs) -> anyhow::Result<()> {
    let lifecycle = runtime.engine.lifecycle();
    if args.once {
        lifecycle.tick().await?;
        let pending = lifecycle.pending_settlements().await;
        if pending > 0 {
            anyhow::bail!("{pending} settlements could not be written");
        }
        return Ok(());
    }

    let health = runtime.spawn_background();
    tokio::select! {
        _ = lifecycle.run() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    if let Some(health) = health {
        health.abort();
    }
    Ok(())
}
