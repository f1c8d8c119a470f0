use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wallet_ledger::application::ledger::MutationService;
use wallet_ledger::application::limits::LimitEvaluator;
use wallet_ledger::application::payments::PaymentService;
use wallet_ledger::application::refund::RefundPolicy;
use wallet_ledger::application::sweeper::ReconciliationSweeper;
use wallet_ledger::application::webhook::WebhookIngestion;
use wallet_ledger::config::Settings;
use wallet_ledger::domain::ports::{SharedClock, SharedLedgerStore, SharedNotifier};
use wallet_ledger::infrastructure::clock::SystemClock;
use wallet_ledger::infrastructure::in_memory::InMemoryLedgerStore;
use wallet_ledger::infrastructure::notify::TracingNotifier;
use wallet_ledger::infrastructure::providers::ProviderRegistry;
use wallet_ledger::interfaces::csv::{ResultWriter, import_report};
use wallet_ledger::interfaces::http::{AppState, create_router};
use wallet_ledger::telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML settings file; missing files fall back to defaults
    #[arg(long, default_value = "wallet-ledger.toml")]
    config: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "WALLET_LEDGER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the reconciliation sweeper
    Serve,
    /// Run a single reconciliation pass and print its report
    Sweep,
    /// Settle the rows of a provider settlement report (reference,status,amount)
    ImportReport {
        /// Settlement report CSV file
        report: PathBuf,
    },
}

struct Services {
    store: SharedLedgerStore,
    clock: SharedClock,
    notifier: SharedNotifier,
    providers: ProviderRegistry,
    ledger: Arc<MutationService>,
}

fn open_store(db_path: Option<PathBuf>) -> Result<SharedLedgerStore> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store =
                wallet_ledger::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Arc::new(InMemoryLedgerStore::new()))
        }
        None => Ok(Arc::new(InMemoryLedgerStore::new())),
    }
}

fn build(settings: &Settings, db_path: Option<PathBuf>) -> Result<Services> {
    let store = open_store(db_path)?;
    let clock: SharedClock = Arc::new(SystemClock);
    let notifier: SharedNotifier = Arc::new(TracingNotifier);
    let providers = ProviderRegistry::from_config(&settings.providers).into_diagnostic()?;
    let ledger = Arc::new(MutationService::new(
        store.clone(),
        clock.clone(),
        notifier.clone(),
        RefundPolicy::new(settings.refunds.alert_threshold),
    ));
    Ok(Services {
        store,
        clock,
        notifier,
        providers,
        ledger,
    })
}

fn sweeper(settings: &Settings, services: &Services) -> ReconciliationSweeper {
    ReconciliationSweeper::new(
        services.store.clone(),
        services.ledger.clone(),
        services.providers.clone(),
        services.notifier.clone(),
        services.clock.clone(),
        settings.sweeper.clone(),
    )
}

async fn serve(settings: Settings, services: Services) -> Result<()> {
    let limits = Arc::new(LimitEvaluator::new(
        services.store.clone(),
        services.clock.clone(),
        settings.limits.clone(),
    ));
    let payments = Arc::new(PaymentService::new(
        services.ledger.clone(),
        limits,
        services.providers.clone(),
        settings.routing.clone(),
    ));
    let webhooks = Arc::new(WebhookIngestion::new(
        services.store.clone(),
        services.ledger.clone(),
        services.providers.clone(),
        services.clock.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = sweeper(&settings, &services);
    let sweeping = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { sweeper.run(shutdown).await }
    });

    let app = create_router(AppState { payments, webhooks });
    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .into_diagnostic()?;
    info!(bind = %settings.server.bind, "listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            signal.cancel();
        })
        .await
        .into_diagnostic()?;

    shutdown.cancel();
    sweeping.await.into_diagnostic()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_json).into_diagnostic()?;

    let settings = Settings::load(&cli.config).into_diagnostic()?;
    let services = build(&settings, cli.db_path)?;

    match cli.command {
        Command::Serve => serve(settings, services).await,
        Command::Sweep => {
            let report = sweeper(&settings, &services).tick().await.into_diagnostic()?;
            println!("{}", serde_json::to_string(&report).into_diagnostic()?);
            Ok(())
        }
        Command::ImportReport { report } => {
            let file = File::open(report).into_diagnostic()?;
            let stdout = io::stdout();
            let mut writer = ResultWriter::new(stdout.lock());
            let summary = import_report(&services.ledger, file, &mut writer)
                .await
                .into_diagnostic()?;
            info!(?summary, "settlement report imported");
            Ok(())
        }
    }
}
