use chrono::Utc;
use clap::Parser;
use ordex::cli::{read_intents, Cli, Commands};
use ordex::config::AppConfig;
use ordex::error::{OrdexError, Result};
use ordex::execution::recovery;
use ordex::persistence::{self, AuditLog, SnapshotStore};
use ordex::{
    BudgetLedger, EventBus, FsmEngine, IdempotencyStore, OrderRouter, PaperExchange,
    RecoveryManager, RuntimeFlags, StaticPriceOracle,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Interval of the background timeout sweep
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

struct Runtime {
    config: AppConfig,
    ledger: Arc<BudgetLedger>,
    engine: Arc<FsmEngine>,
    snapshots: Arc<dyn SnapshotStore>,
    audit: Arc<dyn AuditLog>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config);

    match cli.command {
        Commands::Run {
            intents,
            prices,
            fee_rate,
        } => {
            let rt = build_runtime(config).await?;
            let oracle = Arc::new(StaticPriceOracle::new());
            for (symbol, price) in prices {
                oracle.set(symbol, price);
            }
            let exchange = Arc::new(PaperExchange::new().with_fee_rate(fee_rate));
            run_intents(rt, exchange, oracle, &intents).await?;
        }
        Commands::Recover => {
            let rt = build_runtime(config).await?;
            let manager = RecoveryManager::new(
                rt.engine.clone(),
                rt.ledger.clone(),
                rt.snapshots.clone(),
                Arc::new(PaperExchange::new()),
            );
            let report = manager.recover().await?;
            print!("{}", report);
            println!("{}", rt.ledger.snapshot()?);
        }
        Commands::Audit { intent_id } => {
            let rt = build_runtime(config).await?;
            let records = rt.audit.by_intent(&intent_id).await?;
            if records.is_empty() {
                println!("No audit records for {}", intent_id);
            }
            for record in records {
                println!("{}", record);
            }
        }
        Commands::Ledger => {
            let rt = build_runtime(config).await?;
            for state in rt.snapshots.list().await? {
                match (recovery::validate(&state), &state.reservation) {
                    (Ok(()), Some(reservation)) => rt.ledger.restore(reservation)?,
                    (Ok(()), None) => {}
                    (Err(e), _) => warn!(key = %state.key, error = %e, "Skipping inconsistent snapshot"),
                }
            }
            println!("{}", rt.ledger.snapshot()?);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config: {}", e);
        }
        return Err(OrdexError::Validation(errors.join("; ")));
    }
    Ok(config)
}

async fn build_runtime(config: AppConfig) -> Result<Runtime> {
    let persistence::Backends {
        snapshots,
        audit,
        fingerprints,
    } = persistence::open(&config.persistence).await?;
    let ledger = Arc::new(BudgetLedger::new(&config.budget));
    let idempotency = IdempotencyStore::new(&config.idempotency).with_journal(fingerprints);
    let engine = Arc::new(FsmEngine::new(
        &config,
        ledger.clone(),
        Arc::new(idempotency),
        snapshots.clone(),
        audit.clone(),
    ));
    info!(
        strategy = engine.strategy_name(),
        capital = %config.budget.initial_capital,
        "Execution engine ready"
    );
    Ok(Runtime {
        config,
        ledger,
        engine,
        snapshots,
        audit,
    })
}

async fn run_intents(
    rt: Runtime,
    exchange: Arc<PaperExchange>,
    oracle: Arc<StaticPriceOracle>,
    path: &std::path::Path,
) -> Result<()> {
    let intents = read_intents(path).await?;
    info!(count = intents.len(), "Loaded intents");

    let (flags_tx, flags_rx) = watch::channel(RuntimeFlags {
        kill_switch: rt.config.runtime.kill_switch,
    });
    let bus = EventBus::default();
    let router = Arc::new(
        OrderRouter::new(
            &rt.config,
            rt.engine.clone(),
            rt.ledger.clone(),
            exchange.clone(),
            oracle,
        )
        .with_event_bus(bus.clone())
        .with_flags(flags_rx),
    );

    // Ctrl+C stops new intents; orders in flight finish their attempts
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, engaging kill switch");
            let _ = flags_tx.send(RuntimeFlags { kill_switch: true });
        }
    });

    let report = RecoveryManager::new(
        rt.engine.clone(),
        rt.ledger.clone(),
        rt.snapshots.clone(),
        exchange,
    )
    .recover()
    .await?;
    if !report.restored.is_empty() || !report.reset.is_empty() {
        print!("{}", report);
    }

    // Resumes run concurrently; the sweep starts only once they are done so it
    // never cancels an order a resume is about to drive
    let resumes: Vec<_> = report
        .resumable
        .iter()
        .cloned()
        .map(|key| {
            let router = router.clone();
            tokio::spawn(async move { router.resume(&key).await })
        })
        .collect();
    let (resumed_tx, resumed_rx) = oneshot::channel();
    let sweeper_router = router.clone();
    let sweeper = tokio::spawn(async move {
        for handle in resumes {
            match handle.await {
                Ok(Some(outcome)) => println!("{}", outcome),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Resume task panicked"),
            }
        }
        let _ = resumed_tx.send(());

        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweeper_router.sweep(Utc::now()).await;
        }
    });

    let handles: Vec<_> = intents
        .into_iter()
        .map(|intent| router.submit(intent))
        .collect();
    for handle in handles {
        match handle.await {
            Ok(outcome) => println!("{}", outcome),
            Err(e) => error!(error = %e, "Intent task panicked"),
        }
    }

    if resumed_rx.await.is_err() {
        warn!("Sweeper stopped before resumed orders finished");
    }
    sweeper.abort();
    println!("{}", rt.ledger.snapshot()?);
    Ok(())
}

fn init_logging(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},ordex=debug,sqlx=warn", config.logging.level))
    });

    // Optional daily-rolling file output
    let file_layer = std::env::var("ORDEX_LOG_DIR").ok().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir, e
            );
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(&log_dir, "ordex.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // The guard flushes on drop; keep it for the life of the process
        Box::leak(Box::new(guard));
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (json_layer, text_layer) = if config.logging.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
}
