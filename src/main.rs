use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;
use tradekeeper::api::BinanceMarketData;
use tradekeeper::config::AppConfig;
use tradekeeper::db::PostgresStore;
use tradekeeper::execution::{
    summarize, InMemoryOrderStore, OrderExecutionService, OrderHousekeeper, OrderStore,
};
use tradekeeper::models::{AccountId, StrategyType};
use tradekeeper::reconciler::SettingsReconciler;
use tradekeeper::settings::{InMemorySettingsStore, SettingsService, SettingsStore};
use tradekeeper::strategy::{StrategyContext, StrategyRegistry};
use tradekeeper::supervisor::StrategySupervisor;
use tradekeeper::venue::{PaperVenue, Venue};

#[derive(Parser)]
#[command(author, version, about = "Strategy supervisor with order housekeeping")]
struct Cli {
    /// TOML config file (defaults to ./tradekeeper.toml when present)
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run strategy ticks, settings reconciliation and housekeeping until Ctrl+C
    Run,
    /// Activate a strategy for an account
    Enable {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        strategy: StrategyType,
    },
    /// Deactivate a strategy for an account
    Disable {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        strategy: StrategyType,
    },
    /// Show persisted strategy settings
    Status {
        #[arg(long)]
        account: Option<AccountId>,
    },
    /// Run one housekeeping pass over an account's open orders
    Housekeep {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        symbol: String,
        /// Overrides housekeeper.max_active_per_side
        #[arg(long)]
        max_per_side: Option<usize>,
    },
    /// Print the order trail and realized PnL of an account
    Orders {
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        symbol: String,
    },
}

/// Wired collaborators shared by every command
struct App {
    config: AppConfig,
    settings_store: Arc<dyn SettingsStore>,
    order_store: Arc<dyn OrderStore>,
    market_data: Arc<BinanceMarketData>,
    execution: Arc<OrderExecutionService>,
    /// Set when settings live in Postgres; carries cross-process commit notifications
    postgres: Option<Arc<PostgresStore>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())
        .map_err(anyhow::Error::msg)
        .context("Failed to load configuration")?;
    setup_logging();

    let app = build_app(config).await?;

    match cli.command {
        Command::Run => run(app).await,
        Command::Enable { account, strategy } => set_active(&app, account, strategy, true).await,
        Command::Disable { account, strategy } => set_active(&app, account, strategy, false).await,
        Command::Status { account } => status(&app, account).await,
        Command::Housekeep {
            account,
            symbol,
            max_per_side,
        } => housekeep(&app, account, &symbol, max_per_side).await,
        Command::Orders { account, symbol } => orders(&app, account, &symbol).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tradekeeper=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_app(config: AppConfig) -> Result<App> {
    let settings_store: Arc<dyn SettingsStore>;
    let order_store: Arc<dyn OrderStore>;
    let mut postgres = None;
    match &config.database_url {
        Some(url) => {
            let store = Arc::new(
                PostgresStore::new(url)
                    .await
                    .map_err(anyhow::Error::msg)
                    .context("Failed to connect to Postgres")?,
            );
            settings_store = store.clone();
            order_store = store.clone();
            postgres = Some(store);
        }
        None => {
            tracing::warn!("No database_url configured, settings and orders live in memory only");
            settings_store = Arc::new(InMemorySettingsStore::new());
            order_store = Arc::new(InMemoryOrderStore::new());
        }
    }

    if config.venue.name != "paper" {
        bail!(
            "Unsupported venue '{}': only the paper venue can place orders",
            config.venue.name
        );
    }

    let market_data = Arc::new(BinanceMarketData::new(
        config.venue.market_data_url.clone(),
        config.venue.requests_per_minute,
    ));
    let fee_rate = Decimal::from_f64(config.venue.fee_rate)
        .with_context(|| format!("Invalid fee rate {}", config.venue.fee_rate))?;
    let venue: Arc<dyn Venue> = Arc::new(
        PaperVenue::new(config.venue.network.clone(), fee_rate).with_upstream(market_data.clone()),
    );

    let execution = Arc::new(OrderExecutionService::new(venue, order_store.clone()));

    Ok(App {
        config,
        settings_store,
        order_store,
        market_data,
        execution,
        postgres,
    })
}

// ============================================================================
// Commands
// ============================================================================

async fn run(app: App) -> Result<()> {
    tracing::info!("🚀 tradekeeper starting");

    let registry = StrategyRegistry::standard(StrategyContext {
        settings: app.settings_store.clone(),
        execution: app.execution.clone(),
        candles: app.market_data.clone(),
    });
    let supervisor = Arc::new(StrategySupervisor::new(
        registry,
        app.config.supervisor.tick_interval(),
    ));

    let reconciler = Arc::new(SettingsReconciler::new(
        supervisor.clone(),
        app.settings_store.clone(),
    ));
    let housekeeper = Arc::new(OrderHousekeeper::new(
        app.execution.clone(),
        app.config.housekeeper.price_scale,
    ));

    tracing::info!("📊 Configuration:");
    tracing::info!(
        "  Venue: {} ({})",
        app.config.venue.name,
        app.config.venue.network
    );
    tracing::info!("  Tick: every {:?}", app.config.supervisor.tick_interval());
    tracing::info!("  Reconcile: every {:?}", app.config.reconciler.scan_interval());
    tracing::info!(
        "  Housekeeping: every {:?}, max {} per side unless a grid sets its own",
        app.config.housekeeper.interval(),
        app.config.housekeeper.max_active_per_side
    );

    let reconcile_task = tokio::spawn(
        reconciler
            .clone()
            .run_periodic(app.config.reconciler.scan_interval()),
    );
    let commit_task = match &app.postgres {
        Some(store) => {
            let listener = store
                .commit_listener()
                .await
                .map_err(anyhow::Error::msg)
                .context("Failed to listen for settings commits")?;
            let (tx, commits) = mpsc::unbounded_channel();
            tokio::spawn(PostgresStore::relay_commits(listener, tx));
            Some(tokio::spawn(reconciler.clone().run_events(commits)))
        }
        None => {
            tracing::warn!(
                "In-memory settings: no commit listener, writes from other processes never reach this daemon"
            );
            None
        }
    };
    let commit_task = async move {
        match commit_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };
    let housekeeping_task = {
        let housekeeper = housekeeper.clone();
        let settings_store = app.settings_store.clone();
        let every = app.config.housekeeper.interval();
        let default_cap = app.config.housekeeper.max_active_per_side;
        tokio::spawn(async move {
            housekeeping_loop(housekeeper, settings_store, every, default_cap).await;
        })
    };

    tracing::info!("✅ All loops spawned, press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = reconcile_task => {
            tracing::error!("Reconcile loop exited: {:?}", result);
        }
        result = commit_task => {
            tracing::error!("Commit listener exited: {:?}", result);
        }
        result = housekeeping_task => {
            tracing::error!("Housekeeping loop exited: {:?}", result);
        }
    }

    supervisor.shutdown().await;

    tracing::info!(
        "👋 tradekeeper stopped ({} unconfirmed cancellations this run)",
        housekeeper.cancel_failures_total()
    );
    Ok(())
}

/// Housekeep every (account, symbol) that has open orders
async fn housekeeping_loop(
    housekeeper: Arc<OrderHousekeeper>,
    settings_store: Arc<dyn SettingsStore>,
    every: Duration,
    default_cap: usize,
) {
    tracing::info!("🧹 Housekeeping loop starting...");

    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if let Err(e) = housekeeper.sweep(settings_store.as_ref(), default_cap).await {
            tracing::error!("Housekeeping: failed to list open orders: {}", e);
        }
    }
}

async fn set_active(
    app: &App,
    account_id: AccountId,
    strategy_type: StrategyType,
    active: bool,
) -> Result<()> {
    let service = SettingsService::new(
        app.settings_store.clone(),
        app.config.settings.retry_policy(),
    );
    let saved = service
        .set_active(account_id, strategy_type, active)
        .await
        .with_context(|| {
            format!(
                "Failed to {} {} for account {}",
                if active { "enable" } else { "disable" },
                strategy_type,
                account_id
            )
        })?;

    println!(
        "{} for account {} is now {} (version {})",
        strategy_type,
        account_id,
        if saved.active { "active" } else { "inactive" },
        saved.version
    );
    Ok(())
}

async fn status(app: &App, account: Option<AccountId>) -> Result<()> {
    let rows = match account {
        Some(account_id) => app.settings_store.list_for_account(account_id).await?,
        None => app.settings_store.list_all().await?,
    };

    if rows.is_empty() {
        println!("No strategy settings stored");
        return Ok(());
    }

    println!(
        "{:<10} {:<6} {:<10} {:<4} {:<8} {:<7} PARAMS",
        "ACCOUNT", "TYPE", "SYMBOL", "TF", "ACTIVE", "VERSION"
    );
    for row in rows {
        println!(
            "{:<10} {:<6} {:<10} {:<4} {:<8} {:<7} {}",
            row.account_id,
            row.strategy_type,
            row.symbol,
            row.timeframe,
            row.active,
            row.version,
            serde_json::to_string(&row.params)?
        );
    }
    Ok(())
}

async fn housekeep(
    app: &App,
    account_id: AccountId,
    symbol: &str,
    max_per_side: Option<usize>,
) -> Result<()> {
    let housekeeper = OrderHousekeeper::new(
        app.execution.clone(),
        app.config.housekeeper.price_scale,
    );
    let cap = match max_per_side {
        Some(cap) => cap,
        None => {
            housekeeper
                .cap_for(
                    app.settings_store.as_ref(),
                    account_id,
                    symbol,
                    app.config.housekeeper.max_active_per_side,
                )
                .await
        }
    };

    let report = housekeeper
        .reconcile(account_id, symbol, cap)
        .await
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Housekeeping {} for account {} failed", symbol, account_id))?;

    println!("{} for account {} (cap {} per side):", symbol, account_id, cap);
    println!("  Active BUY:       {}", report.buy_active);
    println!("  Active SELL:      {}", report.sell_active);
    println!("  Removed records:  {}", report.removed_from_store);
    println!("  Cancellations:    {}", report.cancelled);
    println!("  Unconfirmed:      {}", report.cancel_failures);
    Ok(())
}

async fn orders(app: &App, account_id: AccountId, symbol: &str) -> Result<()> {
    let records = app.order_store.list_for(account_id, symbol).await?;

    if records.is_empty() {
        println!("No orders for account {} on {}", account_id, symbol);
        return Ok(());
    }

    for record in &records {
        println!(
            "{}  {:<4} {:<6} {:<16} {:>14} @ {:<14} {}{}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.side,
            record.order_type.as_str(),
            record.status,
            record.executed_qty.max(record.quantity),
            record.price,
            record.venue_order_id,
            record
                .reason
                .as_ref()
                .map(|r| format!("  ({})", r))
                .unwrap_or_default()
        );
    }

    let pnl = summarize(&records);
    println!();
    println!("Fills:         {}", pnl.trades);
    println!("Volume:        {}", pnl.volume);
    println!("Realized PnL:  {}", pnl.realized_pnl);
    println!("Fees:          {}", pnl.fees);
    println!("Net PnL:       {}", pnl.net_pnl());
    if !pnl.position.is_zero() {
        println!("Open position: {} @ {}", pnl.position, pnl.average_cost);
    }
    Ok(())
}
