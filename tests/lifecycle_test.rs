use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tradekeeper::execution::{InMemoryOrderStore, OrderExecutionService, OrderStore};
use tradekeeper::reconciler::SettingsReconciler;
use tradekeeper::settings::{
    InMemorySettingsStore, RetryPolicy, SettingsService, SettingsStore, StrategyParams,
};
use tradekeeper::strategy::{StrategyContext, StrategyRegistry};
use tradekeeper::supervisor::StrategySupervisor;
use tradekeeper::venue::{PaperVenue, SymbolConstraints};
use tradekeeper::{AccountId, OrderSide, OrderStatus, PositionSide, StrategyType, StrategyUnit};

/// Unit that only counts lifecycle calls and ticks
struct RecordingUnit {
    kind: StrategyType,
    starts: AtomicUsize,
    stops: AtomicUsize,
    ticks: AtomicUsize,
}

impl RecordingUnit {
    fn new(kind: StrategyType) -> Arc<Self> {
        Arc::new(Self {
            kind,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            ticks: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StrategyUnit for RecordingUnit {
    fn strategy_type(&self) -> StrategyType {
        self.kind
    }

    async fn start(&self, _account_id: AccountId) -> tradekeeper::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _account_id: AccountId) -> tradekeeper::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn current_price(&self, _account_id: AccountId) -> tradekeeper::Result<Decimal> {
        Ok(dec!(100))
    }

    async fn on_price_update(&self, _account_id: AccountId, _price: Decimal) -> tradekeeper::Result<()> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn recording_supervisor(
    band: Arc<RecordingUnit>,
    grid: Arc<RecordingUnit>,
    every: Duration,
) -> Arc<StrategySupervisor> {
    let mut registry = StrategyRegistry::new();
    registry.register(band);
    registry.register(grid);
    Arc::new(StrategySupervisor::new(registry, every))
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_repeated_start_keeps_one_loop() {
    let band = RecordingUnit::new(StrategyType::Band);
    let supervisor = recording_supervisor(
        band.clone(),
        RecordingUnit::new(StrategyType::Grid),
        Duration::from_millis(20),
    );

    let (a, b) = tokio::join!(
        supervisor.start(5, StrategyType::Band),
        supervisor.start(5, StrategyType::Band)
    );
    assert!(a.unwrap() ^ b.unwrap());
    assert!(!supervisor.start(5, StrategyType::Band).await.unwrap());

    assert_eq!(band.starts.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.running_keys().len(), 1);

    // One loop means roughly one tick per period, never double
    tokio::time::sleep(Duration::from_millis(110)).await;
    assert!(band.ticks.load(Ordering::SeqCst) <= 8);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_on_idle_key_is_safe() {
    let band = RecordingUnit::new(StrategyType::Band);
    let supervisor = recording_supervisor(
        band.clone(),
        RecordingUnit::new(StrategyType::Grid),
        Duration::from_secs(60),
    );

    assert!(!supervisor.stop(9, StrategyType::Band).await.unwrap());
    assert!(!supervisor.stop(9, StrategyType::Band).await.unwrap());

    assert_eq!(band.stops.load(Ordering::SeqCst), 2);
    assert!(supervisor.running_keys().is_empty());
}

#[tokio::test]
async fn test_scan_rebuilds_running_set_after_restart() {
    let settings = Arc::new(InMemorySettingsStore::new());
    let service = SettingsService::new(settings.clone(), RetryPolicy::default());
    service.set_active(1, StrategyType::Band, true).await.unwrap();
    service.set_active(1, StrategyType::Grid, true).await.unwrap();
    service.set_active(2, StrategyType::Band, true).await.unwrap();
    service.set_active(2, StrategyType::Band, false).await.unwrap();

    let first = recording_supervisor(
        RecordingUnit::new(StrategyType::Band),
        RecordingUnit::new(StrategyType::Grid),
        Duration::from_secs(60),
    );
    SettingsReconciler::new(first.clone(), settings.clone())
        .reconcile_once()
        .await
        .unwrap();
    let before = first.running_keys();
    assert_eq!(before.len(), 2);

    // Process restart: nothing survives but storage
    first.shutdown().await;
    drop(first);

    let second = recording_supervisor(
        RecordingUnit::new(StrategyType::Band),
        RecordingUnit::new(StrategyType::Grid),
        Duration::from_secs(60),
    );
    let reconciler = SettingsReconciler::new(second.clone(), settings);
    let report = reconciler.reconcile_once().await.unwrap();

    assert_eq!(report.started.len(), 2);
    assert_eq!(second.running_keys(), before);
    assert!(!second.is_running(2, StrategyType::Band));
    assert!(reconciler.reconcile_once().await.unwrap().is_noop());
}

/// Paper desk whose candle history puts the bands at 96 / 104
fn band_desk() -> (Arc<PaperVenue>, Arc<InMemoryOrderStore>) {
    let venue = Arc::new(PaperVenue::new("testnet", dec!(0)));
    venue.set_price("BTCUSDT", dec!(100));
    venue.set_constraints(
        "BTCUSDT",
        SymbolConstraints {
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(0),
        },
    );
    // mean 100, stddev 2
    let closes: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 98.0 } else { 102.0 }).collect();
    venue.set_closes("BTCUSDT", &closes);
    (venue, Arc::new(InMemoryOrderStore::new()))
}

#[tokio::test]
async fn test_enable_through_settings_starts_band_strategy() {
    let _ = tracing_subscriber::fmt::try_init();

    let (venue, orders) = band_desk();
    let settings = Arc::new(InMemorySettingsStore::new());
    let context = StrategyContext {
        settings: settings.clone(),
        execution: Arc::new(OrderExecutionService::new(venue.clone(), orders.clone())),
        candles: venue.clone(),
    };
    let band = Arc::new(tradekeeper::strategy::BandStrategy::new(context));
    let mut registry = StrategyRegistry::new();
    registry.register(band.clone());
    let supervisor = Arc::new(StrategySupervisor::new(registry, Duration::from_millis(20)));

    let mut service = SettingsService::new(settings.clone(), RetryPolicy::default());
    let commits = service.subscribe();
    let reconciler = Arc::new(SettingsReconciler::new(supervisor.clone(), settings.clone()));
    let listener = tokio::spawn(reconciler.clone().run_events(commits));

    service
        .update(1, StrategyType::Band, |s| {
            s.symbol = "BTCUSDT".to_string();
            if let StrategyParams::Band(p) = &mut s.params {
                p.order_size = dec!(0.01);
                p.multiplier = 2.0;
            }
            s.active = true;
        })
        .await
        .unwrap();

    assert!(wait_until(|| supervisor.is_running(1, StrategyType::Band)).await);

    // Below the lower band (96): the next tick goes long
    venue.set_price("BTCUSDT", dec!(95));
    let mut entered = false;
    for _ in 0..100 {
        if band.position(1).await.is_some() {
            entered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(entered);

    let position = band.position(1).await.unwrap();
    assert_eq!(position.side, PositionSide::Long);
    assert_eq!(position.entry_price, dec!(95));

    let records = orders.list_for(1, "BTCUSDT").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].side, OrderSide::Buy);
    assert_eq!(records[0].status, OrderStatus::Filled);

    service
        .set_active(1, StrategyType::Band, false)
        .await
        .unwrap();
    assert!(wait_until(|| !supervisor.is_running(1, StrategyType::Band)).await);
    assert!(band.position(1).await.is_none());

    let row = settings.load(1, StrategyType::Band).await.unwrap().unwrap();
    assert!(!row.active);

    drop(service);
    listener.await.unwrap();
}
