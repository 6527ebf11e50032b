//! Main application orchestration.
//!
//! Builds the shared store, notifier and per-subscriber session cache, then
//! runs the trading loop and the position monitor side by side until
//! shutdown. In paper mode a third task keeps the simulated market's mids
//! fresh.

use crate::config::{AppConfig, NotifierBackend, OperatingMode, StoreBackend};
use crate::error::{AppError, AppResult};
use relay_core::Price;
use relay_exchange::{
    DynSessionFactory, HexKeyCredentialStore, InfoClient, PaperMarket, PaperSessionFactory,
    SessionCache,
};
use relay_executor::{BracketExecutor, TradingLoop};
use relay_position::PositionMonitor;
use relay_signal::SignalService;
use relay_store::{DynStore, MemoryStore, PgStore};
use relay_telemetry::{DynNotifier, EmailNotifier, LogNotifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main application.
pub struct Application {
    config: AppConfig,
    store: DynStore,
    notifier: DynNotifier,
    sessions: Arc<SessionCache>,
    market: Option<Arc<PaperMarket>>,
    trading_loop: Arc<TradingLoop>,
    monitor: Arc<PositionMonitor>,
}

impl Application {
    /// Build a paper-mode application.
    ///
    /// # Errors
    /// `Config` in live mode, which needs [`Application::with_session_factory`].
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        if config.mode == OperatingMode::Live {
            return Err(AppError::Config(
                "live mode needs an exchange session factory; build with Application::with_session_factory"
                    .to_string(),
            ));
        }

        let market = Arc::new(PaperMarket::new());
        for (coin, mid) in &config.paper.mids {
            market.set_mid(coin, Price::new(*mid));
        }
        let factory = Arc::new(PaperSessionFactory::new(
            Arc::clone(&market),
            config.paper.initial_equity,
        ));
        info!(
            initial_equity = %config.paper.initial_equity,
            seeded_mids = config.paper.mids.len(),
            "Paper trading enabled"
        );

        Self::build(config, factory, Some(market)).await
    }

    /// Build with an external session factory (live trading).
    pub async fn with_session_factory(
        config: AppConfig,
        factory: DynSessionFactory,
    ) -> AppResult<Self> {
        Self::build(config, factory, None).await
    }

    async fn build(
        config: AppConfig,
        factory: DynSessionFactory,
        market: Option<Arc<PaperMarket>>,
    ) -> AppResult<Self> {
        config.validate()?;

        let store: DynStore = match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Postgres => {
                let url = config.store.database_url.as_deref().ok_or_else(|| {
                    AppError::Config("store.database_url is not set".to_string())
                })?;
                Arc::new(PgStore::connect(url, config.store.max_connections).await?)
            }
        };
        for seed in &config.subscribers {
            store.upsert_subscriber(seed.to_subscriber()).await?;
        }
        if !config.subscribers.is_empty() {
            info!(count = config.subscribers.len(), "Seeded subscribers");
        }

        let notifier: DynNotifier = match config.notifier.backend {
            NotifierBackend::Log => Arc::new(LogNotifier),
            NotifierBackend::Email => {
                Arc::new(EmailNotifier::new(config.notifier.email_config()?)?)
            }
        };

        let sessions = Arc::new(SessionCache::new(Arc::new(HexKeyCredentialStore), factory));
        let retry = config.retry.policy();

        let executor = Arc::new(BracketExecutor::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            config.trading.bracket_config(),
            retry,
        ));
        let trading_loop = Arc::new(TradingLoop::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            executor,
            config.trading.loop_config(),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            Arc::clone(&notifier),
            retry,
            config.monitor.clone(),
        ));

        Ok(Self {
            config,
            store,
            notifier,
            sessions,
            market,
            trading_loop,
            monitor,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn notifier(&self) -> &DynNotifier {
        &self.notifier
    }

    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Simulated market, paper mode only.
    pub fn market(&self) -> Option<&Arc<PaperMarket>> {
        self.market.as_ref()
    }

    pub fn trading_loop(&self) -> &Arc<TradingLoop> {
        &self.trading_loop
    }

    pub fn monitor(&self) -> &Arc<PositionMonitor> {
        &self.monitor
    }

    /// Signal protocol over the same store the loops use.
    pub fn signals(&self) -> SignalService {
        SignalService::new(Arc::clone(&self.store))
            .with_expiry_minutes(self.config.trading.signal_expiry_minutes)
    }

    /// Run until Ctrl-C.
    pub async fn run(&self) -> AppResult<()> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            signal_token.cancel();
        });

        self.run_until(shutdown).await
    }

    /// Run every loop until `shutdown` is cancelled, then wait for them.
    pub async fn run_until(&self, shutdown: CancellationToken) -> AppResult<()> {
        info!(
            mode = ?self.config.mode,
            poll_interval_secs = self.config.trading.poll_interval_secs,
            check_interval_secs = self.config.monitor.check_interval_secs,
            classifier = self.monitor.classifier_name(),
            "Starting signal relay"
        );

        let mut tasks = JoinSet::new();

        let trading_loop = Arc::clone(&self.trading_loop);
        let token = shutdown.clone();
        tasks.spawn(async move { trading_loop.run(token).await });

        let monitor = Arc::clone(&self.monitor);
        let token = shutdown.clone();
        tasks.spawn(async move { monitor.run(token).await });

        if let Some(market) = &self.market {
            let refresh = Duration::from_secs(self.config.paper.mid_refresh_secs);
            if refresh.is_zero() {
                info!("Paper mid refresher disabled");
            } else {
                let info_client = InfoClient::new(self.config.paper.info_url.clone())?;
                let market = Arc::clone(market);
                let token = shutdown.clone();
                tasks.spawn(async move { refresh_mids(market, info_client, refresh, token).await });
            }
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Loop task ended abnormally");
                shutdown.cancel();
                failure.get_or_insert_with(|| AppError::Task(e.to_string()));
            }
        }

        info!("Signal relay stopped");
        failure.map_or(Ok(()), Err)
    }
}

/// Keep the paper market's mids in step with the real exchange.
async fn refresh_mids(
    market: Arc<PaperMarket>,
    info_client: InfoClient,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match market.refresh(&info_client).await {
            Ok(count) => debug!(count, "Paper mids refreshed"),
            Err(e) => warn!(error = %e, url = info_client.info_url(), "Paper mid refresh failed"),
        }
    }
}
